use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use pkg_constants::state::LEASE_EVENT_CHANNEL_CAPACITY;
use pkg_types::lease::{LeaseEvent, LeaseEventKind};
use tokio::sync::RwLock;
use tokio::sync::broadcast;

/// In-memory log of lease transitions with monotonic sequence numbers.
///
/// Holds the most recent events for the status endpoint and fans every new
/// event out to live subscribers.
#[derive(Clone)]
pub struct LeaseEventLog {
    inner: Arc<RwLock<EventLogInner>>,
    sender: broadcast::Sender<LeaseEvent>,
}

struct EventLogInner {
    seq: u64,
    events: VecDeque<LeaseEvent>,
    max_events: usize,
}

impl LeaseEventLog {
    pub fn new(max_events: usize) -> Self {
        let (sender, _) = broadcast::channel(LEASE_EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(EventLogInner {
                seq: 0,
                events: VecDeque::with_capacity(max_events),
                max_events,
            })),
            sender,
        }
    }

    pub async fn emit(
        &self,
        kind: LeaseEventKind,
        session_id: &str,
        instance_id: &str,
        error: Option<String>,
    ) -> LeaseEvent {
        let mut inner = self.inner.write().await;
        inner.seq += 1;
        let event = LeaseEvent {
            seq: inner.seq,
            kind,
            session_id: session_id.to_string(),
            instance_id: instance_id.to_string(),
            at: Utc::now(),
            error,
        };
        if inner.events.len() >= inner.max_events {
            inner.events.pop_front();
        }
        inner.events.push_back(event.clone());
        // No receivers is fine.
        let _ = self.sender.send(event.clone());
        event
    }

    pub async fn current_seq(&self) -> u64 {
        self.inner.read().await.seq
    }

    /// Buffered events with `seq > from_seq`, oldest first.
    pub async fn events_since(&self, from_seq: u64) -> Vec<LeaseEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|e| e.seq > from_seq)
            .cloned()
            .collect()
    }

    /// Up to `limit` most recent events, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<LeaseEvent> {
        let inner = self.inner.read().await;
        let skip = inner.events.len().saturating_sub(limit);
        inner.events.iter().skip(skip).cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.sender.subscribe()
    }
}
