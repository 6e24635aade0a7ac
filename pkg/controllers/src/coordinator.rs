use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use pkg_types::fleet::{FleetStatus, NodeInfo, NodesResponse};
use pkg_types::lease::{LeaseEvent, LeaseState};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::reconciler::Reconciler;
use crate::shutdown::ShutdownReport;

const RECENT_EVENTS_IN_STATUS: usize = 50;

/// Owns the reconciliation loop of one instance and exposes its lifecycle
/// and status queries.
pub struct LeaseCoordinator {
    reconciler: Arc<Reconciler>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseCoordinator {
    pub fn new(reconciler: Reconciler) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            reconciler: Arc::new(reconciler),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn instance_id(&self) -> &str {
        &self.reconciler.instance().id
    }

    pub fn is_shutting_down(&self) -> bool {
        self.reconciler.is_stopping()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LeaseEvent> {
        self.reconciler.events().subscribe()
    }

    /// Spawn the tick loop. The first tick runs immediately; calling this
    /// again while the loop runs does nothing.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let reconciler = self.reconciler.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let tick_every = reconciler.config().tick_interval;

        *task = Some(tokio::spawn(async move {
            info!(
                "LeaseCoordinator started (instance={}, tick={}ms, lease_ttl={}s)",
                reconciler.instance().id,
                tick_every.as_millis(),
                reconciler.config().lease_ttl.as_secs()
            );
            let mut interval = tokio::time::interval(tick_every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {}
                }
                // Never raced against shutdown; stop() waits for it instead.
                reconciler.tick().await;
            }
            info!("LeaseCoordinator loop stopped ({})", reconciler.instance().id);
        }));
    }

    /// Stop the loop, then run the bounded shutdown. The whole sequence shares
    /// the configured grace period.
    pub async fn stop(&self) -> ShutdownReport {
        let grace = self.reconciler.config().shutdown_grace;
        let deadline = Instant::now() + grace;
        self.reconciler.begin_stopping();
        self.shutdown_tx.send_replace(true);

        let handle = self.task.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("LeaseCoordinator loop ended abnormally: {}", e),
                Err(_) => {
                    warn!("LeaseCoordinator loop did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.reconciler.shutdown(remaining).await
    }

    /// Snapshot of the local view for the status endpoint.
    pub async fn fleet_status(&self) -> FleetStatus {
        let reconciler = &self.reconciler;
        let me = reconciler.instance().id.clone();
        let (sessions, live, last_tick_at) = {
            let view = reconciler.view.read().await;
            (
                view.sessions.values().cloned().collect::<Vec<_>>(),
                view.live.clone().unwrap_or_default(),
                view.last_tick_at,
            )
        };

        // Only holders confirmed by the store at the last tick; an uncertain
        // lease has no running poller.
        let mut owned_by: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for lease in &sessions {
            if !matches!(lease.state, LeaseState::Owned | LeaseState::Other) {
                continue;
            }
            if let Some(owner) = lease.owner_id.as_deref() {
                owned_by
                    .entry(owner)
                    .or_default()
                    .push(lease.session_id.clone());
            }
        }
        let live_instances = live
            .iter()
            .map(|(id, status)| NodeInfo {
                instance_id: id.to_string(),
                is_this_instance: id == me,
                status,
                owned_sessions: owned_by.get(id).cloned().unwrap_or_default(),
            })
            .collect();

        FleetStatus {
            this_instance_id: me.clone(),
            started_at: reconciler.instance().started_at,
            shutting_down: reconciler.is_stopping(),
            live_instances,
            sessions,
            recent_events: reconciler.events().recent(RECENT_EVENTS_IN_STATUS).await,
            last_tick_at,
            timestamp: Utc::now(),
        }
    }

    /// Live instances and their leases, read fresh from the store.
    pub async fn nodes(&self) -> anyhow::Result<NodesResponse> {
        let reconciler = &self.reconciler;
        let me = reconciler.instance().id.as_str();
        let live = reconciler.membership.live_set().await?;
        let leases = reconciler.leases.read_all().await?;

        let mut owned_by: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (session_id, record) in leases {
            owned_by.entry(record.owner_id).or_default().push(session_id);
        }
        let live_nodes = live
            .iter()
            .map(|(id, status)| {
                let mut owned_sessions = owned_by.remove(id).unwrap_or_default();
                owned_sessions.sort();
                NodeInfo {
                    instance_id: id.to_string(),
                    is_this_instance: id == me,
                    status,
                    owned_sessions,
                }
            })
            .collect();

        Ok(NodesResponse {
            this_instance_id: me.to_string(),
            live_nodes,
            timestamp: Utc::now(),
        })
    }
}
