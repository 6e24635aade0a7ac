use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pkg_types::session::Session;
use tokio::sync::{Notify, watch};

use crate::poller::Poller;

/// Poller that idles until cancelled and records which sessions are active.
#[derive(Clone, Default)]
pub struct CountingPoller {
    started: Arc<AtomicUsize>,
    active: Arc<Mutex<BTreeSet<String>>>,
    active_count: Arc<AtomicUsize>,
    finish: Arc<Notify>,
}

impl CountingPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.active.lock().unwrap().iter().cloned().collect()
    }

    /// Make every running poll return as if it gave up on its own.
    pub fn finish_all(&self) {
        self.finish.notify_waiters();
    }

    pub async fn wait_active(&self, n: usize) {
        for _ in 0..1000 {
            if self.active() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {} active pollers, have {}", n, self.active());
    }
}

#[async_trait]
impl Poller for CountingPoller {
    async fn poll(&self, session: Session, mut shutdown: watch::Receiver<bool>) {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.active_count.fetch_add(1, Ordering::SeqCst);
        self.active.lock().unwrap().insert(session.id.clone());

        let finished = self.finish.notified();
        tokio::pin!(finished);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = &mut finished => break,
            }
        }

        self.active.lock().unwrap().remove(&session.id);
        self.active_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Poller that ignores cancellation and only ends when its task is aborted.
#[derive(Clone, Default)]
pub struct StubbornPoller {
    alive: Arc<AtomicUsize>,
}

impl StubbornPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn wait_alive(&self, n: usize) {
        for _ in 0..1000 {
            if self.alive() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {} live stubborn pollers, have {}", n, self.alive());
    }
}

struct AliveGuard(Arc<AtomicUsize>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Poller for StubbornPoller {
    async fn poll(&self, _session: Session, _shutdown: watch::Receiver<bool>) {
        self.alive.fetch_add(1, Ordering::SeqCst);
        let _guard = AliveGuard(self.alive.clone());
        std::future::pending::<()>().await;
    }
}
