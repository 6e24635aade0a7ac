use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pkg_metrics::Gauge;
use pkg_types::session::Session;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::poller::Poller;

/// Poller task handle that aborts the task when dropped, so a stop that is
/// itself cancelled cannot leave the poller running unsupervised.
struct PollerTask(JoinHandle<()>);

impl PollerTask {
    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for PollerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct RunningPoller {
    cancel: watch::Sender<bool>,
    task: PollerTask,
}

/// Starts and stops poller tasks, at most one per session.
pub struct PollerSupervisor {
    poller: Arc<dyn Poller>,
    stop_timeout: Duration,
    tasks: Mutex<HashMap<String, RunningPoller>>,
    running_gauge: Arc<Gauge>,
}

impl PollerSupervisor {
    pub fn new(poller: Arc<dyn Poller>, stop_timeout: Duration, running_gauge: Arc<Gauge>) -> Self {
        Self {
            poller,
            stop_timeout,
            tasks: Mutex::new(HashMap::new()),
            running_gauge,
        }
    }

    /// Bring the session's poller to the requested state. Idempotent; a
    /// poller that exited on its own is restarted.
    pub async fn ensure(&self, session: &Session, running: bool) {
        if running {
            self.start(session).await;
        } else {
            self.stop(&session.id).await;
        }
    }

    async fn start(&self, session: &Session) -> bool {
        let mut tasks = self.tasks.lock().await;
        if let Some(existing) = tasks.get(&session.id) {
            if !existing.task.is_finished() {
                return false;
            }
            warn!("Poller for session {} exited on its own, restarting", session.id);
            tasks.remove(&session.id);
        }

        let (cancel, shutdown) = watch::channel(false);
        let poller = self.poller.clone();
        let target = session.clone();
        let task = PollerTask(tokio::spawn(async move { poller.poll(target, shutdown).await }));
        tasks.insert(session.id.clone(), RunningPoller { cancel, task });
        self.running_gauge.set(tasks.len() as i64);
        debug!("Supervisor: poller started for session {}", session.id);
        true
    }

    /// Cancel the session's poller and wait for it to acknowledge, aborting
    /// it after the stop timeout. Returns whether a poller was running.
    pub async fn stop(&self, session_id: &str) -> bool {
        let running = {
            let mut tasks = self.tasks.lock().await;
            let running = tasks.remove(session_id);
            self.running_gauge.set(tasks.len() as i64);
            running
        };
        let Some(running) = running else {
            return false;
        };
        let _ = running.cancel.send(true);
        let deadline = Instant::now() + self.stop_timeout;
        Self::await_stop(session_id, running.task, deadline).await;
        true
    }

    /// Cancel every poller at once and wait for all of them against one
    /// shared deadline.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<(String, RunningPoller)> = {
            let mut tasks = self.tasks.lock().await;
            let drained = tasks.drain().collect();
            self.running_gauge.set(0);
            drained
        };
        if drained.is_empty() {
            return 0;
        }
        info!("Supervisor: stopping {} pollers", drained.len());
        for (_, running) in &drained {
            let _ = running.cancel.send(true);
        }
        let deadline = Instant::now() + self.stop_timeout;
        let count = drained.len();
        for (session_id, running) in drained {
            Self::await_stop(&session_id, running.task, deadline).await;
        }
        count
    }

    async fn await_stop(session_id: &str, mut task: PollerTask, deadline: Instant) {
        match tokio::time::timeout_at(deadline, &mut task.0).await {
            Ok(Ok(())) => debug!("Supervisor: poller for session {} stopped", session_id),
            Ok(Err(e)) => warn!("Poller for session {} ended abnormally: {}", session_id, e),
            Err(_) => {
                warn!(
                    "Poller for session {} did not acknowledge stop in time, aborting",
                    session_id
                );
            }
        }
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(session_id)
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Sessions with a live poller task, sorted.
    pub async fn running(&self) -> Vec<String> {
        let tasks = self.tasks.lock().await;
        let mut ids: Vec<String> = tasks
            .iter()
            .filter(|(_, r)| !r.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}
