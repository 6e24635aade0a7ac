use std::collections::BTreeSet;
use std::time::Duration;

use pkg_types::lease::{LeaseEventKind, SessionLease};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::reconciler::Reconciler;

/// Outcome of a bounded shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub pollers_stopped: usize,
    /// Sessions whose lease was deleted from the store.
    pub released: Vec<String>,
    /// Sessions whose release errored; their leases expire via TTL.
    pub release_failures: Vec<String>,
    pub left_fleet: bool,
    /// The grace period ran out before every step finished.
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl Reconciler {
    /// Stop pollers, release every lease this instance holds and remove its
    /// heartbeat, all within `grace`. Never fails: whatever is not done in
    /// time is left to expire.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let started = Instant::now();
        self.begin_stopping();
        let mut report = ShutdownReport::default();

        if tokio::time::timeout(grace, self.drain(&mut report))
            .await
            .is_err()
        {
            report.timed_out = true;
            warn!(
                "Shutdown: grace period of {:?} exceeded, remaining leases will expire",
                grace
            );
        }
        report.elapsed = started.elapsed();
        info!(
            "Shutdown: {} pollers stopped, {} leases released, {} release failures, left fleet={} ({}ms)",
            report.pollers_stopped,
            report.released.len(),
            report.release_failures.len(),
            report.left_fleet,
            report.elapsed.as_millis()
        );
        report
    }

    async fn drain(&self, report: &mut ShutdownReport) {
        let me = self.instance.id.clone();
        // Waits out an in-flight tick; later ticks see the stopping flag.
        let _tick = self.tick_lock.lock().await;

        report.pollers_stopped = self.pollers.stop_all().await;

        let mut owned: BTreeSet<String> = {
            let view = self.view.read().await;
            view.held
                .keys()
                .cloned()
                .chain(
                    view.sessions
                        .values()
                        .filter(|l| l.is_owned())
                        .map(|l| l.session_id.clone()),
                )
                .collect()
        };
        // Also catch leases the store attributes to us that the view missed.
        match self.leases.read_all().await {
            Ok(all) => owned.extend(
                all.into_iter()
                    .filter(|(_, r)| r.owner_id == me)
                    .map(|(sid, _)| sid),
            ),
            Err(e) => warn!("Shutdown: reading leases failed, releasing known leases only: {}", e),
        }

        for session_id in owned {
            match self
                .leases
                .release_within(&session_id, &me, self.config.release_timeout)
                .await
            {
                Ok(removed) => {
                    if removed {
                        self.metrics.released.inc();
                        self.events
                            .emit(LeaseEventKind::Released, &session_id, &me, None)
                            .await;
                        report.released.push(session_id.clone());
                    }
                }
                Err(e) => {
                    warn!("Shutdown: releasing session {} failed: {}", session_id, e);
                    report.release_failures.push(session_id.clone());
                }
            }
            let mut view = self.view.write().await;
            view.held.remove(&session_id);
            if let Some(lease) = view.sessions.get_mut(&session_id) {
                *lease = SessionLease::new(&lease.session_id, &lease.session_name);
            }
        }
        self.metrics.leases_owned.set(0);

        match self.membership.leave().await {
            Ok(()) => report.left_fleet = true,
            Err(e) => warn!("Shutdown: removing heartbeat failed, it will expire: {}", e),
        }
    }
}
