use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use pkg_constants::state::LEASE_EVENT_LOG_CAPACITY;
use pkg_metrics::LeaseMetrics;
use pkg_state::{KeySpace, KvStore, LeaseEventLog, LeaseStore, LiveSet, Membership};
use pkg_types::config::LeaseConfig;
use pkg_types::lease::{LeaseEventKind, LeaseRecord, LeaseState, SessionLease};
use pkg_types::node::{Instance, NodeStatus};
use pkg_types::session::Session;
use pkg_types::validate::validate_id;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::poller::Poller;
use crate::registry::SessionRegistry;
use crate::supervisor::PollerSupervisor;

/// What one call to [`Reconciler::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    /// Nothing usable could be read from the store or registry yet.
    Skipped,
    /// Shutdown has begun; ticks are no-ops from now on.
    Stopping,
}

/// Local view of every known session, written only by the tick.
#[derive(Debug, Clone, Default)]
pub(crate) struct LocalView {
    pub(crate) sessions: BTreeMap<String, SessionLease>,
    /// Records of leases this instance believes it holds.
    pub(crate) held: HashMap<String, LeaseRecord>,
    pub(crate) known_sessions: Option<Vec<Session>>,
    pub(crate) live: Option<LiveSet>,
    pub(crate) last_tick_at: Option<DateTime<Utc>>,
}

struct TickContext<'a> {
    live: &'a LiveSet,
    live_ids: Vec<String>,
    leases: Option<&'a HashMap<String, LeaseRecord>>,
    status: NodeStatus,
}

/// Per-instance lease state machine.
///
/// Every tick: publish the heartbeat, read the live set, the session list and
/// all leases, then drive each session toward "owned by its preferred owner".
/// Ticks never overlap, and a store failure only degrades the current tick.
pub struct Reconciler {
    pub(crate) instance: Instance,
    pub(crate) config: LeaseConfig,
    pub(crate) membership: Membership,
    pub(crate) leases: LeaseStore,
    registry: Arc<dyn SessionRegistry>,
    pub(crate) pollers: PollerSupervisor,
    pub(crate) events: LeaseEventLog,
    pub(crate) metrics: LeaseMetrics,
    pub(crate) view: RwLock<LocalView>,
    pub(crate) tick_lock: Mutex<()>,
    stopping: AtomicBool,
}

impl Reconciler {
    pub fn new(
        instance: Instance,
        store: Arc<dyn KvStore>,
        keys: KeySpace,
        registry: Arc<dyn SessionRegistry>,
        poller: Arc<dyn Poller>,
        config: LeaseConfig,
        metrics: LeaseMetrics,
    ) -> Self {
        let membership = Membership::new(store.clone(), keys.clone(), instance.clone(), &config);
        let leases = LeaseStore::new(store, keys, config.store_op_timeout);
        let pollers = PollerSupervisor::new(
            poller,
            config.poller_stop_timeout,
            metrics.pollers_running.clone(),
        );
        Self {
            instance,
            config,
            membership,
            leases,
            registry,
            pollers,
            events: LeaseEventLog::new(LEASE_EVENT_LOG_CAPACITY),
            metrics,
            view: RwLock::new(LocalView::default()),
            tick_lock: Mutex::new(()),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn events(&self) -> &LeaseEventLog {
        &self.events
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Refuse any further ticks. In-flight ticks finish normally.
    pub fn begin_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Local view only; no store round-trip.
    pub async fn is_owned(&self, session_id: &str) -> bool {
        self.view
            .read()
            .await
            .sessions
            .get(session_id)
            .is_some_and(SessionLease::is_owned)
    }

    /// Owned locally and confirmed by the store right now.
    pub async fn is_owned_strict(&self, session_id: &str) -> anyhow::Result<bool> {
        if !self.is_owned(session_id).await {
            return Ok(false);
        }
        let record = self.leases.get(session_id).await?;
        Ok(record.is_some_and(|r| r.owner_id == self.instance.id))
    }

    /// Run one reconciliation pass.
    pub async fn tick(&self) -> TickOutcome {
        let _tick = self.tick_lock.lock().await;
        if self.is_stopping() {
            return TickOutcome::Stopping;
        }
        self.metrics.ticks.inc();

        let status = match self.membership.beat().await {
            Ok(status) => Some(status),
            Err(e) => {
                self.metrics.store_errors.inc();
                warn!("Reconciler: heartbeat for {} failed: {}", self.instance.id, e);
                None
            }
        };

        let Some(live) = self.read_live_set(status).await else {
            debug!("Reconciler: no live set read yet, skipping tick");
            return TickOutcome::Skipped;
        };
        self.metrics.live_instances.set(live.len() as i64);

        let Some(sessions) = self.read_sessions().await else {
            debug!("Reconciler: no session list read yet, skipping tick");
            return TickOutcome::Skipped;
        };

        let leases = match self.leases.read_all().await {
            Ok(leases) => Some(leases),
            Err(e) => {
                self.metrics.store_errors.inc();
                warn!(
                    "Reconciler: reading leases failed, only renewing held leases this tick: {}",
                    e
                );
                None
            }
        };

        let ctx = TickContext {
            live: &live,
            live_ids: live.ids(),
            leases: leases.as_ref(),
            status: self.membership.status(),
        };

        for session in &sessions {
            if session.is_paused {
                self.relinquish(session, &ctx, "session paused").await;
                // Paused sessions are listed but not reconciled.
                self.commit(SessionLease::new(&session.id, &session.name), None)
                    .await;
                continue;
            }
            self.reconcile_session(session, &ctx).await;
        }

        self.forget_removed(&sessions, &ctx).await;

        let mut view = self.view.write().await;
        view.last_tick_at = Some(Utc::now());
        let owned = view.sessions.values().filter(|l| l.is_owned()).count();
        self.metrics.leases_owned.set(owned as i64);
        TickOutcome::Completed
    }

    async fn read_live_set(&self, beat: Option<NodeStatus>) -> Option<LiveSet> {
        match self.membership.live_set().await {
            Ok(mut live) => {
                if let Some(status) = beat {
                    // Our own fresh heartbeat always counts.
                    live.insert(&self.instance.id, Some(status));
                }
                let mut view = self.view.write().await;
                if view.live.as_ref() != Some(&live) {
                    info!("Reconciler: live set is now [{}]", live.ids().join(", "));
                }
                view.live = Some(live.clone());
                Some(live)
            }
            Err(e) => {
                self.metrics.store_errors.inc();
                warn!("Reconciler: reading live instances failed, keeping previous set: {}", e);
                self.view.read().await.live.clone()
            }
        }
    }

    async fn read_sessions(&self) -> Option<Vec<Session>> {
        match self.registry.list_sessions().await {
            Ok(sessions) => {
                let mut valid: Vec<Session> = sessions
                    .into_iter()
                    .filter(|s| match validate_id(&s.id) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("Reconciler: ignoring session with invalid id: {}", e);
                            false
                        }
                    })
                    .collect();
                valid.sort_by(|a, b| a.id.cmp(&b.id));
                valid.dedup_by(|a, b| a.id == b.id);
                self.view.write().await.known_sessions = Some(valid.clone());
                Some(valid)
            }
            Err(e) => {
                warn!("Reconciler: listing sessions failed, using last known list: {}", e);
                self.view.read().await.known_sessions.clone()
            }
        }
    }

    async fn current(&self, session: &Session) -> (SessionLease, Option<LeaseRecord>) {
        let view = self.view.read().await;
        let mut lease = view
            .sessions
            .get(&session.id)
            .cloned()
            .unwrap_or_else(|| SessionLease::new(&session.id, &session.name));
        lease.session_name = session.name.clone();
        (lease, view.held.get(&session.id).cloned())
    }

    async fn commit(&self, lease: SessionLease, held: Option<LeaseRecord>) {
        let mut view = self.view.write().await;
        match held {
            Some(record) => {
                view.held.insert(lease.session_id.clone(), record);
            }
            None => {
                view.held.remove(&lease.session_id);
            }
        }
        view.sessions.insert(lease.session_id.clone(), lease);
    }

    async fn reconcile_session(&self, session: &Session, ctx: &TickContext<'_>) {
        let me = self.instance.id.as_str();
        let (mut lease, held) = self.current(session).await;
        let preferred = pkg_assigner::preferred_owner(&session.id, &ctx.live_ids).map(String::from);
        lease.preferred_owner_id = preferred.clone();

        let i_am_preferred = preferred.as_deref() == Some(me);
        let preferred_online = preferred.as_deref().is_some_and(|p| ctx.live.is_online(p));
        let was_owned = lease.is_owned();

        let Some(store_leases) = ctx.leases else {
            match held.filter(|_| was_owned) {
                Some(held) => self.renew(session, lease, held, was_owned).await,
                None => self.commit(lease, None).await,
            }
            return;
        };

        match store_leases.get(&session.id) {
            Some(record) if record.owner_id == me => {
                if !i_am_preferred && preferred_online {
                    self.hand_off(session, lease, preferred.as_deref()).await;
                } else {
                    let basis = held.unwrap_or_else(|| record.clone());
                    self.renew(session, lease, basis, was_owned).await;
                }
            }
            Some(record) => {
                if was_owned {
                    self.pollers.ensure(session, false).await;
                    warn!(
                        "Reconciler: lease for session {} is now held by {}",
                        session.id, record.owner_id
                    );
                    self.events
                        .emit(
                            LeaseEventKind::TakenOver,
                            &session.id,
                            me,
                            Some(format!("now held by {}", record.owner_id)),
                        )
                        .await;
                }
                if ctx.live.contains(&record.owner_id) {
                    mark_other(&mut lease, record);
                    self.commit(lease, None).await;
                } else if i_am_preferred && ctx.status == NodeStatus::Online {
                    // Succeeds once the absent owner's TTL lapses.
                    self.acquire(session, lease, Some(&record.owner_id)).await;
                } else {
                    mark_uncertain(&mut lease, Some(&record.owner_id));
                    self.commit(lease, None).await;
                }
            }
            None => {
                if was_owned {
                    self.pollers.ensure(session, false).await;
                    warn!("Reconciler: lease for session {} expired while held", session.id);
                    self.events
                        .emit(LeaseEventKind::Expired, &session.id, me, None)
                        .await;
                }
                // An online instance stands in while the preferred owner warms up.
                let stand_in = !i_am_preferred && preferred.is_some() && !preferred_online;
                if ctx.status == NodeStatus::Online && (i_am_preferred || stand_in) {
                    self.acquire(session, lease, None).await;
                } else {
                    mark_uncertain(&mut lease, None);
                    self.commit(lease, None).await;
                }
            }
        }
    }

    async fn renew(
        &self,
        session: &Session,
        mut lease: SessionLease,
        basis: LeaseRecord,
        was_owned: bool,
    ) {
        let me = self.instance.id.as_str();
        match self.leases.renew(&session.id, &basis, self.config.lease_ttl).await {
            Ok(Some(record)) => {
                if was_owned {
                    debug!("Reconciler: renewed lease for session {}", session.id);
                } else {
                    info!("Reconciler: regained lease for session {}", session.id);
                    self.events
                        .emit(LeaseEventKind::Renewed, &session.id, me, None)
                        .await;
                }
                self.pollers.ensure(session, true).await;
                mark_owned(&mut lease, &record);
                self.commit(lease, Some(record)).await;
            }
            Ok(None) => {
                self.metrics.renew_failed.inc();
                self.pollers.ensure(session, false).await;
                info!("Reconciler: lost lease for session {} (renew rejected)", session.id);
                self.events
                    .emit(
                        LeaseEventKind::RenewFailed,
                        &session.id,
                        me,
                        Some("lease no longer held".to_string()),
                    )
                    .await;
                mark_uncertain(&mut lease, None);
                self.commit(lease, None).await;
            }
            Err(e) => {
                self.metrics.renew_failed.inc();
                self.metrics.store_errors.inc();
                self.pollers.ensure(session, false).await;
                warn!("Reconciler: renewing lease for session {} failed: {}", session.id, e);
                self.events
                    .emit(LeaseEventKind::RenewFailed, &session.id, me, Some(e.to_string()))
                    .await;
                mark_uncertain(&mut lease, Some(me));
                self.commit(lease, None).await;
            }
        }
    }

    async fn acquire(
        &self,
        session: &Session,
        mut lease: SessionLease,
        stale_owner: Option<&str>,
    ) {
        let me = self.instance.id.as_str();
        match self
            .leases
            .try_acquire(&session.id, me, self.config.lease_ttl)
            .await
        {
            Ok(Some(record)) => {
                self.metrics.acquired.inc();
                match stale_owner {
                    Some(prev) => info!(
                        "Reconciler: acquired lease for session {} from absent owner {}",
                        session.id, prev
                    ),
                    None => info!("Reconciler: acquired lease for session {}", session.id),
                }
                self.events
                    .emit(LeaseEventKind::Acquired, &session.id, me, None)
                    .await;
                self.pollers.ensure(session, true).await;
                mark_owned(&mut lease, &record);
                self.commit(lease, Some(record)).await;
            }
            Ok(None) => {
                self.metrics.acquire_failed.inc();
                debug!("Reconciler: lease for session {} is held elsewhere", session.id);
                mark_uncertain(&mut lease, stale_owner);
                self.commit(lease, None).await;
            }
            Err(e) => {
                self.metrics.acquire_failed.inc();
                self.metrics.store_errors.inc();
                warn!("Reconciler: acquiring lease for session {} failed: {}", session.id, e);
                self.events
                    .emit(LeaseEventKind::AcquireFailed, &session.id, me, Some(e.to_string()))
                    .await;
                mark_uncertain(&mut lease, stale_owner);
                self.commit(lease, None).await;
            }
        }
    }

    /// Give a lease back so the preferred owner can take it.
    async fn hand_off(
        &self,
        session: &Session,
        mut lease: SessionLease,
        preferred: Option<&str>,
    ) {
        self.pollers.ensure(session, false).await;
        let target = preferred.unwrap_or("-");
        if self.release(&session.id).await {
            info!(
                "Reconciler: handed session {} over to preferred owner {}",
                session.id, target
            );
        }
        lease.state = LeaseState::Other;
        lease.owner_id = None;
        lease.acquired_at = None;
        lease.last_renewed_at = None;
        lease.uncertain_since = None;
        self.commit(lease, None).await;
    }

    /// Conditional release with event and metrics. Errors are logged; the
    /// lease then expires through its TTL.
    pub(crate) async fn release(&self, session_id: &str) -> bool {
        let me = self.instance.id.as_str();
        match self.leases.release(session_id, me).await {
            Ok(true) => {
                self.metrics.released.inc();
                self.events
                    .emit(LeaseEventKind::Released, session_id, me, None)
                    .await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.metrics.store_errors.inc();
                warn!(
                    "Reconciler: releasing lease for session {} failed, it will expire: {}",
                    session_id, e
                );
                false
            }
        }
    }

    /// Stop polling a session that must not be polled and drop any lease
    /// this instance holds on it.
    async fn relinquish(&self, session: &Session, ctx: &TickContext<'_>, reason: &str) {
        let me = self.instance.id.as_str();
        let stopped = self.pollers.stop(&session.id).await;
        let held_locally = {
            let view = self.view.read().await;
            view.held.contains_key(&session.id)
                || view.sessions.get(&session.id).is_some_and(|l| l.is_owned())
        };
        let held_in_store = ctx
            .leases
            .and_then(|m| m.get(&session.id))
            .is_some_and(|r| r.owner_id == me);
        if (held_locally || held_in_store) && self.release(&session.id).await {
            info!("Reconciler: released lease for session {} ({})", session.id, reason);
        } else if stopped {
            info!("Reconciler: stopped polling session {} ({})", session.id, reason);
        }
        self.view.write().await.held.remove(&session.id);
    }

    /// Sessions that vanished from the registry are relinquished and dropped.
    async fn forget_removed(&self, sessions: &[Session], ctx: &TickContext<'_>) {
        let removed: Vec<SessionLease> = {
            let view = self.view.read().await;
            view.sessions
                .values()
                .filter(|l| sessions.binary_search_by(|s| s.id.cmp(&l.session_id)).is_err())
                .cloned()
                .collect()
        };
        for lease in removed {
            let session = Session {
                id: lease.session_id.clone(),
                name: lease.session_name.clone(),
                address: String::new(),
                is_paused: true,
            };
            self.relinquish(&session, ctx, "session removed").await;
            self.view.write().await.sessions.remove(&lease.session_id);
        }
    }
}

fn mark_owned(lease: &mut SessionLease, record: &LeaseRecord) {
    lease.state = LeaseState::Owned;
    lease.owner_id = Some(record.owner_id.clone());
    lease.acquired_at = Some(record.acquired_at);
    lease.last_renewed_at = Some(record.last_renewed_at);
    lease.uncertain_since = None;
}

fn mark_other(lease: &mut SessionLease, record: &LeaseRecord) {
    lease.state = LeaseState::Other;
    lease.owner_id = Some(record.owner_id.clone());
    lease.acquired_at = Some(record.acquired_at);
    lease.last_renewed_at = Some(record.last_renewed_at);
    lease.uncertain_since = None;
}

fn mark_uncertain(lease: &mut SessionLease, owner: Option<&str>) {
    if lease.state != LeaseState::Uncertain || lease.uncertain_since.is_none() {
        lease.uncertain_since = Some(Utc::now());
    }
    lease.state = LeaseState::Uncertain;
    lease.owner_id = owner.map(String::from);
    lease.acquired_at = None;
    lease.last_renewed_at = None;
}
