use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use grouptab_protocol::{
    ChargeOutcome, Event, Identity, ItemPatch, LineItemInfo, NewItem, ParticipantId,
    ParticipantInfo, RestaurantId, SessionId, SessionInfo, SessionStatus, SplitPolicy, TableId,
};

use crate::config::{EngineConfig, SessionPolicy};
use crate::error::EngineError;
use crate::events::EventBroker;
use crate::joincode;
use crate::payment::{charge_with_timeout, ChargeRequest, PaymentGateway};
use crate::scheduler::{DeadlineKind, DeadlineScheduler};
use crate::session::{GroupOrderSession, IdleOutcome, SessionParams, SessionSnapshot};
use crate::store::SessionStore;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Inputs for `create_session`. Split policy and spending limits can be
/// seeded here and adjusted later by the host, since both are keyed by
/// participant IDs that only exist after join.
pub struct CreateSessionRequest {
    pub restaurant_id: RestaurantId,
    pub table_id: Option<TableId>,
    pub created_by: Identity,
    /// Time until the order deadline, if the session has one.
    pub expires_in: Option<Duration>,
    pub payment_split: SplitPolicy,
    pub spending_limits: HashMap<ParticipantId, u64>,
}

/// What `place_order` hands back: the aggregate order reference on
/// success, and in either case every per-participant charge outcome so
/// the calling layer can reconcile or refund.
#[derive(Debug, Clone)]
pub struct PlaceOrderOutcome {
    pub completed: bool,
    pub order_reference: Option<String>,
    pub total_cents: u64,
    pub charges: Vec<ChargeOutcome>,
}

type SessionHandle = Arc<Mutex<GroupOrderSession>>;

/// Process-wide map of live sessions: the only place sessions are
/// created, looked up, and reaped.
///
/// Each session sits behind its own `tokio::sync::Mutex`; that lock is
/// the session's serialization boundary, and operations on different
/// sessions never contend. The registry's own indices are `DashMap`s;
/// the join-code index is claimed through the entry API so two creates
/// can never race onto the same freshly freed code.
pub struct SessionRegistry {
    config: EngineConfig,
    sessions: DashMap<SessionId, SessionHandle>,
    codes: DashMap<String, SessionId>,
    active_counts: DashMap<RestaurantId, usize>,
    broker: EventBroker,
    scheduler: DeadlineScheduler,
    gateway: Arc<dyn PaymentGateway>,
    store: Option<Arc<dyn SessionStore>>,
}

impl SessionRegistry {
    /// Build the registry and spawn its timer driver. Must be called
    /// from within a tokio runtime.
    pub fn new(config: EngineConfig, gateway: Arc<dyn PaymentGateway>) -> Arc<Self> {
        Self::build(config, gateway, None)
    }

    pub fn with_store(
        config: EngineConfig,
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn SessionStore>,
    ) -> Arc<Self> {
        Self::build(config, gateway, Some(store))
    }

    fn build(
        config: EngineConfig,
        gateway: Arc<dyn PaymentGateway>,
        store: Option<Arc<dyn SessionStore>>,
    ) -> Arc<Self> {
        let event_buffer = config.event_buffer;
        let registry = Arc::new(Self {
            config,
            sessions: DashMap::new(),
            codes: DashMap::new(),
            active_counts: DashMap::new(),
            broker: EventBroker::new(event_buffer),
            scheduler: DeadlineScheduler::new(),
            gateway,
            store,
        });
        Self::spawn_timer_driver(Arc::downgrade(&registry));
        registry
    }

    /// Allocate a session in `Active` status with a fresh join code.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<SessionInfo, EngineError> {
        self.claim_capacity(&request.restaurant_id)?;

        let id: SessionId = uuid::Uuid::new_v4().to_string();
        let join_code = match self.claim_join_code(&id) {
            Ok(code) => code,
            Err(err) => {
                self.release_capacity(&request.restaurant_id);
                return Err(err);
            }
        };

        let now = now_ms();
        let order_deadline_ms = request
            .expires_in
            .map(|d| now + d.as_millis() as u64);
        let session = GroupOrderSession::new(
            SessionParams {
                id: id.clone(),
                join_code: join_code.clone(),
                restaurant_id: request.restaurant_id.clone(),
                table_id: request.table_id,
                created_by: request.created_by,
                order_deadline_ms,
                payment_split: request.payment_split,
                spending_limits: request.spending_limits,
                policy: SessionPolicy::from(&self.config),
            },
            now,
        );
        let info = session.to_info();
        let snapshot = session.snapshot();

        self.sessions
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        self.broker.register(&id).await;
        if let Some(at) = order_deadline_ms {
            self.scheduler.register(&id, at, DeadlineKind::OrderDeadline);
        }
        if let Some(idle) = self.config.idle_timeout {
            self.scheduler
                .register(&id, now + idle.as_millis() as u64, DeadlineKind::IdleCheck);
        }

        info!(
            session_id = %id,
            join_code = %join_code,
            restaurant_id = %info.restaurant_id,
            "session created"
        );
        self.broker
            .emit(
                &id,
                Event::SessionCreated {
                    session_id: id.clone(),
                    join_code,
                    restaurant_id: info.restaurant_id.clone(),
                },
            )
            .await;
        self.persist(&snapshot).await;
        Ok(info)
    }

    /// Resolve a join code. Codes only resolve while the session is
    /// `Active` or `Locked`; terminal sessions keep their ID but their
    /// code is gone.
    pub async fn lookup_by_join_code(&self, code: &str) -> Result<SessionInfo, EngineError> {
        let normalized = joincode::normalize(code);
        let session_id = self
            .codes
            .get(&normalized)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::SessionNotFound(format!("join code {normalized}")))?;
        let handle = self.handle(&session_id)?;
        let session = handle.lock().await;
        if !session.status.is_resolvable() {
            return Err(EngineError::SessionNotFound(format!(
                "join code {normalized}"
            )));
        }
        Ok(session.to_info())
    }

    pub async fn lookup_by_id(&self, session_id: &str) -> Result<SessionInfo, EngineError> {
        let handle = self.handle(session_id)?;
        let session = handle.lock().await;
        Ok(session.to_info())
    }

    /// Alias for the external `getSession` operation.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionInfo, EngineError> {
        self.lookup_by_id(session_id).await
    }

    /// Subscribe to a session's domain events.
    pub async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<Event>, EngineError> {
        self.broker
            .subscribe(session_id)
            .await
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    pub async fn join_session(
        &self,
        code: &str,
        identity: Identity,
    ) -> Result<(SessionInfo, ParticipantInfo), EngineError> {
        let normalized = joincode::normalize(code);
        let session_id = self
            .codes
            .get(&normalized)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::SessionNotFound(format!("join code {normalized}")))?;
        let handle = self.handle(&session_id)?;

        let (info, participant, event, snapshot) = {
            let mut session = handle.lock().await;
            if !session.status.is_resolvable() {
                return Err(EngineError::SessionNotFound(format!(
                    "join code {normalized}"
                )));
            }
            let (participant, event) = session.join(identity, now_ms())?;
            (session.to_info(), participant, event, session.snapshot())
        };

        self.broker.emit(&session_id, event).await;
        self.persist(&snapshot).await;
        Ok((info, participant))
    }

    pub async fn add_items(
        &self,
        session_id: &str,
        participant_id: &str,
        items: &[NewItem],
    ) -> Result<Vec<LineItemInfo>, EngineError> {
        let handle = self.handle(session_id)?;
        let (added, event, snapshot) = {
            let mut session = handle.lock().await;
            let (added, event) = session.add_items(participant_id, items, now_ms())?;
            (added, event, session.snapshot())
        };
        self.broker.emit(session_id, event).await;
        self.persist(&snapshot).await;
        Ok(added)
    }

    pub async fn update_item(
        &self,
        session_id: &str,
        item_id: &str,
        expected_version: u64,
        patch: &ItemPatch,
        participant_id: &str,
    ) -> Result<LineItemInfo, EngineError> {
        let handle = self.handle(session_id)?;
        let (updated, event, snapshot) = {
            let mut session = handle.lock().await;
            let (updated, event) =
                session.update_item(item_id, expected_version, patch, participant_id, now_ms())?;
            (updated, event, session.snapshot())
        };
        self.broker.emit(session_id, event).await;
        self.persist(&snapshot).await;
        Ok(updated)
    }

    pub async fn remove_item(
        &self,
        session_id: &str,
        item_id: &str,
        requested_by: &Identity,
    ) -> Result<(), EngineError> {
        let handle = self.handle(session_id)?;
        let (event, snapshot) = {
            let mut session = handle.lock().await;
            let event = session.remove_item(item_id, requested_by, now_ms())?;
            (event, session.snapshot())
        };
        self.broker.emit(session_id, event).await;
        self.persist(&snapshot).await;
        Ok(())
    }

    pub async fn set_payment_split(
        &self,
        session_id: &str,
        requested_by: &Identity,
        payment_split: SplitPolicy,
    ) -> Result<(), EngineError> {
        let handle = self.handle(session_id)?;
        let (event, snapshot) = {
            let mut session = handle.lock().await;
            let event = session.set_payment_split(requested_by, payment_split, now_ms())?;
            (event, session.snapshot())
        };
        self.broker.emit(session_id, event).await;
        self.persist(&snapshot).await;
        Ok(())
    }

    pub async fn set_spending_limit(
        &self,
        session_id: &str,
        requested_by: &Identity,
        participant_id: &str,
        limit_cents: Option<u64>,
    ) -> Result<(), EngineError> {
        let handle = self.handle(session_id)?;
        let (event, snapshot) = {
            let mut session = handle.lock().await;
            let event = session.set_spending_limit(
                requested_by,
                participant_id,
                limit_cents,
                now_ms(),
            )?;
            (event, session.snapshot())
        };
        self.broker.emit(session_id, event).await;
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Host closes joining. The pending order-deadline timer is
    /// cancelled so it cannot fire against the locked session.
    pub async fn lock_session(
        &self,
        session_id: &str,
        requested_by: &Identity,
    ) -> Result<SessionInfo, EngineError> {
        let handle = self.handle(session_id)?;
        let (info, event, snapshot) = {
            let mut session = handle.lock().await;
            let event = session.lock(requested_by, now_ms())?;
            (session.to_info(), event, session.snapshot())
        };
        self.scheduler
            .cancel(session_id, DeadlineKind::OrderDeadline);
        self.broker.emit(session_id, event).await;
        self.persist(&snapshot).await;
        Ok(info)
    }

    pub async fn cancel_session(
        &self,
        session_id: &str,
        requested_by: &Identity,
        reason: Option<String>,
    ) -> Result<SessionInfo, EngineError> {
        let handle = self.handle(session_id)?;
        let (info, event, snapshot, restaurant_id, join_code) = {
            let mut session = handle.lock().await;
            let event = session.cancel(requested_by, reason, now_ms())?;
            (
                session.to_info(),
                event,
                session.snapshot(),
                session.restaurant_id.clone(),
                session.join_code.clone(),
            )
        };
        self.note_terminal(session_id, &restaurant_id, &join_code);
        self.broker.emit(session_id, event).await;
        self.persist(&snapshot).await;
        Ok(info)
    }

    pub async fn leave_session(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<(), EngineError> {
        let handle = self.handle(session_id)?;
        let (event, snapshot) = {
            let mut session = handle.lock().await;
            let event = session.leave(participant_id, now_ms())?;
            (event, session.snapshot())
        };
        if let Some(event) = event {
            self.broker.emit(session_id, event).await;
            self.persist(&snapshot).await;
        }
        Ok(())
    }

    pub async fn remove_participant(
        &self,
        session_id: &str,
        participant_id: &str,
        requested_by: &Identity,
    ) -> Result<(), EngineError> {
        let handle = self.handle(session_id)?;
        let (event, snapshot) = {
            let mut session = handle.lock().await;
            let event = session.remove_participant(participant_id, requested_by, now_ms())?;
            (event, session.snapshot())
        };
        self.broker.emit(session_id, event).await;
        self.persist(&snapshot).await;
        Ok(())
    }

    pub async fn touch_activity(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<(), EngineError> {
        let handle = self.handle(session_id)?;
        let mut session = handle.lock().await;
        session.touch_activity(participant_id, now_ms())
    }

    /// Finalize a locked session: compute the split, charge every
    /// participant with a non-zero owed amount, and settle to
    /// `Completed` or `Cancelled`.
    ///
    /// The session lock is held only for the `Locked -> Finalizing`
    /// transition and again for settlement, never across gateway calls.
    /// A concurrent second call observes `Finalizing` and fails with
    /// `InvalidTransition`, so charges are issued at most once.
    pub async fn place_order(
        &self,
        session_id: &str,
        requested_by: &Identity,
    ) -> Result<PlaceOrderOutcome, EngineError> {
        let handle = self.handle(session_id)?;

        let (owed, snapshot) = {
            let mut session = handle.lock().await;
            let (owed, _total) = session.begin_finalize(requested_by, now_ms())?;
            (owed, session.snapshot())
        };
        // Make the Finalizing state durable before money moves.
        self.persist(&snapshot).await;

        let mut requests = Vec::new();
        for (participant_id, &amount) in &owed {
            if amount == 0 {
                continue;
            }
            requests.push(ChargeRequest {
                session_id: session_id.to_string(),
                participant_id: participant_id.clone(),
                amount_cents: amount,
            });
        }
        let outcomes: Vec<ChargeOutcome> = join_all(requests.into_iter().map(|request| {
            charge_with_timeout(self.gateway.as_ref(), request, self.config.charge_timeout)
        }))
        .await;

        let order_reference = uuid::Uuid::new_v4().to_string();
        let (event, snapshot, total_cents, restaurant_id, join_code) = {
            let mut session = handle.lock().await;
            let event = session.settle(outcomes.clone(), order_reference.clone(), now_ms())?;
            (
                event,
                session.snapshot(),
                session.total_cents(),
                session.restaurant_id.clone(),
                session.join_code.clone(),
            )
        };
        self.note_terminal(session_id, &restaurant_id, &join_code);
        let completed = matches!(event, Event::OrderPlaced { .. });
        self.broker.emit(session_id, event).await;
        self.persist(&snapshot).await;

        Ok(PlaceOrderOutcome {
            completed,
            order_reference: completed.then_some(order_reference),
            total_cents,
            charges: outcomes,
        })
    }

    /// Remove a terminal session from the in-memory indices. Idempotent;
    /// refuses non-terminal sessions. The durable snapshot is left to
    /// the persistence collaborator's retention window.
    pub async fn reap(&self, session_id: &str) -> Result<(), EngineError> {
        let Some(handle) = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
        else {
            return Ok(());
        };
        {
            let session = handle.lock().await;
            if !session.status.is_terminal() {
                return Err(EngineError::InvalidTransition {
                    from: session.status,
                    event: "reap",
                });
            }
            self.codes
                .remove_if(&session.join_code, |_, sid| sid == session_id);
        }
        self.sessions.remove(session_id);
        self.scheduler.cancel_all(session_id);
        self.broker.remove(session_id).await;
        debug!(session_id = %session_id, "session reaped");
        Ok(())
    }

    /// Rehydrate a session from a durable snapshot, re-registering
    /// indices and, for live sessions, the deadline timers.
    pub async fn restore(&self, snapshot: SessionSnapshot) -> Result<SessionInfo, EngineError> {
        if self.sessions.contains_key(&snapshot.id) {
            return Err(EngineError::Internal(format!(
                "session {} is already live",
                snapshot.id
            )));
        }

        let session = GroupOrderSession::restore(snapshot);
        let info = session.to_info();
        let id = info.id.clone();

        if !info.status.is_terminal() {
            match self.codes.entry(session.join_code.clone()) {
                Entry::Occupied(occupied) => {
                    return Err(EngineError::Internal(format!(
                        "join code {} already maps to session {}",
                        session.join_code,
                        occupied.get()
                    )));
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(id.clone());
                }
            }
            *self
                .active_counts
                .entry(info.restaurant_id.clone())
                .or_insert(0) += 1;
            if info.status == SessionStatus::Active {
                if let Some(at) = info.order_deadline_ms {
                    self.scheduler.register(&id, at, DeadlineKind::OrderDeadline);
                }
            }
            if let Some(idle) = self.config.idle_timeout {
                self.scheduler.register(
                    &id,
                    now_ms() + idle.as_millis() as u64,
                    DeadlineKind::IdleCheck,
                );
            }
        }

        self.sessions
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        self.broker.register(&id).await;
        info!(session_id = %id, status = %info.status, "session restored from snapshot");
        Ok(info)
    }

    /// Non-terminal session count for one restaurant; what the capacity
    /// cap is enforced against.
    pub fn active_session_count(&self, restaurant_id: &str) -> usize {
        self.active_counts
            .get(restaurant_id)
            .map(|c| *c)
            .unwrap_or(0)
    }

    fn handle(&self, session_id: &str) -> Result<SessionHandle, EngineError> {
        self.sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    /// Check-and-increment under the shard lock so concurrent creates
    /// cannot both slip under the cap.
    fn claim_capacity(&self, restaurant_id: &str) -> Result<(), EngineError> {
        let mut count = self
            .active_counts
            .entry(restaurant_id.to_string())
            .or_insert(0);
        if *count >= self.config.max_active_sessions_per_restaurant {
            return Err(EngineError::CapacityExceeded(format!(
                "restaurant {restaurant_id} already has {} active sessions",
                *count
            )));
        }
        *count += 1;
        Ok(())
    }

    fn release_capacity(&self, restaurant_id: &str) {
        if let Some(mut count) = self.active_counts.get_mut(restaurant_id) {
            *count = count.saturating_sub(1);
        }
    }

    /// Draw candidate codes until one claims a vacant index slot. The
    /// entry API makes claim-or-retry atomic, so a code freed by one
    /// session cannot be handed to two new ones.
    fn claim_join_code(&self, session_id: &str) -> Result<String, EngineError> {
        for _ in 0..self.config.join_code_retry_limit {
            let candidate = joincode::generate(self.config.join_code_len);
            match self.codes.entry(candidate.clone()) {
                Entry::Occupied(_) => {
                    debug!(code = %candidate, "join code collision, retrying");
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(session_id.to_string());
                    return Ok(candidate);
                }
            }
        }
        Err(EngineError::CodeSpaceExhausted(
            self.config.join_code_retry_limit,
        ))
    }

    /// Bookkeeping for a session that just reached a terminal status:
    /// free its join code, release the restaurant's capacity slot, and
    /// drop any pending timers.
    fn note_terminal(&self, session_id: &str, restaurant_id: &str, join_code: &str) {
        self.codes.remove_if(join_code, |_, sid| sid == session_id);
        self.release_capacity(restaurant_id);
        self.scheduler.cancel_all(session_id);
    }

    async fn persist(&self, snapshot: &SessionSnapshot) {
        if let Some(store) = &self.store {
            if let Err(err) = store.put(snapshot).await {
                warn!(
                    session_id = %snapshot.id,
                    error = %err,
                    "failed to persist session snapshot"
                );
            }
        }
    }

    /// Timer fires arrive here from the driver task and are delivered to
    /// the session's serialized entry point, which treats stale fires as
    /// no-ops.
    async fn on_timer_fire(&self, session_id: &str, kind: DeadlineKind) {
        let Some(handle) = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
        else {
            return;
        };

        match kind {
            DeadlineKind::OrderDeadline => {
                let fired = {
                    let mut session = handle.lock().await;
                    session.handle_deadline(now_ms()).map(|event| {
                        (
                            event,
                            session.snapshot(),
                            session.status.is_terminal(),
                            session.restaurant_id.clone(),
                            session.join_code.clone(),
                        )
                    })
                };
                let Some((event, snapshot, terminal, restaurant_id, join_code)) = fired else {
                    return;
                };
                if terminal {
                    self.note_terminal(session_id, &restaurant_id, &join_code);
                }
                self.broker.emit(session_id, event).await;
                self.persist(&snapshot).await;
            }
            DeadlineKind::IdleCheck => {
                let Some(idle) = self.config.idle_timeout else {
                    return;
                };
                let idle_ms = idle.as_millis() as u64;
                let outcome = {
                    let mut session = handle.lock().await;
                    match session.handle_idle_expiry(idle_ms, now_ms()) {
                        IdleOutcome::Expired(event) => Some((
                            event,
                            session.snapshot(),
                            session.restaurant_id.clone(),
                            session.join_code.clone(),
                        )),
                        IdleOutcome::Rearm(at) => {
                            self.scheduler
                                .register(session_id, at, DeadlineKind::IdleCheck);
                            None
                        }
                        IdleOutcome::Stale => None,
                    }
                };
                if let Some((event, snapshot, restaurant_id, join_code)) = outcome {
                    self.note_terminal(session_id, &restaurant_id, &join_code);
                    self.broker.emit(session_id, event).await;
                    self.persist(&snapshot).await;
                }
            }
        }
    }

    /// Single driver task behind the scheduler: sleeps until the next
    /// deadline or a registration wake, then delivers due fires. Holds
    /// the registry weakly so it winds down once the registry is gone.
    fn spawn_timer_driver(registry: Weak<SessionRegistry>) {
        tokio::spawn(async move {
            loop {
                let Some(reg) = registry.upgrade() else { break };

                let wait_ms = match reg.scheduler.next_fire_ms() {
                    Some(at) => at.saturating_sub(now_ms()),
                    // Idle fallback; a register() wake cuts this short.
                    None => 60_000,
                };
                if wait_ms > 0 {
                    tokio::select! {
                        _ = reg.scheduler.notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(wait_ms.min(60_000))) => {}
                    }
                }

                let due = reg.scheduler.due(now_ms());
                for (session_id, kind) in due {
                    reg.on_timer_fire(&session_id, kind).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::StaticGateway;

    fn request(restaurant: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            restaurant_id: restaurant.to_string(),
            table_id: None,
            created_by: Identity::new("host"),
            expires_in: None,
            payment_split: SplitPolicy::Equal,
            spending_limits: HashMap::new(),
        }
    }

    fn registry() -> Arc<SessionRegistry> {
        SessionRegistry::new(
            EngineConfig::default(),
            Arc::new(StaticGateway::approving()),
        )
    }

    #[tokio::test]
    async fn created_sessions_get_distinct_codes() {
        let registry = registry();
        let a = registry.create_session(request("r1")).await.unwrap();
        let b = registry.create_session(request("r1")).await.unwrap();

        assert_ne!(a.join_code, b.join_code);
        assert_eq!(registry.active_session_count("r1"), 2);
    }

    #[tokio::test]
    async fn lookup_by_code_is_case_insensitive() {
        let registry = registry();
        let info = registry.create_session(request("r1")).await.unwrap();

        let found = registry
            .lookup_by_join_code(&info.join_code.to_lowercase())
            .await
            .unwrap();
        assert_eq!(found.id, info.id);
    }

    #[tokio::test]
    async fn capacity_cap_is_enforced_per_restaurant() {
        let mut config = EngineConfig::default();
        config.max_active_sessions_per_restaurant = 2;
        let registry =
            SessionRegistry::new(config, Arc::new(StaticGateway::approving()));

        registry.create_session(request("r1")).await.unwrap();
        registry.create_session(request("r1")).await.unwrap();
        let err = registry.create_session(request("r1")).await.unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded(_)));

        // A different restaurant is unaffected.
        registry.create_session(request("r2")).await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_frees_the_capacity_slot_and_code() {
        let mut config = EngineConfig::default();
        config.max_active_sessions_per_restaurant = 1;
        let registry =
            SessionRegistry::new(config, Arc::new(StaticGateway::approving()));

        let info = registry.create_session(request("r1")).await.unwrap();
        registry
            .cancel_session(&info.id, &Identity::new("host"), None)
            .await
            .unwrap();

        assert_eq!(registry.active_session_count("r1"), 0);
        assert!(registry.lookup_by_join_code(&info.join_code).await.is_err());
        // The slot is free again.
        registry.create_session(request("r1")).await.unwrap();
    }

    #[tokio::test]
    async fn reap_is_idempotent_and_rejects_live_sessions() {
        let registry = registry();
        let info = registry.create_session(request("r1")).await.unwrap();

        let err = registry.reap(&info.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        registry
            .cancel_session(&info.id, &Identity::new("host"), None)
            .await
            .unwrap();
        registry.reap(&info.id).await.unwrap();
        registry.reap(&info.id).await.unwrap();
        assert!(registry.lookup_by_id(&info.id).await.is_err());
    }

    #[tokio::test]
    async fn restore_round_trip_rebuilds_indices() {
        let registry = registry();
        let info = registry.create_session(request("r1")).await.unwrap();
        let (_, participant) = registry
            .join_session(&info.join_code, Identity::new("ana"))
            .await
            .unwrap();

        let snapshot = {
            let handle = registry.handle(&info.id).unwrap();
            let session = handle.lock().await;
            session.snapshot()
        };

        // Fresh registry, as after a process restart.
        let revived = registry_restored(snapshot).await;
        let found = revived.lookup_by_join_code(&info.join_code).await.unwrap();
        assert_eq!(found.id, info.id);
        assert_eq!(found.participants[0].id, participant.id);
        assert_eq!(revived.active_session_count("r1"), 1);
    }

    async fn registry_restored(snapshot: SessionSnapshot) -> Arc<SessionRegistry> {
        let registry = registry();
        registry.restore(snapshot).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn restore_refuses_duplicate_live_session() {
        let registry = registry();
        let info = registry.create_session(request("r1")).await.unwrap();
        let snapshot = {
            let handle = registry.handle(&info.id).unwrap();
            let session = handle.lock().await;
            session.snapshot()
        };

        let err = registry.restore(snapshot).await.unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }
}
