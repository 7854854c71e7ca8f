use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use grouptab_protocol::{
    ChargeOutcome, Event, Identity, ItemPatch, LineItemInfo, NewItem, ParticipantId,
    ParticipantInfo, RestaurantId, SessionId, SessionInfo, SessionStatus, SplitPolicy, TableId,
};

use crate::config::SessionPolicy;
use crate::error::EngineError;
use crate::ledger::ItemLedger;
use crate::participants::ParticipantRoster;
use crate::split;

/// Everything needed to construct a session. The registry fills this in;
/// nothing here changes after construction.
pub struct SessionParams {
    pub id: SessionId,
    pub join_code: String,
    pub restaurant_id: RestaurantId,
    pub table_id: Option<TableId>,
    pub created_by: Identity,
    pub order_deadline_ms: Option<u64>,
    pub payment_split: SplitPolicy,
    pub spending_limits: HashMap<ParticipantId, u64>,
    pub policy: SessionPolicy,
}

/// Durable form of a session, including the ledger's version counters.
/// The persistence collaborator stores these by session ID; `restore`
/// rebuilds a live session from one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub join_code: String,
    pub restaurant_id: RestaurantId,
    pub table_id: Option<TableId>,
    pub created_by: Identity,
    pub status: SessionStatus,
    pub order_deadline_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub payment_split: SplitPolicy,
    pub spending_limits: HashMap<ParticipantId, u64>,
    pub roster: ParticipantRoster,
    pub ledger: ItemLedger,
    pub cancel_reason: Option<String>,
    pub charge_outcomes: Vec<ChargeOutcome>,
    pub policy: SessionPolicy,
}

/// One group order from creation to terminal state.
///
/// The session is the unit of serialization: the registry wraps each one
/// in its own lock and every mutating entry point below runs under it.
/// Methods validate the current status first, mutate, stamp
/// `updated_at_ms`, re-verify invariants, and hand back the single domain
/// event the registry emits. Status only ever moves forward.
pub struct GroupOrderSession {
    pub id: SessionId,
    pub join_code: String,
    pub restaurant_id: RestaurantId,
    pub table_id: Option<TableId>,
    pub created_by: Identity,
    pub status: SessionStatus,
    pub order_deadline_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub payment_split: SplitPolicy,
    pub spending_limits: HashMap<ParticipantId, u64>,
    roster: ParticipantRoster,
    ledger: ItemLedger,
    cancel_reason: Option<String>,
    charge_outcomes: Vec<ChargeOutcome>,
    policy: SessionPolicy,
}

impl GroupOrderSession {
    pub fn new(params: SessionParams, now_ms: u64) -> Self {
        Self {
            id: params.id,
            join_code: params.join_code,
            restaurant_id: params.restaurant_id,
            table_id: params.table_id,
            created_by: params.created_by,
            status: SessionStatus::Active,
            order_deadline_ms: params.order_deadline_ms,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            payment_split: params.payment_split,
            spending_limits: params.spending_limits,
            roster: ParticipantRoster::new(),
            ledger: ItemLedger::new(),
            cancel_reason: None,
            charge_outcomes: Vec::new(),
            policy: params.policy,
        }
    }

    /// Sum over items attributed to `Active` participants. Always
    /// derived from the ledger, never cached.
    pub fn total_cents(&self) -> u64 {
        self.ledger.total_cents(|pid| self.roster.is_active(pid))
    }

    /// Accept a new participant. Only `Active` sessions are joinable;
    /// a locked session no longer accepts joins.
    pub fn join(
        &mut self,
        identity: Identity,
        now_ms: u64,
    ) -> Result<(ParticipantInfo, Event), EngineError> {
        if self.status != SessionStatus::Active {
            return Err(EngineError::SessionNotJoinable(self.status));
        }
        let participant = self
            .roster
            .join(identity, self.policy.max_participants, now_ms)?;
        self.touch(now_ms);
        self.verify_invariants()?;

        info!(session_id = %self.id, participant_id = %participant.id, "participant joined");
        let info = participant.to_info();
        let event = Event::ParticipantJoined {
            session_id: self.id.clone(),
            participant: info.clone(),
        };
        Ok((info, event))
    }

    /// Append a batch of items for one participant, all or nothing.
    pub fn add_items(
        &mut self,
        participant_id: &str,
        items: &[NewItem],
        now_ms: u64,
    ) -> Result<(Vec<LineItemInfo>, Event), EngineError> {
        self.require_editable("add_items")?;
        self.require_active_participant(participant_id)?;

        let added = self
            .ledger
            .add_items(participant_id, items, &self.spending_limits, now_ms)?;
        self.roster.touch_activity(participant_id, now_ms)?;
        self.touch(now_ms);
        self.verify_invariants()?;

        let event = Event::ItemsAdded {
            session_id: self.id.clone(),
            participant_id: participant_id.to_string(),
            items: added.clone(),
        };
        Ok((added, event))
    }

    /// Optimistic-concurrency item edit. Stale `expected_version` fails
    /// with `VersionConflict`; the caller re-reads and retries.
    pub fn update_item(
        &mut self,
        item_id: &str,
        expected_version: u64,
        patch: &ItemPatch,
        modified_by: &str,
        now_ms: u64,
    ) -> Result<(LineItemInfo, Event), EngineError> {
        self.require_editable("update_item")?;
        self.require_active_participant(modified_by)?;

        let updated = self.ledger.update_item(
            item_id,
            expected_version,
            patch,
            modified_by,
            &self.spending_limits,
            now_ms,
        )?;
        self.roster.touch_activity(modified_by, now_ms)?;
        self.touch(now_ms);
        self.verify_invariants()?;

        let event = Event::ItemUpdated {
            session_id: self.id.clone(),
            item: updated.clone(),
        };
        Ok((updated, event))
    }

    /// Remove an item. Only the participant who added it, or the host,
    /// may do so.
    pub fn remove_item(
        &mut self,
        item_id: &str,
        requested_by: &Identity,
        now_ms: u64,
    ) -> Result<Event, EngineError> {
        self.require_editable("remove_item")?;

        let added_by = self
            .ledger
            .get(item_id)
            .map(|i| i.added_by.clone())
            .ok_or_else(|| EngineError::ItemNotFound(item_id.to_string()))?;

        let is_host = requested_by == &self.created_by;
        let is_author = self
            .roster
            .get(&added_by)
            .is_some_and(|p| &p.identity == requested_by);
        if !is_host && !is_author {
            return Err(EngineError::Unauthorized(
                "only the item's author or the host may remove it".to_string(),
            ));
        }

        self.ledger.remove_item(item_id)?;
        self.touch(now_ms);
        self.verify_invariants()?;

        Ok(Event::ItemRemoved {
            session_id: self.id.clone(),
            item_id: item_id.to_string(),
        })
    }

    /// Voluntary departure. Items stay in the ledger; totals and splits
    /// exclude them from here on. Idempotent: leaving twice yields no
    /// second event.
    pub fn leave(
        &mut self,
        participant_id: &str,
        now_ms: u64,
    ) -> Result<Option<Event>, EngineError> {
        self.require_status(
            &[SessionStatus::Active, SessionStatus::Locked],
            "leave",
        )?;

        let changed = self.roster.leave(participant_id, now_ms)?;
        if !changed {
            return Ok(None);
        }
        self.apply_departure_policy(participant_id, now_ms);
        self.touch(now_ms);
        self.verify_invariants()?;

        info!(session_id = %self.id, participant_id = %participant_id, "participant left");
        Ok(Some(Event::ParticipantLeft {
            session_id: self.id.clone(),
            participant_id: participant_id.to_string(),
        }))
    }

    /// Host-initiated removal. Same ledger effect as `leave`, but gated
    /// on the host identity.
    pub fn remove_participant(
        &mut self,
        participant_id: &str,
        requested_by: &Identity,
        now_ms: u64,
    ) -> Result<Event, EngineError> {
        self.require_status(
            &[SessionStatus::Active, SessionStatus::Locked],
            "remove_participant",
        )?;
        if requested_by != &self.created_by {
            return Err(EngineError::Unauthorized(
                "only the host may remove participants".to_string(),
            ));
        }

        self.roster.leave(participant_id, now_ms)?;
        self.apply_departure_policy(participant_id, now_ms);
        self.touch(now_ms);
        self.verify_invariants()?;

        info!(session_id = %self.id, participant_id = %participant_id, "participant removed by host");
        Ok(Event::ParticipantRemoved {
            session_id: self.id.clone(),
            participant_id: participant_id.to_string(),
        })
    }

    /// Record participant activity for the idle-timeout policy.
    pub fn touch_activity(
        &mut self,
        participant_id: &str,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        self.require_status(
            &[SessionStatus::Active, SessionStatus::Locked],
            "touch_activity",
        )?;
        self.roster.touch_activity(participant_id, now_ms)?;
        self.touch(now_ms);
        Ok(())
    }

    /// Change the split policy. Host-only, and only before finalization.
    /// Custom splits are keyed by participant IDs, which exist only after
    /// join, so this is how a custom split gets configured at all.
    pub fn set_payment_split(
        &mut self,
        requested_by: &Identity,
        payment_split: SplitPolicy,
        now_ms: u64,
    ) -> Result<Event, EngineError> {
        self.require_status(
            &[SessionStatus::Active, SessionStatus::Locked],
            "set_payment_split",
        )?;
        if requested_by != &self.created_by {
            return Err(EngineError::Unauthorized(
                "only the host may change the payment split".to_string(),
            ));
        }

        self.payment_split = payment_split.clone();
        self.touch(now_ms);
        info!(session_id = %self.id, "payment split changed");
        Ok(Event::SplitPolicyChanged {
            session_id: self.id.clone(),
            payment_split,
        })
    }

    /// Set or clear one participant's spending cap. Host-only. Lowering
    /// a cap below what the participant already spent is rejected rather
    /// than leaving the ledger in violation.
    pub fn set_spending_limit(
        &mut self,
        requested_by: &Identity,
        participant_id: &str,
        limit_cents: Option<u64>,
        now_ms: u64,
    ) -> Result<Event, EngineError> {
        self.require_status(
            &[SessionStatus::Active, SessionStatus::Locked],
            "set_spending_limit",
        )?;
        if requested_by != &self.created_by {
            return Err(EngineError::Unauthorized(
                "only the host may set spending limits".to_string(),
            ));
        }
        if self.roster.get(participant_id).is_none() {
            return Err(EngineError::ParticipantNotFound(
                participant_id.to_string(),
            ));
        }

        if let Some(limit) = limit_cents {
            let spent = self.ledger.participant_total(participant_id);
            if spent > limit {
                return Err(EngineError::SpendingLimitExceeded {
                    participant_id: participant_id.to_string(),
                    requested_cents: 0,
                    spent_cents: spent,
                    limit_cents: limit,
                });
            }
            self.spending_limits
                .insert(participant_id.to_string(), limit);
        } else {
            self.spending_limits.remove(participant_id);
        }
        self.touch(now_ms);
        self.verify_invariants()?;

        Ok(Event::SpendingLimitSet {
            session_id: self.id.clone(),
            participant_id: participant_id.to_string(),
            limit_cents,
        })
    }

    /// Host closes the doors: no new joins. Item edits stay open to
    /// existing participants unless the lock-freezes policy is on.
    pub fn lock(&mut self, requested_by: &Identity, now_ms: u64) -> Result<Event, EngineError> {
        self.require_status(&[SessionStatus::Active], "lock")?;
        if requested_by != &self.created_by {
            return Err(EngineError::Unauthorized(
                "only the host may lock the session".to_string(),
            ));
        }

        self.status = SessionStatus::Locked;
        self.touch(now_ms);
        info!(session_id = %self.id, "session locked");
        Ok(Event::SessionLocked {
            session_id: self.id.clone(),
        })
    }

    /// Host cancels outright, capturing the reason.
    pub fn cancel(
        &mut self,
        requested_by: &Identity,
        reason: Option<String>,
        now_ms: u64,
    ) -> Result<Event, EngineError> {
        self.require_status(&[SessionStatus::Active, SessionStatus::Locked], "cancel")?;
        if requested_by != &self.created_by {
            return Err(EngineError::Unauthorized(
                "only the host may cancel the session".to_string(),
            ));
        }

        self.status = SessionStatus::Cancelled;
        self.cancel_reason = reason.clone();
        self.touch(now_ms);
        info!(session_id = %self.id, reason = ?reason, "session cancelled");
        Ok(Event::SessionCancelled {
            session_id: self.id.clone(),
            reason,
            charges: Vec::new(),
        })
    }

    /// Order-deadline fire delivered by the scheduler. Locks an active
    /// session, or expires it when nobody ever joined. Idempotent: any
    /// other status is a stale timer and a strict no-op; `updated_at_ms`
    /// is not touched.
    pub fn handle_deadline(&mut self, now_ms: u64) -> Option<Event> {
        if self.status != SessionStatus::Active {
            return None;
        }
        if self.roster.ever_joined() == 0 {
            self.status = SessionStatus::Expired;
            self.touch(now_ms);
            info!(session_id = %self.id, "session expired at deadline with no participants");
            return Some(Event::SessionExpired {
                session_id: self.id.clone(),
            });
        }
        self.status = SessionStatus::Locked;
        self.touch(now_ms);
        info!(session_id = %self.id, "session locked at deadline");
        Some(Event::SessionLocked {
            session_id: self.id.clone(),
        })
    }

    /// Idle-timeout fire. Expires a session that has seen no mutation for
    /// `idle_ms`. Returns the event, or the timestamp the timer should be
    /// re-armed for when there has been activity since.
    pub fn handle_idle_expiry(&mut self, idle_ms: u64, now_ms: u64) -> IdleOutcome {
        if !matches!(
            self.status,
            SessionStatus::Active | SessionStatus::Locked
        ) {
            return IdleOutcome::Stale;
        }
        let idle_since = self.last_activity_ms();
        if now_ms.saturating_sub(idle_since) >= idle_ms {
            self.status = SessionStatus::Expired;
            self.touch(now_ms);
            info!(session_id = %self.id, "session hard-expired after inactivity");
            return IdleOutcome::Expired(Event::SessionExpired {
                session_id: self.id.clone(),
            });
        }
        IdleOutcome::Rearm(idle_since + idle_ms)
    }

    /// First half of place-order: validate, compute the split over a
    /// frozen snapshot, and move to `Finalizing`. The caller releases the
    /// session lock before issuing any gateway charge; a second
    /// place-order attempt then observes `Finalizing` and fails.
    pub fn begin_finalize(
        &mut self,
        requested_by: &Identity,
        now_ms: u64,
    ) -> Result<(BTreeMap<ParticipantId, u64>, u64), EngineError> {
        self.require_status(&[SessionStatus::Locked], "place_order")?;

        let is_host = requested_by == &self.created_by;
        let is_participant = self
            .roster
            .find_by_identity(requested_by)
            .is_some_and(|p| p.is_active());
        if !is_host && !is_participant {
            return Err(EngineError::Unauthorized(
                "only the host or a participant may place the order".to_string(),
            ));
        }

        let owed = split::compute_split(
            &self.ledger.snapshot(),
            self.roster.in_join_order(),
            &self.payment_split,
            &self.spending_limits,
        )?;
        let total = self.total_cents();

        self.status = SessionStatus::Finalizing;
        self.touch(now_ms);
        info!(session_id = %self.id, total_cents = total, "finalizing order");
        Ok((owed, total))
    }

    /// Second half of place-order, entered once every charge outcome is
    /// known. All charges succeeded: totals freeze and the session
    /// completes. Any failure: the session cancels, carrying the
    /// per-participant outcomes so the caller can reconcile.
    pub fn settle(
        &mut self,
        outcomes: Vec<ChargeOutcome>,
        order_reference: String,
        now_ms: u64,
    ) -> Result<Event, EngineError> {
        self.require_status(&[SessionStatus::Finalizing], "settle")?;

        let all_charged = outcomes.iter().all(ChargeOutcome::succeeded);
        self.charge_outcomes = outcomes.clone();

        if all_charged {
            self.status = SessionStatus::Completed;
            self.touch(now_ms);
            info!(session_id = %self.id, order_reference = %order_reference, "order placed");
            Ok(Event::OrderPlaced {
                session_id: self.id.clone(),
                order_reference,
                total_cents: self.total_cents(),
                charges: outcomes,
            })
        } else {
            let failed: Vec<&str> = outcomes
                .iter()
                .filter(|o| !o.succeeded())
                .map(|o| o.participant_id.as_str())
                .collect();
            let reason = format!("payment failed for: {}", failed.join(", "));
            self.status = SessionStatus::Cancelled;
            self.cancel_reason = Some(reason.clone());
            self.touch(now_ms);
            info!(session_id = %self.id, reason = %reason, "order cancelled on charge failure");
            Ok(Event::SessionCancelled {
                session_id: self.id.clone(),
                reason: Some(reason),
                charges: outcomes,
            })
        }
    }

    pub fn to_info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            join_code: self.join_code.clone(),
            restaurant_id: self.restaurant_id.clone(),
            table_id: self.table_id.clone(),
            created_by: self.created_by.clone(),
            status: self.status,
            order_deadline_ms: self.order_deadline_ms,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
            payment_split: self.payment_split.clone(),
            total_cents: self.total_cents(),
            participants: self.roster.to_info(),
            items: self.ledger.snapshot(),
            cancel_reason: self.cancel_reason.clone(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            join_code: self.join_code.clone(),
            restaurant_id: self.restaurant_id.clone(),
            table_id: self.table_id.clone(),
            created_by: self.created_by.clone(),
            status: self.status,
            order_deadline_ms: self.order_deadline_ms,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
            payment_split: self.payment_split.clone(),
            spending_limits: self.spending_limits.clone(),
            roster: self.roster.clone(),
            ledger: self.ledger.clone(),
            cancel_reason: self.cancel_reason.clone(),
            charge_outcomes: self.charge_outcomes.clone(),
            policy: self.policy,
        }
    }

    /// Rehydrate from a durable snapshot, version counters included.
    pub fn restore(snapshot: SessionSnapshot) -> Self {
        Self {
            id: snapshot.id,
            join_code: snapshot.join_code,
            restaurant_id: snapshot.restaurant_id,
            table_id: snapshot.table_id,
            created_by: snapshot.created_by,
            status: snapshot.status,
            order_deadline_ms: snapshot.order_deadline_ms,
            created_at_ms: snapshot.created_at_ms,
            updated_at_ms: snapshot.updated_at_ms,
            payment_split: snapshot.payment_split,
            spending_limits: snapshot.spending_limits,
            roster: snapshot.roster,
            ledger: snapshot.ledger,
            cancel_reason: snapshot.cancel_reason,
            charge_outcomes: snapshot.charge_outcomes,
            policy: snapshot.policy,
        }
    }

    pub fn roster(&self) -> &ParticipantRoster {
        &self.roster
    }

    pub fn charge_outcomes(&self) -> &[ChargeOutcome] {
        &self.charge_outcomes
    }

    fn touch(&mut self, now_ms: u64) {
        self.updated_at_ms = now_ms;
    }

    /// Most recent mutation or participant activity, for the idle policy.
    fn last_activity_ms(&self) -> u64 {
        self.roster
            .in_join_order()
            .iter()
            .map(|p| p.last_activity_at_ms)
            .max()
            .unwrap_or(0)
            .max(self.updated_at_ms)
    }

    fn require_status(
        &self,
        allowed: &[SessionStatus],
        event: &'static str,
    ) -> Result<(), EngineError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                from: self.status,
                event,
            })
        }
    }

    /// Item edits are open while `Active`, and while `Locked` unless the
    /// lock-freezes policy is on.
    fn require_editable(&self, event: &'static str) -> Result<(), EngineError> {
        match self.status {
            SessionStatus::Active => Ok(()),
            SessionStatus::Locked if !self.policy.lock_freezes_items => Ok(()),
            _ => Err(EngineError::InvalidTransition {
                from: self.status,
                event,
            }),
        }
    }

    fn require_active_participant(&self, participant_id: &str) -> Result<(), EngineError> {
        let participant = self
            .roster
            .get(participant_id)
            .ok_or_else(|| EngineError::ParticipantNotFound(participant_id.to_string()))?;
        if !participant.is_active() {
            return Err(EngineError::Unauthorized(
                "participant has left the session".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_departure_policy(&mut self, participant_id: &str, now_ms: u64) {
        if !self.policy.removed_items_to_host {
            return;
        }
        // Transfer only works when the host joined as a participant and
        // is still present; otherwise exclusion-from-totals applies.
        let host = self
            .roster
            .find_by_identity(&self.created_by)
            .filter(|p| p.is_active() && p.id != participant_id)
            .map(|p| p.id.clone());
        if let Some(host_id) = host {
            let moved = self.ledger.reattribute(participant_id, &host_id, now_ms);
            if moved > 0 {
                info!(
                    session_id = %self.id,
                    from = %participant_id,
                    to = %host_id,
                    moved,
                    "reattributed items to host"
                );
            }
        }
    }

    /// Consistency check run after every mutation. A failure here is a
    /// programming-bug signal: it is logged and surfaced as an internal
    /// error, never a panic.
    fn verify_invariants(&self) -> Result<(), EngineError> {
        for item in self.ledger.iter() {
            if item.version == 0 {
                let msg = format!("item {} has version 0", item.id);
                error!(session_id = %self.id, %msg, "invariant violation");
                return Err(EngineError::Internal(msg));
            }
            if self.roster.get(&item.added_by).is_none() {
                let msg = format!(
                    "item {} references unknown participant {}",
                    item.id, item.added_by
                );
                error!(session_id = %self.id, %msg, "invariant violation");
                return Err(EngineError::Internal(msg));
            }
        }
        for participant in self.roster.in_join_order() {
            if !participant.is_active() {
                continue;
            }
            if let Some(&limit) = self.spending_limits.get(&participant.id) {
                let spent = self.ledger.participant_total(&participant.id);
                if spent > limit {
                    let msg = format!(
                        "participant {} spent {spent} cents over limit {limit}",
                        participant.id
                    );
                    error!(session_id = %self.id, %msg, "invariant violation");
                    return Err(EngineError::Internal(msg));
                }
            }
        }
        Ok(())
    }
}

/// Result of an idle-timer fire.
pub enum IdleOutcome {
    /// Session expired; emit the event and tear down timers.
    Expired(Event),
    /// Activity happened since; re-arm the timer for this timestamp.
    Rearm(u64),
    /// Timer is stale (session finalized or terminal); drop it.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;
    use grouptab_protocol::ChargeStatus;

    fn policy() -> SessionPolicy {
        SessionPolicy {
            max_participants: 20,
            lock_freezes_items: false,
            removed_items_to_host: false,
        }
    }

    fn host() -> Identity {
        Identity::new("host")
    }

    fn session_with(policy: SessionPolicy) -> GroupOrderSession {
        GroupOrderSession::new(
            SessionParams {
                id: "s1".to_string(),
                join_code: "ABC234".to_string(),
                restaurant_id: "r1".to_string(),
                table_id: None,
                created_by: host(),
                order_deadline_ms: None,
                payment_split: SplitPolicy::Equal,
                spending_limits: HashMap::new(),
                policy,
            },
            1_000,
        )
    }

    fn session() -> GroupOrderSession {
        session_with(policy())
    }

    fn burger(cents: u64) -> NewItem {
        NewItem {
            menu_item_id: "m-burger".to_string(),
            name: "burger".to_string(),
            unit_price_cents: cents,
            quantity: 1,
            customizations: vec![],
        }
    }

    fn charged(pid: &str, amount: u64) -> ChargeOutcome {
        ChargeOutcome {
            participant_id: pid.to_string(),
            amount_cents: amount,
            status: ChargeStatus::Charged {
                reference: "ref".to_string(),
            },
        }
    }

    fn declined(pid: &str, amount: u64) -> ChargeOutcome {
        ChargeOutcome {
            participant_id: pid.to_string(),
            amount_cents: amount,
            status: ChargeStatus::Failed {
                reason: "card declined".to_string(),
            },
        }
    }

    #[test]
    fn join_add_and_total() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        let (p2, _) = s.join(Identity::new("ben"), 3_000).unwrap();

        s.add_items(&p1.id, &[burger(1000)], 4_000).unwrap();
        s.add_items(&p2.id, &[burger(1000)], 5_000).unwrap();
        assert_eq!(s.total_cents(), 2000);
        assert_eq!(s.updated_at_ms, 5_000);
    }

    #[test]
    fn locked_session_rejects_joins_but_keeps_edits_open() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        s.lock(&host(), 3_000).unwrap();

        let err = s.join(Identity::new("late"), 4_000).unwrap_err();
        assert!(matches!(err, EngineError::SessionNotJoinable(_)));

        // Default policy: existing participants still edit after lock.
        s.add_items(&p1.id, &[burger(500)], 5_000).unwrap();
        assert_eq!(s.total_cents(), 500);
    }

    #[test]
    fn lock_freezes_items_policy_blocks_edits() {
        let mut p = policy();
        p.lock_freezes_items = true;
        let mut s = session_with(p);
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        s.lock(&host(), 3_000).unwrap();

        let err = s.add_items(&p1.id, &[burger(500)], 4_000).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn only_host_locks_and_cancels() {
        let mut s = session();
        s.join(Identity::new("ana"), 2_000).unwrap();

        let err = s.lock(&Identity::new("ana"), 3_000).unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        let err = s
            .cancel(&Identity::new("ana"), None, 3_000)
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        s.lock(&host(), 4_000).unwrap();
        s.cancel(&host(), Some("kitchen closed".to_string()), 5_000)
            .unwrap();
        assert_eq!(s.status, SessionStatus::Cancelled);
        assert_eq!(s.cancel_reason.as_deref(), Some("kitchen closed"));
    }

    #[test]
    fn status_never_reverses() {
        let mut s = session();
        s.join(Identity::new("ana"), 2_000).unwrap();
        s.lock(&host(), 3_000).unwrap();

        // Lock again: invalid, still locked.
        let err = s.lock(&host(), 4_000).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(s.status, SessionStatus::Locked);

        s.cancel(&host(), None, 5_000).unwrap();
        let err = s.cancel(&host(), None, 6_000).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(s.status, SessionStatus::Cancelled);
    }

    #[test]
    fn deadline_on_active_session_locks_it() {
        let mut s = session();
        s.join(Identity::new("ana"), 2_000).unwrap();

        let event = s.handle_deadline(9_000).unwrap();
        assert!(matches!(event, Event::SessionLocked { .. }));
        assert_eq!(s.status, SessionStatus::Locked);
    }

    #[test]
    fn deadline_with_no_participants_expires() {
        let mut s = session();
        let event = s.handle_deadline(9_000).unwrap();
        assert!(matches!(event, Event::SessionExpired { .. }));
        assert_eq!(s.status, SessionStatus::Expired);
    }

    #[test]
    fn stale_deadline_is_a_no_op_and_keeps_updated_at() {
        let mut s = session();
        s.join(Identity::new("ana"), 2_000).unwrap();
        s.lock(&host(), 3_000).unwrap();
        let updated_at = s.updated_at_ms;

        assert!(s.handle_deadline(9_000).is_none());
        assert_eq!(s.updated_at_ms, updated_at);
        assert_eq!(s.status, SessionStatus::Locked);
    }

    #[test]
    fn place_order_requires_locked() {
        let mut s = session();
        s.join(Identity::new("ana"), 2_000).unwrap();

        let err = s.begin_finalize(&host(), 3_000).unwrap_err();
        match err {
            EngineError::InvalidTransition { from, event } => {
                assert_eq!(from, SessionStatus::Active);
                assert_eq!(event, "place_order");
            }
            other => panic!("expected InvalidTransition, got {other}"),
        }
    }

    #[test]
    fn second_place_order_sees_finalizing() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        s.add_items(&p1.id, &[burger(1000)], 3_000).unwrap();
        s.lock(&host(), 4_000).unwrap();

        s.begin_finalize(&host(), 5_000).unwrap();
        let err = s.begin_finalize(&host(), 5_000).unwrap_err();
        match err {
            EngineError::InvalidTransition { from, .. } => {
                assert_eq!(from, SessionStatus::Finalizing)
            }
            other => panic!("expected InvalidTransition, got {other}"),
        }
    }

    #[test]
    fn settle_all_charged_completes() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        s.add_items(&p1.id, &[burger(1000)], 3_000).unwrap();
        s.lock(&host(), 4_000).unwrap();
        let (owed, _) = s.begin_finalize(&host(), 5_000).unwrap();
        assert_eq!(owed[&p1.id], 1000);

        let event = s
            .settle(vec![charged(&p1.id, 1000)], "order-1".to_string(), 6_000)
            .unwrap();
        assert!(matches!(event, Event::OrderPlaced { .. }));
        assert_eq!(s.status, SessionStatus::Completed);
    }

    #[test]
    fn settle_with_failure_cancels_and_reports_outcomes() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        let (p2, _) = s.join(Identity::new("ben"), 2_100).unwrap();
        s.add_items(&p1.id, &[burger(1000)], 3_000).unwrap();
        s.add_items(&p2.id, &[burger(1000)], 3_100).unwrap();
        s.lock(&host(), 4_000).unwrap();
        s.begin_finalize(&host(), 5_000).unwrap();

        let event = s
            .settle(
                vec![charged(&p1.id, 1000), declined(&p2.id, 1000)],
                "order-1".to_string(),
                6_000,
            )
            .unwrap();
        match event {
            Event::SessionCancelled { reason, charges, .. } => {
                assert!(reason.unwrap().contains(&p2.id));
                assert_eq!(charges.len(), 2);
            }
            other => panic!("expected SessionCancelled, got {other:?}"),
        }
        assert_eq!(s.status, SessionStatus::Cancelled);
        // The successful charge is reported so the caller can refund.
        assert!(s.charge_outcomes()[0].succeeded());
    }

    #[test]
    fn place_order_denied_for_strangers() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        s.add_items(&p1.id, &[burger(1000)], 3_000).unwrap();
        s.lock(&host(), 4_000).unwrap();

        let err = s
            .begin_finalize(&Identity::new("rando"), 5_000)
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        // A participant (not just the host) may place the order.
        s.begin_finalize(&Identity::new("ana"), 6_000).unwrap();
    }

    #[test]
    fn removed_participant_items_drop_out_of_totals() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        let (p2, _) = s.join(Identity::new("ben"), 2_100).unwrap();
        s.add_items(&p1.id, &[burger(1000)], 3_000).unwrap();
        s.add_items(&p2.id, &[burger(800)], 3_100).unwrap();
        assert_eq!(s.total_cents(), 1800);

        s.remove_participant(&p2.id, &host(), 4_000).unwrap();
        assert_eq!(s.total_cents(), 1000);
        // Ledger still holds the items for audit.
        assert_eq!(s.to_info().items.len(), 2);
    }

    #[test]
    fn remove_participant_requires_host() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        let err = s
            .remove_participant(&p1.id, &Identity::new("ana"), 3_000)
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
    }

    #[test]
    fn items_transfer_to_host_under_transfer_policy() {
        let mut p = policy();
        p.removed_items_to_host = true;
        let mut s = session_with(p);
        let (host_p, _) = s.join(host(), 2_000).unwrap();
        let (p2, _) = s.join(Identity::new("ben"), 2_100).unwrap();
        s.add_items(&p2.id, &[burger(800)], 3_000).unwrap();

        s.remove_participant(&p2.id, &host(), 4_000).unwrap();
        // The item moved to the host, so the total keeps it.
        assert_eq!(s.total_cents(), 800);
        let info = s.to_info();
        assert_eq!(info.items[0].added_by, host_p.id);
    }

    #[test]
    fn item_removal_authorization() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        s.join(Identity::new("ben"), 2_100).unwrap();
        let (items, _) = s.add_items(&p1.id, &[burger(1000)], 3_000).unwrap();
        let item_id = items[0].id.clone();

        // A different participant may not remove it.
        let err = s
            .remove_item(&item_id, &Identity::new("ben"), 4_000)
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        // The author may.
        s.remove_item(&item_id, &Identity::new("ana"), 5_000).unwrap();
        assert_eq!(s.total_cents(), 0);
    }

    #[test]
    fn host_may_remove_any_item() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        let (items, _) = s.add_items(&p1.id, &[burger(1000)], 3_000).unwrap();

        s.remove_item(&items[0].id, &host(), 4_000).unwrap();
        assert_eq!(s.total_cents(), 0);
    }

    #[test]
    fn split_and_limit_setters_are_host_only() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();

        let err = s
            .set_payment_split(&Identity::new("ana"), SplitPolicy::ByItems, 3_000)
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        let err = s
            .set_spending_limit(&Identity::new("ana"), &p1.id, Some(500), 3_000)
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        s.set_payment_split(&host(), SplitPolicy::ByItems, 4_000)
            .unwrap();
        s.set_spending_limit(&host(), &p1.id, Some(500), 5_000)
            .unwrap();
        assert_eq!(s.spending_limits[&p1.id], 500);
    }

    #[test]
    fn lowering_a_limit_below_spent_is_rejected() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        s.add_items(&p1.id, &[burger(1000)], 3_000).unwrap();

        let err = s
            .set_spending_limit(&host(), &p1.id, Some(500), 4_000)
            .unwrap_err();
        assert!(matches!(err, EngineError::SpendingLimitExceeded { .. }));
        // The old (absent) cap still applies.
        assert!(!s.spending_limits.contains_key(&p1.id));

        s.set_spending_limit(&host(), &p1.id, Some(1000), 5_000)
            .unwrap();
        let err = s.add_items(&p1.id, &[burger(1)], 6_000).unwrap_err();
        assert!(matches!(err, EngineError::SpendingLimitExceeded { .. }));
    }

    #[test]
    fn leave_is_idempotent_and_emits_once() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();

        assert!(s.leave(&p1.id, 3_000).unwrap().is_some());
        assert!(s.leave(&p1.id, 4_000).unwrap().is_none());
    }

    #[test]
    fn idle_expiry_rearms_while_active() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        s.touch_activity(&p1.id, 10_000).unwrap();

        match s.handle_idle_expiry(5_000, 12_000) {
            IdleOutcome::Rearm(at) => assert_eq!(at, 15_000),
            _ => panic!("expected rearm"),
        }
        match s.handle_idle_expiry(5_000, 15_000) {
            IdleOutcome::Expired(event) => {
                assert!(matches!(event, Event::SessionExpired { .. }))
            }
            _ => panic!("expected expiry"),
        }
        assert_eq!(s.status, SessionStatus::Expired);
    }

    #[test]
    fn snapshot_round_trip_preserves_versions() {
        let mut s = session();
        let (p1, _) = s.join(Identity::new("ana"), 2_000).unwrap();
        let (items, _) = s.add_items(&p1.id, &[burger(1000)], 3_000).unwrap();
        let patch = ItemPatch {
            quantity: Some(3),
            customizations: None,
        };
        s.update_item(&items[0].id, 1, &patch, &p1.id, 4_000).unwrap();

        let json = serde_json::to_string(&s.snapshot()).unwrap();
        let snapshot: SessionSnapshot = serde_json::from_str(&json).unwrap();
        let restored = GroupOrderSession::restore(snapshot);

        assert_eq!(restored.status, SessionStatus::Active);
        assert_eq!(restored.total_cents(), 3000);
        let info = restored.to_info();
        assert_eq!(info.items[0].version, 2);

        // Optimistic concurrency continues from the restored counter.
        let mut restored = restored;
        let err = restored
            .update_item(&items[0].id, 1, &patch, &p1.id, 5_000)
            .unwrap_err();
        assert!(matches!(err, EngineError::VersionConflict { .. }));
    }
}
