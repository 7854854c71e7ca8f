use serde::{Deserialize, Serialize};

use grouptab_protocol::{Identity, ParticipantId, ParticipantInfo, ParticipantStatus};

use crate::error::EngineError;

/// One diner's presence within a session. References the session only by
/// being owned by it; never holds a pointer back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub identity: Identity,
    pub joined_at_ms: u64,
    pub last_activity_at_ms: u64,
    pub status: ParticipantStatus,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.status == ParticipantStatus::Active
    }

    pub fn to_info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            identity: self.identity.clone(),
            joined_at_ms: self.joined_at_ms,
            last_activity_at_ms: self.last_activity_at_ms,
            status: self.status,
        }
    }
}

/// Join-ordered participant list with capacity and status invariants.
/// Owned exclusively by one session; all mutation goes through the
/// session's serialized entry points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantRoster {
    participants: Vec<Participant>,
}

impl ParticipantRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant with a fresh ID. The caller has already verified
    /// the session is joinable; this only enforces the capacity cap.
    pub fn join(
        &mut self,
        identity: Identity,
        max_participants: usize,
        now_ms: u64,
    ) -> Result<Participant, EngineError> {
        if self.active_count() >= max_participants {
            return Err(EngineError::CapacityExceeded(format!(
                "session already has {max_participants} active participants"
            )));
        }

        let participant = Participant {
            id: uuid::Uuid::new_v4().to_string(),
            identity,
            joined_at_ms: now_ms,
            last_activity_at_ms: now_ms,
            status: ParticipantStatus::Active,
        };
        self.participants.push(participant.clone());
        Ok(participant)
    }

    /// Mark a participant as having left. Their items stay in the ledger;
    /// totals and splits exclude them. Leaving twice is an idempotent
    /// no-op; returns whether the status actually changed.
    pub fn leave(&mut self, participant_id: &str, now_ms: u64) -> Result<bool, EngineError> {
        let participant = self
            .get_mut(participant_id)
            .ok_or_else(|| EngineError::ParticipantNotFound(participant_id.to_string()))?;

        if participant.status == ParticipantStatus::Left {
            return Ok(false);
        }
        participant.status = ParticipantStatus::Left;
        participant.last_activity_at_ms = now_ms;
        Ok(true)
    }

    pub fn touch_activity(&mut self, participant_id: &str, now_ms: u64) -> Result<(), EngineError> {
        let participant = self
            .get_mut(participant_id)
            .ok_or_else(|| EngineError::ParticipantNotFound(participant_id.to_string()))?;
        participant.last_activity_at_ms = now_ms;
        Ok(())
    }

    pub fn get(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == participant_id)
    }

    fn get_mut(&mut self, participant_id: &str) -> Option<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| p.id == participant_id)
    }

    pub fn is_active(&self, participant_id: &str) -> bool {
        self.get(participant_id).is_some_and(|p| p.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.participants.iter().filter(|p| p.is_active()).count()
    }

    /// Count of everyone who ever joined, including `Left`.
    pub fn ever_joined(&self) -> usize {
        self.participants.len()
    }

    /// Participants in join order. The split calculator relies on this
    /// ordering for deterministic remainder-cent assignment.
    pub fn in_join_order(&self) -> &[Participant] {
        &self.participants
    }

    /// Look up a joined participant by their captured identity.
    pub fn find_by_identity(&self, identity: &Identity) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.identity == identity)
    }

    pub fn to_info(&self) -> Vec<ParticipantInfo> {
        self.participants.iter().map(|p| p.to_info()).collect()
    }
}
