use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Unique identifier for a group-order session.
pub type SessionId = String;

/// Unique identifier for a participant within a session.
pub type ParticipantId = String;

/// Unique identifier for a line item within a session's ledger.
pub type ItemId = String;

/// Restaurant the session belongs to.
pub type RestaurantId = String;

/// Optional table the session is anchored to.
pub type TableId = String;

/// Format an integer cent amount as a dollar string, e.g. `1500 -> "$15.00"`.
pub fn format_cents(cents: u64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}

/// Identity captured at join time. Not necessarily a registered account;
/// verification is the auth collaborator's job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Identity {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            email: None,
        }
    }
}

/// Lifecycle status of a session. Transitions only move forward.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Locked,
    Finalizing,
    Completed,
    Cancelled,
    Expired,
}

impl SessionStatus {
    /// Terminal sessions accept no further mutation and may be reaped.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Expired
        )
    }

    /// Whether a join code for this session should still resolve.
    pub fn is_resolvable(self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Locked)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Locked => "locked",
            SessionStatus::Finalizing => "finalizing",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Participant presence within a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Active,
    Left,
}

/// One participant's share under a `Custom` split.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CustomShare {
    /// Fixed amount in cents. All fixed shares must sum to the session total.
    Fixed { amount_cents: u64 },
    /// Fraction of the total. All fractions must sum to 1.0 within epsilon.
    Fraction { fraction: f64 },
}

/// How the final total is divided across participants.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SplitPolicy {
    #[default]
    Equal,
    ByItems,
    Custom {
        splits: HashMap<ParticipantId, CustomShare>,
    },
}

/// A new line item as submitted by a participant.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewItem {
    pub menu_item_id: String,
    pub name: String,
    pub unit_price_cents: u64,
    pub quantity: u32,
    #[serde(default)]
    pub customizations: Vec<String>,
}

/// Partial update applied to an existing line item.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customizations: Option<Vec<String>>,
}

/// Snapshot of one participant, as reported to callers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub identity: Identity,
    pub joined_at_ms: u64,
    pub last_activity_at_ms: u64,
    pub status: ParticipantStatus,
}

/// Snapshot of one line item, as reported to callers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LineItemInfo {
    pub id: ItemId,
    pub menu_item_id: String,
    pub name: String,
    pub unit_price_cents: u64,
    pub quantity: u32,
    pub customizations: Vec<String>,
    pub added_by: ParticipantId,
    pub added_at_ms: u64,
    pub last_modified_by: ParticipantId,
    pub last_modified_at_ms: u64,
    pub version: u64,
}

impl LineItemInfo {
    pub fn total_cents(&self) -> u64 {
        self.unit_price_cents * u64::from(self.quantity)
    }
}

/// Full session view returned by `get_session` and carried in snapshots.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub join_code: String,
    pub restaurant_id: RestaurantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<TableId>,
    pub created_by: Identity,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_deadline_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub payment_split: SplitPolicy,
    /// Sum over items attributed to `Active` participants.
    pub total_cents: u64,
    pub participants: Vec<ParticipantInfo>,
    pub items: Vec<LineItemInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

/// Result of one participant's charge during finalization.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChargeOutcome {
    pub participant_id: ParticipantId,
    pub amount_cents: u64,
    pub status: ChargeStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChargeStatus {
    Charged { reference: String },
    Failed { reason: String },
}

impl ChargeOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, ChargeStatus::Charged { .. })
    }
}

/// Logical operations on the engine, transport-agnostic. A REST or
/// WebSocket binding maps its routes onto these.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    CreateSession {
        restaurant_id: RestaurantId,
        #[serde(default)]
        table_id: Option<TableId>,
        identity: Identity,
        /// Milliseconds until the order deadline, if any.
        #[serde(default)]
        expires_in_ms: Option<u64>,
        #[serde(default)]
        payment_split: SplitPolicy,
        #[serde(default)]
        spending_limits: HashMap<ParticipantId, u64>,
    },
    JoinSession {
        join_code: String,
        identity: Identity,
    },
    AddItems {
        session_id: SessionId,
        participant_id: ParticipantId,
        items: Vec<NewItem>,
    },
    UpdateItem {
        session_id: SessionId,
        item_id: ItemId,
        expected_version: u64,
        participant_id: ParticipantId,
        #[serde(default)]
        patch: ItemPatch,
    },
    RemoveItem {
        session_id: SessionId,
        item_id: ItemId,
        identity: Identity,
    },
    LockSession {
        session_id: SessionId,
        identity: Identity,
    },
    PlaceOrder {
        session_id: SessionId,
        identity: Identity,
    },
    CancelSession {
        session_id: SessionId,
        identity: Identity,
        #[serde(default)]
        reason: Option<String>,
    },
    RemoveParticipant {
        session_id: SessionId,
        participant_id: ParticipantId,
        identity: Identity,
    },
    SetPaymentSplit {
        session_id: SessionId,
        identity: Identity,
        payment_split: SplitPolicy,
    },
    SetSpendingLimit {
        session_id: SessionId,
        identity: Identity,
        participant_id: ParticipantId,
        /// `None` clears the cap.
        #[serde(default)]
        limit_cents: Option<u64>,
    },
    LeaveSession {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    TouchActivity {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    GetSession {
        session_id: SessionId,
    },
}

/// Domain events, one per successful mutation. The notification
/// collaborator fans these out to every device attached to the session.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SessionCreated {
        session_id: SessionId,
        join_code: String,
        restaurant_id: RestaurantId,
    },
    ParticipantJoined {
        session_id: SessionId,
        participant: ParticipantInfo,
    },
    ParticipantLeft {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    ParticipantRemoved {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    ItemsAdded {
        session_id: SessionId,
        participant_id: ParticipantId,
        items: Vec<LineItemInfo>,
    },
    ItemUpdated {
        session_id: SessionId,
        item: LineItemInfo,
    },
    ItemRemoved {
        session_id: SessionId,
        item_id: ItemId,
    },
    SessionLocked {
        session_id: SessionId,
    },
    SplitPolicyChanged {
        session_id: SessionId,
        payment_split: SplitPolicy,
    },
    SpendingLimitSet {
        session_id: SessionId,
        participant_id: ParticipantId,
        limit_cents: Option<u64>,
    },
    OrderPlaced {
        session_id: SessionId,
        order_reference: String,
        total_cents: u64,
        charges: Vec<ChargeOutcome>,
    },
    SessionCancelled {
        session_id: SessionId,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        charges: Vec<ChargeOutcome>,
    },
    SessionExpired {
        session_id: SessionId,
    },
}

/// Wire-facing error categories. Every engine error maps onto one of
/// these; none of them is fatal to the process.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvalidTransition,
    SessionNotJoinable,
    CapacityExceeded,
    Unauthorized,
    VersionConflict,
    SpendingLimitExceeded,
    InvalidSplitConfiguration,
    Internal,
}
