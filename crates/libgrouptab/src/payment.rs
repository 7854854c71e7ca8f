use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use grouptab_protocol::{ChargeOutcome, ChargeStatus, ParticipantId, SessionId};

/// One charge request, as handed to the gateway. How the gateway resolves
/// the participant to a payment method is its business; the engine only
/// identifies who owes what.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub amount_cents: u64,
}

/// Outcome of a single charge attempt from the gateway's point of view.
/// Transport-level failures map to `Declined` with a reason; the engine
/// never distinguishes them from a card decline.
#[derive(Debug, Clone)]
pub enum ChargeResult {
    Approved { reference: String },
    Declined { reason: String },
}

/// The payment collaborator. Implementations wrap a real processor; the
/// engine calls `charge` once per participant with a non-zero owed
/// amount during finalization.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: ChargeRequest) -> ChargeResult;
}

/// Issue one charge with a hard timeout. A timeout is conservatively
/// treated as not-charged so the session takes the cancellation path
/// rather than completing on an unknown outcome.
pub async fn charge_with_timeout(
    gateway: &dyn PaymentGateway,
    request: ChargeRequest,
    timeout: Duration,
) -> ChargeOutcome {
    let participant_id = request.participant_id.clone();
    let amount_cents = request.amount_cents;
    let session_id = request.session_id.clone();

    let status = match tokio::time::timeout(timeout, gateway.charge(request)).await {
        Ok(ChargeResult::Approved { reference }) => ChargeStatus::Charged { reference },
        Ok(ChargeResult::Declined { reason }) => ChargeStatus::Failed { reason },
        Err(_) => {
            warn!(
                session_id = %session_id,
                participant_id = %participant_id,
                timeout_ms = timeout.as_millis() as u64,
                "charge timed out, treating as failed"
            );
            ChargeStatus::Failed {
                reason: "charge timed out".to_string(),
            }
        }
    };

    ChargeOutcome {
        participant_id,
        amount_cents,
        status,
    }
}

/// Scriptable gateway for tests and local development: approves
/// everything except the configured decline list, with an optional
/// artificial delay to exercise the timeout path.
#[derive(Default)]
pub struct StaticGateway {
    declines: HashSet<ParticipantId>,
    delay: Option<Duration>,
}

impl StaticGateway {
    pub fn approving() -> Self {
        Self::default()
    }

    pub fn declining<I: IntoIterator<Item = String>>(participants: I) -> Self {
        Self {
            declines: participants.into_iter().collect(),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl PaymentGateway for StaticGateway {
    async fn charge(&self, request: ChargeRequest) -> ChargeResult {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.declines.contains(&request.participant_id) {
            ChargeResult::Declined {
                reason: "card declined".to_string(),
            }
        } else {
            ChargeResult::Approved {
                reference: format!("chg-{}", uuid::Uuid::new_v4()),
            }
        }
    }
}
