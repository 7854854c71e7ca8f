//! Group-ordering session engine.
//!
//! One `GroupOrderSession` owns a shared cart from creation to terminal
//! state; the `SessionRegistry` is the process-wide map that creates,
//! resolves, and reaps sessions and serializes every mutation behind the
//! session's own lock. Transport, auth, durable storage, and the payment
//! processor are collaborators behind the contracts in `store` and
//! `payment`.

pub mod config;
pub mod error;
pub mod events;
pub mod joincode;
pub mod ledger;
pub mod participants;
pub mod payment;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod split;
pub mod store;

pub use config::EngineConfig;
pub use error::EngineError;
pub use events::EventBroker;
pub use payment::{ChargeRequest, ChargeResult, PaymentGateway, StaticGateway};
pub use registry::{CreateSessionRequest, PlaceOrderOutcome, SessionRegistry};
pub use scheduler::{DeadlineKind, DeadlineScheduler};
pub use session::{GroupOrderSession, SessionParams, SessionSnapshot};
pub use split::compute_split;
pub use store::{MemoryStore, SessionStore};
