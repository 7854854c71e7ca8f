use std::time::Duration;

/// Engine-wide configuration. All knobs have working defaults; callers
/// override fields as needed before handing the config to the registry.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on concurrently non-terminal sessions per restaurant. Protects
    /// the join-code space from exhaustion.
    pub max_active_sessions_per_restaurant: usize,
    /// Cap on active participants per session.
    pub max_participants_per_session: usize,
    /// Length of generated join codes.
    pub join_code_len: usize,
    /// How many collision retries before create fails.
    pub join_code_retry_limit: usize,
    /// Hard timeout per payment-gateway charge. A timeout is treated as a
    /// failed charge, never a successful one.
    pub charge_timeout: Duration,
    /// Buffer size of each session's event broadcast channel.
    pub event_buffer: usize,
    /// If set, sessions with no mutation for this long hard-expire.
    pub idle_timeout: Option<Duration>,
    /// Whether locking also freezes item edits for existing participants.
    /// Default keeps edits open until the order is placed.
    pub lock_freezes_items: bool,
    /// Whether a removed participant's items transfer to the host when the
    /// host has joined as a participant. Default excludes them from totals
    /// but keeps them in the ledger for audit.
    pub removed_items_to_host: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_active_sessions_per_restaurant: 100,
            max_participants_per_session: 20,
            join_code_len: 6,
            join_code_retry_limit: 16,
            charge_timeout: Duration::from_secs(10),
            event_buffer: 64,
            idle_timeout: None,
            lock_freezes_items: false,
            removed_items_to_host: false,
        }
    }
}

/// The per-session slice of the configuration, copied into each session
/// at creation so policy stays stable for the session's lifetime.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct SessionPolicy {
    pub max_participants: usize,
    pub lock_freezes_items: bool,
    pub removed_items_to_host: bool,
}

impl From<&EngineConfig> for SessionPolicy {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            max_participants: cfg.max_participants_per_session,
            lock_freezes_items: cfg.lock_freezes_items,
            removed_items_to_host: cfg.removed_items_to_host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.join_code_len, 6);
        assert!(cfg.join_code_retry_limit > 0);
        assert!(cfg.max_participants_per_session > 1);
        assert!(!cfg.lock_freezes_items);
        assert!(!cfg.removed_items_to_host);
    }

    #[test]
    fn session_policy_copies_engine_fields() {
        let mut cfg = EngineConfig::default();
        cfg.lock_freezes_items = true;
        cfg.max_participants_per_session = 4;
        let policy = SessionPolicy::from(&cfg);
        assert!(policy.lock_freezes_items);
        assert_eq!(policy.max_participants, 4);
    }
}
