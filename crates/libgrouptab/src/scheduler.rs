use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use tokio::sync::Notify;

use grouptab_protocol::SessionId;

/// What a timer firing means for the session it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadlineKind {
    /// The order deadline: lock the session, or expire it if empty.
    OrderDeadline,
    /// Idle-timeout probe: expire the session if nothing happened.
    IdleCheck,
}

#[derive(PartialEq, Eq)]
struct Entry {
    fire_at_ms: u64,
    seq: u64,
    session_id: SessionId,
    kind: DeadlineKind,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.fire_at_ms, self.seq).cmp(&(other.fire_at_ms, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    heap: BinaryHeap<Reverse<Entry>>,
    /// Live registrations: (session, kind) -> latest seq. Entries in the
    /// heap with a different seq are tombstones and get skipped on pop,
    /// so cancellation never needs random heap removal.
    live: HashMap<(SessionId, DeadlineKind), u64>,
    next_seq: u64,
}

/// Process-wide timer facility keyed by deadline. Holds session IDs only,
/// never sessions; the registry owns both this and the sessions and
/// delivers fires to each session's serialized entry point. Late or
/// duplicate fires are harmless there, so this side only has to promise
/// "at least once, not before the deadline".
pub struct DeadlineScheduler {
    state: Mutex<State>,
    /// Woken whenever the earliest deadline may have moved.
    pub(crate) notify: Notify,
}

impl DeadlineScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                live: HashMap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Register or replace the timer of `kind` for a session.
    pub fn register(&self, session_id: &str, fire_at_ms: u64, kind: DeadlineKind) {
        let mut state = self.state.lock().expect("scheduler lock");
        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .live
            .insert((session_id.to_string(), kind), seq);
        state.heap.push(Reverse(Entry {
            fire_at_ms,
            seq,
            session_id: session_id.to_string(),
            kind,
        }));
        drop(state);
        self.notify.notify_one();
    }

    /// Cancel one kind of timer for a session. Idempotent.
    pub fn cancel(&self, session_id: &str, kind: DeadlineKind) {
        let mut state = self.state.lock().expect("scheduler lock");
        state.live.remove(&(session_id.to_string(), kind));
    }

    /// Cancel every pending timer for a session. Idempotent.
    pub fn cancel_all(&self, session_id: &str) {
        let mut state = self.state.lock().expect("scheduler lock");
        state.live.retain(|(sid, _), _| sid != session_id);
    }

    /// Earliest live deadline, if any. Tombstoned heap heads are pruned
    /// on the way.
    pub fn next_fire_ms(&self) -> Option<u64> {
        let mut state = self.state.lock().expect("scheduler lock");
        loop {
            let Some(Reverse(head)) = state.heap.peek() else {
                return None;
            };
            let key = (head.session_id.clone(), head.kind);
            let head_seq = head.seq;
            let fire_at = head.fire_at_ms;
            if state.live.get(&key) == Some(&head_seq) {
                return Some(fire_at);
            }
            state.heap.pop();
        }
    }

    /// Pop every live entry due at or before `now_ms`. Popped entries are
    /// deregistered; the caller re-registers if it wants another fire.
    pub fn due(&self, now_ms: u64) -> Vec<(SessionId, DeadlineKind)> {
        let mut state = self.state.lock().expect("scheduler lock");
        let mut fired = Vec::new();
        while let Some(Reverse(head)) = state.heap.peek() {
            if head.fire_at_ms > now_ms {
                break;
            }
            let Reverse(entry) = state.heap.pop().expect("non-empty heap");
            let key = (entry.session_id.clone(), entry.kind);
            if state.live.get(&key) == Some(&entry.seq) {
                state.live.remove(&key);
                fired.push((entry.session_id, entry.kind));
            }
        }
        fired
    }
}

impl Default for DeadlineScheduler {
    fn default() -> Self {
        Self::new()
    }
}
