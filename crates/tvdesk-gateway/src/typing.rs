//! Typing indicator timers.
//!
//! At most one pending auto-clear per (room, user). Re-arming aborts the
//! previous timer; a generation number guards against a timer that already
//! woke up racing with a refresh.

use std::collections::HashMap;

use tokio::task::AbortHandle;

use tvdesk_types::models::{Identity, RoomId};

pub type TypingKey = (RoomId, String);

struct ActiveTimer {
    generation: u64,
    /// Identity to announce on expiry, even if the user is gone by then.
    identity: Identity,
    handle: AbortHandle,
}

#[derive(Default)]
pub struct TypingTimers {
    active: HashMap<TypingKey, ActiveTimer>,
    next_generation: u64,
}

impl TypingTimers {
    /// Arms (or re-arms) the auto-clear for `key`. `spawn` receives the new
    /// generation and returns the handle of the scheduled task.
    pub fn arm(&mut self, key: TypingKey, identity: Identity, spawn: impl FnOnce(u64) -> AbortHandle) {
        let generation = self.next_generation;
        self.next_generation += 1;

        if let Some(previous) = self.active.remove(&key) {
            previous.handle.abort();
        }

        let handle = spawn(generation);
        self.active.insert(
            key,
            ActiveTimer {
                generation,
                identity,
                handle,
            },
        );
    }

    /// Explicit stop. Returns the identity if the user was typing.
    pub fn clear(&mut self, key: &TypingKey) -> Option<Identity> {
        self.active.remove(key).map(|timer| {
            timer.handle.abort();
            timer.identity
        })
    }

    /// Called by the timer task itself. Only the current generation may expire.
    pub fn expire(&mut self, key: &TypingKey, generation: u64) -> Option<Identity> {
        match self.active.get(key) {
            Some(timer) if timer.generation == generation => self.active.remove(key).map(|t| t.identity),
            _ => None,
        }
    }

    pub fn is_typing(&self, key: &TypingKey) -> bool {
        self.active.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
