// src/connection/inflight.rs

//! Tracks messages delivered to the application until FIN/REQ/expiry.

use crate::core::message::MessageId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

/// Per-message state shared between the connection actor and the `Message`
/// handed to the application. The actor owns deadline updates; the message
/// reads them for `expires_in` and the keepalive helper.
#[derive(Debug)]
pub(crate) struct InflightSlot {
    pub deadline: Mutex<Instant>,
    /// Set once the entry leaves the map: FIN/REQ completed or the deadline
    /// lapsed.
    pub finished: AtomicBool,
}

impl InflightSlot {
    fn new(deadline: Instant) -> Self {
        InflightSlot {
            deadline: Mutex::new(deadline),
            finished: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

/// The connection's inflight map: message id to shared slot.
#[derive(Debug, Default)]
pub(crate) struct InflightMap {
    entries: HashMap<MessageId, Arc<InflightSlot>>,
}

impl InflightMap {
    /// Registers a freshly delivered message with its expiry deadline.
    pub fn insert(&mut self, id: MessageId, deadline: Instant) -> Arc<InflightSlot> {
        let slot = Arc::new(InflightSlot::new(deadline));
        self.entries.insert(id, Arc::clone(&slot));
        slot
    }

    /// Releases an entry after FIN/REQ. Returns false when the id was
    /// already expired or never tracked.
    pub fn remove(&mut self, id: &MessageId) -> bool {
        match self.entries.remove(id) {
            Some(slot) => {
                slot.release();
                true
            }
            None => false,
        }
    }

    /// Pushes an entry's deadline out after TOUCH. Returns false when the
    /// id is no longer tracked.
    pub fn touch(&mut self, id: &MessageId, deadline: Instant) -> bool {
        match self.entries.get(id) {
            Some(slot) => {
                *slot.deadline.lock() = deadline;
                true
            }
            None => false,
        }
    }

    /// The earliest deadline across all entries, for the actor's timer arm.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .map(|slot| *slot.deadline.lock())
            .min()
    }

    /// Drops every entry whose deadline has lapsed, returning the ids for
    /// logging. The server requeues these independently.
    pub fn expire(&mut self, now: Instant) -> Vec<MessageId> {
        let expired: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|(_, slot)| *slot.deadline.lock() <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(slot) = self.entries.remove(id) {
                slot.release();
            }
        }
        expired
    }

    /// Releases everything, used when the socket drops: the server will
    /// redeliver on whichever connection picks the messages up next.
    pub fn clear(&mut self) {
        for slot in self.entries.values() {
            slot.release();
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
