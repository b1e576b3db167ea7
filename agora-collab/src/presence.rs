//! Per-room presence: who is online, when they were last seen, and which
//! session they are looking at.
//!
//! ## Heartbeat contract
//!
//! ```text
//! client ── heartbeat (every heartbeat_interval) ──► touch()
//!                                                      │
//! sweep(now) ◄── periodic ─────────────────────────────┘
//!     │  last_seen + 2 × heartbeat_interval < now
//!     ▼
//! status = Offline  ──► caller releases locks, emits user_left(disconnected)
//! ```
//!
//! Going offline keeps the record; only an explicit leave removes it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::model::{SessionId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen: Timestamp,
    /// Session the user most recently joined or touched.
    pub session_id: Option<SessionId>,
}

/// Presence state for every user of one room.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    records: BTreeMap<UserId, PresenceRecord>,
    heartbeat_interval: Duration,
}

impl PresenceTracker {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            heartbeat_interval,
        }
    }

    /// Mark the user online. Returns `true` when this is a transition
    /// (new record or previously offline).
    pub fn mark_online(&mut self, user_id: &str, session_id: Option<SessionId>, now: Timestamp) -> bool {
        match self.records.get_mut(user_id) {
            Some(record) => {
                let was_offline = record.status == PresenceStatus::Offline;
                record.status = PresenceStatus::Online;
                record.last_seen = now;
                if session_id.is_some() {
                    record.session_id = session_id;
                }
                was_offline
            }
            None => {
                self.records.insert(
                    user_id.to_string(),
                    PresenceRecord {
                        user_id: user_id.to_string(),
                        status: PresenceStatus::Online,
                        last_seen: now,
                        session_id,
                    },
                );
                true
            }
        }
    }

    /// Mark the user offline. Returns `true` when the user was online.
    pub fn mark_offline(&mut self, user_id: &str, now: Timestamp) -> bool {
        match self.records.get_mut(user_id) {
            Some(record) if record.status == PresenceStatus::Online => {
                record.status = PresenceStatus::Offline;
                record.last_seen = now;
                true
            }
            _ => false,
        }
    }

    /// Record a heartbeat. Unknown users are ignored; offline users come back
    /// online. Returns `true` when the user transitioned back online.
    pub fn touch(&mut self, user_id: &str, now: Timestamp) -> bool {
        match self.records.get_mut(user_id) {
            Some(record) => {
                let revived = record.status == PresenceStatus::Offline;
                record.status = PresenceStatus::Online;
                record.last_seen = now;
                revived
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn remove(&mut self, user_id: &str) -> Option<PresenceRecord> {
        self.records.remove(user_id)
    }

    /// Mark every online user whose last heartbeat is older than
    /// `2 × heartbeat_interval` offline and return them.
    pub fn sweep(&mut self, now: Timestamp) -> Vec<UserId> {
        let timeout = 2 * self.heartbeat_interval.as_millis() as u64;
        let mut timed_out = Vec::new();
        for record in self.records.values_mut() {
            if record.status == PresenceStatus::Online && now.saturating_sub(record.last_seen) > timeout {
                record.status = PresenceStatus::Offline;
                timed_out.push(record.user_id.clone());
            }
        }
        timed_out
    }

    pub fn snapshot(&self) -> BTreeMap<UserId, PresenceStatus> {
        self.records
            .iter()
            .map(|(id, record)| (id.clone(), record.status))
            .collect()
    }

    pub fn record(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.records
            .get(user_id)
            .is_some_and(|r| r.status == PresenceStatus::Online)
    }

    pub fn online_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status == PresenceStatus::Online)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
