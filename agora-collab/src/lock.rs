//! Exclusive, time-bounded document locks within one session.
//!
//! Expiry is lazy: a lock whose `expires_at` has passed is treated as absent
//! by every call. Callers that need to announce the expiry (the session
//! store emits `document_unlocked` with reason `expired`) collect expired
//! locks first with [`LockManager::expire_document`] or
//! [`LockManager::expire_all`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{CollabError, CollabResult};
use crate::model::{DocumentId, Timestamp, UserId};

/// An exclusive edit claim on one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub document_id: DocumentId,
    pub holder: UserId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl Lock {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }
}

/// Returned to the caller of a successful acquire.
pub type LockToken = Lock;

/// Lock table for a single session.
#[derive(Debug, Clone)]
pub struct LockManager {
    locks: HashMap<DocumentId, Lock>,
    max_duration: Duration,
}

impl LockManager {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            locks: HashMap::new(),
            max_duration,
        }
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Acquire or renew the lock on `document_id`.
    ///
    /// The requested duration is clamped to the configured maximum.
    /// Re-acquiring by the current holder extends the expiry.
    pub fn acquire(
        &mut self,
        document_id: &str,
        user_id: &str,
        duration: Duration,
        now: Timestamp,
    ) -> CollabResult<LockToken> {
        let ttl = duration.min(self.max_duration).as_millis() as u64;

        if let Some(existing) = self.live(document_id, now) {
            if existing.holder != user_id {
                return Err(CollabError::AlreadyLocked {
                    document_id: document_id.to_string(),
                    holder: existing.holder.clone(),
                    expires_at: existing.expires_at,
                });
            }
        }

        let lock = match self.locks.get_mut(document_id) {
            Some(existing) if existing.holder == user_id && !existing.is_expired(now) => {
                existing.expires_at = now + ttl;
                existing.clone()
            }
            _ => {
                let lock = Lock {
                    document_id: document_id.to_string(),
                    holder: user_id.to_string(),
                    acquired_at: now,
                    expires_at: now + ttl,
                };
                self.locks.insert(document_id.to_string(), lock.clone());
                lock
            }
        };
        Ok(lock)
    }

    /// Release the lock on `document_id`.
    ///
    /// Returns the released lock, or `None` when there was no live lock.
    pub fn release(
        &mut self,
        document_id: &str,
        user_id: &str,
        now: Timestamp,
    ) -> CollabResult<Option<Lock>> {
        match self.live(document_id, now) {
            None => Ok(None),
            Some(lock) if lock.holder != user_id => Err(CollabError::NotHolder {
                document_id: document_id.to_string(),
                holder: lock.holder.clone(),
            }),
            Some(_) => Ok(self.locks.remove(document_id)),
        }
    }

    /// Fails with `AlreadyLocked` when someone other than `user_id` holds a
    /// live lock on the document.
    pub fn check_write(&self, document_id: &str, user_id: &str, now: Timestamp) -> CollabResult<()> {
        match self.live(document_id, now) {
            Some(lock) if lock.holder != user_id => Err(CollabError::AlreadyLocked {
                document_id: document_id.to_string(),
                holder: lock.holder.clone(),
                expires_at: lock.expires_at,
            }),
            _ => Ok(()),
        }
    }

    /// Remove the lock on `document_id` if it has expired.
    pub fn expire_document(&mut self, document_id: &str, now: Timestamp) -> Option<Lock> {
        if self.locks.get(document_id)?.is_expired(now) {
            self.locks.remove(document_id)
        } else {
            None
        }
    }

    /// Remove every expired lock.
    pub fn expire_all(&mut self, now: Timestamp) -> Vec<Lock> {
        let expired: Vec<DocumentId> = self
            .locks
            .values()
            .filter(|l| l.is_expired(now))
            .map(|l| l.document_id.clone())
            .collect();
        let mut removed: Vec<Lock> = expired
            .iter()
            .filter_map(|id| self.locks.remove(id))
            .collect();
        removed.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        removed
    }

    /// Drop every lock held by `user_id` (holder disconnected or left).
    pub fn release_all_held_by(&mut self, user_id: &str) -> Vec<Lock> {
        let held: Vec<DocumentId> = self
            .locks
            .values()
            .filter(|l| l.holder == user_id)
            .map(|l| l.document_id.clone())
            .collect();
        let mut removed: Vec<Lock> = held.iter().filter_map(|id| self.locks.remove(id)).collect();
        removed.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        removed
    }

    pub fn get(&self, document_id: &str, now: Timestamp) -> Option<&Lock> {
        self.live(document_id, now)
    }

    /// Live locks ordered by document id.
    pub fn active(&self, now: Timestamp) -> Vec<Lock> {
        let mut locks: Vec<Lock> = self
            .locks
            .values()
            .filter(|l| !l.is_expired(now))
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        locks
    }

    /// Restore a lock from an export. Expired entries are ignored on access.
    pub fn restore(&mut self, lock: Lock) {
        self.locks.insert(lock.document_id.clone(), lock);
    }

    fn live(&self, document_id: &str, now: Timestamp) -> Option<&Lock> {
        self.locks.get(document_id).filter(|l| !l.is_expired(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECS: u64 = 1_000;

    fn manager() -> LockManager {
        LockManager::new(Duration::from_secs(300))
    }

    #[test]
    fn test_acquire_and_conflict() {
        let mut locks = manager();
        let lock = locks.acquire("D1", "alice", Duration::from_secs(60), 0).unwrap();
        assert_eq!(lock.holder, "alice");
        assert_eq!(lock.expires_at, 60 * SECS);

        let err = locks.acquire("D1", "bob", Duration::from_secs(60), 10).unwrap_err();
        match err {
            CollabError::AlreadyLocked { holder, .. } => assert_eq!(holder, "alice"),
            other => panic!("expected AlreadyLocked, got {other:?}"),
        }
    }

    #[test]
    fn test_renewal_extends_expiry() {
        let mut locks = manager();
        locks.acquire("D1", "alice", Duration::from_secs(60), 0).unwrap();
        let renewed = locks.acquire("D1", "alice", Duration::from_secs(60), 30 * SECS).unwrap();
        assert_eq!(renewed.acquired_at, 0);
        assert_eq!(renewed.expires_at, 90 * SECS);
    }

    #[test]
    fn test_duration_is_clamped() {
        let mut locks = manager();
        let lock = locks.acquire("D1", "alice", Duration::from_secs(3_600), 0).unwrap();
        assert_eq!(lock.expires_at, 300 * SECS);
    }

    #[test]
    fn test_expired_lock_is_absent() {
        let mut locks = manager();
        locks.acquire("D1", "alice", Duration::from_secs(300), 0).unwrap();
        // Exactly at expiry the lock still holds.
        assert!(locks.check_write("D1", "bob", 300 * SECS).is_err());
        assert!(locks.check_write("D1", "bob", 301 * SECS).is_ok());

        let expired = locks.expire_document("D1", 301 * SECS).unwrap();
        assert_eq!(expired.holder, "alice");
        let lock = locks.acquire("D1", "bob", Duration::from_secs(10), 301 * SECS).unwrap();
        assert_eq!(lock.holder, "bob");
    }

    #[test]
    fn test_release_rules() {
        let mut locks = manager();
        assert_eq!(locks.release("D1", "alice", 0).unwrap(), None);

        locks.acquire("D1", "alice", Duration::from_secs(60), 0).unwrap();
        let err = locks.release("D1", "bob", 0).unwrap_err();
        assert!(matches!(err, CollabError::NotHolder { .. }));

        let released = locks.release("D1", "alice", 0).unwrap();
        assert!(released.is_some());
        assert!(locks.get("D1", 0).is_none());
    }

    #[test]
    fn test_release_all_held_by() {
        let mut locks = manager();
        locks.acquire("D1", "alice", Duration::from_secs(60), 0).unwrap();
        locks.acquire("D2", "alice", Duration::from_secs(60), 0).unwrap();
        locks.acquire("D3", "bob", Duration::from_secs(60), 0).unwrap();

        let released = locks.release_all_held_by("alice");
        let ids: Vec<_> = released.iter().map(|l| l.document_id.as_str()).collect();
        assert_eq!(ids, vec!["D1", "D2"]);
        assert_eq!(locks.active(0).len(), 1);
    }

    #[test]
    fn test_expire_all() {
        let mut locks = manager();
        locks.acquire("D1", "alice", Duration::from_secs(10), 0).unwrap();
        locks.acquire("D2", "bob", Duration::from_secs(100), 0).unwrap();
        let expired = locks.expire_all(11 * SECS);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].document_id, "D1");
        assert_eq!(locks.active(11 * SECS).len(), 1);
    }
}
