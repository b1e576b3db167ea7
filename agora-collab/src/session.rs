//! The session aggregate: one resource being edited inside a room.
//!
//! A `Session` is plain data mutated only by its room's sequencer, so none
//! of its methods lock or await. Methods that change state return what
//! changed and leave event fan-out to the caller.
//!
//! ```text
//!            join                 last leave              grace elapsed
//! Created ─────────► Active ───────────────► Draining ──────────────► Closed
//!    │                  ▲                        │
//!    │ grace elapsed    └──────── join ──────────┘
//!    └──────────────────────────────────────────────────────────────► Closed
//! ```
//!
//! The change log is capped. When the oldest record is evicted its op is
//! folded into `base_content`, so `base_content` plus the retained log always
//! reproduces the current content.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

use crate::collaborators::DocumentSnapshot;
use crate::error::{CollabError, CollabResult};
use crate::lock::{Lock, LockManager, LockToken};
use crate::model::{
    ActivityEntry, ActivityKind, Anchor, ChangeId, ChangeRecord, Comment, ConflictChoice,
    ConflictId, DocumentContent, EditOp, EditOutcome, LeaveReason, Message, Participant,
    PendingConflict, Permission, ResourceId, RoomId, SessionId, SessionState, Timestamp,
    UnlockReason,
};
use crate::protocol::{decode_binary, decode_json, encode_binary, ProtocolError};
use crate::resolver::{ConflictResolver, Resolution, Strategy};

/// Capacity and duration limits applied to every session.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub change_log_cap: usize,
    pub message_history_cap: usize,
    pub activity_log_cap: usize,
    pub lock_max: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            change_log_cap: 1_000,
            message_history_cap: 1_000,
            activity_log_cap: 10_000,
            lock_max: Duration::from_secs(300),
        }
    }
}

/// Result of settling a manual conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct SettledConflict {
    pub conflict: PendingConflict,
    /// The change applied for `TakeIncoming`.
    pub change: Option<ChangeRecord>,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    room_id: RoomId,
    resource_id: ResourceId,
    state: SessionState,
    created_at: Timestamp,
    participants: Vec<Participant>,
    content: DocumentContent,
    content_type: String,
    strategy: Strategy,
    version: u64,
    base_content: DocumentContent,
    base_version: u64,
    changes: VecDeque<ChangeRecord>,
    messages: VecDeque<Message>,
    activity: VecDeque<ActivityEntry>,
    comments: Vec<Comment>,
    locks: LockManager,
    conflicts: Vec<PendingConflict>,
    /// Start of the current empty period (Created or Draining).
    empty_since: Option<Timestamp>,
    dirty_since: Option<Timestamp>,
    edits_since_save: usize,
    limits: SessionLimits,
}

impl Session {
    pub fn new(
        room_id: impl Into<RoomId>,
        resource_id: impl Into<ResourceId>,
        snapshot: DocumentSnapshot,
        strategy: Strategy,
        limits: SessionLimits,
        now: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id: room_id.into(),
            resource_id: resource_id.into(),
            state: SessionState::Created,
            created_at: now,
            participants: Vec::new(),
            base_content: snapshot.content.clone(),
            base_version: snapshot.version,
            content: snapshot.content,
            content_type: snapshot.content_type,
            strategy,
            version: snapshot.version,
            changes: VecDeque::new(),
            messages: VecDeque::new(),
            activity: VecDeque::new(),
            comments: Vec::new(),
            locks: LockManager::new(limits.lock_max),
            conflicts: Vec::new(),
            empty_since: Some(now),
            dirty_since: None,
            edits_since_save: 0,
            limits,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn content(&self) -> &DocumentContent {
        &self.content
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant(user_id).is_some()
    }

    pub fn changes(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.changes.iter()
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn activity(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.activity.iter()
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn pending_conflicts(&self) -> &[PendingConflict] {
        &self.conflicts
    }

    pub fn locks(&self, now: Timestamp) -> Vec<Lock> {
        self.locks.active(now)
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot::new(self.content.clone(), self.version, self.content_type.clone())
    }

    // ─── Participants ─────────────────────────────────────────────────

    /// Add a participant. Returns `None` when the user was already present
    /// (only their activity time is refreshed).
    pub fn join(&mut self, user_id: &str, permission: Permission, now: Timestamp) -> Option<Participant> {
        if let Some(existing) = self.participants.iter_mut().find(|p| p.user_id == user_id) {
            existing.last_activity = now;
            return None;
        }
        let participant = Participant::new(user_id, permission, now);
        self.participants.push(participant.clone());
        if matches!(self.state, SessionState::Created | SessionState::Draining) {
            if self.state == SessionState::Draining {
                log::debug!("Session {} drain cancelled by {user_id}", self.id);
            }
            self.state = SessionState::Active;
            self.empty_since = None;
        }
        self.record(user_id, ActivityKind::Joined { permission }, now);
        Some(participant)
    }

    /// Remove a participant and every lock they hold. Leaving twice is a
    /// no-op that returns `None`.
    pub fn leave(&mut self, user_id: &str, now: Timestamp) -> Option<(Participant, Vec<Lock>)> {
        let index = self.participants.iter().position(|p| p.user_id == user_id)?;
        let participant = self.participants.remove(index);
        let released = self.locks.release_all_held_by(user_id);
        self.record(
            user_id,
            ActivityKind::Left {
                reason: LeaveReason::Left,
            },
            now,
        );
        if self.participants.is_empty() && self.state == SessionState::Active {
            self.state = SessionState::Draining;
            self.empty_since = Some(now);
            log::debug!("Session {} draining", self.id);
        }
        Some((participant, released))
    }

    pub fn touch(&mut self, user_id: &str, now: Timestamp) {
        if let Some(p) = self.participants.iter_mut().find(|p| p.user_id == user_id) {
            p.last_activity = now;
        }
    }

    /// Participant's permission, or `Forbidden` when absent or below `needed`.
    pub fn require(&self, user_id: &str, needed: Permission) -> CollabResult<Permission> {
        let participant = self.participant(user_id).ok_or_else(|| {
            CollabError::Forbidden(format!("{user_id} is not in session {}", self.id))
        })?;
        if participant.permission < needed {
            return Err(CollabError::Forbidden(format!(
                "{user_id} has {:?} permission, {:?} required",
                participant.permission, needed
            )));
        }
        Ok(participant.permission)
    }

    pub fn set_permission(
        &mut self,
        actor: &str,
        target: &str,
        permission: Permission,
        now: Timestamp,
    ) -> CollabResult<()> {
        let participant = self
            .participants
            .iter_mut()
            .find(|p| p.user_id == target)
            .ok_or_else(|| CollabError::NotFound(format!("participant {target}")))?;
        participant.permission = permission;
        self.record(
            actor,
            ActivityKind::PermissionChanged {
                target: target.to_string(),
                permission,
            },
            now,
        );
        Ok(())
    }

    // ─── Edits ────────────────────────────────────────────────────────

    /// Validate, resolve and apply one edit.
    ///
    /// Expired locks must already have been collected by the caller.
    pub fn apply_edit(
        &mut self,
        resolver: &ConflictResolver,
        author: &str,
        document_id: &str,
        base_version: u64,
        op: EditOp,
        now: Timestamp,
    ) -> CollabResult<EditOutcome> {
        self.require(author, Permission::Editor)?;
        self.check_document(document_id)?;
        if base_version > self.version {
            return Err(CollabError::InvalidOperation(format!(
                "base version {base_version} is ahead of session version {}",
                self.version
            )));
        }
        if base_version >= self.base_version {
            self.check_at(base_version, &op)?;
        }
        self.locks.check_write(document_id, author, now)?;
        self.touch(author, now);

        let resolution = if base_version < self.base_version {
            Resolution::Conflict {
                reason: format!(
                    "history before version {} is no longer retained",
                    self.base_version
                ),
                competing: self.changes.iter().map(|c| c.change_id).collect(),
            }
        } else {
            let since: Vec<ChangeRecord> = self
                .changes
                .iter()
                .filter(|c| c.version > base_version)
                .cloned()
                .collect();
            resolver.resolve(self.strategy, author, &op, &since)
        };

        match resolution {
            Resolution::Apply(resolved) => {
                let change = self.commit(author, resolved, now)?;
                Ok(EditOutcome::Applied {
                    change_id: change.change_id,
                    version: change.version,
                    op: change.op,
                })
            }
            Resolution::Superseded { by } => {
                log::debug!("Edit by {author} on {document_id} superseded by {by}");
                Ok(EditOutcome::Superseded {
                    by,
                    version: self.version,
                })
            }
            Resolution::Conflict { reason, competing } => {
                let conflict = PendingConflict {
                    conflict_id: Uuid::new_v4(),
                    session_id: self.id,
                    document_id: document_id.to_string(),
                    author: author.to_string(),
                    base_version,
                    current_version: self.version,
                    op,
                    strategy: self.strategy,
                    reason,
                    competing,
                    raised_at: now,
                };
                log::info!(
                    "Conflict {} in session {}: {}",
                    conflict.conflict_id,
                    self.id,
                    conflict.reason
                );
                self.conflicts.push(conflict.clone());
                self.record(
                    author,
                    ActivityKind::ConflictRaised {
                        conflict_id: conflict.conflict_id,
                    },
                    now,
                );
                Ok(EditOutcome::Conflict(conflict))
            }
        }
    }

    /// Settle a pending conflict.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        user_id: &str,
        choice: ConflictChoice,
        now: Timestamp,
    ) -> CollabResult<SettledConflict> {
        self.require(user_id, Permission::Editor)?;
        let index = self
            .conflicts
            .iter()
            .position(|c| c.conflict_id == conflict_id)
            .ok_or_else(|| CollabError::NotFound(format!("conflict {conflict_id}")))?;

        let change = match choice {
            ConflictChoice::KeepCurrent => None,
            ConflictChoice::TakeIncoming => {
                let op = self.conflicts[index].op.clone();
                let author = self.conflicts[index].author.clone();
                match self.commit(&author, op, now) {
                    Ok(change) => Some(change),
                    Err(e) => {
                        log::warn!("Conflict {conflict_id} cannot take incoming op: {e}");
                        return Err(CollabError::Conflict(conflict_id));
                    }
                }
            }
        };

        let conflict = self.conflicts.remove(index);
        self.record(user_id, ActivityKind::ConflictSettled { conflict_id, choice }, now);
        Ok(SettledConflict { conflict, change })
    }

    /// Bounds-check `op` against the content as of `version`, which must be
    /// covered by the retained log.
    fn check_at(&self, version: u64, op: &EditOp) -> CollabResult<()> {
        if version == self.version {
            return self.content.check(op);
        }
        let mut content = self.base_content.clone();
        for change in self.changes.iter().take_while(|c| c.version <= version) {
            content.apply(&change.op)?;
        }
        content.check(op)
    }

    /// Apply `op` to the content and append the change record.
    fn commit(&mut self, author: &str, op: EditOp, now: Timestamp) -> CollabResult<ChangeRecord> {
        self.content.apply(&op)?;
        self.version += 1;
        let change = ChangeRecord {
            change_id: Uuid::new_v4(),
            author: author.to_string(),
            document_id: self.resource_id.clone(),
            op,
            version: self.version,
            timestamp: now,
        };
        self.changes.push_back(change.clone());
        while self.changes.len() > self.limits.change_log_cap {
            if let Some(evicted) = self.changes.pop_front() {
                // The evicted op applied cleanly to content at the time, so it
                // applies to the base too.
                if let Err(e) = self.base_content.apply(&evicted.op) {
                    log::error!("Session {} base diverged at v{}: {e}", self.id, evicted.version);
                }
                self.base_version = evicted.version;
            }
        }
        self.dirty_since.get_or_insert(now);
        self.edits_since_save += 1;
        self.record(
            author,
            ActivityKind::Edited {
                change_id: change.change_id,
                version: change.version,
            },
            now,
        );
        Ok(change)
    }

    fn check_document(&self, document_id: &str) -> CollabResult<()> {
        if document_id == self.resource_id {
            Ok(())
        } else {
            Err(CollabError::NotFound(format!(
                "document {document_id} in session {}",
                self.id
            )))
        }
    }

    // ─── Locks ────────────────────────────────────────────────────────

    pub fn lock(
        &mut self,
        document_id: &str,
        user_id: &str,
        duration: Duration,
        now: Timestamp,
    ) -> CollabResult<LockToken> {
        self.require(user_id, Permission::Editor)?;
        self.check_document(document_id)?;
        let token = self.locks.acquire(document_id, user_id, duration, now)?;
        self.touch(user_id, now);
        self.record(
            user_id,
            ActivityKind::Locked {
                document_id: document_id.to_string(),
            },
            now,
        );
        Ok(token)
    }

    /// Release the caller's lock. `Ok(None)` when nothing was locked.
    pub fn unlock(&mut self, document_id: &str, user_id: &str, now: Timestamp) -> CollabResult<Option<Lock>> {
        self.check_document(document_id)?;
        let released = self.locks.release(document_id, user_id, now)?;
        if released.is_some() {
            self.record(
                user_id,
                ActivityKind::Unlocked {
                    document_id: document_id.to_string(),
                    reason: UnlockReason::Released,
                },
                now,
            );
        }
        Ok(released)
    }

    pub fn expire_lock(&mut self, document_id: &str, now: Timestamp) -> Option<Lock> {
        let expired = self.locks.expire_document(document_id, now)?;
        self.record_unlock(&expired, UnlockReason::Expired, now);
        Some(expired)
    }

    pub fn expire_locks(&mut self, now: Timestamp) -> Vec<Lock> {
        let expired = self.locks.expire_all(now);
        for lock in &expired {
            self.record_unlock(lock, UnlockReason::Expired, now);
        }
        expired
    }

    /// Drop every lock held by a disconnected user.
    pub fn release_locks_of(&mut self, user_id: &str, now: Timestamp) -> Vec<Lock> {
        let released = self.locks.release_all_held_by(user_id);
        for lock in &released {
            self.record_unlock(lock, UnlockReason::Disconnect, now);
        }
        released
    }

    fn record_unlock(&mut self, lock: &Lock, reason: UnlockReason, now: Timestamp) {
        self.record(
            &lock.holder,
            ActivityKind::Unlocked {
                document_id: lock.document_id.clone(),
                reason,
            },
            now,
        );
    }

    // ─── Messages and comments ────────────────────────────────────────

    pub fn push_message(&mut self, message: Message) {
        self.record(
            &message.author.clone(),
            ActivityKind::Messaged {
                message_id: message.message_id,
            },
            message.timestamp,
        );
        self.messages.push_back(message);
        while self.messages.len() > self.limits.message_history_cap {
            self.messages.pop_front();
        }
    }

    pub fn add_comment(
        &mut self,
        author: &str,
        document_id: &str,
        body: String,
        anchor: Option<Anchor>,
        now: Timestamp,
    ) -> CollabResult<Comment> {
        self.require(author, Permission::Commenter)?;
        self.check_document(document_id)?;
        if body.trim().is_empty() {
            return Err(CollabError::InvalidOperation("comment body is empty".to_string()));
        }
        if let Some(anchor) = anchor {
            if anchor.start > anchor.end || anchor.end > self.content.len() {
                return Err(CollabError::InvalidOperation(format!(
                    "anchor {}..{} outside document of length {}",
                    anchor.start,
                    anchor.end,
                    self.content.len()
                )));
            }
        }
        let comment = Comment {
            comment_id: Uuid::new_v4(),
            session_id: self.id,
            document_id: document_id.to_string(),
            author: author.to_string(),
            body,
            anchor,
            timestamp: now,
        };
        self.comments.push(comment.clone());
        self.touch(author, now);
        self.record(
            author,
            ActivityKind::Commented {
                comment_id: comment.comment_id,
            },
            now,
        );
        Ok(comment)
    }

    fn record(&mut self, user_id: &str, kind: ActivityKind, now: Timestamp) {
        self.activity.push_back(ActivityEntry {
            timestamp: now,
            user_id: user_id.to_string(),
            kind,
        });
        while self.activity.len() > self.limits.activity_log_cap {
            self.activity.pop_front();
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Empty for at least `grace`.
    pub fn drain_elapsed(&self, now: Timestamp, grace: Duration) -> bool {
        self.participants.is_empty()
            && self
                .empty_since
                .is_some_and(|since| now.saturating_sub(since) >= grace.as_millis() as u64)
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.participants.clear();
        self.empty_since = None;
    }

    /// Dirty for `interval`, or `threshold` edits since the last save.
    pub fn autosave_due(&self, now: Timestamp, interval: Duration, threshold: usize) -> bool {
        let Some(since) = self.dirty_since else {
            return false;
        };
        self.edits_since_save >= threshold
            || now.saturating_sub(since) >= interval.as_millis() as u64
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    pub fn mark_saved(&mut self) {
        self.dirty_since = None;
        self.edits_since_save = 0;
    }

    // ─── Export ───────────────────────────────────────────────────────

    pub fn export(&self, now: Timestamp) -> SessionExport {
        SessionExport {
            format_version: SessionExport::FORMAT_VERSION,
            session_id: self.id,
            room_id: self.room_id.clone(),
            resource_id: self.resource_id.clone(),
            state: self.state,
            created_at: self.created_at,
            exported_at: now,
            content_type: self.content_type.clone(),
            strategy: self.strategy,
            base_content: self.base_content.clone(),
            base_version: self.base_version,
            content: self.content.clone(),
            version: self.version,
            participants: self.participants.clone(),
            changes: self.changes.iter().cloned().collect(),
            messages: self.messages.iter().cloned().collect(),
            comments: self.comments.clone(),
            activity: self.activity.iter().cloned().collect(),
            locks: self.locks.active(now),
            conflicts: self.conflicts.clone(),
        }
    }

    /// Rebuild a session from an export. Participants and locks are not
    /// restored: importers rejoin through the room.
    pub fn from_export(
        room_id: impl Into<RoomId>,
        export: SessionExport,
        limits: SessionLimits,
        now: Timestamp,
    ) -> CollabResult<Self> {
        export.validate()?;
        let mut changes: VecDeque<ChangeRecord> = export.changes.into();
        let mut base_content = export.base_content;
        let mut base_version = export.base_version;
        while changes.len() > limits.change_log_cap {
            if let Some(evicted) = changes.pop_front() {
                base_content.apply(&evicted.op)?;
                base_version = evicted.version;
            }
        }
        let mut messages: VecDeque<Message> = export.messages.into();
        while messages.len() > limits.message_history_cap {
            messages.pop_front();
        }
        let mut activity: VecDeque<ActivityEntry> = export.activity.into();
        while activity.len() > limits.activity_log_cap {
            activity.pop_front();
        }

        Ok(Self {
            id: export.session_id,
            room_id: room_id.into(),
            resource_id: export.resource_id,
            state: SessionState::Created,
            created_at: export.created_at,
            participants: Vec::new(),
            content: export.content,
            content_type: export.content_type,
            strategy: export.strategy,
            version: export.version,
            base_content,
            base_version,
            changes,
            messages,
            activity,
            comments: export.comments,
            locks: LockManager::new(limits.lock_max),
            conflicts: export.conflicts,
            empty_since: Some(now),
            dirty_since: None,
            edits_since_save: 0,
            limits,
        })
    }
}

/// Audit snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionExport {
    pub format_version: u32,
    pub session_id: SessionId,
    pub room_id: RoomId,
    pub resource_id: ResourceId,
    pub state: SessionState,
    pub created_at: Timestamp,
    pub exported_at: Timestamp,
    pub content_type: String,
    pub strategy: Strategy,
    /// Content before the oldest retained change.
    pub base_content: DocumentContent,
    pub base_version: u64,
    pub content: DocumentContent,
    pub version: u64,
    pub participants: Vec<Participant>,
    pub changes: Vec<ChangeRecord>,
    pub messages: Vec<Message>,
    pub comments: Vec<Comment>,
    pub activity: Vec<ActivityEntry>,
    pub locks: Vec<Lock>,
    pub conflicts: Vec<PendingConflict>,
}

impl SessionExport {
    pub const FORMAT_VERSION: u32 = 1;

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string_pretty(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        decode_json(json)
    }

    pub fn to_bincode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn from_bincode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn change_ids(&self) -> Vec<ChangeId> {
        self.changes.iter().map(|c| c.change_id).collect()
    }

    /// Re-apply the change log on top of the base content.
    pub fn replay(&self) -> CollabResult<DocumentContent> {
        let mut content = self.base_content.clone();
        for change in &self.changes {
            content.apply(&change.op)?;
        }
        Ok(content)
    }

    /// The change log must be contiguous from `base_version` to `version`.
    pub fn validate(&self) -> CollabResult<()> {
        if self.format_version != Self::FORMAT_VERSION {
            return Err(CollabError::InvalidOperation(format!(
                "unsupported export format {}",
                self.format_version
            )));
        }
        let contiguous = self
            .changes
            .iter()
            .enumerate()
            .all(|(i, c)| c.version == self.base_version + i as u64 + 1);
        if !contiguous || self.base_version + self.changes.len() as u64 != self.version {
            return Err(CollabError::InvalidOperation(
                "export change log is not contiguous".to_string(),
            ));
        }
        Ok(())
    }
}
