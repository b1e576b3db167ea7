//! Core data model: identifiers, document content, edit operations, rooms,
//! participants and the immutable records a session accumulates.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::resolver::Strategy;

pub type RoomId = String;
pub type UserId = String;
pub type DocumentId = String;
pub type ResourceId = String;
pub type SessionId = Uuid;
pub type ChangeId = Uuid;
pub type MessageId = Uuid;
pub type CommentId = Uuid;
pub type ConflictId = Uuid;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

// ───────────────────────────────────────────────────────────────────
// Document content
// ───────────────────────────────────────────────────────────────────

/// Self-describing field value for record documents.
///
/// Externally tagged so that both the JSON and the bincode encodings
/// round-trip without needing a self-describing deserializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Authoritative document state held by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentContent {
    Text(String),
    Record(BTreeMap<String, Value>),
}

impl Default for DocumentContent {
    fn default() -> Self {
        DocumentContent::Text(String::new())
    }
}

impl DocumentContent {
    pub fn kind(&self) -> &'static str {
        match self {
            DocumentContent::Text(_) => "text",
            DocumentContent::Record(_) => "record",
        }
    }

    /// Length in characters for text content, field count for records.
    pub fn len(&self) -> usize {
        match self {
            DocumentContent::Text(text) => text.chars().count(),
            DocumentContent::Record(fields) => fields.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DocumentContent::Text(text) => Some(text),
            DocumentContent::Record(_) => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            DocumentContent::Record(fields) => fields.get(name),
            DocumentContent::Text(_) => None,
        }
    }

    /// Fail with `InvalidOperation` when `apply` would, without changing
    /// anything.
    pub fn check(&self, op: &EditOp) -> CollabResult<()> {
        match (self, op) {
            (DocumentContent::Text(text), EditOp::Insert { pos, .. }) => {
                if *pos > text.chars().count() {
                    return Err(CollabError::InvalidOperation(format!(
                        "insert position {pos} out of bounds"
                    )));
                }
                Ok(())
            }
            (DocumentContent::Text(text), EditOp::Delete { pos, len }) => {
                let end = delete_end(*pos, *len)?;
                if end > text.chars().count() {
                    return Err(CollabError::InvalidOperation(format!(
                        "delete range {pos}..{end} out of bounds"
                    )));
                }
                Ok(())
            }
            (DocumentContent::Record(_), EditOp::SetField { .. } | EditOp::Patch { .. }) => Ok(()),
            (content, op) => Err(CollabError::InvalidOperation(format!(
                "{} cannot be applied to {} content",
                op.kind(),
                content.kind()
            ))),
        }
    }

    /// Apply an operation in place. The content is left untouched on error.
    pub fn apply(&mut self, op: &EditOp) -> CollabResult<()> {
        match (self, op) {
            (DocumentContent::Text(text), EditOp::Insert { pos, text: inserted }) => {
                let at = char_to_byte(text, *pos).ok_or_else(|| {
                    CollabError::InvalidOperation(format!(
                        "insert position {pos} out of bounds"
                    ))
                })?;
                text.insert_str(at, inserted);
                Ok(())
            }
            (DocumentContent::Text(text), EditOp::Delete { pos, len }) => {
                let end = delete_end(*pos, *len)?;
                let range = char_to_byte(text, *pos).zip(char_to_byte(text, end));
                let (start, end) = range.ok_or_else(|| {
                    CollabError::InvalidOperation(format!("delete range {pos}..{end} out of bounds"))
                })?;
                text.replace_range(start..end, "");
                Ok(())
            }
            (DocumentContent::Record(fields), EditOp::SetField { field, value, .. }) => {
                fields.insert(field.clone(), value.clone());
                Ok(())
            }
            (DocumentContent::Record(fields), EditOp::Patch { fields: patch }) => {
                for (name, value) in patch {
                    match value {
                        Some(value) => {
                            fields.insert(name.clone(), value.clone());
                        }
                        None => {
                            fields.remove(name);
                        }
                    }
                }
                Ok(())
            }
            (content, op) => Err(CollabError::InvalidOperation(format!(
                "{} cannot be applied to {} content",
                op.kind(),
                content.kind()
            ))),
        }
    }
}

fn delete_end(pos: usize, len: usize) -> CollabResult<usize> {
    pos.checked_add(len).ok_or_else(|| {
        CollabError::InvalidOperation(format!("delete range {pos}+{len} overflows"))
    })
}

/// Byte offset of the `pos`-th character; `pos == len` maps to the end.
fn char_to_byte(text: &str, pos: usize) -> Option<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .nth(pos)
}

/// One edit submitted by a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOp {
    /// Insert `text` before character `pos`.
    Insert { pos: usize, text: String },
    /// Delete `len` characters starting at `pos`.
    Delete { pos: usize, len: usize },
    /// Overwrite a single-valued field. `timestamp` orders concurrent writes.
    SetField {
        field: String,
        value: Value,
        timestamp: Timestamp,
    },
    /// Set (`Some`) or remove (`None`) several record fields at once.
    Patch {
        fields: BTreeMap<String, Option<Value>>,
    },
}

impl EditOp {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        EditOp::Insert {
            pos,
            text: text.into(),
        }
    }

    pub fn delete(pos: usize, len: usize) -> Self {
        EditOp::Delete { pos, len }
    }

    pub fn set_field(field: impl Into<String>, value: impl Into<Value>, timestamp: Timestamp) -> Self {
        EditOp::SetField {
            field: field.into(),
            value: value.into(),
            timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EditOp::Insert { .. } => "insert",
            EditOp::Delete { .. } => "delete",
            EditOp::SetField { .. } => "set_field",
            EditOp::Patch { .. } => "patch",
        }
    }

    /// Record fields written by this op (empty for text ops).
    pub fn touched_fields(&self) -> BTreeSet<&str> {
        match self {
            EditOp::SetField { field, .. } => std::iter::once(field.as_str()).collect(),
            EditOp::Patch { fields } => fields.keys().map(String::as_str).collect(),
            EditOp::Insert { .. } | EditOp::Delete { .. } => BTreeSet::new(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Rooms and permissions
// ───────────────────────────────────────────────────────────────────

/// Participant permission level, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Viewer,
    Commenter,
    Editor,
    Admin,
}

impl Permission {
    pub fn can_comment(self) -> bool {
        self >= Permission::Commenter
    }

    pub fn can_edit(self) -> bool {
        self >= Permission::Editor
    }

    pub fn can_admin(self) -> bool {
        self == Permission::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub chat: bool,
    pub file_sharing: bool,
    pub recording: bool,
}

/// Kind of room; selects the default permission set and enabled features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    /// Reviewers annotate an application; editing is granted explicitly.
    #[default]
    Review,
    /// Everyone edits.
    Workspace,
    /// Mostly read-only; chat and recording.
    Meeting,
}

impl RoomType {
    /// Permission granted when a joiner does not ask for one.
    pub fn default_permission(self) -> Permission {
        match self {
            RoomType::Review => Permission::Commenter,
            RoomType::Workspace => Permission::Editor,
            RoomType::Meeting => Permission::Viewer,
        }
    }

    /// Highest permission a non-creator may request on join.
    pub fn max_permission(self) -> Permission {
        match self {
            RoomType::Review | RoomType::Workspace => Permission::Editor,
            RoomType::Meeting => Permission::Commenter,
        }
    }

    pub fn default_features(self) -> Features {
        match self {
            RoomType::Review => Features {
                chat: true,
                file_sharing: true,
                recording: false,
            },
            RoomType::Workspace => Features {
                chat: true,
                file_sharing: true,
                recording: false,
            },
            RoomType::Meeting => Features {
                chat: true,
                file_sharing: false,
                recording: true,
            },
        }
    }
}

/// Overrides supplied on room creation; unset fields take the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomSettings {
    pub name: Option<String>,
    pub room_type: Option<RoomType>,
    pub max_participants: Option<usize>,
    pub features: Option<Features>,
    pub created_by: Option<UserId>,
    /// When set, only these users (and the creator) may join.
    pub invited: Option<BTreeSet<UserId>>,
}

impl RoomSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_type(mut self, room_type: RoomType) -> Self {
        self.room_type = Some(room_type);
        self
    }

    pub fn with_max_participants(mut self, max: usize) -> Self {
        self.max_participants = Some(max);
        self
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = Some(features);
        self
    }

    pub fn created_by(mut self, user_id: impl Into<UserId>) -> Self {
        self.created_by = Some(user_id.into());
        self
    }

    pub fn invite_only<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        self.invited = Some(users.into_iter().map(Into::into).collect());
        self
    }
}

/// A bounded collaboration context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub room_type: RoomType,
    pub max_participants: usize,
    pub created_at: Timestamp,
    pub created_by: UserId,
    pub features: Features,
    pub invited: Option<BTreeSet<UserId>>,
}

impl Room {
    pub fn is_invited(&self, user_id: &str) -> bool {
        user_id == self.created_by
            || self
                .invited
                .as_ref()
                .map_or(true, |invited| invited.contains(user_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub joined_at: Timestamp,
    pub permission: Permission,
    pub last_activity: Timestamp,
}

impl Participant {
    pub fn new(user_id: impl Into<UserId>, permission: Permission, now: Timestamp) -> Self {
        Self {
            user_id: user_id.into(),
            joined_at: now,
            permission,
            last_activity: now,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Session records
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Draining,
    Closed,
}

/// One accepted edit. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: ChangeId,
    pub author: UserId,
    pub document_id: DocumentId,
    pub op: EditOp,
    pub version: u64,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub session_id: Option<SessionId>,
    pub author: UserId,
    pub body: String,
    pub timestamp: Timestamp,
    pub metadata: BTreeMap<String, String>,
}

/// Character range a comment is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: CommentId,
    pub session_id: SessionId,
    pub document_id: DocumentId,
    pub author: UserId,
    pub body: String,
    pub anchor: Option<Anchor>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Left,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockReason {
    Released,
    Expired,
    Disconnect,
}

impl UnlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UnlockReason::Released => "released",
            UnlockReason::Expired => "expired",
            UnlockReason::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    KeepCurrent,
    TakeIncoming,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Joined { permission: Permission },
    Left { reason: LeaveReason },
    Edited { change_id: ChangeId, version: u64 },
    Locked { document_id: DocumentId },
    Unlocked { document_id: DocumentId, reason: UnlockReason },
    Commented { comment_id: CommentId },
    Messaged { message_id: MessageId },
    ConflictRaised { conflict_id: ConflictId },
    ConflictSettled { conflict_id: ConflictId, choice: ConflictChoice },
    PermissionChanged { target: UserId, permission: Permission },
}

/// A conflict awaiting a manual choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub conflict_id: ConflictId,
    pub session_id: SessionId,
    pub document_id: DocumentId,
    pub author: UserId,
    pub base_version: u64,
    pub current_version: u64,
    pub op: EditOp,
    pub strategy: Strategy,
    pub reason: String,
    /// Change records the incoming op clashed with.
    pub competing: Vec<ChangeId>,
    pub raised_at: Timestamp,
}

/// Result of `apply_edit` as seen by the author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOutcome {
    /// Accepted; `op` is the transformed op that was applied.
    Applied {
        change_id: ChangeId,
        version: u64,
        op: EditOp,
    },
    /// A concurrent write won (last-write-wins); nothing changed.
    Superseded { by: ChangeId, version: u64 },
    /// Routed to manual resolution; every participant has been told.
    Conflict(PendingConflict),
}

/// Audit trail entry kept per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: Timestamp,
    pub user_id: UserId,
    pub kind: ActivityKind,
}
