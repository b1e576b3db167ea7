//! Session events and the client wire protocol.
//!
//! Frames travel either as bincode (WebSocket binary frames) or JSON (text
//! frames). All enums are externally tagged so that both encodings
//! round-trip:
//!
//! ```text
//! client                                   server
//!   │ ── Hello { user_id } ─────────────────► │
//!   │ ◄──────────────── Welcome { user_id } ── │
//!   │ ── Request { request_id, request } ───► │
//!   │ ◄──── Response { request_id, reply } ── │
//!   │ ◄──────────────── Event(Envelope) ───── │  (any time, in publish order)
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::lock::Lock;
use crate::model::{
    Anchor, ChangeRecord, Comment, ConflictChoice, ConflictId, DocumentId, EditOp, EditOutcome,
    LeaveReason, Message, Participant, PendingConflict, Permission, ResourceId, RoomId,
    SessionId, Timestamp, UnlockReason, UserId,
};
use crate::presence::PresenceStatus;

// ───────────────────────────────────────────────────────────────────
// Outbound events
// ───────────────────────────────────────────────────────────────────

/// Everything the gateway can push to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    UserJoined {
        session_id: Option<SessionId>,
        user_id: UserId,
        permission: Permission,
    },
    UserLeft {
        session_id: Option<SessionId>,
        user_id: UserId,
        reason: LeaveReason,
    },
    DocumentEdited {
        session_id: SessionId,
        change: ChangeRecord,
    },
    DocumentLocked {
        session_id: SessionId,
        lock: Lock,
    },
    DocumentUnlocked {
        session_id: SessionId,
        document_id: DocumentId,
        holder: UserId,
        reason: UnlockReason,
    },
    CommentAdded {
        comment: Comment,
    },
    MessageReceived {
        message: Message,
    },
    ConflictRequiresAttention {
        conflict: PendingConflict,
    },
    ConflictResolved {
        session_id: SessionId,
        conflict_id: ConflictId,
        choice: ConflictChoice,
        resolved_by: UserId,
    },
    PermissionChanged {
        session_id: SessionId,
        user_id: UserId,
        permission: Permission,
    },
    SessionClosed {
        session_id: SessionId,
        final_version: u64,
    },
}

impl SessionEvent {
    /// Wire name of the event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::UserJoined { .. } => "user_joined",
            SessionEvent::UserLeft { .. } => "user_left",
            SessionEvent::DocumentEdited { .. } => "document_edited",
            SessionEvent::DocumentLocked { .. } => "document_locked",
            SessionEvent::DocumentUnlocked { .. } => "document_unlocked",
            SessionEvent::CommentAdded { .. } => "comment_added",
            SessionEvent::MessageReceived { .. } => "message_received",
            SessionEvent::ConflictRequiresAttention { .. } => "conflict_requires_attention",
            SessionEvent::ConflictResolved { .. } => "conflict_resolved",
            SessionEvent::PermissionChanged { .. } => "permission_changed",
            SessionEvent::SessionClosed { .. } => "session_closed",
        }
    }
}

/// A published event with its per-room sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub room_id: RoomId,
    /// Strictly increasing per room, in publish order.
    pub seq: u64,
    pub timestamp: Timestamp,
    pub event: SessionEvent,
}

// ───────────────────────────────────────────────────────────────────
// Inbound requests
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRequest {
    /// Join a room, or a session within it when `session_id` is given.
    Join {
        room_id: RoomId,
        session_id: Option<SessionId>,
        permission: Option<Permission>,
    },
    /// Leave one session, or the whole room when `session_id` is `None`.
    Leave {
        room_id: RoomId,
        session_id: Option<SessionId>,
    },
    CreateSession {
        room_id: RoomId,
        resource_id: ResourceId,
    },
    SendMessage {
        room_id: RoomId,
        session_id: Option<SessionId>,
        body: String,
        metadata: BTreeMap<String, String>,
    },
    ApplyEdit {
        session_id: SessionId,
        document_id: Option<DocumentId>,
        base_version: u64,
        op: EditOp,
    },
    LockDocument {
        session_id: SessionId,
        document_id: DocumentId,
        duration_secs: u64,
    },
    UnlockDocument {
        session_id: SessionId,
        document_id: DocumentId,
    },
    AddComment {
        session_id: SessionId,
        document_id: DocumentId,
        body: String,
        anchor: Option<Anchor>,
    },
    ResolveConflict {
        session_id: SessionId,
        conflict_id: ConflictId,
        choice: ConflictChoice,
    },
    /// Heartbeat for one room, or for every room the user is in.
    Heartbeat { room_id: Option<RoomId> },
    Presence { room_id: RoomId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyBody {
    Done,
    Joined(Participant),
    SessionCreated { session_id: SessionId, version: u64 },
    Edit(EditOutcome),
    Locked(Lock),
    MessageSent(Message),
    CommentAdded(Comment),
    Presence(BTreeMap<UserId, PresenceStatus>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Success(ReplyBody),
    Failure { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Hello { user_id: UserId },
    Request { request_id: u64, request: ClientRequest },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome { user_id: UserId },
    Response { request_id: u64, reply: Reply },
    Event(Envelope),
}

// ───────────────────────────────────────────────────────────────────
// Codecs
// ───────────────────────────────────────────────────────────────────

/// Wire encoding of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Binary,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("handshake error: {0}")]
    Handshake(String),
    #[error("connection closed")]
    ConnectionClosed,
}

pub fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}
