//! Error taxonomy for the collaboration core.
//!
//! Contract violations are returned synchronously to the caller and never
//! take down a room. Resolver conflicts are *not* errors on the edit path
//! (see [`crate::resolver::Resolution`]); the `Conflict` variant here is only
//! used when a caller addresses a conflict that cannot be acted on.

use thiserror::Error;

use crate::model::{ConflictId, RoomId, SessionId, Timestamp, UserId};
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollabError {
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Any other absent entity (document, lock, conflict, participant).
    #[error("{0} not found")]
    NotFound(String),

    #[error("room already exists: {0}")]
    AlreadyExists(RoomId),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("room {room_id} is full ({max} participants)")]
    RoomFull { room_id: RoomId, max: usize },

    #[error("document {document_id} is locked by {holder} until {expires_at}")]
    AlreadyLocked {
        document_id: String,
        holder: UserId,
        expires_at: Timestamp,
    },

    #[error("lock on {document_id} is held by {holder}")]
    NotHolder { document_id: String, holder: UserId },

    #[error("conflict {0} cannot be settled")]
    Conflict(ConflictId),

    #[error("timed out waiting for room {0}")]
    Timeout(RoomId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type CollabResult<T> = Result<T, CollabError>;

impl CollabError {
    /// Short machine-readable code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            CollabError::RoomNotFound(_)
            | CollabError::SessionNotFound(_)
            | CollabError::NotFound(_) => "not_found",
            CollabError::AlreadyExists(_) => "already_exists",
            CollabError::Forbidden(_) => "forbidden",
            CollabError::RoomFull { .. } => "room_full",
            CollabError::AlreadyLocked { .. } => "already_locked",
            CollabError::NotHolder { .. } => "not_holder",
            CollabError::Conflict(_) => "conflict",
            CollabError::Timeout(_) => "timeout",
            CollabError::InvalidOperation(_) => "invalid_operation",
            CollabError::Storage(_) => "storage",
            CollabError::Protocol(_) => "protocol",
        }
    }
}
