//! # agora-collab: Real-time collaboration session core
//!
//! Rooms, sessions over shared documents, document locks, presence, conflict
//! resolution and ordered event fan-out to connected participants.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket     ┌──────────────┐
//! │ client       │ ◄──────────────► │ CollabServer │
//! │ (per user)   │  bincode / JSON  └──────┬───────┘
//! └──────────────┘                         │
//!                                          ▼
//!                                  ┌───────────────┐
//!                                  │ Collaboration │ ── NotificationSink
//!                                  └───────┬───────┘
//!                 ┌────────────────────────┼─────────────────────┐
//!                 ▼                        ▼                     ▼
//!          ┌─────────────┐        ┌─────────────────┐   ┌──────────────────┐
//!          │ SessionStore│        │BroadcastGateway │   │ persistence      │
//!          │ room arena  │        │ offline queues  │   │ worker           │
//!          └──────┬──────┘        └─────────────────┘   └────────┬─────────┘
//!                 │                                              ▼
//!   Room ─ Session ─ LockManager                       DocumentCollaborator
//!        │         └ ConflictResolver                  (memory / RocksDB)
//!        └ PresenceTracker
//! ```
//!
//! ## Modules
//!
//! - [`facade`]: public operations (`Collaboration`)
//! - [`store`]: room arena, per-room sequencer and room-level membership
//! - [`session`]: one live session: document state, change log, locks
//! - [`resolver`]: operational transform, last-write-wins, three-way merge
//! - [`lock`]: time-bounded exclusive document locks
//! - [`presence`]: heartbeat-driven online/offline tracking
//! - [`broadcast`]: ordered fan-out with per-user offline queues
//! - [`protocol`]: events, client requests and frame codecs
//! - [`server`]: WebSocket front end
//! - [`storage`]: RocksDB document store
//! - [`collaborators`]: document and notification boundaries

pub mod broadcast;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod facade;
pub mod lock;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;

// Re-exports for convenience
pub use broadcast::{
    Attachment, BroadcastGateway, ChannelTransport, ConnectionId, DeliveryDiagnostic,
    DeliveryError, GatewayConfig, GatewayStats, Transport,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use collaborators::{
    ChannelNotifier, DocumentCollaborator, DocumentSnapshot, LogNotifier, MemoryDocuments,
    Notification, NotificationSink,
};
pub use config::CollabConfig;
pub use error::{CollabError, CollabResult};
pub use facade::{Collaboration, JoinTarget, RoomView, SessionView, SweepReport};
pub use lock::{Lock, LockToken};
pub use model::*;
pub use presence::PresenceStatus;
pub use protocol::{
    ClientMessage, ClientRequest, Envelope, ProtocolError, Reply, ReplyBody, ServerMessage,
    SessionEvent,
};
pub use resolver::{ConflictResolver, Resolution, Strategy};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use session::{SessionExport, SettledConflict};
pub use storage::{DocumentMetadata, RocksDocumentStore, StoreConfig, StoreError};
