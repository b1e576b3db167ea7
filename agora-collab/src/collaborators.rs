//! External collaborators the core calls into.
//!
//! ```text
//!                 get_snapshot (session creation)
//! Collaboration ─────────────────────────────────► DocumentCollaborator
//!       │                                              ▲
//!       │ PersistJob (teardown, auto-save, close)      │ persist
//!       ▼                                              │
//! PersistenceHandle ── mpsc ──► persistence worker ────┘
//!
//! Collaboration ── notify (fire-and-forget) ──► NotificationSink
//! ```
//!
//! The room critical section never awaits a persist: jobs are queued on an
//! unbounded channel and a single worker applies them in submission order,
//! so snapshots of one resource reach the collaborator in version order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::model::{
    Comment, DocumentContent, PendingConflict, Permission, ResourceId, RoomId, SessionId, UserId,
};
use crate::storage::StoreError;

/// A resource's persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub content: DocumentContent,
    pub version: u64,
    /// Selects the conflict-resolution strategy.
    pub content_type: String,
}

impl DocumentSnapshot {
    pub fn new(content: DocumentContent, version: u64, content_type: impl Into<String>) -> Self {
        Self {
            content,
            version,
            content_type: content_type.into(),
        }
    }

    /// Empty text document at version 0, used for resources the
    /// collaborator has never seen.
    pub fn empty() -> Self {
        Self::new(DocumentContent::Text(String::new()), 0, "text")
    }

    pub fn text(text: impl Into<String>, version: u64) -> Self {
        Self::new(DocumentContent::Text(text.into()), version, "text")
    }
}

#[async_trait]
pub trait DocumentCollaborator: Send + Sync {
    /// Current snapshot, or `None` when the resource has never been persisted.
    async fn get_snapshot(&self, resource_id: &str) -> Result<Option<DocumentSnapshot>, StoreError>;

    /// Store a snapshot. Implementations ignore snapshots older than the one
    /// they already hold.
    async fn persist(&self, resource_id: &str, snapshot: DocumentSnapshot) -> Result<(), StoreError>;
}

/// In-memory document collaborator.
#[derive(Debug, Default, Clone)]
pub struct MemoryDocuments {
    documents: Arc<RwLock<HashMap<ResourceId, DocumentSnapshot>>>,
}

impl MemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a resource.
    pub async fn insert(&self, resource_id: impl Into<ResourceId>, snapshot: DocumentSnapshot) {
        self.documents.write().await.insert(resource_id.into(), snapshot);
    }

    pub async fn get(&self, resource_id: &str) -> Option<DocumentSnapshot> {
        self.documents.read().await.get(resource_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentCollaborator for MemoryDocuments {
    async fn get_snapshot(&self, resource_id: &str) -> Result<Option<DocumentSnapshot>, StoreError> {
        Ok(self.get(resource_id).await)
    }

    async fn persist(&self, resource_id: &str, snapshot: DocumentSnapshot) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        match documents.get(resource_id) {
            Some(existing) if existing.version > snapshot.version => {
                log::debug!(
                    "Ignoring stale snapshot v{} for {resource_id} (have v{})",
                    snapshot.version,
                    existing.version
                );
            }
            _ => {
                documents.insert(resource_id.to_string(), snapshot);
            }
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Persistence worker
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistReason {
    Autosave,
    Teardown,
    RoomClosed,
}

impl PersistReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PersistReason::Autosave => "autosave",
            PersistReason::Teardown => "teardown",
            PersistReason::RoomClosed => "room_closed",
        }
    }
}

#[derive(Debug)]
pub struct PersistJob {
    pub resource_id: ResourceId,
    pub snapshot: DocumentSnapshot,
    pub reason: PersistReason,
}

enum WorkerCommand {
    Persist(PersistJob),
    RetryFailed,
    Flush(oneshot::Sender<()>),
}

/// Sending half of the persistence worker.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<WorkerCommand>,
    failed: Arc<AtomicUsize>,
}

impl PersistenceHandle {
    /// Queue a persist. Never blocks.
    pub fn submit(&self, job: PersistJob) -> Result<(), StoreError> {
        self.send(WorkerCommand::Persist(job))
    }

    /// Queue another attempt at every persist that failed and has not been
    /// superseded by a newer snapshot of the same resource.
    pub fn retry_failed(&self) -> Result<(), StoreError> {
        self.send(WorkerCommand::RetryFailed)
    }

    /// Resources whose latest persist failed.
    pub fn failed_count(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    /// Wait until every job submitted before this call has been handled.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(WorkerCommand::Flush(done_tx))?;
        done_rx
            .await
            .map_err(|_| StoreError::Unavailable("persistence worker stopped".to_string()))
    }

    fn send(&self, command: WorkerCommand) -> Result<(), StoreError> {
        self.tx
            .send(command)
            .map_err(|_| StoreError::Unavailable("persistence worker stopped".to_string()))
    }
}

/// Spawn the worker on the current tokio runtime. It exits once every
/// handle has been dropped.
///
/// A failed job is parked, newest version per resource, until the next
/// `retry_failed`; a later successful persist of the same resource at an
/// equal or newer version discards it.
pub fn spawn_persistence_worker(
    collaborator: Arc<dyn DocumentCollaborator>,
) -> (PersistenceHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerCommand>();
    let failed_count = Arc::new(AtomicUsize::new(0));
    let counter = failed_count.clone();
    let task = tokio::spawn(async move {
        let mut failed: HashMap<ResourceId, PersistJob> = HashMap::new();
        while let Some(command) = rx.recv().await {
            match command {
                WorkerCommand::Persist(job) => {
                    run_job(collaborator.as_ref(), job, &mut failed).await;
                }
                WorkerCommand::RetryFailed => {
                    if !failed.is_empty() {
                        log::info!("Retrying {} failed persist(s)", failed.len());
                    }
                    for (_, job) in std::mem::take(&mut failed) {
                        run_job(collaborator.as_ref(), job, &mut failed).await;
                    }
                }
                WorkerCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
            counter.store(failed.len(), Ordering::Relaxed);
        }
        log::debug!("Persistence worker stopped");
    });
    (
        PersistenceHandle {
            tx,
            failed: failed_count,
        },
        task,
    )
}

async fn run_job(
    collaborator: &dyn DocumentCollaborator,
    job: PersistJob,
    failed: &mut HashMap<ResourceId, PersistJob>,
) {
    let version = job.snapshot.version;
    match collaborator.persist(&job.resource_id, job.snapshot.clone()).await {
        Ok(()) => {
            log::debug!(
                "Persisted {} at v{version} ({})",
                job.resource_id,
                job.reason.as_str()
            );
            if failed
                .get(&job.resource_id)
                .is_some_and(|parked| parked.snapshot.version <= version)
            {
                failed.remove(&job.resource_id);
            }
        }
        Err(e) => {
            log::error!(
                "Failed to persist {} at v{version} ({}), will retry: {e}",
                job.resource_id,
                job.reason.as_str()
            );
            let superseded = failed
                .get(&job.resource_id)
                .is_some_and(|parked| parked.snapshot.version > version);
            if !superseded {
                failed.insert(job.resource_id.clone(), job);
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Notifications
// ───────────────────────────────────────────────────────────────────

/// User-facing events forwarded to the notification service.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    PermissionChanged {
        room_id: RoomId,
        session_id: SessionId,
        user_id: UserId,
        permission: Permission,
        changed_by: UserId,
    },
    CommentAdded {
        room_id: RoomId,
        comment: Comment,
    },
    ConflictRaised {
        room_id: RoomId,
        conflict: PendingConflict,
    },
}

/// Fire-and-forget notification delivery. Implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::PermissionChanged {
                room_id,
                user_id,
                permission,
                changed_by,
                ..
            } => log::info!(
                "Notify: {changed_by} set {user_id} to {permission:?} in room {room_id}"
            ),
            Notification::CommentAdded { room_id, comment } => log::info!(
                "Notify: {} commented on {} in room {room_id}",
                comment.author,
                comment.document_id
            ),
            Notification::ConflictRaised { room_id, conflict } => log::info!(
                "Notify: conflict {} on {} in room {room_id} needs a decision",
                conflict.conflict_id,
                conflict.document_id
            ),
        }
    }
}

/// Forwards notifications to a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            log::debug!("Notification receiver dropped");
        }
    }
}
