//! Public API of the collaboration core.
//!
//! ```text
//!  request ──► Collaboration ──► SessionStore::enter(room)   (sequencer)
//!                   │                  │
//!                   │                  ├── Session (locks, resolver, logs)
//!                   │                  ├── PresenceTracker
//!                   │                  │
//!                   │                  ▼  Vec<Outbound>
//!                   ├──────────► BroadcastGateway::publish   (still inside)
//!                   │
//!                   ├──────────► PersistenceHandle::submit   (non-blocking)
//!                   └──────────► NotificationSink::notify    (fire-and-forget)
//! ```
//!
//! Every operation on a room runs inside that room's critical section, and
//! the events it produces are published before the section is released so a
//! recipient observes them in commit order. Persistence and notifications are
//! handed off without waiting.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::MutexGuard;
use tokio::task::JoinHandle;

use crate::broadcast::{Attachment, BroadcastGateway, ConnectionId, GatewayConfig, Transport};
use crate::clock::SharedClock;
use crate::collaborators::{
    spawn_persistence_worker, DocumentCollaborator, DocumentSnapshot, Notification,
    NotificationSink, PersistJob, PersistReason, PersistenceHandle,
};
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::lock::Lock;
use crate::model::{
    Anchor, Comment, ConflictChoice, ConflictId, DocumentContent, EditOp, EditOutcome, Message,
    Participant, PendingConflict, Permission, Room, RoomId, RoomSettings, SessionId, SessionState,
    Timestamp, UnlockReason, UserId,
};
use crate::presence::PresenceStatus;
use crate::protocol::SessionEvent;
use crate::resolver::{ConflictResolver, Strategy};
use crate::session::{Session, SessionExport, SessionLimits, SettledConflict};
use crate::store::{Outbound, RoomHandle, RoomState, SessionStore};

/// What a `join` call targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    Room(RoomId),
    Session(SessionId),
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: SessionId,
    pub room_id: RoomId,
    pub resource_id: String,
    pub state: SessionState,
    pub version: u64,
    pub content: DocumentContent,
    pub content_type: String,
    pub strategy: Strategy,
    pub participants: Vec<Participant>,
    pub locks: Vec<Lock>,
    pub pending_conflicts: Vec<PendingConflict>,
}

/// Read-only view of a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    pub room: Room,
    pub members: Vec<Participant>,
    pub sessions: Vec<SessionId>,
    pub messages: Vec<Message>,
}

/// Outcome of one background sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub expired_locks: usize,
    pub timed_out: Vec<(RoomId, UserId)>,
    pub closed_sessions: Vec<SessionId>,
    pub autosaved: usize,
    pub closed_rooms: Vec<RoomId>,
    pub redelivered: usize,
    /// Failed persists queued for another attempt
    pub persist_retries: usize,
}

pub struct Collaboration {
    config: CollabConfig,
    clock: SharedClock,
    store: SessionStore,
    gateway: Arc<BroadcastGateway>,
    resolver: ConflictResolver,
    documents: Arc<dyn DocumentCollaborator>,
    notifier: Arc<dyn NotificationSink>,
    persistence: PersistenceHandle,
    limits: SessionLimits,
    _persistence_task: JoinHandle<()>,
}

impl Collaboration {
    /// Build the core and spawn its persistence worker. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: CollabConfig,
        clock: SharedClock,
        documents: Arc<dyn DocumentCollaborator>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let gateway = Arc::new(BroadcastGateway::new(
            GatewayConfig {
                queue_capacity: config.offline_queue_cap,
                max_delivery_attempts: config.max_delivery_attempts,
                diagnostics_capacity: config.diagnostics_cap,
            },
            clock.clone(),
        ));
        let limits = SessionLimits {
            change_log_cap: config.change_log_cap,
            message_history_cap: config.message_history_cap,
            activity_log_cap: config.activity_log_cap,
            lock_max: config.lock_max(),
        };
        let (persistence, task) = spawn_persistence_worker(documents.clone());
        Self {
            store: SessionStore::new(config.room_wait_timeout()),
            resolver: ConflictResolver::new(config.strategies.clone()),
            config,
            clock,
            gateway,
            documents,
            notifier,
            persistence,
            limits,
            _persistence_task: task,
        }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn gateway(&self) -> &Arc<BroadcastGateway> {
        &self.gateway
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    pub async fn create_room(&self, room_id: impl Into<RoomId>, settings: RoomSettings) -> CollabResult<Room> {
        let room_id = room_id.into();
        let room_type = settings.room_type.unwrap_or_default();
        let max_participants = settings
            .max_participants
            .unwrap_or(self.config.default_max_participants);
        if max_participants == 0 {
            return Err(CollabError::InvalidOperation(
                "max_participants must be at least 1".to_string(),
            ));
        }
        let room = Room {
            name: settings.name.unwrap_or_else(|| room_id.clone()),
            id: room_id,
            room_type,
            max_participants,
            created_at: self.clock.now(),
            created_by: settings.created_by.unwrap_or_default(),
            features: settings.features.unwrap_or_else(|| room_type.default_features()),
            invited: settings.invited,
        };
        let state = RoomState::new(
            room.clone(),
            self.config.heartbeat_interval(),
            self.config.message_history_cap,
        );
        self.store.insert_room(state).await?;
        log::info!(
            "Room {} created ({:?}, max {} participants)",
            room.id,
            room.room_type,
            room.max_participants
        );
        Ok(room)
    }

    /// Close a room: every session is persisted and closed, members are
    /// dropped and the room is removed.
    pub async fn close_room(&self, room_id: &str) -> CollabResult<()> {
        let handle = self.store.room(room_id).await?;
        let closed = {
            let mut state = self.store.enter(&handle).await?;
            self.close_locked(&mut state).await
        };
        self.store.remove_room(room_id).await;
        self.store.unindex_sessions(closed).await;
        Ok(())
    }

    async fn close_locked(&self, state: &mut MutexGuard<'_, RoomState>) -> Vec<SessionId> {
        let room_id = state.room.id.clone();
        let sessions = state.close();
        let mut out = Vec::with_capacity(sessions.len());
        let mut closed = Vec::with_capacity(sessions.len());
        for session in &sessions {
            self.persist(session, PersistReason::RoomClosed);
            out.push(Outbound::all(SessionEvent::SessionClosed {
                session_id: session.id(),
                final_version: session.version(),
            }));
            closed.push(session.id());
        }
        self.dispatch(&room_id, out).await;
        self.gateway.remove_room(&room_id).await;
        log::info!("Room {room_id} closed ({} session(s))", closed.len());
        closed
    }

    pub async fn room_view(&self, room_id: &str) -> CollabResult<RoomView> {
        let handle = self.store.room(room_id).await?;
        let state = self.store.enter(&handle).await?;
        let now = self.clock.now();
        Ok(RoomView {
            room: state.room.clone(),
            members: state
                .members
                .values()
                .map(|m| {
                    let last_seen = state.presence.record(&m.user_id).map_or(now, |r| r.last_seen);
                    m.as_participant(last_seen)
                })
                .collect(),
            sessions: state.sessions.keys().copied().collect(),
            messages: state.messages.iter().cloned().collect(),
        })
    }

    pub async fn room_count(&self) -> usize {
        self.store.room_count().await
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Open a session over `resource_id` in a room, seeded from the document
    /// collaborator's snapshot, and join `participants` to it. Admission of
    /// every participant is checked before anything changes.
    pub async fn create_session(
        &self,
        room_id: &str,
        resource_id: &str,
        participants: &[UserId],
    ) -> CollabResult<SessionView> {
        let handle = self.store.room(room_id).await?;
        let snapshot = self
            .documents
            .get_snapshot(resource_id)
            .await?
            .unwrap_or_else(DocumentSnapshot::empty);

        let mut state = self.store.enter(&handle).await?;
        let now = self.clock.now();

        let unique: BTreeSet<&str> = participants.iter().map(String::as_str).collect();
        let mut newcomers = 0;
        for user_id in &unique {
            if !state.members.contains_key(*user_id) {
                state.admission(user_id, None)?;
                newcomers += 1;
            }
        }
        state.check_capacity(newcomers)?;

        let strategy = self
            .resolver
            .strategy_for(&snapshot.content_type, &snapshot.content);
        let session = Session::new(room_id, resource_id, snapshot, strategy, self.limits.clone(), now);
        let session_id = session.id();
        log::info!(
            "Session {session_id} opened on {resource_id} in room {room_id} at v{} ({})",
            session.version(),
            strategy.as_str()
        );
        state.sessions.insert(session_id, session);
        self.store.index_session(session_id, room_id).await;

        let mut out = Vec::new();
        for user_id in unique {
            let was_member = state.members.contains_key(user_id);
            let (_, events) = state.join_session(session_id, user_id, None, now)?;
            if !was_member {
                self.gateway.subscribe(room_id, user_id).await;
            }
            out.extend(events);
        }
        self.dispatch(room_id, out).await;
        Ok(view(state.session(session_id)?, now))
    }

    pub async fn session_view(&self, session_id: SessionId) -> CollabResult<SessionView> {
        let handle = self.store.room_of_session(session_id).await?;
        let state = self.store.enter(&handle).await?;
        Ok(view(state.session(session_id)?, self.clock.now()))
    }

    // ─── Membership ───────────────────────────────────────────────────

    /// Join a room or one of its sessions. Rejoining returns the existing
    /// participant without a new `user_joined`.
    pub async fn join(
        &self,
        target: JoinTarget,
        user_id: &str,
        permission: Option<Permission>,
    ) -> CollabResult<Participant> {
        let handle = match &target {
            JoinTarget::Room(room_id) => self.store.room(room_id).await?,
            JoinTarget::Session(session_id) => self.store.room_of_session(*session_id).await?,
        };
        let mut state = self.store.enter(&handle).await?;
        let now = self.clock.now();
        let was_member = state.members.contains_key(user_id);

        let (participant, out) = match target {
            JoinTarget::Room(_) => {
                let (member, new) = state.join_room(user_id, permission, true, now)?;
                let out = if new {
                    vec![Outbound::all(SessionEvent::UserJoined {
                        session_id: None,
                        user_id: user_id.to_string(),
                        permission: member.permission,
                    })]
                } else {
                    Vec::new()
                };
                (member.as_participant(now), out)
            }
            JoinTarget::Session(session_id) => state.join_session(session_id, user_id, permission, now)?,
        };
        if !was_member {
            self.gateway.subscribe(&handle.id, user_id).await;
        }
        self.dispatch(&handle.id, out).await;
        Ok(participant)
    }

    /// Leave one session. Leaving twice is a no-op.
    pub async fn leave(&self, session_id: SessionId, user_id: &str) -> CollabResult<()> {
        let handle = self.store.room_of_session(session_id).await?;
        let mut state = self.store.enter(&handle).await?;
        let was_member = state.members.contains_key(user_id);
        let out = state.leave_session(session_id, user_id, self.clock.now())?;
        self.dispatch(&handle.id, out).await;
        if was_member && !state.members.contains_key(user_id) {
            self.gateway.unsubscribe(&handle.id, user_id).await;
        }
        Ok(())
    }

    /// Leave every session in the room and the room itself.
    pub async fn leave_room(&self, room_id: &str, user_id: &str) -> CollabResult<()> {
        let handle = self.store.room(room_id).await?;
        let mut state = self.store.enter(&handle).await?;
        let was_member = state.members.contains_key(user_id);
        let out = state.leave_room(user_id, self.clock.now());
        self.dispatch(room_id, out).await;
        if was_member {
            self.gateway.unsubscribe(room_id, user_id).await;
        }
        Ok(())
    }

    /// Change a session participant's permission. The actor must be an
    /// admin of the session.
    pub async fn update_permission(
        &self,
        session_id: SessionId,
        actor: &str,
        target: &str,
        permission: Permission,
    ) -> CollabResult<()> {
        let handle = self.store.room_of_session(session_id).await?;
        let mut state = self.store.enter(&handle).await?;
        let now = self.clock.now();
        let session = state.session_mut(session_id)?;
        session.require(actor, Permission::Admin)?;
        session.set_permission(actor, target, permission, now)?;
        log::info!("{actor} set {target} to {permission:?} in session {session_id}");

        let event = SessionEvent::PermissionChanged {
            session_id,
            user_id: target.to_string(),
            permission,
        };
        self.dispatch(&handle.id, vec![Outbound::all(event)]).await;
        self.notifier.notify(Notification::PermissionChanged {
            room_id: handle.id.clone(),
            session_id,
            user_id: target.to_string(),
            permission,
            changed_by: actor.to_string(),
        });
        Ok(())
    }

    // ─── Messages and comments ────────────────────────────────────────

    pub async fn send_message(
        &self,
        room_id: &str,
        session_id: Option<SessionId>,
        author: &str,
        body: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> CollabResult<Message> {
        let body = body.into();
        if body.trim().is_empty() {
            return Err(CollabError::InvalidOperation("message body is empty".to_string()));
        }
        let handle = self.store.room(room_id).await?;
        let mut state = self.store.enter(&handle).await?;
        if !state.room.features.chat {
            return Err(CollabError::Forbidden(format!("chat is disabled in room {room_id}")));
        }
        state.member(author)?;
        let now = self.clock.now();

        let message = Message {
            message_id: uuid::Uuid::new_v4(),
            room_id: room_id.to_string(),
            session_id,
            author: author.to_string(),
            body,
            timestamp: now,
            metadata,
        };
        match session_id {
            Some(session_id) => {
                let session = state.session_mut(session_id)?;
                session.require(author, Permission::Viewer)?;
                session.touch(author, now);
                session.push_message(message.clone());
            }
            None => state.push_message(message.clone()),
        }

        let mut out = state.touch(author, now);
        out.push(Outbound::all(SessionEvent::MessageReceived {
            message: message.clone(),
        }));
        self.dispatch(room_id, out).await;
        Ok(message)
    }

    pub async fn add_comment(
        &self,
        session_id: SessionId,
        author: &str,
        document_id: &str,
        body: impl Into<String>,
        anchor: Option<Anchor>,
    ) -> CollabResult<Comment> {
        let handle = self.store.room_of_session(session_id).await?;
        let mut state = self.store.enter(&handle).await?;
        let now = self.clock.now();
        let comment = state
            .session_mut(session_id)?
            .add_comment(author, document_id, body.into(), anchor, now)?;

        let mut out = state.touch(author, now);
        out.push(Outbound::all(SessionEvent::CommentAdded {
            comment: comment.clone(),
        }));
        self.dispatch(&handle.id, out).await;
        self.notifier.notify(Notification::CommentAdded {
            room_id: handle.id.clone(),
            comment: comment.clone(),
        });
        Ok(comment)
    }

    // ─── Edits ────────────────────────────────────────────────────────

    /// Submit an edit made against `base_version`. `document_id` defaults to
    /// the session's resource.
    pub async fn apply_edit(
        &self,
        session_id: SessionId,
        author: &str,
        document_id: Option<&str>,
        base_version: u64,
        op: EditOp,
    ) -> CollabResult<EditOutcome> {
        let handle = self.store.room_of_session(session_id).await?;
        let mut state = self.store.enter(&handle).await?;
        let now = self.clock.now();
        let document_id = match document_id {
            Some(id) => id.to_string(),
            None => state.session(session_id)?.resource_id().to_string(),
        };

        let mut out = state.expire_lock(session_id, &document_id, now)?;
        let result = state.session_mut(session_id).and_then(|session| {
            session.apply_edit(&self.resolver, author, &document_id, base_version, op, now)
        });

        if let Ok(outcome) = &result {
            out.extend(state.touch(author, now));
            let session = state.session_mut(session_id)?;
            match outcome {
                EditOutcome::Applied { version, .. } => {
                    log::debug!("{author} edited session {session_id} → v{version}");
                    if let Some(change) = session.changes().last().cloned() {
                        out.push(Outbound::except(
                            SessionEvent::DocumentEdited { session_id, change },
                            author,
                        ));
                    }
                    if session.autosave_due(
                        now,
                        self.config.autosave_interval(),
                        self.config.autosave_change_threshold,
                    ) {
                        self.persist(session, PersistReason::Autosave);
                        session.mark_saved();
                    }
                }
                EditOutcome::Superseded { by, .. } => {
                    log::debug!("Edit by {author} in session {session_id} superseded by {by}");
                }
                EditOutcome::Conflict(conflict) => {
                    log::info!(
                        "Conflict {} in session {session_id} needs a decision: {}",
                        conflict.conflict_id,
                        conflict.reason
                    );
                    out.push(Outbound::all(SessionEvent::ConflictRequiresAttention {
                        conflict: conflict.clone(),
                    }));
                    self.notifier.notify(Notification::ConflictRaised {
                        room_id: handle.id.clone(),
                        conflict: conflict.clone(),
                    });
                }
            }
        }
        self.dispatch(&handle.id, out).await;
        result
    }

    /// Settle a pending conflict. Taking the incoming op applies it at the
    /// current version and announces it to everyone, the author included.
    pub async fn resolve_conflict(
        &self,
        session_id: SessionId,
        conflict_id: ConflictId,
        user_id: &str,
        choice: ConflictChoice,
    ) -> CollabResult<SettledConflict> {
        let handle = self.store.room_of_session(session_id).await?;
        let mut state = self.store.enter(&handle).await?;
        let now = self.clock.now();
        let settled = state
            .session_mut(session_id)?
            .resolve_conflict(conflict_id, user_id, choice, now)?;

        let mut out = Vec::new();
        if let Some(change) = &settled.change {
            out.push(Outbound::all(SessionEvent::DocumentEdited {
                session_id,
                change: change.clone(),
            }));
        }
        out.push(Outbound::all(SessionEvent::ConflictResolved {
            session_id,
            conflict_id,
            choice,
            resolved_by: user_id.to_string(),
        }));
        log::info!("{user_id} settled conflict {conflict_id} with {choice:?}");
        self.dispatch(&handle.id, out).await;
        Ok(settled)
    }

    // ─── Locks ────────────────────────────────────────────────────────

    /// Acquire or renew a lock. Returns `AlreadyLocked` at once when another
    /// user holds an unexpired lock.
    pub async fn lock_document(
        &self,
        session_id: SessionId,
        document_id: &str,
        user_id: &str,
        duration: Duration,
    ) -> CollabResult<Lock> {
        let handle = self.store.room_of_session(session_id).await?;
        let mut state = self.store.enter(&handle).await?;
        let now = self.clock.now();
        let mut out = state.expire_lock(session_id, document_id, now)?;
        let result = state
            .session_mut(session_id)
            .and_then(|session| session.lock(document_id, user_id, duration, now));
        match &result {
            Ok(lock) => {
                log::debug!("{user_id} locked {document_id} until {}", lock.expires_at);
                out.extend(state.touch(user_id, now));
                out.push(Outbound::except(
                    SessionEvent::DocumentLocked {
                        session_id,
                        lock: lock.clone(),
                    },
                    user_id,
                ));
            }
            Err(CollabError::AlreadyLocked { holder, .. }) => {
                log::warn!("{user_id} blocked on {document_id}, held by {holder}");
            }
            Err(_) => {}
        }
        self.dispatch(&handle.id, out).await;
        result
    }

    /// Release the caller's lock. Succeeds when nothing is locked.
    pub async fn unlock_document(&self, session_id: SessionId, document_id: &str, user_id: &str) -> CollabResult<()> {
        let handle = self.store.room_of_session(session_id).await?;
        let mut state = self.store.enter(&handle).await?;
        let now = self.clock.now();
        let mut out = state.expire_lock(session_id, document_id, now)?;
        let result = state
            .session_mut(session_id)
            .and_then(|session| session.unlock(document_id, user_id, now));
        if let Ok(Some(lock)) = &result {
            out.push(Outbound::except(
                SessionEvent::DocumentUnlocked {
                    session_id,
                    document_id: lock.document_id.clone(),
                    holder: lock.holder.clone(),
                    reason: UnlockReason::Released,
                },
                user_id,
            ));
        }
        self.dispatch(&handle.id, out).await;
        result.map(|_| ())
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Record a heartbeat in one room, or in every room the user belongs to.
    /// Returns the number of rooms touched.
    pub async fn heartbeat(&self, user_id: &str, room_id: Option<&str>) -> CollabResult<usize> {
        let handles = match room_id {
            Some(room_id) => vec![self.store.room(room_id).await?],
            None => self.store.rooms().await,
        };
        let mut touched = 0;
        for handle in handles {
            let mut state = match self.store.enter(&handle).await {
                Ok(state) => state,
                Err(e) if room_id.is_none() => {
                    log::debug!("Skipping heartbeat for room {}: {e}", handle.id);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !state.members.contains_key(user_id) {
                if room_id.is_some() {
                    state.member(user_id)?;
                }
                continue;
            }
            let now = self.clock.now();
            for session in state.sessions.values_mut() {
                session.touch(user_id, now);
            }
            let out = state.touch(user_id, now);
            self.dispatch(&handle.id, out).await;
            touched += 1;
        }
        Ok(touched)
    }

    pub async fn mark_online(&self, room_id: &str, user_id: &str) -> CollabResult<()> {
        let handle = self.store.room(room_id).await?;
        let mut state = self.store.enter(&handle).await?;
        let out = state.mark_online(user_id, self.clock.now())?;
        self.dispatch(room_id, out).await;
        Ok(())
    }

    /// Mark a member offline: their locks are released and `user_left`
    /// (disconnected) is published, but their participation is kept.
    pub async fn mark_offline(&self, room_id: &str, user_id: &str) -> CollabResult<()> {
        let handle = self.store.room(room_id).await?;
        let mut state = self.store.enter(&handle).await?;
        state.member(user_id)?;
        let out = state.mark_offline(user_id, self.clock.now());
        self.dispatch(room_id, out).await;
        Ok(())
    }

    pub async fn presence_snapshot(&self, room_id: &str) -> CollabResult<BTreeMap<UserId, PresenceStatus>> {
        let handle = self.store.room(room_id).await?;
        let state = self.store.enter(&handle).await?;
        Ok(state.presence.snapshot())
    }

    // ─── Transports ───────────────────────────────────────────────────

    /// Attach a user's transport and flush events queued while away.
    pub async fn connect(&self, user_id: &str, transport: Arc<dyn Transport>) -> Attachment {
        self.gateway.connect(user_id, transport).await
    }

    /// Detach `connection` and mark the user offline in every room. A
    /// connection that was already replaced by a newer one only closes
    /// itself; returns whether the user went offline.
    pub async fn disconnect(&self, user_id: &str, connection: ConnectionId) -> bool {
        if !self.gateway.disconnect(user_id, connection).await {
            log::debug!("Superseded connection {connection} of {user_id} closed");
            return false;
        }
        for handle in self.store.rooms().await {
            let Ok(mut state) = self.store.enter(&handle).await else {
                continue;
            };
            if !state.members.contains_key(user_id) {
                continue;
            }
            // A reconnect may have landed while earlier rooms were swept.
            if self.gateway.is_connected(user_id).await {
                break;
            }
            let out = state.mark_offline(user_id, self.clock.now());
            self.dispatch(&handle.id, out).await;
        }
        log::info!("{user_id} disconnected");
        true
    }

    // ─── Export ───────────────────────────────────────────────────────

    pub async fn export_session(&self, session_id: SessionId) -> CollabResult<SessionExport> {
        let handle = self.store.room_of_session(session_id).await?;
        let state = self.store.enter(&handle).await?;
        Ok(state.session(session_id)?.export(self.clock.now()))
    }

    /// Rebuild an exported session inside a room. The session keeps its id
    /// and starts with no participants.
    pub async fn import_session(&self, room_id: &str, export: SessionExport) -> CollabResult<SessionView> {
        if self.store.contains_session(export.session_id).await {
            return Err(CollabError::InvalidOperation(format!(
                "session {} already exists",
                export.session_id
            )));
        }
        let handle = self.store.room(room_id).await?;
        let mut state = self.store.enter(&handle).await?;
        let now = self.clock.now();
        let session = Session::from_export(room_id, export, self.limits.clone(), now)?;
        let session_id = session.id();
        log::info!(
            "Session {session_id} imported into room {room_id} at v{}",
            session.version()
        );
        let snapshot = view(&session, now);
        state.sessions.insert(session_id, session);
        self.store.index_session(session_id, room_id).await;
        Ok(snapshot)
    }

    // ─── Background work ──────────────────────────────────────────────

    /// One pass over every room: expire locks, time out silent users, close
    /// drained sessions, auto-save dirty ones and close idle rooms. Then
    /// retry queued deliveries and failed persists.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for handle in self.store.rooms().await {
            if let Err(e) = self.sweep_room(&handle, &mut report).await {
                log::warn!("Sweep skipped room {}: {e}", handle.id);
            }
        }
        report.redelivered = self.gateway.retry_pending().await;
        report.persist_retries = self.persistence.failed_count();
        if report.persist_retries > 0 {
            if let Err(e) = self.persistence.retry_failed() {
                log::error!("Could not queue persist retries: {e}");
            }
        }
        if !report.closed_sessions.is_empty() || !report.timed_out.is_empty() {
            log::info!(
                "Sweep: {} lock(s) expired, {} user(s) timed out, {} session(s) closed, {} room(s) closed",
                report.expired_locks,
                report.timed_out.len(),
                report.closed_sessions.len(),
                report.closed_rooms.len()
            );
        }
        report
    }

    async fn sweep_room(&self, handle: &RoomHandle, report: &mut SweepReport) -> CollabResult<()> {
        let mut state = self.store.enter(handle).await?;
        let now = self.clock.now();

        let mut out = state.expire_locks(now);
        report.expired_locks += out.len();

        let (timed_out, events) = state.sweep_presence(now);
        out.extend(events);
        report
            .timed_out
            .extend(timed_out.into_iter().map(|user| (handle.id.clone(), user)));

        let mut drained = Vec::new();
        for session in state.take_drained(now, self.config.drain_grace()) {
            log::info!(
                "Session {} closed after drain at v{}",
                session.id(),
                session.version()
            );
            self.persist(&session, PersistReason::Teardown);
            out.push(Outbound::all(SessionEvent::SessionClosed {
                session_id: session.id(),
                final_version: session.version(),
            }));
            drained.push(session.id());
        }

        for session in state.sessions.values_mut() {
            if session.autosave_due(
                now,
                self.config.autosave_interval(),
                self.config.autosave_change_threshold,
            ) {
                self.persist(session, PersistReason::Autosave);
                session.mark_saved();
                report.autosaved += 1;
            }
        }
        self.dispatch(&handle.id, out).await;

        if state.idle_elapsed(now, self.config.room_idle_timeout()) {
            log::info!("Room {} idle, closing", handle.id);
            drained.extend(self.close_locked(&mut state).await);
            drop(state);
            self.store.remove_room(&handle.id).await;
            report.closed_rooms.push(handle.id.clone());
        } else {
            drop(state);
        }

        report.closed_sessions.extend(drained.iter().copied());
        self.store.unindex_sessions(drained).await;
        Ok(())
    }

    /// Run `sweep` every `sweep_interval` until the returned task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let core = Arc::clone(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = core.sweep().await;
                log::trace!("Sweep finished: {report:?}");
            }
        })
    }

    /// Wait until every persist submitted so far has been handled.
    pub async fn flush_persistence(&self) -> CollabResult<()> {
        Ok(self.persistence.flush().await?)
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn persist(&self, session: &Session, reason: PersistReason) {
        let job = PersistJob {
            resource_id: session.resource_id().to_string(),
            snapshot: session.snapshot(),
            reason,
        };
        if let Err(e) = self.persistence.submit(job) {
            log::error!(
                "Could not queue {} persist of {}: {e}",
                reason.as_str(),
                session.resource_id()
            );
        }
    }

    /// Publish committed events. Called while the room is still entered.
    async fn dispatch(&self, room_id: &str, outbound: Vec<Outbound>) {
        for Outbound { event, except } in outbound {
            match except {
                Some(user_id) => self.gateway.publish_except(room_id, &user_id, event).await,
                None => self.gateway.publish(room_id, event).await,
            };
        }
    }
}

fn view(session: &Session, now: Timestamp) -> SessionView {
    SessionView {
        session_id: session.id(),
        room_id: session.room_id().to_string(),
        resource_id: session.resource_id().to_string(),
        state: session.state(),
        version: session.version(),
        content: session.content().clone(),
        content_type: session.content_type().to_string(),
        strategy: session.strategy(),
        participants: session.participants().to_vec(),
        locks: session.locks(now),
        pending_conflicts: session.pending_conflicts().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ChannelTransport;
    use crate::clock::ManualClock;
    use crate::collaborators::{ChannelNotifier, LogNotifier, MemoryDocuments};
    use crate::model::{Features, LeaveReason, RoomType};
    use crate::protocol::Envelope;
    use crate::storage::StoreError;
    use tokio::sync::mpsc;

    struct Fixture {
        core: Arc<Collaboration>,
        clock: ManualClock,
        documents: MemoryDocuments,
    }

    fn fixture(config: CollabConfig) -> Fixture {
        let clock = ManualClock::new(1_000_000);
        let documents = MemoryDocuments::new();
        let core = Arc::new(Collaboration::new(
            config,
            Arc::new(clock.clone()),
            Arc::new(documents.clone()),
            Arc::new(LogNotifier),
        ));
        Fixture { core, clock, documents }
    }

    async fn connect(core: &Collaboration, user: &str) -> mpsc::Receiver<Envelope> {
        attach(core, user).await.0
    }

    async fn attach(core: &Collaboration, user: &str) -> (mpsc::Receiver<Envelope>, ConnectionId) {
        let (transport, rx) = ChannelTransport::new(64);
        let attachment = core.connect(user, Arc::new(transport)).await;
        (rx, attachment.connection)
    }

    fn drain(rx: &mut mpsc::Receiver<Envelope>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            events.push(envelope.event);
        }
        events
    }

    fn workspace() -> RoomSettings {
        RoomSettings::new().with_type(RoomType::Workspace)
    }

    #[tokio::test]
    async fn test_create_room_defaults_and_duplicate() {
        let f = fixture(CollabConfig::default());
        let room = f.core.create_room("R1", RoomSettings::new()).await.unwrap();
        assert_eq!(room.name, "R1");
        assert_eq!(room.max_participants, 50);
        assert_eq!(room.room_type, RoomType::Review);
        assert!(matches!(
            f.core.create_room("R1", RoomSettings::new()).await,
            Err(CollabError::AlreadyExists(_))
        ));
        assert!(matches!(
            f.core
                .create_room("R2", RoomSettings::new().with_max_participants(0))
                .await,
            Err(CollabError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_session_seeds_from_collaborator() {
        let f = fixture(CollabConfig::default());
        f.documents.insert("doc", DocumentSnapshot::text("hello", 5)).await;
        f.core.create_room("R1", workspace()).await.unwrap();
        let view = f
            .core
            .create_session("R1", "doc", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(view.version, 5);
        assert_eq!(view.content.as_text(), Some("hello"));
        assert_eq!(view.participants.len(), 2);
        assert_eq!(view.state, SessionState::Active);

        assert!(matches!(
            f.core.create_session("nope", "doc", &[]).await,
            Err(CollabError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_session_checks_capacity_first() {
        let f = fixture(CollabConfig::default());
        f.core
            .create_room("R1", workspace().with_max_participants(1))
            .await
            .unwrap();
        let err = f
            .core
            .create_session("R1", "doc", &["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::RoomFull { .. }));
        let room = f.core.room_view("R1").await.unwrap();
        assert!(room.sessions.is_empty());
        assert!(room.members.is_empty());
    }

    #[tokio::test]
    async fn test_edit_is_not_echoed_to_author() {
        let f = fixture(CollabConfig::default());
        f.core.create_room("R1", workspace()).await.unwrap();
        let mut rx_a = connect(&f.core, "a").await;
        let mut rx_b = connect(&f.core, "b").await;
        let view = f
            .core
            .create_session("R1", "doc", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        f.core
            .apply_edit(view.session_id, "a", None, 0, EditOp::insert(0, "hi"))
            .await
            .unwrap();
        assert!(drain(&mut rx_a).is_empty());
        let events = drain(&mut rx_b);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SessionEvent::DocumentEdited { change, .. } if change.version == 1));
    }

    #[tokio::test]
    async fn test_lazy_lock_expiry_on_edit() {
        let f = fixture(CollabConfig::default());
        f.core.create_room("R1", workspace()).await.unwrap();
        let view = f
            .core
            .create_session("R1", "doc", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let sid = view.session_id;
        let mut rx_b = connect(&f.core, "b").await;

        f.core
            .lock_document(sid, "doc", "a", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(
            f.core.apply_edit(sid, "b", None, 0, EditOp::insert(0, "x")).await,
            Err(CollabError::AlreadyLocked { .. })
        ));

        f.clock.advance(Duration::from_secs(61));
        drain(&mut rx_b);
        f.core
            .apply_edit(sid, "b", None, 0, EditOp::insert(0, "x"))
            .await
            .unwrap();
        let events = drain(&mut rx_b);
        assert!(matches!(
            &events[0],
            SessionEvent::DocumentUnlocked { reason: UnlockReason::Expired, .. }
        ));
    }

    #[tokio::test]
    async fn test_unlock_by_other_user_fails() {
        let f = fixture(CollabConfig::default());
        f.core.create_room("R1", workspace()).await.unwrap();
        let view = f
            .core
            .create_session("R1", "doc", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let sid = view.session_id;
        f.core
            .lock_document(sid, "doc", "a", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(
            f.core.unlock_document(sid, "doc", "b").await,
            Err(CollabError::NotHolder { .. })
        ));
        f.core.unlock_document(sid, "doc", "a").await.unwrap();
        // Nothing locked any more: silent success.
        f.core.unlock_document(sid, "doc", "a").await.unwrap();
    }

    #[tokio::test]
    async fn test_chat_requires_feature_and_membership() {
        let f = fixture(CollabConfig::default());
        let muted = Features {
            chat: false,
            file_sharing: false,
            recording: false,
        };
        f.core
            .create_room("quiet", RoomSettings::new().with_features(muted))
            .await
            .unwrap();
        f.core.join(JoinTarget::Room("quiet".into()), "a", None).await.unwrap();
        assert!(matches!(
            f.core.send_message("quiet", None, "a", "hi", BTreeMap::new()).await,
            Err(CollabError::Forbidden(_))
        ));

        f.core.create_room("R1", workspace()).await.unwrap();
        assert!(matches!(
            f.core.send_message("R1", None, "stranger", "hi", BTreeMap::new()).await,
            Err(CollabError::Forbidden(_))
        ));
        f.core.join(JoinTarget::Room("R1".into()), "a", None).await.unwrap();
        let message = f
            .core
            .send_message("R1", None, "a", "hi", BTreeMap::new())
            .await
            .unwrap();
        let room = f.core.room_view("R1").await.unwrap();
        assert_eq!(room.messages, vec![message]);
    }

    #[tokio::test]
    async fn test_comment_and_permission_notify() {
        let clock = ManualClock::new(0);
        let (notifier, mut notes) = ChannelNotifier::new();
        let core = Collaboration::new(
            CollabConfig::default(),
            Arc::new(clock),
            Arc::new(MemoryDocuments::new()),
            Arc::new(notifier),
        );
        core.create_room("R1", workspace().created_by("owner")).await.unwrap();
        let view = core
            .create_session("R1", "doc", &["owner".to_string(), "b".to_string()])
            .await
            .unwrap();
        let sid = view.session_id;

        core.add_comment(sid, "b", "doc", "looks good", None).await.unwrap();
        assert!(matches!(notes.recv().await, Some(Notification::CommentAdded { .. })));

        assert!(matches!(
            core.update_permission(sid, "b", "owner", Permission::Viewer).await,
            Err(CollabError::Forbidden(_))
        ));
        core.update_permission(sid, "owner", "b", Permission::Viewer)
            .await
            .unwrap();
        assert!(matches!(
            notes.recv().await,
            Some(Notification::PermissionChanged { permission: Permission::Viewer, .. })
        ));
        assert!(matches!(
            core.apply_edit(sid, "b", None, 0, EditOp::insert(0, "x")).await,
            Err(CollabError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_user_receives_queue_on_reconnect() {
        let f = fixture(CollabConfig::default());
        f.core.create_room("R1", workspace()).await.unwrap();
        let view = f
            .core
            .create_session("R1", "doc", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        for i in 0..3u64 {
            f.core
                .apply_edit(view.session_id, "a", None, i, EditOp::insert(0, "x"))
                .await
                .unwrap();
        }
        // Two joins and three edits.
        assert_eq!(f.core.gateway().queued_for("b").await, 5);
        let mut rx_b = connect(&f.core, "b").await;
        let versions: Vec<u64> = drain(&mut rx_b)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::DocumentEdited { change, .. } => Some(change.version),
                _ => None,
            })
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_disconnect_releases_locks() {
        let f = fixture(CollabConfig::default());
        f.core.create_room("R1", workspace()).await.unwrap();
        let view = f
            .core
            .create_session("R1", "doc", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let (_rx_a, conn_a) = attach(&f.core, "a").await;
        let mut rx_b = connect(&f.core, "b").await;
        f.core
            .lock_document(view.session_id, "doc", "a", Duration::from_secs(300))
            .await
            .unwrap();
        drain(&mut rx_b);

        assert!(f.core.disconnect("a", conn_a).await);
        let events = drain(&mut rx_b);
        assert!(matches!(
            &events[0],
            SessionEvent::DocumentUnlocked { reason: UnlockReason::Disconnect, .. }
        ));
        assert!(matches!(
            &events[1],
            SessionEvent::UserLeft { reason: LeaveReason::Disconnected, .. }
        ));
        let after = f.core.session_view(view.session_id).await.unwrap();
        assert!(after.locks.is_empty());
        assert_eq!(after.participants.len(), 2);
    }

    #[tokio::test]
    async fn test_superseded_connection_close_keeps_user_online() {
        let f = fixture(CollabConfig::default());
        f.core.create_room("R1", workspace()).await.unwrap();
        let view = f
            .core
            .create_session("R1", "doc", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let (_rx_old, old) = attach(&f.core, "a").await;
        let (mut rx_new, new) = attach(&f.core, "a").await;
        f.core
            .lock_document(view.session_id, "doc", "a", Duration::from_secs(300))
            .await
            .unwrap();
        drain(&mut rx_new);

        assert!(!f.core.disconnect("a", old).await);
        assert!(f.core.gateway().is_connected("a").await);
        let presence = f.core.presence_snapshot("R1").await.unwrap();
        assert_eq!(presence.get("a"), Some(&PresenceStatus::Online));
        assert_eq!(f.core.session_view(view.session_id).await.unwrap().locks.len(), 1);

        f.core
            .send_message("R1", Some(view.session_id), "b", "still there?", Default::default())
            .await
            .unwrap();
        let events = drain(&mut rx_new);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::MessageReceived { .. })));

        assert!(f.core.disconnect("a", new).await);
        assert!(!f.core.gateway().is_connected("a").await);
        assert!(f.core.session_view(view.session_id).await.unwrap().locks.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_closes_drained_session_and_persists() {
        let f = fixture(CollabConfig::default());
        f.core.create_room("R1", workspace()).await.unwrap();
        let view = f.core.create_session("R1", "doc", &["a".to_string()]).await.unwrap();
        let sid = view.session_id;
        f.core
            .apply_edit(sid, "a", None, 0, EditOp::insert(0, "final"))
            .await
            .unwrap();
        f.core.join(JoinTarget::Room("R1".into()), "a", None).await.unwrap();
        f.core.leave(sid, "a").await.unwrap();
        assert_eq!(
            f.core.session_view(sid).await.unwrap().state,
            SessionState::Draining
        );

        f.clock.advance(Duration::from_secs(299));
        f.core.heartbeat("a", Some("R1")).await.unwrap();
        assert!(f.core.sweep().await.closed_sessions.is_empty());

        f.clock.advance(Duration::from_secs(2));
        let report = f.core.sweep().await;
        assert_eq!(report.closed_sessions, vec![sid]);
        assert!(matches!(
            f.core.session_view(sid).await,
            Err(CollabError::SessionNotFound(_))
        ));
        f.core.flush_persistence().await.unwrap();
        let stored = f.documents.get("doc").await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.content.as_text(), Some("final"));
    }

    #[tokio::test]
    async fn test_autosave_threshold() {
        let config = CollabConfig {
            autosave_change_threshold: 2,
            ..CollabConfig::default()
        };
        let f = fixture(config);
        f.core.create_room("R1", workspace()).await.unwrap();
        let view = f.core.create_session("R1", "doc", &["a".to_string()]).await.unwrap();
        f.core
            .apply_edit(view.session_id, "a", None, 0, EditOp::insert(0, "a"))
            .await
            .unwrap();
        f.core.flush_persistence().await.unwrap();
        assert!(f.documents.get("doc").await.is_none());
        f.core
            .apply_edit(view.session_id, "a", None, 1, EditOp::insert(1, "b"))
            .await
            .unwrap();
        f.core.flush_persistence().await.unwrap();
        assert_eq!(f.documents.get("doc").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_idle_room_closed_by_sweep() {
        let config = CollabConfig {
            room_idle_timeout_secs: 60,
            ..CollabConfig::default()
        };
        let f = fixture(config);
        f.core.create_room("R1", workspace()).await.unwrap();
        assert!(f.core.sweep().await.closed_rooms.is_empty());
        f.clock.advance(Duration::from_secs(60));
        assert_eq!(f.core.sweep().await.closed_rooms, vec!["R1".to_string()]);
        assert_eq!(f.core.room_count().await, 0);
        assert!(matches!(
            f.core.join(JoinTarget::Room("R1".into()), "a", None).await,
            Err(CollabError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_room_persists_sessions() {
        let f = fixture(CollabConfig::default());
        f.core.create_room("R1", workspace()).await.unwrap();
        let view = f.core.create_session("R1", "doc", &["a".to_string()]).await.unwrap();
        f.core
            .apply_edit(view.session_id, "a", None, 0, EditOp::insert(0, "kept"))
            .await
            .unwrap();
        f.core.close_room("R1").await.unwrap();
        f.core.flush_persistence().await.unwrap();
        assert_eq!(f.documents.get("doc").await.unwrap().content.as_text(), Some("kept"));
        assert!(matches!(
            f.core.session_view(view.session_id).await,
            Err(CollabError::SessionNotFound(_))
        ));
    }

    /// Collaborator whose persists fail while `down` is set.
    struct OutageDocuments {
        inner: MemoryDocuments,
        down: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl DocumentCollaborator for OutageDocuments {
        async fn get_snapshot(&self, resource_id: &str) -> Result<Option<DocumentSnapshot>, StoreError> {
            self.inner.get_snapshot(resource_id).await
        }

        async fn persist(&self, resource_id: &str, snapshot: DocumentSnapshot) -> Result<(), StoreError> {
            if self.down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::Unavailable("outage".to_string()));
            }
            self.inner.persist(resource_id, snapshot).await
        }
    }

    #[tokio::test]
    async fn test_failed_persists_retried_by_sweep() {
        let documents = MemoryDocuments::new();
        let collaborator = Arc::new(OutageDocuments {
            inner: documents.clone(),
            down: std::sync::atomic::AtomicBool::new(true),
        });
        let config = CollabConfig {
            autosave_change_threshold: 1,
            ..CollabConfig::default()
        };
        let core = Collaboration::new(
            config,
            Arc::new(ManualClock::new(1_000_000)),
            collaborator.clone(),
            Arc::new(LogNotifier),
        );
        core.create_room("R1", workspace()).await.unwrap();
        let view = core.create_session("R1", "doc", &["a".to_string()]).await.unwrap();
        core.apply_edit(view.session_id, "a", None, 0, EditOp::insert(0, "saved"))
            .await
            .unwrap();
        core.flush_persistence().await.unwrap();
        assert!(documents.get("doc").await.is_none());

        // The session is gone by the time the collaborator recovers.
        core.close_room("R1").await.unwrap();
        core.flush_persistence().await.unwrap();
        assert!(documents.get("doc").await.is_none());
        assert_eq!(core.sweep().await.persist_retries, 1);
        core.flush_persistence().await.unwrap();
        assert!(documents.get("doc").await.is_none());

        collaborator
            .down
            .store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(core.sweep().await.persist_retries, 1);
        core.flush_persistence().await.unwrap();
        let stored = documents.get("doc").await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.content.as_text(), Some("saved"));
        assert_eq!(core.sweep().await.persist_retries, 0);
    }

    #[tokio::test]
    async fn test_import_rejects_live_session() {
        let f = fixture(CollabConfig::default());
        f.core.create_room("R1", workspace()).await.unwrap();
        let view = f.core.create_session("R1", "doc", &["a".to_string()]).await.unwrap();
        let export = f.core.export_session(view.session_id).await.unwrap();
        assert!(matches!(
            f.core.import_session("R1", export).await,
            Err(CollabError::InvalidOperation(_))
        ));
    }
}
