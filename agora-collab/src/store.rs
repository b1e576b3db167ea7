//! Arena of rooms.
//!
//! ```text
//! SessionStore
//!   rooms:    RwLock<HashMap<RoomId, Arc<RoomHandle>>>    (registry, short reads)
//!   sessions: RwLock<HashMap<SessionId, RoomId>>           (session → room index)
//!
//! RoomHandle
//!   state: Mutex<RoomState>   ← the room's sequencer; every operation on the
//!                               room, its sessions, locks and presence runs
//!                               while holding it
//! ```
//!
//! Rooms never share mutable state, so operations on different rooms run in
//! parallel. `RoomState` methods are synchronous and return the events the
//! caller publishes before releasing the room.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::error::{CollabError, CollabResult};
use crate::lock::Lock;
use crate::model::{
    LeaveReason, Message, Participant, Permission, Room, RoomId, SessionId, Timestamp,
    UnlockReason, UserId,
};
use crate::presence::PresenceTracker;
use crate::protocol::SessionEvent;
use crate::session::Session;

/// An event to publish once the state change has committed.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub event: SessionEvent,
    /// Recipient to skip (the author of an edit).
    pub except: Option<UserId>,
}

impl Outbound {
    pub fn all(event: SessionEvent) -> Self {
        Self { event, except: None }
    }

    pub fn except(event: SessionEvent, user_id: &str) -> Self {
        Self {
            event,
            except: Some(user_id.to_string()),
        }
    }
}

/// Room-level membership. Counts toward `max_participants`.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomMember {
    pub user_id: UserId,
    pub permission: Permission,
    pub joined_at: Timestamp,
    /// Joined the room itself rather than only through a session; such
    /// members stay after leaving their last session.
    pub direct: bool,
}

impl RoomMember {
    pub fn as_participant(&self, last_activity: Timestamp) -> Participant {
        Participant {
            user_id: self.user_id.clone(),
            joined_at: self.joined_at,
            permission: self.permission,
            last_activity,
        }
    }
}

/// Everything owned by one room's sequencer.
#[derive(Debug)]
pub struct RoomState {
    pub room: Room,
    pub members: BTreeMap<UserId, RoomMember>,
    pub presence: PresenceTracker,
    pub sessions: BTreeMap<SessionId, Session>,
    pub messages: VecDeque<Message>,
    message_cap: usize,
    idle_since: Option<Timestamp>,
    closed: bool,
}

impl RoomState {
    pub fn new(room: Room, heartbeat_interval: Duration, message_cap: usize) -> Self {
        let idle_since = Some(room.created_at);
        Self {
            room,
            members: BTreeMap::new(),
            presence: PresenceTracker::new(heartbeat_interval),
            sessions: BTreeMap::new(),
            messages: VecDeque::new(),
            message_cap,
            idle_since,
            closed: false,
        }
    }

    pub fn session(&self, session_id: SessionId) -> CollabResult<&Session> {
        self.sessions
            .get(&session_id)
            .ok_or(CollabError::SessionNotFound(session_id))
    }

    pub fn session_mut(&mut self, session_id: SessionId) -> CollabResult<&mut Session> {
        self.sessions
            .get_mut(&session_id)
            .ok_or(CollabError::SessionNotFound(session_id))
    }

    pub fn member(&self, user_id: &str) -> CollabResult<&RoomMember> {
        self.members.get(user_id).ok_or_else(|| {
            CollabError::Forbidden(format!("{user_id} is not a member of room {}", self.room.id))
        })
    }

    // ─── Admission ────────────────────────────────────────────────────

    /// Permission the user would be admitted with, after the invite and
    /// permission-policy checks. Capacity is checked separately.
    pub fn admission(&self, user_id: &str, requested: Option<Permission>) -> CollabResult<Permission> {
        if !self.room.is_invited(user_id) {
            return Err(CollabError::Forbidden(format!(
                "{user_id} is not invited to room {}",
                self.room.id
            )));
        }
        if user_id == self.room.created_by {
            return Ok(requested.unwrap_or(Permission::Admin));
        }
        let ceiling = self.room.room_type.max_permission();
        match requested {
            Some(permission) if permission > ceiling => Err(CollabError::Forbidden(format!(
                "{permission:?} exceeds {ceiling:?} allowed in {:?} rooms",
                self.room.room_type
            ))),
            Some(permission) => Ok(permission),
            None => Ok(self.room.room_type.default_permission()),
        }
    }

    /// Fails with `RoomFull` when admitting `new_members` more users would
    /// exceed the room's capacity.
    pub fn check_capacity(&self, new_members: usize) -> CollabResult<()> {
        if self.members.len() + new_members > self.room.max_participants {
            return Err(CollabError::RoomFull {
                room_id: self.room.id.clone(),
                max: self.room.max_participants,
            });
        }
        Ok(())
    }

    /// Admit a user to the room. Returns the member and whether it is new.
    pub fn join_room(
        &mut self,
        user_id: &str,
        requested: Option<Permission>,
        direct: bool,
        now: Timestamp,
    ) -> CollabResult<(RoomMember, bool)> {
        if let Some(member) = self.members.get_mut(user_id) {
            member.direct |= direct;
            let member = member.clone();
            self.presence.mark_online(user_id, None, now);
            return Ok((member, false));
        }
        let permission = self.admission(user_id, requested)?;
        self.check_capacity(1)?;

        let member = RoomMember {
            user_id: user_id.to_string(),
            permission,
            joined_at: now,
            direct,
        };
        self.members.insert(user_id.to_string(), member.clone());
        self.presence.mark_online(user_id, None, now);
        self.idle_since = None;
        log::info!("{user_id} joined room {} as {permission:?}", self.room.id);
        Ok((member, true))
    }

    /// Join a session, admitting the user to the room first if needed.
    pub fn join_session(
        &mut self,
        session_id: SessionId,
        user_id: &str,
        requested: Option<Permission>,
        now: Timestamp,
    ) -> CollabResult<(Participant, Vec<Outbound>)> {
        self.session(session_id)?;
        let (member, _) = self.join_room(user_id, requested, false, now)?;
        let permission = match requested {
            Some(p) if p <= member.permission => p,
            _ => member.permission,
        };

        self.presence.mark_online(user_id, Some(session_id), now);
        let session = self.session_mut(session_id)?;
        match session.join(user_id, permission, now) {
            Some(participant) => {
                log::info!("{user_id} joined session {session_id} as {permission:?}");
                let event = SessionEvent::UserJoined {
                    session_id: Some(session_id),
                    user_id: user_id.to_string(),
                    permission,
                };
                Ok((participant, vec![Outbound::all(event)]))
            }
            None => {
                let existing = session
                    .participant(user_id)
                    .cloned()
                    .ok_or_else(|| CollabError::NotFound(format!("participant {user_id}")))?;
                Ok((existing, Vec::new()))
            }
        }
    }

    // ─── Departure ────────────────────────────────────────────────────

    /// Leave one session. A user who joined only through sessions leaves the
    /// room with their last one. Leaving twice is a no-op.
    pub fn leave_session(&mut self, session_id: SessionId, user_id: &str, now: Timestamp) -> CollabResult<Vec<Outbound>> {
        let session = self.session_mut(session_id)?;
        let Some((_, released)) = session.leave(user_id, now) else {
            return Ok(Vec::new());
        };
        log::info!("{user_id} left session {session_id}");

        let mut out = unlock_events(session_id, &released, UnlockReason::Released);
        out.push(Outbound::all(SessionEvent::UserLeft {
            session_id: Some(session_id),
            user_id: user_id.to_string(),
            reason: LeaveReason::Left,
        }));

        let direct = self.members.get(user_id).is_some_and(|m| m.direct);
        if !direct && !self.in_any_session(user_id) {
            out.extend(self.remove_member(user_id));
        }
        Ok(out)
    }

    /// Leave every session and the room. Leaving twice is a no-op.
    pub fn leave_room(&mut self, user_id: &str, now: Timestamp) -> Vec<Outbound> {
        let joined: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_participant(user_id))
            .map(|(id, _)| *id)
            .collect();
        let mut out = Vec::new();
        for session_id in joined {
            if let Ok(events) = self.leave_session(session_id, user_id, now) {
                out.extend(events);
            }
        }
        out.extend(self.remove_member(user_id));
        out
    }

    fn remove_member(&mut self, user_id: &str) -> Vec<Outbound> {
        if self.members.remove(user_id).is_none() {
            return Vec::new();
        }
        self.presence.remove(user_id);
        log::info!("{user_id} left room {}", self.room.id);
        vec![Outbound::all(SessionEvent::UserLeft {
            session_id: None,
            user_id: user_id.to_string(),
            reason: LeaveReason::Left,
        })]
    }

    fn in_any_session(&self, user_id: &str) -> bool {
        self.sessions.values().any(|s| s.is_participant(user_id))
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Record activity. A user coming back online is announced again.
    pub fn touch(&mut self, user_id: &str, now: Timestamp) -> Vec<Outbound> {
        let Some(member) = self.members.get(user_id) else {
            return Vec::new();
        };
        let permission = member.permission;
        if self.presence.touch(user_id, now) {
            log::info!("{user_id} is back online in room {}", self.room.id);
            return vec![Outbound::all(SessionEvent::UserJoined {
                session_id: None,
                user_id: user_id.to_string(),
                permission,
            })];
        }
        Vec::new()
    }

    /// Mark a member online (explicit presence update).
    pub fn mark_online(&mut self, user_id: &str, now: Timestamp) -> CollabResult<Vec<Outbound>> {
        let permission = self.member(user_id)?.permission;
        if self.presence.mark_online(user_id, None, now) {
            return Ok(vec![Outbound::all(SessionEvent::UserJoined {
                session_id: None,
                user_id: user_id.to_string(),
                permission,
            })]);
        }
        Ok(Vec::new())
    }

    /// Mark a member offline: their locks are released with reason
    /// `disconnect` and `user_left(disconnected)` is emitted, but membership
    /// and session participation are kept.
    pub fn mark_offline(&mut self, user_id: &str, now: Timestamp) -> Vec<Outbound> {
        if !self.presence.mark_offline(user_id, now) {
            return Vec::new();
        }
        self.disconnected(user_id, now)
    }

    /// Time out members whose heartbeat lapsed.
    pub fn sweep_presence(&mut self, now: Timestamp) -> (Vec<UserId>, Vec<Outbound>) {
        let timed_out = self.presence.sweep(now);
        let mut out = Vec::new();
        for user_id in &timed_out {
            log::info!("{user_id} timed out in room {}", self.room.id);
            out.extend(self.disconnected(user_id, now));
        }
        (timed_out, out)
    }

    fn disconnected(&mut self, user_id: &str, now: Timestamp) -> Vec<Outbound> {
        let mut out = Vec::new();
        for (session_id, session) in self.sessions.iter_mut() {
            let released = session.release_locks_of(user_id, now);
            out.extend(unlock_events(*session_id, &released, UnlockReason::Disconnect));
        }
        out.push(Outbound::all(SessionEvent::UserLeft {
            session_id: None,
            user_id: user_id.to_string(),
            reason: LeaveReason::Disconnected,
        }));
        out
    }

    // ─── Locks ────────────────────────────────────────────────────────

    /// Remove an expired lock on one document, announcing it.
    pub fn expire_lock(&mut self, session_id: SessionId, document_id: &str, now: Timestamp) -> CollabResult<Vec<Outbound>> {
        let session = self.session_mut(session_id)?;
        Ok(session
            .expire_lock(document_id, now)
            .map(|lock| unlock_events(session_id, std::slice::from_ref(&lock), UnlockReason::Expired))
            .unwrap_or_default())
    }

    /// Remove every expired lock in the room.
    pub fn expire_locks(&mut self, now: Timestamp) -> Vec<Outbound> {
        let mut out = Vec::new();
        for (session_id, session) in self.sessions.iter_mut() {
            let expired = session.expire_locks(now);
            out.extend(unlock_events(*session_id, &expired, UnlockReason::Expired));
        }
        out
    }

    // ─── Messages ─────────────────────────────────────────────────────

    pub fn push_message(&mut self, message: Message) {
        self.messages.push_back(message);
        while self.messages.len() > self.message_cap {
            self.messages.pop_front();
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Remove sessions whose drain grace period elapsed, closing them.
    pub fn take_drained(&mut self, now: Timestamp, grace: Duration) -> Vec<Session> {
        let drained: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.drain_elapsed(now, grace))
            .map(|(id, _)| *id)
            .collect();
        drained
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id))
            .map(|mut session| {
                session.close();
                session
            })
            .collect()
    }

    /// Close and remove every session.
    pub fn take_all_sessions(&mut self) -> Vec<Session> {
        std::mem::take(&mut self.sessions)
            .into_values()
            .map(|mut session| {
                session.close();
                session
            })
            .collect()
    }

    /// Close the room: every session is closed and returned, members are
    /// dropped, and later entries fail with `RoomNotFound`.
    pub fn close(&mut self) -> Vec<Session> {
        self.closed = true;
        self.members.clear();
        self.presence.clear();
        self.take_all_sessions()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Idle for at least `timeout`: no sessions and no members.
    pub fn idle_elapsed(&mut self, now: Timestamp, timeout: Duration) -> bool {
        if !self.sessions.is_empty() || !self.members.is_empty() {
            self.idle_since = None;
            return false;
        }
        let since = *self.idle_since.get_or_insert(now);
        now.saturating_sub(since) >= timeout.as_millis() as u64
    }
}

fn unlock_events(session_id: SessionId, locks: &[Lock], reason: UnlockReason) -> Vec<Outbound> {
    locks
        .iter()
        .map(|lock| {
            let event = SessionEvent::DocumentUnlocked {
                session_id,
                document_id: lock.document_id.clone(),
                holder: lock.holder.clone(),
                reason,
            };
            match reason {
                UnlockReason::Released => Outbound::except(event, &lock.holder),
                UnlockReason::Expired | UnlockReason::Disconnect => Outbound::all(event),
            }
        })
        .collect()
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

pub struct RoomHandle {
    pub id: RoomId,
    state: Mutex<RoomState>,
}

impl RoomHandle {
    pub fn new(state: RoomState) -> Self {
        Self {
            id: state.room.id.clone(),
            state: Mutex::new(state),
        }
    }
}

/// Registry of rooms and the session → room index.
pub struct SessionStore {
    rooms: RwLock<HashMap<RoomId, Arc<RoomHandle>>>,
    sessions: RwLock<HashMap<SessionId, RoomId>>,
    wait_timeout: Duration,
}

impl SessionStore {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            wait_timeout,
        }
    }

    pub async fn insert_room(&self, state: RoomState) -> CollabResult<Arc<RoomHandle>> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&state.room.id) {
            return Err(CollabError::AlreadyExists(state.room.id.clone()));
        }
        let handle = Arc::new(RoomHandle::new(state));
        rooms.insert(handle.id.clone(), handle.clone());
        Ok(handle)
    }

    pub async fn room(&self, room_id: &str) -> CollabResult<Arc<RoomHandle>> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| CollabError::RoomNotFound(room_id.to_string()))
    }

    pub async fn remove_room(&self, room_id: &str) -> Option<Arc<RoomHandle>> {
        self.rooms.write().await.remove(room_id)
    }

    pub async fn rooms(&self) -> Vec<Arc<RoomHandle>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_of_session(&self, session_id: SessionId) -> CollabResult<Arc<RoomHandle>> {
        let room_id = self
            .sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(CollabError::SessionNotFound(session_id))?;
        self.room(&room_id).await
    }

    pub async fn index_session(&self, session_id: SessionId, room_id: &str) {
        self.sessions.write().await.insert(session_id, room_id.to_string());
    }

    pub async fn unindex_sessions(&self, session_ids: impl IntoIterator<Item = SessionId>) {
        let mut sessions = self.sessions.write().await;
        for id in session_ids {
            sessions.remove(&id);
        }
    }

    pub async fn contains_session(&self, session_id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&session_id)
    }

    /// Enter the room's critical section, or `Timeout` after the configured
    /// wait.
    pub async fn enter<'a>(&self, handle: &'a RoomHandle) -> CollabResult<MutexGuard<'a, RoomState>> {
        let guard = tokio::time::timeout(self.wait_timeout, handle.state.lock())
            .await
            .map_err(|_| {
                log::warn!("Timed out waiting for room {}", handle.id);
                CollabError::Timeout(handle.id.clone())
            })?;
        if guard.closed {
            return Err(CollabError::RoomNotFound(handle.id.clone()));
        }
        Ok(guard)
    }
}
