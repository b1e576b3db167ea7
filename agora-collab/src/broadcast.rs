//! Fan-out of session events to the members of a room.
//!
//! ```text
//! publish(room, event) ── lock room ── seq = room.next_seq++ ──► Envelope
//!        │
//!        ├── member attached, queue empty ──► transport.send()
//!        │                                        │ error
//!        │                                        ▼
//!        └── member offline / queue non-empty ──► mailbox queue (bounded)
//!                                                   │
//!                       connect() / retry_pending() ┘ flush in order
//! ```
//!
//! Each room owns its channel lock and each user owns a mailbox lock, so
//! publishing in one room never waits on another room. Locks are always
//! taken room first, then mailbox, then diagnostics.
//!
//! Publishing never awaits a transport: `Transport::send` must be
//! non-blocking, so calling `publish` while holding a room's critical
//! section keeps per-recipient order equal to publish order.

use dashmap::DashMap;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::clock::SharedClock;
use crate::model::{RoomId, Timestamp, UserId};
use crate::protocol::{Envelope, SessionEvent};

/// Identifies one attached transport. A user reconnecting gets a new id.
pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("transport closed")]
    Closed,
    #[error("transport buffer full")]
    Full,
}

/// Outbound half of a client connection.
pub trait Transport: Send + Sync {
    /// Hand an envelope to the connection without waiting.
    fn send(&self, envelope: &Envelope) -> Result<(), DeliveryError>;
}

/// Transport backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Envelope>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        self.tx.try_send(envelope.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Events queued per user before the oldest are dropped
    pub queue_capacity: usize,
    /// Failed sends per event before it is dropped
    pub max_delivery_attempts: u32,
    /// Diagnostics retained
    pub diagnostics_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 500,
            max_delivery_attempts: 5,
            diagnostics_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticReason {
    /// Gave up after `max_delivery_attempts` failed sends.
    AttemptsExhausted,
    /// Evicted from a full offline queue.
    QueueOverflow,
}

/// A `delivery_failed` record. Never surfaced as an error to users.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryDiagnostic {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub seq: u64,
    pub event_type: &'static str,
    pub attempts: u32,
    pub reason: DiagnosticReason,
    pub recorded_at: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub published: u64,
    pub delivered: u64,
    pub queued: u64,
    pub dropped: u64,
}

struct AtomicGatewayStats {
    published: AtomicU64,
    delivered: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
}

impl AtomicGatewayStats {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }
}

struct QueuedEvent {
    envelope: Arc<Envelope>,
    attempts: u32,
}

/// Result of attaching a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    /// Token the connection must present to detach itself
    pub connection: ConnectionId,
    /// Queued events delivered on attach
    pub flushed: usize,
}

#[derive(Default)]
struct RoomChannel {
    members: BTreeSet<UserId>,
    next_seq: u64,
}

struct Attached {
    connection: ConnectionId,
    transport: Arc<dyn Transport>,
}

/// Per-user delivery state: the live transport, if any, and the backlog.
#[derive(Default)]
struct Mailbox {
    attached: Option<Attached>,
    queue: VecDeque<QueuedEvent>,
}

pub struct BroadcastGateway {
    rooms: DashMap<RoomId, Arc<Mutex<RoomChannel>>>,
    mailboxes: DashMap<UserId, Arc<Mutex<Mailbox>>>,
    diagnostics: Mutex<VecDeque<DeliveryDiagnostic>>,
    next_connection: AtomicU64,
    config: GatewayConfig,
    clock: SharedClock,
    stats: AtomicGatewayStats,
}

impl BroadcastGateway {
    pub fn new(config: GatewayConfig, clock: SharedClock) -> Self {
        Self {
            rooms: DashMap::new(),
            mailboxes: DashMap::new(),
            diagnostics: Mutex::new(VecDeque::new()),
            next_connection: AtomicU64::new(1),
            config,
            clock,
            stats: AtomicGatewayStats::new(),
        }
    }

    fn room(&self, room_id: &str) -> Arc<Mutex<RoomChannel>> {
        self.rooms.entry(room_id.to_string()).or_default().value().clone()
    }

    fn mailbox(&self, user_id: &str) -> Arc<Mutex<Mailbox>> {
        self.mailboxes.entry(user_id.to_string()).or_default().value().clone()
    }

    fn existing_mailbox(&self, user_id: &str) -> Option<Arc<Mutex<Mailbox>>> {
        self.mailboxes.get(user_id).map(|m| Arc::clone(m.value()))
    }

    // ─── Membership ───────────────────────────────────────────────────

    /// Add a user to a room's audience.
    pub async fn subscribe(&self, room_id: &str, user_id: &str) {
        let room = self.room(room_id);
        room.lock().await.members.insert(user_id.to_string());
    }

    /// Remove a user from a room's audience and drop anything still queued
    /// for them from that room.
    pub async fn unsubscribe(&self, room_id: &str, user_id: &str) {
        let Some(room) = self.rooms.get(room_id).map(|r| Arc::clone(r.value())) else {
            return;
        };
        let mut channel = room.lock().await;
        channel.members.remove(user_id);
        if let Some(mailbox) = self.existing_mailbox(user_id) {
            mailbox
                .lock()
                .await
                .queue
                .retain(|q| q.envelope.room_id != room_id);
        }
    }

    /// Forget a room and every event queued for it.
    pub async fn remove_room(&self, room_id: &str) {
        if let Some((_, room)) = self.rooms.remove(room_id) {
            // Publishers that already hold the channel finish first; later
            // ones find no audience.
            room.lock().await.members.clear();
        }
        let mailboxes: Vec<_> = self.mailboxes.iter().map(|m| Arc::clone(m.value())).collect();
        for mailbox in mailboxes {
            mailbox
                .lock()
                .await
                .queue
                .retain(|q| q.envelope.room_id != room_id);
        }
    }

    pub async fn members(&self, room_id: &str) -> Vec<UserId> {
        let Some(room) = self.rooms.get(room_id).map(|r| Arc::clone(r.value())) else {
            return Vec::new();
        };
        let channel = room.lock().await;
        channel.members.iter().cloned().collect()
    }

    // ─── Connections ──────────────────────────────────────────────────

    /// Attach a transport for `user_id`, replacing any older one, and flush
    /// its queue in order.
    pub async fn connect(&self, user_id: &str, transport: Arc<dyn Transport>) -> Attachment {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mailbox = self.mailbox(user_id);
        let mut mailbox = mailbox.lock().await;
        if let Some(old) = mailbox.attached.replace(Attached { connection, transport }) {
            log::debug!(
                "Connection {connection} for {user_id} replaces connection {}",
                old.connection
            );
        }
        let flushed = self.flush(&mut mailbox, user_id).await;
        log::debug!("Transport {connection} connected for {user_id}, flushed {flushed} queued event(s)");
        Attachment { connection, flushed }
    }

    /// Detach `connection` if it is still the user's live transport; later
    /// events are queued. Returns false when a newer connection owns the
    /// slot, which is then left untouched.
    pub async fn disconnect(&self, user_id: &str, connection: ConnectionId) -> bool {
        let Some(mailbox) = self.existing_mailbox(user_id) else {
            return false;
        };
        let mut mailbox = mailbox.lock().await;
        let owned = mailbox
            .attached
            .as_ref()
            .is_some_and(|a| a.connection == connection);
        if owned {
            mailbox.attached = None;
            log::debug!("Transport {connection} disconnected for {user_id}");
        }
        owned
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        match self.existing_mailbox(user_id) {
            Some(mailbox) => mailbox.lock().await.attached.is_some(),
            None => false,
        }
    }

    // ─── Publishing ───────────────────────────────────────────────────

    /// Deliver `event` to every member of the room. Returns the envelope seq.
    pub async fn publish(&self, room_id: &str, event: SessionEvent) -> u64 {
        self.publish_filtered(room_id, None, event).await
    }

    /// Deliver `event` to every member except `excluded_user`.
    pub async fn publish_except(&self, room_id: &str, excluded_user: &str, event: SessionEvent) -> u64 {
        self.publish_filtered(room_id, Some(excluded_user), event).await
    }

    async fn publish_filtered(&self, room_id: &str, excluded: Option<&str>, event: SessionEvent) -> u64 {
        let room = self.room(room_id);
        let mut channel = room.lock().await;
        let seq = channel.next_seq;
        channel.next_seq += 1;

        let envelope = Arc::new(Envelope {
            room_id: room_id.to_string(),
            seq,
            timestamp: self.clock.now(),
            event,
        });
        let recipients: Vec<&UserId> = channel
            .members
            .iter()
            .filter(|m| Some(m.as_str()) != excluded)
            .collect();
        log::trace!(
            "Publishing {} #{seq} in room {room_id} to {} recipient(s)",
            envelope.event.event_type(),
            recipients.len()
        );
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        for user_id in recipients {
            let mailbox = self.mailbox(user_id);
            let mut mailbox = mailbox.lock().await;
            self.deliver(&mut mailbox, user_id, envelope.clone()).await;
        }
        seq
    }

    async fn deliver(&self, mailbox: &mut Mailbox, user_id: &str, envelope: Arc<Envelope>) {
        let attempts = match &mailbox.attached {
            Some(attached) if mailbox.queue.is_empty() => match attached.transport.send(&envelope) {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    log::warn!(
                        "Delivery of {} #{} to {user_id} failed: {e}",
                        envelope.event.event_type(),
                        envelope.seq
                    );
                    1
                }
            },
            _ => 0,
        };
        self.enqueue(mailbox, user_id, QueuedEvent { envelope, attempts }).await;
    }

    async fn enqueue(&self, mailbox: &mut Mailbox, user_id: &str, event: QueuedEvent) {
        mailbox.queue.push_back(event);
        self.stats.queued.fetch_add(1, Ordering::Relaxed);

        while mailbox.queue.len() > self.config.queue_capacity {
            if let Some(old) = mailbox.queue.pop_front() {
                self.record_drop(user_id, &old, DiagnosticReason::QueueOverflow).await;
            }
        }
    }

    /// Send queued events for one user in order, stopping at the first
    /// failure so later events never overtake earlier ones.
    async fn flush(&self, mailbox: &mut Mailbox, user_id: &str) -> usize {
        let Some(transport) = mailbox.attached.as_ref().map(|a| Arc::clone(&a.transport)) else {
            return 0;
        };

        let mut delivered = 0;
        let mut exhausted = Vec::new();
        while let Some(mut queued) = mailbox.queue.pop_front() {
            match transport.send(&queued.envelope) {
                Ok(()) => {
                    delivered += 1;
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    queued.attempts += 1;
                    log::warn!(
                        "Retry {} of #{} to {user_id} failed: {e}",
                        queued.attempts,
                        queued.envelope.seq
                    );
                    if queued.attempts >= self.config.max_delivery_attempts {
                        exhausted.push(queued);
                        continue;
                    }
                    mailbox.queue.push_front(queued);
                    break;
                }
            }
        }

        for dropped in exhausted {
            self.record_drop(user_id, &dropped, DiagnosticReason::AttemptsExhausted)
                .await;
        }
        delivered
    }

    /// Retry queued deliveries for every connected user.
    pub async fn retry_pending(&self) -> usize {
        let mailboxes: Vec<(UserId, Arc<Mutex<Mailbox>>)> = self
            .mailboxes
            .iter()
            .map(|m| (m.key().clone(), Arc::clone(m.value())))
            .collect();
        let mut delivered = 0;
        for (user_id, mailbox) in mailboxes {
            let mut mailbox = mailbox.lock().await;
            if mailbox.attached.is_some() && !mailbox.queue.is_empty() {
                delivered += self.flush(&mut mailbox, &user_id).await;
            }
        }
        delivered
    }

    async fn record_drop(&self, user_id: &str, event: &QueuedEvent, reason: DiagnosticReason) {
        log::warn!(
            "delivery_failed: dropped {} #{} in room {} for {user_id} after {} attempt(s) ({reason:?})",
            event.envelope.event.event_type(),
            event.envelope.seq,
            event.envelope.room_id,
            event.attempts
        );
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        let mut diagnostics = self.diagnostics.lock().await;
        diagnostics.push_back(DeliveryDiagnostic {
            user_id: user_id.to_string(),
            room_id: event.envelope.room_id.clone(),
            seq: event.envelope.seq,
            event_type: event.envelope.event.event_type(),
            attempts: event.attempts,
            reason,
            recorded_at: self.clock.now(),
        });
        while diagnostics.len() > self.config.diagnostics_capacity {
            diagnostics.pop_front();
        }
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub async fn queued_for(&self, user_id: &str) -> usize {
        match self.existing_mailbox(user_id) {
            Some(mailbox) => mailbox.lock().await.queue.len(),
            None => 0,
        }
    }

    pub async fn diagnostics(&self) -> Vec<DeliveryDiagnostic> {
        self.diagnostics.lock().await.iter().cloned().collect()
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            queued: self.stats.queued.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}
