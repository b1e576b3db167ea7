//! End-to-end scenarios against the in-process core.
//!
//! Clients are simulated with `ChannelTransport`s and time is driven by a
//! `ManualClock`.

use agora_collab::{
    ChannelTransport, CollabConfig, CollabError, Collaboration, DocumentContent,
    DocumentSnapshot, EditOp, EditOutcome, Envelope, JoinTarget, LogNotifier, ManualClock,
    MemoryDocuments, RoomSettings, RoomType, SessionEvent, UnlockReason,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Harness {
    core: Arc<Collaboration>,
    clock: ManualClock,
    documents: MemoryDocuments,
}

fn harness() -> Harness {
    let clock = ManualClock::new(1_700_000_000_000);
    let documents = MemoryDocuments::new();
    let core = Arc::new(Collaboration::new(
        CollabConfig::default(),
        Arc::new(clock.clone()),
        Arc::new(documents.clone()),
        Arc::new(LogNotifier),
    ));
    Harness { core, clock, documents }
}

async fn client(core: &Collaboration, user: &str) -> mpsc::Receiver<Envelope> {
    let (transport, rx) = ChannelTransport::new(256);
    core.connect(user, Arc::new(transport)).await;
    rx
}

fn drain(rx: &mut mpsc::Receiver<Envelope>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.event);
    }
    events
}

fn users(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

// ─── Scenario A: capacity ────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_room_full() {
    let h = harness();
    h.core
        .create_room("R1", RoomSettings::new().with_max_participants(2))
        .await
        .unwrap();

    h.core.join(JoinTarget::Room("R1".into()), "A", None).await.unwrap();
    h.core.join(JoinTarget::Room("R1".into()), "B", None).await.unwrap();
    let err = h
        .core
        .join(JoinTarget::Room("R1".into()), "C", None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CollabError::RoomFull {
            room_id: "R1".into(),
            max: 2
        }
    );

    let room = h.core.room_view("R1").await.unwrap();
    let members: Vec<&str> = room.members.iter().map(|m| m.user_id.as_str()).collect();
    assert_eq!(members, vec!["A", "B"]);
}

// ─── Scenario B: lock contention and expiry ──────────────────────────────────

#[tokio::test]
async fn scenario_b_lock_expires_after_duration() {
    let h = harness();
    h.core
        .create_room("R1", RoomSettings::new().with_type(RoomType::Workspace))
        .await
        .unwrap();
    let session = h
        .core
        .create_session("R1", "D1", &users(&["A", "B"]))
        .await
        .unwrap();
    let sid = session.session_id;

    let lock = h
        .core
        .lock_document(sid, "D1", "A", Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(lock.holder, "A");

    match h
        .core
        .lock_document(sid, "D1", "B", Duration::from_secs(300))
        .await
    {
        Err(CollabError::AlreadyLocked { holder, expires_at, .. }) => {
            assert_eq!(holder, "A");
            assert_eq!(expires_at, lock.expires_at);
        }
        other => panic!("expected AlreadyLocked, got {other:?}"),
    }

    h.clock.advance(Duration::from_secs(301));
    let lock = h
        .core
        .lock_document(sid, "D1", "B", Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(lock.holder, "B");
}

// ─── Scenario C: concurrent edits against the same base ──────────────────────

#[tokio::test]
async fn scenario_c_rebase_converges() {
    let h = harness();
    h.documents
        .insert("D", DocumentSnapshot::text("hello", 5))
        .await;
    h.core
        .create_room("R1", RoomSettings::new().with_type(RoomType::Workspace))
        .await
        .unwrap();
    let session = h
        .core
        .create_session("R1", "D", &users(&["A", "B"]))
        .await
        .unwrap();
    let sid = session.session_id;
    assert_eq!(session.version, 5);

    let mut rx_a = client(&h.core, "A").await;
    let mut rx_b = client(&h.core, "B").await;
    drain(&mut rx_a);
    drain(&mut rx_b);

    // Both edits were made against version 5; A reaches the sequencer first.
    let a = h
        .core
        .apply_edit(sid, "A", None, 5, EditOp::insert(5, " world"))
        .await
        .unwrap();
    let b = h
        .core
        .apply_edit(sid, "B", None, 5, EditOp::insert(0, ">> "))
        .await
        .unwrap();

    let EditOutcome::Applied { version: 6, op: a_op, .. } = a else {
        panic!("unexpected outcome for A: {a:?}");
    };
    let EditOutcome::Applied { version: 7, op: b_op, .. } = b else {
        panic!("unexpected outcome for B: {b:?}");
    };

    // Each replica applies its own op plus the other's broadcast change, in
    // version order.
    let remote_for_a: Vec<EditOp> = drain(&mut rx_a)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::DocumentEdited { change, .. } => Some(change.op),
            _ => None,
        })
        .collect();
    let remote_for_b: Vec<EditOp> = drain(&mut rx_b)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::DocumentEdited { change, .. } => Some(change.op),
            _ => None,
        })
        .collect();
    assert_eq!(remote_for_a, vec![b_op.clone()]);
    assert_eq!(remote_for_b, vec![a_op.clone()]);

    let mut replica_a = DocumentContent::Text("hello".into());
    replica_a.apply(&a_op).unwrap();
    replica_a.apply(&remote_for_a[0]).unwrap();

    let mut replica_b = DocumentContent::Text("hello".into());
    replica_b.apply(&remote_for_b[0]).unwrap();
    replica_b.apply(&b_op).unwrap();

    let server = h.core.session_view(sid).await.unwrap();
    assert_eq!(server.version, 7);
    assert_eq!(server.content.as_text(), Some(">> hello world"));
    assert_eq!(replica_a, server.content);
    assert_eq!(replica_b, server.content);
}

// ─── Scenario D: heartbeat timeout releases locks ────────────────────────────

#[tokio::test]
async fn scenario_d_disconnect_releases_lock() {
    let h = harness();
    h.core
        .create_room("R1", RoomSettings::new().with_type(RoomType::Workspace))
        .await
        .unwrap();
    let session = h
        .core
        .create_session("R1", "D2", &users(&["A", "B"]))
        .await
        .unwrap();
    let sid = session.session_id;

    h.core
        .lock_document(sid, "D2", "A", Duration::from_secs(300))
        .await
        .unwrap();
    let mut rx_b = client(&h.core, "B").await;
    drain(&mut rx_b);

    // A stops sending heartbeats; B keeps going.
    h.clock.advance(Duration::from_secs(45));
    h.core.heartbeat("B", Some("R1")).await.unwrap();
    h.clock.advance(Duration::from_secs(16));
    h.core.heartbeat("B", Some("R1")).await.unwrap();

    let report = h.core.sweep().await;
    assert_eq!(report.timed_out, vec![("R1".to_string(), "A".to_string())]);

    let events = drain(&mut rx_b);
    let unlocked: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::DocumentUnlocked {
                document_id,
                holder,
                reason,
                ..
            } => Some((document_id.as_str(), holder.as_str(), *reason)),
            _ => None,
        })
        .collect();
    assert_eq!(unlocked, vec![("D2", "A", UnlockReason::Disconnect)]);

    // B can take the lock immediately.
    h.core
        .lock_document(sid, "D2", "B", Duration::from_secs(60))
        .await
        .unwrap();
    let view = h.core.session_view(sid).await.unwrap();
    assert!(view.participants.iter().any(|p| p.user_id == "A"));
}
