//! Integration tests for the WebSocket front end.
//!
//! These tests start a real server and connect real clients, one speaking
//! JSON text frames and one speaking bincode binary frames.

use agora_collab::protocol::{decode_binary, decode_json, encode_binary, encode_json};
use agora_collab::{
    ClientMessage, ClientRequest, CollabConfig, CollabServer, Collaboration, EditOp, EditOutcome,
    LeaveReason, LogNotifier, MemoryDocuments, Reply, ReplyBody, RoomSettings, RoomType,
    ServerConfig, ServerMessage, SessionEvent, SystemClock,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy)]
enum Wire {
    Json,
    Binary,
}

/// Start a server on a free port, return the port and the core behind it.
async fn start_test_server() -> (u16, Arc<Collaboration>) {
    let core = Arc::new(Collaboration::new(
        CollabConfig::default(),
        Arc::new(SystemClock),
        Arc::new(MemoryDocuments::new()),
        Arc::new(LogNotifier),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = CollabServer::new(
        ServerConfig {
            bind_addr: format!("127.0.0.1:{port}"),
            ..ServerConfig::default()
        },
        core.clone(),
    );
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (port, core)
}

async fn send(ws: &mut Ws, wire: Wire, message: &ClientMessage) {
    let frame = match wire {
        Wire::Json => Message::Text(encode_json(message).unwrap().into()),
        Wire::Binary => Message::Binary(encode_binary(message).unwrap().into()),
    };
    ws.send(frame).await.unwrap();
}

async fn next_message(ws: &mut Ws) -> Option<ServerMessage> {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")?
            .ok()?;
        match frame {
            Message::Text(text) => return Some(decode_json(text.as_str()).unwrap()),
            Message::Binary(data) => return Some(decode_binary(&data).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Connect and complete the hello handshake.
async fn connect(port: u16, user: &str, wire: Wire) -> Ws {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    send(
        &mut ws,
        wire,
        &ClientMessage::Hello {
            user_id: user.to_string(),
        },
    )
    .await;
    match next_message(&mut ws).await {
        Some(ServerMessage::Welcome { user_id }) => assert_eq!(user_id, user),
        other => panic!("expected welcome, got {other:?}"),
    }
    ws
}

/// Send a request and wait for its response, collecting events seen on the
/// way.
async fn request(
    ws: &mut Ws,
    wire: Wire,
    request_id: u64,
    request: ClientRequest,
) -> (Reply, Vec<SessionEvent>) {
    send(ws, wire, &ClientMessage::Request { request_id, request }).await;
    let mut events = Vec::new();
    loop {
        match next_message(ws).await {
            Some(ServerMessage::Response { request_id: id, reply }) if id == request_id => {
                return (reply, events);
            }
            Some(ServerMessage::Event(envelope)) => events.push(envelope.event),
            Some(other) => panic!("unexpected message {other:?}"),
            None => panic!("connection closed while waiting for response {request_id}"),
        }
    }
}

/// Wait for the first pushed event matching `pred`, skipping others.
async fn wait_for(ws: &mut Ws, mut pred: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
    for _ in 0..16 {
        match next_message(ws).await {
            Some(ServerMessage::Event(envelope)) if pred(&envelope.event) => return envelope.event,
            Some(ServerMessage::Event(_)) => continue,
            other => panic!("expected event, got {other:?}"),
        }
    }
    panic!("no matching event");
}

#[tokio::test]
async fn test_json_and_binary_clients_collaborate() {
    let (port, core) = start_test_server().await;
    core.create_room("R1", RoomSettings::new().with_type(RoomType::Workspace))
        .await
        .unwrap();

    let mut alice = connect(port, "alice", Wire::Json).await;
    let (reply, _) = request(
        &mut alice,
        Wire::Json,
        1,
        ClientRequest::CreateSession {
            room_id: "R1".into(),
            resource_id: "notes".into(),
        },
    )
    .await;
    let Reply::Success(ReplyBody::SessionCreated { session_id, version: 0 }) = reply else {
        panic!("unexpected reply {reply:?}");
    };

    let mut bob = connect(port, "bob", Wire::Binary).await;
    let (reply, _) = request(
        &mut bob,
        Wire::Binary,
        1,
        ClientRequest::Join {
            room_id: "R1".into(),
            session_id: Some(session_id),
            permission: None,
        },
    )
    .await;
    assert!(matches!(reply, Reply::Success(ReplyBody::Joined(_))));

    wait_for(&mut alice, |e| {
        matches!(e, SessionEvent::UserJoined { user_id, session_id: Some(_), .. } if user_id == "bob")
    })
    .await;

    let (reply, _) = request(
        &mut alice,
        Wire::Json,
        2,
        ClientRequest::ApplyEdit {
            session_id,
            document_id: None,
            base_version: 0,
            op: EditOp::insert(0, "hello"),
        },
    )
    .await;
    assert!(matches!(
        reply,
        Reply::Success(ReplyBody::Edit(EditOutcome::Applied { version: 1, .. }))
    ));

    match wait_for(&mut bob, |e| matches!(e, SessionEvent::DocumentEdited { .. })).await {
        SessionEvent::DocumentEdited { change, .. } => {
            assert_eq!(change.author, "alice");
            assert_eq!(change.version, 1);
        }
        other => panic!("expected document_edited, got {other:?}"),
    }

    // Failures come back as codes, not dropped connections.
    let (reply, _) = request(
        &mut bob,
        Wire::Binary,
        2,
        ClientRequest::UnlockDocument {
            session_id,
            document_id: "elsewhere".into(),
        },
    )
    .await;
    assert!(matches!(reply, Reply::Failure { ref code, .. } if code == "not_found"));

    // Bob drops; Alice sees him go offline.
    bob.close(None).await.unwrap();
    let left = wait_for(&mut alice, |e| matches!(e, SessionEvent::UserLeft { .. })).await;
    assert_eq!(
        left,
        SessionEvent::UserLeft {
            session_id: None,
            user_id: "bob".into(),
            reason: LeaveReason::Disconnected,
        }
    );
}

#[tokio::test]
async fn test_request_before_hello_is_rejected() {
    let (port, _core) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    send(
        &mut ws,
        Wire::Json,
        &ClientMessage::Request {
            request_id: 1,
            request: ClientRequest::Heartbeat { room_id: None },
        },
    )
    .await;
    assert!(next_message(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_offline_events_delivered_on_connect() {
    let (port, core) = start_test_server().await;
    core.create_room("R1", RoomSettings::new().with_type(RoomType::Workspace))
        .await
        .unwrap();
    let session = core
        .create_session("R1", "doc", &["alice".to_string(), "bob".to_string()])
        .await
        .unwrap();
    core.apply_edit(session.session_id, "alice", None, 0, EditOp::insert(0, "queued"))
        .await
        .unwrap();

    let mut bob = connect(port, "bob", Wire::Binary).await;
    match wait_for(&mut bob, |e| matches!(e, SessionEvent::DocumentEdited { .. })).await {
        SessionEvent::DocumentEdited { change, .. } => assert_eq!(change.version, 1),
        other => panic!("expected document_edited, got {other:?}"),
    }
}
