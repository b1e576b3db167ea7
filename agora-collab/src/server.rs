//! WebSocket front end for the collaboration core.
//!
//! ```text
//! Client A ──┐   Hello / Request frames    ┌──────────────┐
//!            ├───────────────────────────► │ CollabServer │ ── Collaboration
//! Client B ──┘ ◄─ Response / Event frames  └──────┬───────┘        │
//!                                                 │                │ publish
//!                          ChannelTransport ◄─────┴──── BroadcastGateway
//! ```
//!
//! Each connection registers a [`ChannelTransport`] with the gateway after
//! the `Hello` handshake. The connection task multiplexes inbound requests
//! and outbound events with `tokio::select!`. Binary frames carry bincode,
//! text frames carry JSON; a reply uses the encoding of its request and
//! pushed events use the encoding of the handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::broadcast::ChannelTransport;
use crate::error::CollabResult;
use crate::facade::{Collaboration, JoinTarget};
use crate::model::UserId;
use crate::protocol::{
    decode_binary, decode_json, encode_binary, encode_json, ClientMessage, ClientRequest,
    Encoding, Envelope, ProtocolError, Reply, ReplyBody, ServerMessage,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Events buffered per connection before delivery falls back to the
    /// gateway's offline queue
    pub outbound_buffer: usize,
    /// Time allowed for the `Hello` frame
    pub handshake_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_buffer: 256,
            handshake_timeout_secs: 10,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_bytes: u64,
}

pub struct CollabServer {
    config: ServerConfig,
    core: Arc<Collaboration>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig, core: Arc<Collaboration>) -> Self {
        Self {
            config,
            core,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let core = self.core.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, core, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        core: Arc<Collaboration>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Handshake: the first data frame must be Hello.
        let handshake = tokio::time::timeout(
            Duration::from_secs(config.handshake_timeout_secs),
            read_hello(&mut ws_receiver),
        )
        .await;

        let (user_id, session_encoding) = match handshake {
            Ok(Ok(hello)) => hello,
            Ok(Err(e)) => {
                stats.write().await.active_connections -= 1;
                log::warn!("Handshake with {addr} failed: {e}");
                return Ok(());
            }
            Err(_) => {
                stats.write().await.active_connections -= 1;
                log::warn!("Handshake with {addr} timed out");
                return Ok(());
            }
        };

        let welcome = ServerMessage::Welcome {
            user_id: user_id.clone(),
        };
        ws_sender.send(encode_frame(&welcome, session_encoding)?).await?;

        let (transport, mut events) = ChannelTransport::new(config.outbound_buffer);
        let attachment = core.connect(&user_id, Arc::new(transport)).await;
        log::info!(
            "{user_id} connected from {addr} ({} queued event(s) flushed)",
            attachment.flushed
        );

        let result = Self::connection_loop(
            &mut ws_sender,
            &mut ws_receiver,
            &mut events,
            &core,
            &stats,
            &user_id,
            session_encoding,
        )
        .await;

        // Cleanup: detach this transport and, unless a newer connection
        // took over, mark the user offline.
        core.disconnect(&user_id, attachment.connection).await;
        stats.write().await.active_connections -= 1;
        log::info!("{user_id} disconnected from {addr}");
        result
    }

    async fn connection_loop<S, R>(
        ws_sender: &mut S,
        ws_receiver: &mut R,
        events: &mut mpsc::Receiver<Envelope>,
        core: &Collaboration,
        stats: &RwLock<ServerStats>,
        user_id: &str,
        session_encoding: Encoding,
    ) -> Result<(), BoxError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            tokio::select! {
                // Incoming WebSocket frame
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed by {user_id}");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(frame)) => {
                            let size = frame.len() as u64;
                            match decode_frame(frame) {
                                Some(Ok((ClientMessage::Request { request_id, request }, encoding))) => {
                                    let reply = handle_request(core, user_id, request).await;
                                    {
                                        let mut s = stats.write().await;
                                        s.total_requests += 1;
                                        s.total_bytes += size;
                                        if matches!(reply, Reply::Failure { .. }) {
                                            s.failed_requests += 1;
                                        }
                                    }
                                    let response = ServerMessage::Response { request_id, reply };
                                    ws_sender.send(encode_frame(&response, encoding)?).await?;
                                }
                                Some(Ok((ClientMessage::Hello { .. }, _))) => {
                                    log::warn!("Ignoring repeated hello from {user_id}");
                                }
                                Some(Err(e)) => {
                                    log::warn!("Failed to decode frame from {user_id}: {e}");
                                }
                                None => {}
                            }
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error for {user_id}: {e}");
                            break;
                        }
                    }
                }

                // Outgoing event
                envelope = events.recv() => {
                    match envelope {
                        Some(envelope) => {
                            let frame = encode_frame(&ServerMessage::Event(envelope), session_encoding)?;
                            ws_sender.send(frame).await?;
                        }
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn core(&self) -> &Arc<Collaboration> {
        &self.core
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn read_hello<R>(ws_receiver: &mut R) -> Result<(UserId, Encoding), BoxError>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = ws_receiver.next().await {
        match decode_frame(frame?) {
            Some(Ok((ClientMessage::Hello { user_id }, encoding))) => return Ok((user_id, encoding)),
            Some(Ok((ClientMessage::Request { .. }, _))) => {
                return Err(ProtocolError::Handshake("expected hello".to_string()).into());
            }
            Some(Err(e)) => return Err(e.into()),
            None => {}
        }
    }
    Err(ProtocolError::ConnectionClosed.into())
}

/// Execute one client request on behalf of `user_id`.
pub async fn handle_request(core: &Collaboration, user_id: &str, request: ClientRequest) -> Reply {
    match execute(core, user_id, request).await {
        Ok(body) => Reply::Success(body),
        Err(e) => {
            log::debug!("Request from {user_id} failed: {e}");
            Reply::Failure {
                code: e.code().to_string(),
                message: e.to_string(),
            }
        }
    }
}

async fn execute(core: &Collaboration, user_id: &str, request: ClientRequest) -> CollabResult<ReplyBody> {
    match request {
        ClientRequest::Join {
            room_id,
            session_id,
            permission,
        } => {
            let target = match session_id {
                Some(session_id) => JoinTarget::Session(session_id),
                None => JoinTarget::Room(room_id),
            };
            Ok(ReplyBody::Joined(core.join(target, user_id, permission).await?))
        }
        ClientRequest::Leave { room_id, session_id } => {
            match session_id {
                Some(session_id) => core.leave(session_id, user_id).await?,
                None => core.leave_room(&room_id, user_id).await?,
            }
            Ok(ReplyBody::Done)
        }
        ClientRequest::CreateSession { room_id, resource_id } => {
            let view = core
                .create_session(&room_id, &resource_id, &[user_id.to_string()])
                .await?;
            Ok(ReplyBody::SessionCreated {
                session_id: view.session_id,
                version: view.version,
            })
        }
        ClientRequest::SendMessage {
            room_id,
            session_id,
            body,
            metadata,
        } => {
            let message = core
                .send_message(&room_id, session_id, user_id, body, metadata)
                .await?;
            Ok(ReplyBody::MessageSent(message))
        }
        ClientRequest::ApplyEdit {
            session_id,
            document_id,
            base_version,
            op,
        } => {
            let outcome = core
                .apply_edit(session_id, user_id, document_id.as_deref(), base_version, op)
                .await?;
            Ok(ReplyBody::Edit(outcome))
        }
        ClientRequest::LockDocument {
            session_id,
            document_id,
            duration_secs,
        } => {
            let lock = core
                .lock_document(session_id, &document_id, user_id, Duration::from_secs(duration_secs))
                .await?;
            Ok(ReplyBody::Locked(lock))
        }
        ClientRequest::UnlockDocument {
            session_id,
            document_id,
        } => {
            core.unlock_document(session_id, &document_id, user_id).await?;
            Ok(ReplyBody::Done)
        }
        ClientRequest::AddComment {
            session_id,
            document_id,
            body,
            anchor,
        } => {
            let comment = core
                .add_comment(session_id, user_id, &document_id, body, anchor)
                .await?;
            Ok(ReplyBody::CommentAdded(comment))
        }
        ClientRequest::ResolveConflict {
            session_id,
            conflict_id,
            choice,
        } => {
            core.resolve_conflict(session_id, conflict_id, user_id, choice)
                .await?;
            Ok(ReplyBody::Done)
        }
        ClientRequest::Heartbeat { room_id } => {
            core.heartbeat(user_id, room_id.as_deref()).await?;
            Ok(ReplyBody::Done)
        }
        ClientRequest::Presence { room_id } => {
            Ok(ReplyBody::Presence(core.presence_snapshot(&room_id).await?))
        }
    }
}

/// Decode a data frame. Control frames yield `None`.
fn decode_frame(frame: Message) -> Option<Result<(ClientMessage, Encoding), ProtocolError>> {
    match frame {
        Message::Binary(data) => Some(decode_binary(&data).map(|m| (m, Encoding::Binary))),
        Message::Text(text) => Some(decode_json(text.as_str()).map(|m| (m, Encoding::Json))),
        _ => None,
    }
}

fn encode_frame(message: &ServerMessage, encoding: Encoding) -> Result<Message, ProtocolError> {
    match encoding {
        Encoding::Binary => Ok(Message::Binary(encode_binary(message)?.into())),
        Encoding::Json => Ok(Message::Text(encode_json(message)?.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::{LogNotifier, MemoryDocuments};
    use crate::config::CollabConfig;
    use crate::model::{EditOp, EditOutcome, RoomSettings, RoomType};
    use std::collections::BTreeMap;

    fn core() -> Arc<Collaboration> {
        Arc::new(Collaboration::new(
            CollabConfig::default(),
            Arc::new(ManualClock::new(0)),
            Arc::new(MemoryDocuments::new()),
            Arc::new(LogNotifier),
        ))
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbound_buffer, 256);
        assert_eq!(config.handshake_timeout_secs, 10);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = CollabServer::new(ServerConfig::default(), core());
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn test_frame_encoding_follows_request() {
        let hello = ClientMessage::Hello { user_id: "a".into() };
        let binary = Message::Binary(encode_binary(&hello).unwrap().into());
        let text = Message::Text(encode_json(&hello).unwrap().into());
        assert_eq!(decode_frame(binary).unwrap().unwrap().1, Encoding::Binary);
        assert_eq!(decode_frame(text).unwrap().unwrap().1, Encoding::Json);
        assert!(decode_frame(Message::Ping(Vec::new().into())).is_none());
        assert!(decode_frame(Message::Text("{nope".to_string().into())).unwrap().is_err());

        let welcome = ServerMessage::Welcome { user_id: "a".into() };
        assert!(matches!(encode_frame(&welcome, Encoding::Json).unwrap(), Message::Text(_)));
        assert!(matches!(encode_frame(&welcome, Encoding::Binary).unwrap(), Message::Binary(_)));
    }

    #[tokio::test]
    async fn test_handle_request_flow() {
        let core = core();
        core.create_room("R1", RoomSettings::new().with_type(RoomType::Workspace))
            .await
            .unwrap();

        let reply = handle_request(
            &core,
            "a",
            ClientRequest::CreateSession {
                room_id: "R1".into(),
                resource_id: "doc".into(),
            },
        )
        .await;
        let Reply::Success(ReplyBody::SessionCreated { session_id, version }) = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!(version, 0);

        let reply = handle_request(
            &core,
            "a",
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

        let reply = handle_request(
            &core,
            "a",
            ClientRequest::SendMessage {
                room_id: "R1".into(),
                session_id: Some(session_id),
                body: "done".into(),
                metadata: BTreeMap::new(),
            },
        )
        .await;
        assert!(matches!(reply, Reply::Success(ReplyBody::MessageSent(_))));
    }

    #[tokio::test]
    async fn test_handle_request_failure_codes() {
        let core = core();
        let reply = handle_request(
            &core,
            "a",
            ClientRequest::Join {
                room_id: "missing".into(),
                session_id: None,
                permission: None,
            },
        )
        .await;
        match reply {
            Reply::Failure { code, .. } => assert_eq!(code, "not_found"),
            other => panic!("unexpected reply {other:?}"),
        }

        core.create_room("R1", RoomSettings::new().with_max_participants(1))
            .await
            .unwrap();
        handle_request(
            &core,
            "a",
            ClientRequest::Join {
                room_id: "R1".into(),
                session_id: None,
                permission: None,
            },
        )
        .await;
        let reply = handle_request(
            &core,
            "b",
            ClientRequest::Join {
                room_id: "R1".into(),
                session_id: None,
                permission: None,
            },
        )
        .await;
        assert!(matches!(reply, Reply::Failure { ref code, .. } if code == "room_full"));
    }
}
