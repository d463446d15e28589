use crate::common::models::{Caller, ChatMessageRequest, ChatMessageResponse, MessageType, Page, ParticipantStatus, UserId};
use crate::server::error::ChatError;
use crate::server::hub::{ClientId, SessionHub};
use crate::server::presence::{PresenceOracle, PRESENCE_HEARTBEAT};
use crate::server::relay::ChatRelay;
use crate::server::rooms::RoomDirectory;
use crate::server::users::UserDirectory;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

const JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame of every connection. Identity is trusted; authentication happens upstream.
    Join { room_id: String, email: String },
    Send { message_type: MessageType, body: String },
    History { #[serde(default)] page: u32 },
}

/// Frames the gateway answers with. Room traffic itself is forwarded as the
/// raw broker payload (`ChatMessageResponse` JSON).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Joined { room_id: String, client_id: String },
    /// The session's QUIT went through; the gateway closes the connection after it.
    Left { room_id: String },
    History { page: Page<ChatMessageResponse> },
    Error { code: u32, message: String },
}

impl ServerFrame {
    fn error(err: &ChatError) -> Self {
        ServerFrame::Error { code: err.code(), message: err.to_string() }
    }

    fn to_text(&self) -> String {
        // plain enums of strings and numbers
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct GatewaySession {
    pub room_id: String,
    pub user_id: UserId,
    pub caller: Caller,
    pub client_id: ClientId,
}

/// Accepts client sessions, feeds their messages to the relay and streams
/// room traffic back from the local hub.
pub struct ChatGateway {
    relay: Arc<ChatRelay>,
    users: Arc<dyn UserDirectory>,
    rooms: Arc<dyn RoomDirectory>,
    presence: Arc<dyn PresenceOracle>,
    hub: SessionHub,
}

impl ChatGateway {
    pub fn new(
        relay: Arc<ChatRelay>,
        users: Arc<dyn UserDirectory>,
        rooms: Arc<dyn RoomDirectory>,
        presence: Arc<dyn PresenceOracle>,
        hub: SessionHub,
    ) -> Self {
        Self { relay, users, rooms, presence, hub }
    }

    /// Register a session for a joined participant of the room.
    pub async fn join(&self, room_id: &str, email: &str) -> Result<(GatewaySession, mpsc::UnboundedReceiver<String>), ChatError> {
        let user = self
            .users
            .find_by_email(email)
            .await?
            .ok_or_else(|| ChatError::user_not_found(email))?;
        let room = self
            .rooms
            .find_room(room_id)
            .await?
            .ok_or_else(|| ChatError::room_not_found(room_id))?;
        let participant = self
            .rooms
            .find_participant(user.id, &room.room_id)
            .await?
            .filter(|p| p.status == ParticipantStatus::Joined)
            .ok_or_else(|| ChatError::participant_not_found(room_id, email))?;

        let (client_id, receiver) = self.hub.register(&room.room_id, participant.user_id).await?;
        if let Err(e) = self.presence.enter(&room.room_id, user.id).await {
            self.hub.unregister(&room.room_id, &client_id).await;
            return Err(e);
        }

        let session = GatewaySession {
            room_id: room.room_id,
            user_id: user.id,
            caller: Caller::user(email),
            client_id,
        };
        Ok((session, receiver))
    }

    pub async fn leave(&self, session: &GatewaySession) {
        self.hub.unregister(&session.room_id, &session.client_id).await;
        if let Err(e) = self.presence.leave(&session.room_id, session.user_id).await {
            warn!("[WS] Presence leave failed for user {} in {}: {}", session.user_id, session.room_id, e);
        }
    }

    /// Handle one text frame from a joined session; returns the reply, if any.
    pub async fn handle_frame(&self, session: &GatewaySession, text: &str) -> Option<ServerFrame> {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => return Some(ServerFrame::error(&ChatError::invalid_message(format!("bad frame: {}", e)))),
        };

        match frame {
            ClientFrame::Join { .. } => Some(ServerFrame::error(&ChatError::invalid_message("session already joined"))),
            ClientFrame::Send { message_type, body } => {
                let quit = message_type == MessageType::Quit;
                let request = ChatMessageRequest { room_id: session.room_id.clone(), message_type, body };
                match self.relay.send(request, &session.caller).await {
                    Ok(_) if quit => Some(ServerFrame::Left { room_id: session.room_id.clone() }),
                    // the sender gets its own message back through the room topic
                    Ok(_) => None,
                    Err(e) if quit && e.is_persisted() => {
                        warn!("[WS] Quit of {} stored but not broadcast: {}", session.client_id, e);
                        Some(ServerFrame::Left { room_id: session.room_id.clone() })
                    }
                    Err(e) => Some(ServerFrame::error(&e)),
                }
            }
            ClientFrame::History { page } => {
                match self.relay.get_saved_messages(&session.room_id, &session.caller, page).await {
                    Ok(page) => Some(ServerFrame::History { page }),
                    Err(e) => Some(ServerFrame::error(&e)),
                }
            }
        }
    }

    pub async fn handle_connection<S>(&self, ws_stream: WebSocketStream<S>) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let deadline = tokio::time::Instant::now() + JOIN_TIMEOUT;
        let first = loop {
            match tokio::time::timeout_at(deadline, ws_receiver.next()).await {
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)))) => continue,
                other => break other,
            }
        };
        let (room_id, email) = match first {
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => {
                info!("[WS] Connection closed before join");
                return Ok(());
            }
            Ok(Some(Ok(message))) => {
                let join = match &message {
                    Message::Text(text) => serde_json::from_str::<ClientFrame>(text).ok(),
                    _ => None,
                };
                match join {
                    Some(ClientFrame::Join { room_id, email }) => (room_id, email),
                    _ => {
                        let reply = ServerFrame::error(&ChatError::invalid_message("expected a join frame"));
                        let _ = ws_sender.send(Message::Text(reply.to_text())).await;
                        return Err(anyhow::anyhow!("Invalid join frame"));
                    }
                }
            }
            Err(_) => {
                let reply = ServerFrame::error(&ChatError::invalid_message("join timeout"));
                let _ = ws_sender.send(Message::Text(reply.to_text())).await;
                return Err(anyhow::anyhow!("Join timeout"));
            }
        };

        let (session, mut room_rx) = match self.join(&room_id, &email).await {
            Ok(joined) => joined,
            Err(e) => {
                warn!("[WS] Join refused for {} in room {}: {}", email, room_id, e);
                let _ = ws_sender.send(Message::Text(ServerFrame::error(&e).to_text())).await;
                let _ = ws_sender.close().await;
                return Ok(());
            }
        };
        info!("[WS] {} joined room {} as {}", email, session.room_id, session.client_id);

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
        let _ = reply_tx.send(ServerFrame::Joined { room_id: session.room_id.clone(), client_id: session.client_id.clone() }.to_text());
        if let Some(history) = self.handle_frame(&session, r#"{"type":"history","page":0}"#).await {
            let _ = reply_tx.send(history.to_text());
        }

        // Task per inviare frame al client
        let mut send_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    Some(frame) = reply_rx.recv() => frame,
                    Some(frame) = room_rx.recv() => frame,
                    else => break,
                };
                if ws_sender.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        let mut heartbeat = tokio::time::interval(PRESENCE_HEARTBEAT);
        let mut send_finished = false;
        loop {
            tokio::select! {
                _ = &mut send_task => {
                    send_finished = true;
                    break;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.presence.refresh(&session.room_id).await {
                        warn!("[WS] Presence refresh failed for room {}: {}", session.room_id, e);
                    }
                }
                message = ws_receiver.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = self.handle_frame(&session, &text).await {
                            let left = matches!(reply, ServerFrame::Left { .. });
                            let _ = reply_tx.send(reply.to_text());
                            if left {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }

        // closes the room channel; the writer drains what is queued, then stops
        self.leave(&session).await;
        drop(reply_tx);
        if !send_finished && tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
            send_task.abort();
        }
        info!("[WS] {} left room {}", email, session.room_id);
        Ok(())
    }
}

pub async fn serve(addr: &str, gateway: Arc<ChatGateway>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("[WS] WebSocket gateway listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("[WS] New connection from {}", peer);
        let gateway = gateway.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws_stream) => {
                    if let Err(e) = gateway.handle_connection(ws_stream).await {
                        error!("[WS] Error handling connection from {}: {}", peer, e);
                    }
                }
                Err(e) => error!("[WS] Handshake with {} failed: {}", peer, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::RoomType;
    use crate::server::broker::LocalPublisher;
    use crate::server::config::ServerConfig;
    use crate::server::database::Database;
    use crate::server::presence::PresenceRegistry;

    struct Setup {
        db: Arc<Database>,
        presence: Arc<PresenceRegistry>,
        hub: SessionHub,
        gateway: Arc<ChatGateway>,
        room_id: String,
    }

    async fn setup() -> Setup {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let alice = db.register_user("alice@example.com", "alice").await.unwrap();
        let bob = db.register_user("bob@example.com", "bob").await.unwrap();
        db.register_user("eve@example.com", "eve").await.unwrap();
        let room = db.create_room(RoomType::Group, alice.id).await.unwrap();
        db.join_room(&room.room_id, bob.id).await.unwrap();

        let hub = SessionHub::new(16);
        let presence = Arc::new(PresenceRegistry::new());
        let relay = Arc::new(ChatRelay::new(
            db.clone(),
            db.clone(),
            db.clone(),
            presence.clone(),
            Arc::new(LocalPublisher::new(hub.clone())),
            &ServerConfig::default(),
        ));
        let gateway = Arc::new(ChatGateway::new(relay, db.clone(), db.clone(), presence.clone(), hub.clone()));
        Setup { db, presence, hub, gateway, room_id: room.room_id }
    }

    #[test]
    fn client_frames_are_tagged() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"send","message_type":"TALK","body":"hi"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Send { message_type: MessageType::Talk, body: "hi".into() });
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"history"}"#).unwrap();
        assert_eq!(frame, ClientFrame::History { page: 0 });
    }

    #[tokio::test]
    async fn join_tracks_presence_and_hub() {
        let s = setup().await;
        let (session, _rx) = s.gateway.join(&s.room_id, "bob@example.com").await.unwrap();

        assert_eq!(s.presence.active_count(&s.room_id).await.unwrap(), 1);
        assert_eq!(s.hub.session_count(&s.room_id).await, 1);

        s.gateway.leave(&session).await;
        assert_eq!(s.presence.active_count(&s.room_id).await.unwrap(), 0);
        assert_eq!(s.hub.session_count(&s.room_id).await, 0);
    }

    #[tokio::test]
    async fn non_participants_cannot_join() {
        let s = setup().await;
        let err = s.gateway.join(&s.room_id, "eve@example.com").await.unwrap_err();
        assert!(matches!(err, ChatError::ParticipantNotFound { .. }));

        let bob = s.db.find_by_email("bob@example.com").await.unwrap().unwrap();
        s.db.leave_room(&s.room_id, bob.id).await.unwrap();
        let err = s.gateway.join(&s.room_id, "bob@example.com").await.unwrap_err();
        assert!(matches!(err, ChatError::ParticipantNotFound { .. }));
        assert_eq!(s.hub.session_count(&s.room_id).await, 0);
    }

    #[tokio::test]
    async fn sent_messages_fan_out_to_room_sessions() {
        let s = setup().await;
        let (alice, mut alice_rx) = s.gateway.join(&s.room_id, "alice@example.com").await.unwrap();
        let (_bob, mut bob_rx) = s.gateway.join(&s.room_id, "bob@example.com").await.unwrap();

        let reply = s.gateway.handle_frame(&alice, r#"{"type":"send","message_type":"TALK","body":"hello bob"}"#).await;
        assert_eq!(reply, None);

        for rx in [&mut alice_rx, &mut bob_rx] {
            let frame = rx.recv().await.unwrap();
            let message: ChatMessageResponse = serde_json::from_str(&frame).unwrap();
            assert_eq!(message.body, "hello bob");
            assert_eq!(message.sender, "alice");
            // both participants connected
            assert_eq!(message.unread_count, 0);
        }
    }

    #[tokio::test]
    async fn bad_frames_get_error_replies() {
        let s = setup().await;
        let (alice, _rx) = s.gateway.join(&s.room_id, "alice@example.com").await.unwrap();

        match s.gateway.handle_frame(&alice, "not json").await {
            Some(ServerFrame::Error { code, .. }) => assert_eq!(code, ChatError::invalid_message("").code()),
            other => panic!("unexpected reply {:?}", other),
        }
        let join_again = format!(r#"{{"type":"join","room_id":"{}","email":"alice@example.com"}}"#, s.room_id);
        assert!(matches!(s.gateway.handle_frame(&alice, &join_again).await, Some(ServerFrame::Error { .. })));
    }

    #[tokio::test]
    async fn history_frame_returns_a_page() {
        let s = setup().await;
        let (alice, _rx) = s.gateway.join(&s.room_id, "alice@example.com").await.unwrap();
        s.gateway.handle_frame(&alice, r#"{"type":"send","message_type":"TALK","body":"one"}"#).await;

        match s.gateway.handle_frame(&alice, r#"{"type":"history","page":0}"#).await {
            Some(ServerFrame::History { page }) => {
                assert_eq!(page.content.len(), 1);
                assert_eq!(page.content[0].body, "one");
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn quit_frame_leaves_the_room_for_good() {
        let s = setup().await;
        let (bob, _bob_rx) = s.gateway.join(&s.room_id, "bob@example.com").await.unwrap();

        let reply = s.gateway.handle_frame(&bob, r#"{"type":"send","message_type":"QUIT","body":""}"#).await;
        assert_eq!(reply, Some(ServerFrame::Left { room_id: s.room_id.clone() }));
        s.gateway.leave(&bob).await;

        let participant = s.db.find_participant(bob.user_id, &s.room_id).await.unwrap().unwrap();
        assert_eq!(participant.status, ParticipantStatus::Left);

        let room = s.db.find_room(&s.room_id).await.unwrap().unwrap();
        assert_eq!(room.roster_size(), 1);

        let err = s.gateway.join(&s.room_id, "bob@example.com").await.unwrap_err();
        assert!(matches!(err, ChatError::ParticipantNotFound { .. }));
    }

    async fn next_text<S>(ws: &mut WebSocketStream<S>) -> String
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn websocket_session_end_to_end() {
        use tokio_tungstenite::tungstenite::protocol::Role;

        let s = setup().await;
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let gateway = s.gateway.clone();
        let server = tokio::spawn(async move { gateway.handle_connection(server_ws).await });

        let join = format!(r#"{{"type":"join","room_id":"{}","email":"bob@example.com"}}"#, s.room_id);
        client_ws.send(Message::Text(join)).await.unwrap();

        let joined: ServerFrame = serde_json::from_str(&next_text(&mut client_ws).await).unwrap();
        assert!(matches!(joined, ServerFrame::Joined { .. }));
        let history: ServerFrame = serde_json::from_str(&next_text(&mut client_ws).await).unwrap();
        assert!(matches!(history, ServerFrame::History { .. }));

        client_ws
            .send(Message::Text(r#"{"type":"send","message_type":"TALK","body":"over the wire"}"#.to_string()))
            .await
            .unwrap();
        let message: ChatMessageResponse = serde_json::from_str(&next_text(&mut client_ws).await).unwrap();
        assert_eq!(message.body, "over the wire");
        assert_eq!(message.sender, "bob");

        client_ws.close(None).await.unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(s.presence.active_count(&s.room_id).await.unwrap(), 0);
        assert_eq!(s.hub.session_count(&s.room_id).await, 0);
    }

    #[tokio::test]
    async fn ping_before_join_then_quit_over_the_wire() {
        use tokio_tungstenite::tungstenite::protocol::Role;

        let s = setup().await;
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let gateway = s.gateway.clone();
        let server = tokio::spawn(async move { gateway.handle_connection(server_ws).await });

        client_ws.send(Message::Ping(b"hi".to_vec())).await.unwrap();
        let join = format!(r#"{{"type":"join","room_id":"{}","email":"bob@example.com"}}"#, s.room_id);
        client_ws.send(Message::Text(join)).await.unwrap();

        let joined: ServerFrame = serde_json::from_str(&next_text(&mut client_ws).await).unwrap();
        assert!(matches!(joined, ServerFrame::Joined { .. }));
        let history: ServerFrame = serde_json::from_str(&next_text(&mut client_ws).await).unwrap();
        assert!(matches!(history, ServerFrame::History { .. }));

        client_ws
            .send(Message::Text(r#"{"type":"send","message_type":"QUIT","body":""}"#.to_string()))
            .await
            .unwrap();
        // the notice and the left frame travel on separate queues
        let frames = [next_text(&mut client_ws).await, next_text(&mut client_ws).await];
        assert!(frames.iter().any(|f| serde_json::from_str::<ServerFrame>(f).ok()
            == Some(ServerFrame::Left { room_id: s.room_id.clone() })));
        let notice = frames
            .iter()
            .find_map(|f| serde_json::from_str::<ChatMessageResponse>(f).ok())
            .unwrap();
        assert_eq!(notice.body, "bob left the chat.");

        server.await.unwrap().unwrap();
        assert_eq!(s.presence.active_count(&s.room_id).await.unwrap(), 0);
        assert_eq!(s.hub.session_count(&s.room_id).await, 0);
        let bob = s.db.find_by_email("bob@example.com").await.unwrap().unwrap();
        let participant = s.db.find_participant(bob.id, &s.room_id).await.unwrap().unwrap();
        assert_eq!(participant.status, ParticipantStatus::Left);
    }
}
