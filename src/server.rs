use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::generation::Generator;
use crate::hub::{ConnectionRegistry, RoomBroadcastHub};
use crate::messages::{ClientMessage, ServerMessage};
use crate::router::{HandlerRegistry, RouterContext, Routers, SendMessage, REQUEST_NEXT_MESSAGE, SEND_MESSAGE};
use crate::store::RoomStore;

#[derive(Clone)]
pub struct Server {
    registry: Arc<ConnectionRegistry>,
    hub: Arc<RoomBroadcastHub>,
    store: Arc<dyn RoomStore>,
    routers: Routers,
    handlers: Arc<HandlerRegistry>,
}

impl Server {
    /// Builds a running server: the connection registry is started and
    /// attached to the hub.
    pub fn new(store: Arc<dyn RoomStore>, generator: Arc<dyn Generator>, history_window: usize) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.start();
        let hub = Arc::new(RoomBroadcastHub::with_delivery(registry.clone()));
        let routers = Routers::new(RouterContext {
            store: store.clone(),
            hub: hub.clone(),
            generator,
            history_window,
        });
        Server {
            registry,
            hub,
            store,
            routers,
            handlers: Arc::new(HandlerRegistry::new()),
        }
    }

    pub fn hub(&self) -> &Arc<RoomBroadcastHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    pub fn routers(&self) -> &Routers {
        &self.routers
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Drops a connection's outbound queue, which closes its socket.
    /// Membership is cleaned up when the read side ends.
    pub fn disconnect(&self, conn_id: &str) -> bool {
        let found = self.registry.unregister(conn_id);
        if found {
            info!("Forcing disconnect of {}", conn_id);
        }
        found
    }

    pub fn shutdown(&self) {
        self.registry.stop();
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let conn_id = Uuid::new_v4().to_string();
        let (mut ws_tx, mut ws_rx) = ws.split();

        let Some(mut rx) = self.registry.register(&conn_id) else {
            let _ = ws_tx.close().await;
            return;
        };
        info!("Connection {} opened", conn_id);

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = ws_tx.send(Message::text(frame)).await {
                    warn!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let server = self.clone();
        tokio::spawn(async move {
            while let Some(result) = ws_rx.next().await {
                match result {
                    Ok(msg) if msg.is_close() => break,
                    Ok(msg) => {
                        let Ok(text) = msg.to_str() else {
                            continue;
                        };
                        match serde_json::from_str::<ClientMessage>(text) {
                            Ok(client_msg) => server.handle_client_message(&conn_id, client_msg).await,
                            Err(e) => {
                                debug!("Unreadable frame from {}: {}", conn_id, e);
                                server.hub.send_to(&conn_id, &ServerMessage::error("malformed event"));
                            }
                        }
                    }
                    Err(e) => {
                        error!("WebSocket error on {}: {}", conn_id, e);
                        break;
                    }
                }
            }

            server.handle_disconnect(&conn_id).await;
        });
    }

    async fn handle_client_message(&self, conn_id: &str, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom { room_id, identity } => {
                self.join_room(conn_id, &room_id, &identity).await;
            }

            ClientMessage::LeaveRoom { room_id, identity } => {
                self.handlers.remove(conn_id, &room_id);
                if self.hub.remove_user_from_room(conn_id, &room_id).await {
                    info!("{} left room {}", identity, room_id);
                    let users_in_room = self.hub.users_in_room(&room_id).await;
                    let left = ServerMessage::UserLeft {
                        room_id: room_id.clone(),
                        username: identity,
                        users_in_room,
                    };
                    self.hub.broadcast_to_room(&room_id, &left).await;
                }
            }

            ClientMessage::SendMessage {
                room_id,
                message,
                sender,
                message_id,
            } => {
                let Some(router) = self.handlers.handler(conn_id, &room_id, SEND_MESSAGE) else {
                    self.hub
                        .send_to(conn_id, &ServerMessage::error("join the room before sending"));
                    return;
                };
                let request = SendMessage {
                    room_id,
                    text: message,
                    sender,
                    message_id,
                };
                if let Err(e) = router.handle_send(Some(conn_id), request).await {
                    warn!("send-message from {} failed: {}", conn_id, e);
                    self.hub.send_to(conn_id, &ServerMessage::error(e.to_string()));
                }
            }

            ClientMessage::RequestNextMessage { room_id } => {
                let Some(router) = self.handlers.handler(conn_id, &room_id, REQUEST_NEXT_MESSAGE) else {
                    self.hub
                        .send_to(conn_id, &ServerMessage::error("join the room before requesting"));
                    return;
                };
                let hub = self.hub.clone();
                let conn_id = conn_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = router.handle_request_next(&room_id).await {
                        warn!("request-next-message for room {} failed: {}", room_id, e);
                        hub.send_to(&conn_id, &ServerMessage::error(e.to_string()));
                    }
                });
            }
        }
    }

    async fn join_room(&self, conn_id: &str, room_id: &str, identity: &str) {
        let room = match self.store.get_room(room_id).await {
            Ok(Some(room)) => room,
            Ok(None) => {
                self.hub
                    .send_to(conn_id, &ServerMessage::error(format!("room {} not found", room_id.trim())));
                return;
            }
            Err(e) => {
                warn!("Failed to load room {}: {}", room_id, e);
                self.hub.send_to(conn_id, &ServerMessage::error(e.to_string()));
                return;
            }
        };

        self.hub.add_user(conn_id, identity).await;
        let joined = self.hub.add_user_to_room(conn_id, &room.id).await;
        let router = self.routers.for_type(room.dialogue_type);
        self.handlers.install(conn_id, &room.id, router.clone());

        if joined {
            info!("{} joined room {} on {}", identity, room.id, conn_id);
            let users_in_room = self.hub.users_in_room(&room.id).await;
            let event = ServerMessage::UserJoined {
                room_id: room.id.clone(),
                username: identity.to_string(),
                users_in_room,
            };
            self.hub.broadcast_to_room(&room.id, &event).await;
        }
        router.on_join(&room.id, conn_id).await;
    }

    async fn handle_disconnect(&self, conn_id: &str) {
        if let Some(participant) = self.hub.remove_user(conn_id).await {
            for room_id in &participant.rooms {
                let users_in_room = self.hub.users_in_room(room_id).await;
                let left = ServerMessage::UserLeft {
                    room_id: room_id.clone(),
                    username: participant.name.clone(),
                    users_in_room,
                };
                self.hub.broadcast_to_room_except(room_id, &left, Some(conn_id)).await;
            }
        }
        self.handlers.clear(conn_id);
        self.registry.unregister(conn_id);
        info!("Connection {} closed", conn_id);
    }
}
