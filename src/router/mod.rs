//! Per-room handling of inbound chat traffic.
//!
//! Each dialogue type has one [`DialogueRouter`]. A connection's handlers live
//! in a [`HandlerRegistry`] keyed by room and event name, so installing a
//! router twice replaces the first installation instead of stacking a second
//! one, and a connection in several rooms reaches each room's own router.

pub mod debate;
pub mod free;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::{debug, warn};

use crate::error::{ChatError, Result};
use crate::generation::Generator;
use crate::hub::RoomBroadcastHub;
use crate::message::ChatMessage;
use crate::messages::ServerMessage;
use crate::room::{canonical_room_id, DialogueType, InsertOutcome, Room};
use crate::store::RoomStore;

pub use debate::DebateRouter;
pub use free::FreeRouter;

pub const SEND_MESSAGE: &str = "send-message";
pub const REQUEST_NEXT_MESSAGE: &str = "request-next-message";

/// A user's chat line as it arrives from the socket or the REST fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessage {
    pub room_id: String,
    pub text: String,
    pub sender: String,
    /// Client-chosen id; retried sends with the same id are stored once.
    pub message_id: Option<String>,
}

impl SendMessage {
    pub fn new(room_id: impl Into<String>, sender: impl Into<String>, text: impl Into<String>) -> Self {
        SendMessage {
            room_id: room_id.into(),
            text: text.into(),
            sender: sender.into(),
            message_id: None,
        }
    }

    pub(crate) fn into_message(self) -> Result<ChatMessage> {
        if self.text.trim().is_empty() {
            return Err(ChatError::Validation("message text must not be empty".into()));
        }
        let sender = self.sender.trim();
        if sender.is_empty() {
            return Err(ChatError::Validation("sender must not be empty".into()));
        }
        let message = ChatMessage::user(sender, self.text);
        Ok(match self.message_id.filter(|id| !id.trim().is_empty()) {
            Some(id) => message.with_id(id.trim()),
            None => message,
        })
    }
}

/// Everything a router needs to persist, generate and fan out.
#[derive(Clone)]
pub struct RouterContext {
    pub store: Arc<dyn RoomStore>,
    pub hub: Arc<RoomBroadcastHub>,
    pub generator: Arc<dyn Generator>,
    pub history_window: usize,
}

impl RouterContext {
    pub async fn load_room(&self, room_id: &str) -> Result<Room> {
        self.store
            .get_room(room_id)
            .await?
            .ok_or_else(|| ChatError::RoomNotFound(canonical_room_id(room_id)))
    }

    /// Persists then broadcasts to the room, skipping `except`.
    ///
    /// Returns false only for a message the store already had. A failed write
    /// is logged and the broadcast still goes out.
    pub async fn deliver(&self, room_id: &str, message: &ChatMessage, except: Option<&str>) -> bool {
        match self.store.append_message(room_id, message.clone()).await {
            Ok(InsertOutcome::Duplicate) => {
                debug!("Message {} already delivered to room {}", message.id, room_id);
                return false;
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to persist message {} in room {}: {}", message.id, room_id, e),
        }
        let event = ServerMessage::NewMessage {
            room_id: room_id.to_string(),
            message: message.clone(),
        };
        self.hub.broadcast_to_room_except(room_id, &event, except).await;
        true
    }
}

#[async_trait]
pub trait DialogueRouter: Send + Sync {
    fn dialogue_type(&self) -> DialogueType;

    /// `origin` is the sending connection, excluded from the broadcast.
    async fn handle_send(&self, origin: Option<&str>, request: SendMessage) -> Result<ChatMessage>;

    async fn handle_request_next(&self, _room_id: &str) -> Result<ChatMessage> {
        Err(ChatError::Unsupported("request-next-message"))
    }

    /// Called after a connection joins one of this router's rooms.
    async fn on_join(&self, _room_id: &str, _conn_id: &str) {}
}

/// One router per dialogue type.
#[derive(Clone)]
pub struct Routers {
    pub free: Arc<FreeRouter>,
    pub debate: Arc<DebateRouter>,
}

impl Routers {
    pub fn new(ctx: RouterContext) -> Self {
        Routers {
            free: Arc::new(FreeRouter::new(ctx.clone())),
            debate: Arc::new(DebateRouter::new(ctx)),
        }
    }

    pub fn for_type(&self, dialogue_type: DialogueType) -> Arc<dyn DialogueRouter> {
        match dialogue_type {
            DialogueType::Free => self.free.clone(),
            DialogueType::Debate => self.debate.clone(),
        }
    }
}

type Handlers = HashMap<&'static str, Arc<dyn DialogueRouter>>;

/// Per-connection event handlers, one set for each room the connection is in.
#[derive(Default)]
pub struct HandlerRegistry {
    connections: Mutex<HashMap<String, HashMap<String, Handlers>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Points the connection's chat events for `room_id` at `router`,
    /// replacing whatever was installed for that room before.
    pub fn install(&self, conn_id: &str, room_id: &str, router: Arc<dyn DialogueRouter>) {
        let mut connections = self.lock();
        let handlers = connections
            .entry(conn_id.to_string())
            .or_default()
            .entry(canonical_room_id(room_id))
            .or_default();
        for event in [SEND_MESSAGE, REQUEST_NEXT_MESSAGE] {
            if handlers.insert(event, router.clone()).is_some() {
                debug!("Replaced {} handler for {} in room {}", event, conn_id, room_id.trim());
            }
        }
    }

    pub fn handler(&self, conn_id: &str, room_id: &str, event: &str) -> Option<Arc<dyn DialogueRouter>> {
        self.lock()
            .get(conn_id)
            .and_then(|rooms| rooms.get(&canonical_room_id(room_id)))
            .and_then(|handlers| handlers.get(event).cloned())
    }

    pub fn handler_count(&self, conn_id: &str) -> usize {
        self.lock()
            .get(conn_id)
            .map_or(0, |rooms| rooms.values().map(HashMap::len).sum())
    }

    pub fn remove(&self, conn_id: &str, room_id: &str) {
        if let Some(rooms) = self.lock().get_mut(conn_id) {
            rooms.remove(&canonical_room_id(room_id));
        }
    }

    pub fn clear(&self, conn_id: &str) {
        self.lock().remove(conn_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, Handlers>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
