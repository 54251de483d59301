use std::sync::{Arc, Mutex, PoisonError};

use log::{info, warn};
use uuid::Uuid;

use crate::api::PostMessage;
use crate::config::ConnectionConfig;
use crate::error::{ChatError, Result};
use crate::message::ChatMessage;
use crate::messages::ServerMessage;
use crate::room::{canonical_room_id, DialogueType, Room};
use crate::turn::{SpeakerRole, TurnCoordinator, TurnTracker};

use super::cache::MessageCache;
use super::connection::{ConnectionManager, Event, CONNECTED, DISCONNECTED};
use super::rest::RestClient;

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered(ChatMessage),
    /// The server gave the floor to someone else. `text` is handed back so
    /// the caller can keep it in the input box.
    NotYourTurn {
        text: String,
        speaker_id: String,
        role: SpeakerRole,
    },
}

/// A client's view of one room.
///
/// Broadcasts are merged into the cache and fed to the turn tracker. Sends
/// go over the socket while it is up and over REST otherwise.
pub struct RoomSession {
    room_id: String,
    identity: String,
    dialogue_type: DialogueType,
    connection: ConnectionManager,
    cache: Arc<MessageCache<RestClient>>,
    tracker: Arc<Mutex<Option<TurnTracker>>>,
}

impl RoomSession {
    /// Loads the room, connects and joins. A failed connect leaves the
    /// session usable over REST while the transport keeps retrying.
    pub async fn open(
        endpoint: &str,
        rest: RestClient,
        config: ConnectionConfig,
        room_id: &str,
        identity: &str,
    ) -> Result<Self> {
        let room_id = canonical_room_id(room_id);
        let cache = Arc::new(MessageCache::new(rest));
        let room = cache
            .get(&room_id)
            .await
            .ok_or_else(|| ChatError::RoomNotFound(room_id.clone()))?;

        let tracker = match room.dialogue_type {
            DialogueType::Debate => {
                let mut tracker = TurnTracker::new(TurnCoordinator::for_room(&room), identity);
                for message in &room.messages {
                    tracker.observe(message);
                }
                Some(tracker)
            }
            DialogueType::Free => None,
        };

        let session = RoomSession {
            room_id,
            identity: identity.to_string(),
            dialogue_type: room.dialogue_type,
            connection: ConnectionManager::new(config),
            cache,
            tracker: Arc::new(Mutex::new(tracker)),
        };
        session.install_listeners();

        if let Err(e) = session.connection.connect(endpoint).await {
            warn!("Real-time channel unavailable, using REST: {}", e);
        }
        if let Err(e) = session.connection.join_room(&session.room_id, identity).await {
            warn!("Could not queue join for room {}: {}", session.room_id, e);
        }
        Ok(session)
    }

    fn install_listeners(&self) {
        let room_id = self.room_id.clone();
        let cache = self.cache.clone();
        let tracker = self.tracker.clone();
        self.connection.on("new-message", move |event| {
            let Event::Message(ServerMessage::NewMessage { room_id: target, message }) = event else {
                return;
            };
            if canonical_room_id(target) != room_id {
                return;
            }
            let fresh = cache
                .merge_message(&room_id, message.clone())
                .is_some_and(|outcome| outcome.is_new());
            if fresh {
                if let Some(tracker) = tracker.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
                    tracker.observe(message);
                }
            }
        });

        let room_id = self.room_id.clone();
        let tracker = self.tracker.clone();
        self.connection.on("next-speaker-update", move |event| {
            let Event::Message(ServerMessage::NextSpeakerUpdate { room_id: target, next_speaker }) = event else {
                return;
            };
            if canonical_room_id(target) != room_id {
                return;
            }
            if let Some(tracker) = tracker.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
                tracker.apply_signal(next_speaker);
            }
        });

        let room_id = self.room_id.clone();
        self.connection.on(CONNECTED, move |_| info!("Back online for room {}", room_id));
        let room_id = self.room_id.clone();
        self.connection.on(DISCONNECTED, move |event| {
            if let Event::Disconnected { reason } = event {
                warn!("Offline in room {}: {}", room_id, reason);
            }
        });
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn is_online(&self) -> bool {
        self.connection.is_connected()
    }

    /// Latest snapshot; refetched once the cached one goes stale.
    pub async fn room(&self) -> Option<Room> {
        self.cache.get(&self.room_id).await
    }

    pub fn snapshot(&self) -> Option<Room> {
        self.cache.peek(&self.room_id)
    }

    /// Free rooms are always open; debate rooms follow the turn tracker.
    pub fn is_my_turn(&self) -> bool {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, TurnTracker::is_my_turn)
    }

    pub fn expect_reply_from(&self, speaker: &str) {
        self.cache.insert_placeholder(&self.room_id, speaker);
    }

    pub async fn send(&self, text: &str) -> Result<SendOutcome> {
        if let Some(rejection) = self.local_rejection(text) {
            return Ok(rejection);
        }

        let message_id = Uuid::new_v4().to_string();
        let mut message = ChatMessage::user(&self.identity, text).with_id(&message_id);
        if self.dialogue_type == DialogueType::Debate {
            if let Some(room) = self.snapshot() {
                message.metadata.position = room.position_of(&self.identity);
            }
        }
        self.with_tracker(TurnTracker::mark_submitted);

        if self.is_online() {
            match self
                .connection
                .send_message(&self.room_id, text, &self.identity, Some(message_id.clone()))
                .await
            {
                Ok(()) => {
                    self.cache.merge_message(&self.room_id, message.clone());
                    return Ok(SendOutcome::Delivered(message));
                }
                Err(e) => warn!("Socket send failed, falling back to REST: {}", e),
            }
        }

        let body = PostMessage {
            sender: self.identity.clone(),
            text: text.to_string(),
            message_id: Some(message_id),
        };
        let rest = self.cache.source();
        let result = match self.dialogue_type {
            DialogueType::Debate => rest.submit_turn(&self.room_id, &body).await,
            DialogueType::Free => rest.append_message(&self.room_id, &body).await,
        };
        match result {
            Ok(stored) => {
                self.cache.merge_message(&self.room_id, stored.clone());
                Ok(SendOutcome::Delivered(stored))
            }
            Err(ChatError::NotYourTurn { speaker_id, role }) => {
                self.with_tracker(|tracker| tracker.correct(&speaker_id, role));
                Ok(SendOutcome::NotYourTurn {
                    text: text.to_string(),
                    speaker_id,
                    role,
                })
            }
            Err(e) => {
                self.with_tracker(TurnTracker::restore_turn);
                Err(e)
            }
        }
    }

    /// Asks for the next scripted debate turn.
    pub async fn request_next(&self) -> Result<()> {
        if self.dialogue_type != DialogueType::Debate {
            return Err(ChatError::Unsupported("request-next-message"));
        }
        if self.is_online() && self.connection.request_next(&self.room_id).await.is_ok() {
            return Ok(());
        }
        let message = self.cache.source().request_next(&self.room_id).await?;
        if self
            .cache
            .merge_message(&self.room_id, message.clone())
            .is_some_and(|outcome| outcome.is_new())
        {
            self.with_tracker(|tracker| {
                tracker.observe(&message);
            });
        }
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = self.connection.leave_room(&self.room_id, &self.identity).await {
            info!("Leaving room {} while offline: {}", self.room_id, e);
        }
        self.connection.close().await;
    }

    /// A debate client that knows someone else holds the floor does not send.
    fn local_rejection(&self, text: &str) -> Option<SendOutcome> {
        let tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        let tracker = tracker.as_ref()?;
        let state = tracker.state()?;
        if tracker.is_my_turn() {
            return None;
        }
        Some(SendOutcome::NotYourTurn {
            text: text.to_string(),
            speaker_id: state.next_speaker_id.clone(),
            role: state.next_speaker_role,
        })
    }

    fn with_tracker<F: FnOnce(&mut TurnTracker)>(&self, f: F) {
        if let Some(tracker) = self.tracker.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            f(tracker);
        }
    }
}
