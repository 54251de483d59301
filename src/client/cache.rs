use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::time::Instant;

use crate::config::{RetryPolicy, DEFAULT_CACHE_TTL};
use crate::error::Result;
use crate::message::ChatMessage;
use crate::retry::RetryingRequestClient;
use crate::room::{canonical_room_id, InsertOutcome, Room};

/// Remote side of the cache: wherever room snapshots come from.
#[async_trait]
pub trait RoomSource: Send + Sync {
    async fn fetch_room(&self, room_id: &str) -> Result<Option<Room>>;

    /// Messages stored apart from the room document, if the source has any.
    async fn fetch_message_log(&self, _room_id: &str) -> Result<Vec<ChatMessage>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    room: Room,
    fetched_at: Instant,
}

/// Read-through cache of room snapshots with a freshness window.
///
/// A fresh entry is served without a remote call. Past the TTL the remote is
/// asked again through the retry wrapper; if every attempt fails, the old
/// entry is served regardless of age. With no entry at all the answer is
/// `None`.
pub struct MessageCache<S> {
    source: S,
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    retry: RetryingRequestClient,
}

impl<S: RoomSource> MessageCache<S> {
    pub fn new(source: S) -> Self {
        Self::with_settings(source, DEFAULT_CACHE_TTL, RetryPolicy::default())
    }

    pub fn with_settings(source: S, ttl: Duration, policy: RetryPolicy) -> Self {
        MessageCache {
            source,
            entries: Mutex::new(HashMap::new()),
            ttl,
            retry: RetryingRequestClient::new(policy),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn get(&self, room_id: &str) -> Option<Room> {
        let id = canonical_room_id(room_id);
        if let Some(room) = self.fresh(&id) {
            return Some(room);
        }

        let fetched = self.retry.execute(|| self.source.fetch_room(&id)).await;
        match fetched {
            Ok(Some(mut room)) if canonical_room_id(&room.id) == id => {
                let log = self.retry.execute(|| self.source.fetch_message_log(&id)).await;
                match log {
                    Ok(log) => room.merge_messages(log),
                    Err(e) => warn!("Message log for room {} unavailable: {}", id, e),
                }
                room.id = id;
                self.put(room.clone());
                Some(room)
            }
            Ok(Some(other)) => {
                warn!("Asked for room {} but got {}", id, other.id);
                self.invalidate(&id);
                None
            }
            Ok(None) => {
                debug!("Room {} not found remotely", id);
                self.invalidate(&id);
                None
            }
            Err(e) => {
                let stale = self.peek(&id);
                match &stale {
                    Some(_) => warn!("Serving stale room {} after fetch failure: {}", id, e),
                    None => warn!("Room {} unavailable and not cached: {}", id, e),
                }
                stale
            }
        }
    }

    /// Stores a snapshot under its canonical id, fresh from now.
    pub fn put(&self, mut room: Room) {
        room.id = canonical_room_id(&room.id);
        self.lock().insert(
            room.id.clone(),
            CacheEntry {
                room,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Folds a broadcast message into the cached room. `None` if the room
    /// is not cached. Freshness is unchanged.
    pub fn merge_message(&self, room_id: &str, message: ChatMessage) -> Option<InsertOutcome> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&canonical_room_id(room_id))?;
        Some(entry.room.insert_message(message))
    }

    pub fn insert_placeholder(&self, room_id: &str, sender: &str) -> Option<InsertOutcome> {
        self.merge_message(room_id, ChatMessage::placeholder_for(sender))
    }

    /// The cached snapshot regardless of age.
    pub fn peek(&self, room_id: &str) -> Option<Room> {
        self.lock()
            .get(&canonical_room_id(room_id))
            .map(|entry| entry.room.clone())
    }

    pub fn is_fresh(&self, room_id: &str) -> bool {
        self.fresh(&canonical_room_id(room_id)).is_some()
    }

    pub fn invalidate(&self, room_id: &str) -> bool {
        self.lock().remove(&canonical_room_id(room_id)).is_some()
    }

    fn fresh(&self, id: &str) -> Option<Room> {
        self.lock()
            .get(id)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.room.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
