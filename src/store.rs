use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{ChatError, Result};
use crate::message::ChatMessage;
use crate::room::{canonical_room_id, InsertOutcome, ParticipantUpdate, Room};

/// Durable home of rooms and their messages.
///
/// Message inserts are idempotent by id: appending a message whose id is
/// already stored reports [`InsertOutcome::Duplicate`] and changes nothing.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn create_room(&self, room: Room) -> Result<Room>;
    async fn get_room(&self, room_id: &str) -> Result<Option<Room>>;
    async fn append_message(&self, room_id: &str, message: ChatMessage) -> Result<InsertOutcome>;
    async fn update_participants(&self, room_id: &str, update: ParticipantUpdate) -> Result<Room>;

    async fn messages(&self, room_id: &str) -> Result<Vec<ChatMessage>> {
        self.get_room(room_id)
            .await?
            .map(|room| room.messages)
            .ok_or_else(|| ChatError::RoomNotFound(canonical_room_id(room_id)))
    }
}

/// Rooms served from memory.
///
/// A store opened on a directory also keeps one JSON document per room
/// there. Every mutation is written through to disk before it is applied in
/// memory and acknowledged, and all rooms are reloaded on open.
#[derive(Default)]
pub struct MemoryStore {
    rooms: RwLock<HashMap<String, Room>>,
    storage_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(storage_path: impl AsRef<Path>) -> Result<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();
        fs::create_dir_all(&storage_path).await?;

        let mut rooms = HashMap::new();
        let mut entries = fs::read_dir(&storage_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read(&path).await?;
            let room = match serde_json::from_slice::<Room>(&raw) {
                Ok(room) => room,
                Err(e) => {
                    warn!("Skipping unreadable room file {}: {}", path.display(), e);
                    continue;
                }
            };
            if let Some(Err(e)) = room.positions.as_ref().map(|p| p.validate(&room.participants)) {
                warn!("Skipping room file {} with inconsistent sides: {}", path.display(), e);
                continue;
            }
            rooms.insert(canonical_room_id(&room.id), room);
        }
        info!("Loaded {} rooms from {}", rooms.len(), storage_path.display());

        Ok(MemoryStore {
            rooms: RwLock::new(rooms),
            storage_path: Some(storage_path),
        })
    }

    async fn persist(&self, room: &Room) -> Result<()> {
        let Some(dir) = &self.storage_path else {
            return Ok(());
        };
        let file_name: String = room
            .id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{file_name}.json"));
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(room)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn create_room(&self, mut room: Room) -> Result<Room> {
        room.id = canonical_room_id(&room.id);
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&room.id) {
            return Err(ChatError::Validation(format!("room {} already exists", room.id)));
        }
        self.persist(&room).await?;
        rooms.insert(room.id.clone(), room.clone());
        Ok(room)
    }

    async fn get_room(&self, room_id: &str) -> Result<Option<Room>> {
        Ok(self.rooms.read().await.get(&canonical_room_id(room_id)).cloned())
    }

    async fn append_message(&self, room_id: &str, message: ChatMessage) -> Result<InsertOutcome> {
        let room_id = canonical_room_id(room_id);
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&room_id).ok_or_else(|| ChatError::RoomNotFound(room_id.clone()))?;

        let mut updated = room.clone();
        let outcome = updated.insert_message(message);
        if outcome == InsertOutcome::Duplicate {
            debug!("Ignoring duplicate message in room {}", room_id);
            return Ok(outcome);
        }
        self.persist(&updated).await?;
        *room = updated;
        Ok(outcome)
    }

    async fn update_participants(&self, room_id: &str, update: ParticipantUpdate) -> Result<Room> {
        let room_id = canonical_room_id(room_id);
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&room_id).ok_or_else(|| ChatError::RoomNotFound(room_id.clone()))?;

        let mut updated = room.clone();
        updated.apply_update(update)?;
        self.persist(&updated).await?;
        *room = updated.clone();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::CreateRoomRequest;

    fn free_room() -> Room {
        CreateRoomRequest {
            title: "Open chat".into(),
            users: vec!["alice".into()],
            npcs: vec!["sage".into()],
            ..Default::default()
        }
        .into_room()
        .unwrap()
    }

    #[tokio::test]
    async fn memory_store_append_is_idempotent() {
        let store = MemoryStore::new();
        let room = store.create_room(free_room()).await.unwrap();
        let message = ChatMessage::user("alice", "hello");

        let first = store.append_message(&room.id, message.clone()).await.unwrap();
        let second = store.append_message(&room.id, message.clone()).await.unwrap();

        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::Duplicate);
        let messages = store.messages(&room.id).await.unwrap();
        assert_eq!(messages.iter().filter(|m| m.id == message.id).count(), 1);
    }

    #[tokio::test]
    async fn lookups_use_canonical_ids() {
        let store = MemoryStore::new();
        let room = store.create_room(free_room()).await.unwrap();
        let padded = format!("  {}\n", room.id);
        assert!(store.get_room(&padded).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_room_is_reported() {
        let store = MemoryStore::new();
        let err = store
            .append_message("nope", ChatMessage::user("alice", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RoomNotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn rejected_update_leaves_room_untouched() {
        let store = MemoryStore::new();
        let room = store.create_room(free_room()).await.unwrap();
        let update = ParticipantUpdate {
            users: Some(Vec::new()),
            npcs: Some(Vec::new()),
            ..Default::default()
        };
        assert!(store.update_participants(&room.id, update).await.is_err());
        let stored = store.get_room(&room.id).await.unwrap().unwrap();
        assert_eq!(stored.participants, room.participants);
    }

    #[tokio::test]
    async fn opened_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let room = {
            let store = MemoryStore::open(dir.path()).await.unwrap();
            let room = store.create_room(free_room()).await.unwrap();
            store
                .append_message(&room.id, ChatMessage::user("alice", "persisted"))
                .await
                .unwrap();
            room
        };

        let reopened = MemoryStore::open(dir.path()).await.unwrap();
        let loaded = reopened.get_room(&room.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Open chat");
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].text, "persisted");
    }

    #[tokio::test]
    async fn opened_store_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        let store = MemoryStore::open(dir.path()).await.unwrap();
        assert!(store.get_room("broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn opened_store_skips_rooms_with_inconsistent_sides() {
        let dir = tempfile::tempdir().unwrap();
        let mut room = CreateRoomRequest {
            title: "Lopsided".into(),
            dialogue_type: crate::room::DialogueType::Debate,
            users: vec!["alice".into(), "bob".into()],
            ..Default::default()
        }
        .into_room()
        .unwrap();
        if let Some(positions) = room.positions.as_mut() {
            positions.neutral.retain(|id| id != "bob");
        }
        std::fs::write(dir.path().join("lopsided.json"), serde_json::to_vec(&room).unwrap()).unwrap();

        let store = MemoryStore::open(dir.path()).await.unwrap();
        assert!(store.get_room(&room.id).await.unwrap().is_none());
    }
}
