use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};

use crate::messages::ServerMessage;
use crate::room::canonical_room_id;

/// Where the hub hands serialized frames for a connection.
pub trait Delivery: Send + Sync {
    /// Returns false when the connection is unknown or already closed.
    fn deliver(&self, conn_id: &str, frame: &str) -> bool;
    fn connection_ids(&self) -> Vec<String>;
}

/// Process-wide table of live connections and their outbound queues.
///
/// Created stopped. [`start`](Self::start) before registering connections;
/// [`stop`](Self::stop) drops every queue, which ends each connection's
/// writer task and closes its socket.
#[derive(Default)]
pub struct ConnectionRegistry {
    running: AtomicBool,
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("Connection registry started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let dropped = self.write().drain().count();
        info!("Connection registry stopped, closed {} connections", dropped);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// None while the registry is stopped.
    pub fn register(&self, conn_id: &str) -> Option<mpsc::UnboundedReceiver<String>> {
        if !self.is_running() {
            warn!("Refusing connection {} while the registry is stopped", conn_id);
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.write().insert(conn_id.to_string(), tx);
        Some(rx)
    }

    /// Dropping the queue ends the connection's writer task.
    pub fn unregister(&self, conn_id: &str) -> bool {
        self.write().remove(conn_id).is_some()
    }

    pub fn send(&self, conn_id: &str, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(frame) => self.deliver(conn_id, &frame),
            Err(e) => {
                warn!("Failed to serialize {}: {}", message.event_name(), e);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, mpsc::UnboundedSender<String>>> {
        self.connections.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, mpsc::UnboundedSender<String>>> {
        self.connections.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Delivery for ConnectionRegistry {
    fn deliver(&self, conn_id: &str, frame: &str) -> bool {
        match self.read().get(conn_id) {
            Some(tx) => tx.send(frame.to_string()).is_ok(),
            None => false,
        }
    }

    fn connection_ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedParticipant {
    pub conn_id: String,
    pub name: String,
    pub rooms: BTreeSet<String>,
}

#[derive(Default)]
struct Membership {
    participants: HashMap<String, ConnectedParticipant>,
    rooms: HashMap<String, Vec<String>>,
}

impl Membership {
    fn names_in(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|conns| {
                conns
                    .iter()
                    .filter_map(|c| self.participants.get(c).map(|p| p.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn detach(&mut self, conn_id: &str, room_id: &str) -> bool {
        let Some(conns) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let before = conns.len();
        conns.retain(|c| c != conn_id);
        let removed = conns.len() != before;
        if conns.is_empty() {
            self.rooms.remove(room_id);
        }
        removed
    }
}

/// Room membership for connected participants, and fan-out to them.
///
/// Holds no message content. Fan-out for a room runs while the membership
/// lock is held, so frames for one room leave in the order they were
/// broadcast.
#[derive(Default)]
pub struct RoomBroadcastHub {
    membership: Mutex<Membership>,
    delivery: RwLock<Option<Arc<dyn Delivery>>>,
}

impl RoomBroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delivery(delivery: Arc<dyn Delivery>) -> Self {
        let hub = Self::new();
        hub.attach(delivery);
        hub
    }

    pub fn attach(&self, delivery: Arc<dyn Delivery>) {
        *self.delivery.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(delivery);
    }

    pub fn detach(&self) {
        *self.delivery.write().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    fn delivery(&self) -> Option<Arc<dyn Delivery>> {
        self.delivery
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Registers or renames a connection.
    pub async fn add_user(&self, conn_id: &str, name: &str) {
        let mut membership = self.membership.lock().await;
        membership
            .participants
            .entry(conn_id.to_string())
            .and_modify(|p| p.name = name.to_string())
            .or_insert_with(|| ConnectedParticipant {
                conn_id: conn_id.to_string(),
                name: name.to_string(),
                rooms: BTreeSet::new(),
            });
    }

    /// Forgets the connection and drops it from every room it had joined.
    pub async fn remove_user(&self, conn_id: &str) -> Option<ConnectedParticipant> {
        let mut membership = self.membership.lock().await;
        let participant = membership.participants.remove(conn_id)?;
        for room_id in &participant.rooms {
            membership.detach(conn_id, room_id);
        }
        Some(participant)
    }

    /// True if the connection was not in the room before.
    pub async fn add_user_to_room(&self, conn_id: &str, room_id: &str) -> bool {
        let room_id = canonical_room_id(room_id);
        let mut membership = self.membership.lock().await;
        let Some(participant) = membership.participants.get_mut(conn_id) else {
            warn!("Unknown connection {} tried to join room {}", conn_id, room_id);
            return false;
        };
        participant.rooms.insert(room_id.clone());
        let conns = membership.rooms.entry(room_id).or_default();
        if conns.iter().any(|c| c == conn_id) {
            return false;
        }
        conns.push(conn_id.to_string());
        true
    }

    /// True if the connection was in the room.
    pub async fn remove_user_from_room(&self, conn_id: &str, room_id: &str) -> bool {
        let room_id = canonical_room_id(room_id);
        let mut membership = self.membership.lock().await;
        if let Some(participant) = membership.participants.get_mut(conn_id) {
            participant.rooms.remove(&room_id);
        }
        membership.detach(conn_id, &room_id)
    }

    pub async fn users_in_room(&self, room_id: &str) -> Vec<String> {
        self.membership.lock().await.names_in(&canonical_room_id(room_id))
    }

    pub async fn connections_in_room(&self, room_id: &str) -> Vec<String> {
        self.membership
            .lock()
            .await
            .rooms
            .get(&canonical_room_id(room_id))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn rooms_of(&self, conn_id: &str) -> BTreeSet<String> {
        self.membership
            .lock()
            .await
            .participants
            .get(conn_id)
            .map(|p| p.rooms.clone())
            .unwrap_or_default()
    }

    pub async fn broadcast_to_room(&self, room_id: &str, message: &ServerMessage) -> usize {
        self.broadcast_to_room_except(room_id, message, None).await
    }

    /// Returns how many connections the frame was handed to.
    pub async fn broadcast_to_room_except(
        &self,
        room_id: &str,
        message: &ServerMessage,
        except: Option<&str>,
    ) -> usize {
        let room_id = canonical_room_id(room_id);
        let Some(delivery) = self.delivery() else {
            warn!("No connection registry attached, dropping {} for room {}", message.event_name(), room_id);
            return 0;
        };
        let Some(frame) = serialize(message) else {
            return 0;
        };
        let membership = self.membership.lock().await;
        let Some(conns) = membership.rooms.get(&room_id) else {
            debug!("Room {} has no connected members", room_id);
            return 0;
        };
        conns
            .iter()
            .filter(|c| Some(c.as_str()) != except)
            .filter(|c| delivery.deliver(c, &frame))
            .count()
    }

    pub async fn broadcast_to_all(&self, message: &ServerMessage) -> usize {
        let Some(delivery) = self.delivery() else {
            warn!("No connection registry attached, dropping {}", message.event_name());
            return 0;
        };
        let Some(frame) = serialize(message) else {
            return 0;
        };
        let _order = self.membership.lock().await;
        delivery
            .connection_ids()
            .iter()
            .filter(|c| delivery.deliver(c, &frame))
            .count()
    }

    pub fn send_to(&self, conn_id: &str, message: &ServerMessage) -> bool {
        let Some(delivery) = self.delivery() else {
            warn!("No connection registry attached, dropping {} for {}", message.event_name(), conn_id);
            return false;
        };
        serialize(message).is_some_and(|frame| delivery.deliver(conn_id, &frame))
    }
}

fn serialize(message: &ServerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Failed to serialize {}: {}", message.event_name(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingDelivery {
        frames: StdMutex<Vec<(String, String)>>,
        known: Vec<String>,
    }

    impl Delivery for RecordingDelivery {
        fn deliver(&self, conn_id: &str, frame: &str) -> bool {
            self.frames.lock().unwrap().push((conn_id.to_string(), frame.to_string()));
            true
        }

        fn connection_ids(&self) -> Vec<String> {
            self.known.clone()
        }
    }

    impl RecordingDelivery {
        fn recipients(&self) -> Vec<String> {
            self.frames.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
        }
    }

    async fn hub_with_room() -> (RoomBroadcastHub, Arc<RecordingDelivery>) {
        let delivery = Arc::new(RecordingDelivery {
            known: vec!["c1".into(), "c2".into(), "c3".into()],
            ..Default::default()
        });
        let hub = RoomBroadcastHub::with_delivery(delivery.clone());
        for (conn, name) in [("c1", "alice"), ("c2", "bob"), ("c3", "carol")] {
            hub.add_user(conn, name).await;
        }
        hub.add_user_to_room("c1", "r1").await;
        hub.add_user_to_room("c2", "r1").await;
        (hub, delivery)
    }

    #[tokio::test]
    async fn joining_twice_keeps_one_membership() {
        let (hub, _) = hub_with_room().await;
        assert!(!hub.add_user_to_room("c1", "r1").await);
        assert!(!hub.add_user_to_room("c1", " r1 ").await);
        assert_eq!(hub.users_in_room("r1").await, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn broadcast_skips_sender_and_outsiders() {
        let (hub, delivery) = hub_with_room().await;
        let sent = hub
            .broadcast_to_room_except("r1", &ServerMessage::error("x"), Some("c1"))
            .await;
        assert_eq!(sent, 1);
        assert_eq!(delivery.recipients(), vec!["c2"]);
    }

    #[tokio::test]
    async fn broadcast_to_all_reaches_every_connection() {
        let (hub, delivery) = hub_with_room().await;
        assert_eq!(hub.broadcast_to_all(&ServerMessage::error("x")).await, 3);
        assert_eq!(delivery.recipients().len(), 3);
    }

    #[tokio::test]
    async fn broadcast_without_delivery_is_a_no_op() {
        let hub = RoomBroadcastHub::new();
        hub.add_user("c1", "alice").await;
        hub.add_user_to_room("c1", "r1").await;
        assert_eq!(hub.broadcast_to_room("r1", &ServerMessage::error("x")).await, 0);
        assert!(!hub.send_to("c1", &ServerMessage::error("x")));
    }

    #[tokio::test]
    async fn remove_user_clears_all_rooms() {
        let (hub, _) = hub_with_room().await;
        hub.add_user_to_room("c1", "r2").await;
        let removed = hub.remove_user("c1").await.unwrap();
        assert_eq!(removed.name, "alice");
        assert_eq!(removed.rooms.len(), 2);
        assert_eq!(hub.users_in_room("r1").await, vec!["bob"]);
        assert!(hub.users_in_room("r2").await.is_empty());
        assert!(hub.remove_user("c1").await.is_none());
    }

    #[tokio::test]
    async fn leaving_reports_whether_membership_changed() {
        let (hub, _) = hub_with_room().await;
        assert!(hub.remove_user_from_room("c2", "r1").await);
        assert!(!hub.remove_user_from_room("c2", "r1").await);
        assert!(hub.rooms_of("c2").await.is_empty());
    }

    #[tokio::test]
    async fn registry_queues_frames_until_stopped() {
        let registry = ConnectionRegistry::new();
        assert!(registry.register("c1").is_none());

        registry.start();
        let mut rx = registry.register("c1").unwrap();
        assert!(registry.send("c1", &ServerMessage::error("boom")));
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("\"event\":\"error\""));

        registry.stop();
        assert!(registry.is_empty());
        assert!(rx.recv().await.is_none());
        assert!(!registry.deliver("c1", "{}"));
    }
}
