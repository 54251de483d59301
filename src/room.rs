use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::message::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogueType {
    #[default]
    Free,
    Debate,
}

impl fmt::Display for DialogueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogueType::Free => write!(f, "free"),
            DialogueType::Debate => write!(f, "debate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Pro,
    Con,
    Neutral,
}

impl Position {
    pub fn opposite(self) -> Option<Position> {
        match self {
            Position::Pro => Some(Position::Con),
            Position::Con => Some(Position::Pro),
            Position::Neutral => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Pro => write!(f, "pro"),
            Position::Con => write!(f, "con"),
            Position::Neutral => write!(f, "neutral"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participants {
    pub users: BTreeSet<String>,
    pub npcs: BTreeSet<String>,
}

impl Participants {
    pub fn contains(&self, id: &str) -> bool {
        self.users.contains(id) || self.npcs.contains(id)
    }

    pub fn is_user(&self, id: &str) -> bool {
        self.users.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.npcs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.users.iter().chain(self.npcs.iter())
    }

    fn build(users: Vec<String>, npcs: Vec<String>) -> Result<Self> {
        let participants = Participants {
            users: users.into_iter().map(|u| u.trim().to_string()).filter(|u| !u.is_empty()).collect(),
            npcs: npcs.into_iter().map(|n| n.trim().to_string()).filter(|n| !n.is_empty()).collect(),
        };
        if participants.is_empty() {
            return Err(ChatError::Validation("at least one participant is required".into()));
        }
        if let Some(both) = participants.users.intersection(&participants.npcs).next() {
            return Err(ChatError::Validation(format!("{both} cannot be both a user and an npc")));
        }
        Ok(participants)
    }
}

/// Debate sides. The three lists are disjoint and together cover every participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebatePositions {
    pub pro: Vec<String>,
    pub con: Vec<String>,
    pub neutral: Vec<String>,
}

impl DebatePositions {
    /// Anyone without an explicit assignment lands on the neutral list.
    pub fn assign(participants: &Participants, assignments: &BTreeMap<String, Position>) -> Result<Self> {
        if let Some(stranger) = assignments.keys().find(|id| !participants.contains(id)) {
            return Err(ChatError::Validation(format!("{stranger} has a position but is not a participant")));
        }
        let mut positions = DebatePositions::default();
        for id in participants.iter() {
            let side = assignments.get(id).copied().unwrap_or(Position::Neutral);
            positions.members_mut(side).push(id.clone());
        }
        Ok(positions)
    }

    pub fn position_of(&self, id: &str) -> Option<Position> {
        [Position::Pro, Position::Con, Position::Neutral]
            .into_iter()
            .find(|side| self.members(*side).iter().any(|m| m == id))
    }

    pub fn members(&self, side: Position) -> &[String] {
        match side {
            Position::Pro => &self.pro,
            Position::Con => &self.con,
            Position::Neutral => &self.neutral,
        }
    }

    fn members_mut(&mut self, side: Position) -> &mut Vec<String> {
        match side {
            Position::Pro => &mut self.pro,
            Position::Con => &mut self.con,
            Position::Neutral => &mut self.neutral,
        }
    }

    pub fn validate(&self, participants: &Participants) -> Result<()> {
        let mut seen = HashSet::new();
        for id in self.pro.iter().chain(&self.con).chain(&self.neutral) {
            if !seen.insert(id.as_str()) {
                return Err(ChatError::Validation(format!("{id} is on more than one side")));
            }
        }
        if let Some(missing) = participants.iter().find(|id| !seen.contains(id.as_str())) {
            return Err(ChatError::Validation(format!("{missing} has no debate position")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The sender's placeholder was swapped for the real message.
    Replaced,
    Duplicate,
}

impl InsertOutcome {
    pub fn is_new(self) -> bool {
        !matches!(self, InsertOutcome::Duplicate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub title: String,
    pub dialogue_type: DialogueType,
    pub participants: Participants,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<DebatePositions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderator_style: Option<String>,
    #[serde(default)]
    pub auto_conversation: bool,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub last_activity: DateTime<Utc>,
}

impl Room {
    pub fn position_of(&self, id: &str) -> Option<Position> {
        self.positions.as_ref().and_then(|p| p.position_of(id))
    }

    /// Idempotent by message id.
    pub fn insert_message(&mut self, message: ChatMessage) -> InsertOutcome {
        if self.messages.iter().any(|m| m.id == message.id) {
            return InsertOutcome::Duplicate;
        }
        let pending = self
            .messages
            .iter()
            .position(|m| m.placeholder && m.sender == message.sender);
        if message.placeholder && pending.is_some() {
            return InsertOutcome::Duplicate;
        }
        self.last_activity = self.last_activity.max(message.timestamp);
        match pending {
            Some(index) => {
                self.messages[index] = message;
                InsertOutcome::Replaced
            }
            None => {
                self.messages.push(message);
                InsertOutcome::Inserted
            }
        }
    }

    /// Union by id, ordered by timestamp.
    pub fn merge_messages(&mut self, log: Vec<ChatMessage>) {
        let mut seen = HashSet::new();
        let mut merged: Vec<ChatMessage> = std::mem::take(&mut self.messages)
            .into_iter()
            .chain(log)
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        if let Some(latest) = merged.last() {
            self.last_activity = self.last_activity.max(latest.timestamp);
        }
        self.messages = merged;
    }

    pub fn recent_messages(&self, limit: usize) -> &[ChatMessage] {
        let start = self.messages.len().saturating_sub(limit);
        &self.messages[start..]
    }

    pub fn apply_update(&mut self, update: ParticipantUpdate) -> Result<()> {
        let users = update
            .users
            .unwrap_or_else(|| self.participants.users.iter().cloned().collect());
        let npcs = update
            .npcs
            .unwrap_or_else(|| self.participants.npcs.iter().cloned().collect());
        let participants = Participants::build(users, npcs)?;

        let positions = match self.dialogue_type {
            DialogueType::Debate => {
                let assignments = match update.positions {
                    Some(assignments) => assignments,
                    None => self.current_assignments(&participants),
                };
                Some(DebatePositions::assign(&participants, &assignments)?)
            }
            DialogueType::Free => None,
        };

        self.participants = participants;
        self.positions = positions;
        if let Some(auto) = update.auto_conversation {
            self.auto_conversation = auto;
        }
        self.last_activity = Utc::now();
        Ok(())
    }

    fn current_assignments(&self, participants: &Participants) -> BTreeMap<String, Position> {
        participants
            .iter()
            .filter_map(|id| self.position_of(id).map(|side| (id.clone(), side)))
            .collect()
    }
}

/// Trims surrounding whitespace; every map keyed by room id uses this form.
pub fn canonical_room_id(id: &str) -> String {
    id.trim().to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub title: String,
    #[serde(default)]
    pub dialogue_type: DialogueType,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub npcs: Vec<String>,
    #[serde(default)]
    pub positions: BTreeMap<String, Position>,
    #[serde(default)]
    pub moderator_style: Option<String>,
    #[serde(default)]
    pub auto_conversation: bool,
}

impl CreateRoomRequest {
    /// Checks everything up front so a rejected request has no side effects.
    pub fn into_room(self) -> Result<Room> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(ChatError::Validation("title must not be empty".into()));
        }
        let participants = Participants::build(self.users, self.npcs)?;
        let positions = match self.dialogue_type {
            DialogueType::Debate => Some(DebatePositions::assign(&participants, &self.positions)?),
            DialogueType::Free => None,
        };
        Ok(Room {
            id: Uuid::new_v4().to_string(),
            title,
            dialogue_type: self.dialogue_type,
            participants,
            positions,
            moderator_style: self.moderator_style,
            auto_conversation: self.auto_conversation,
            messages: Vec::new(),
            last_activity: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantUpdate {
    #[serde(default)]
    pub users: Option<Vec<String>>,
    #[serde(default)]
    pub npcs: Option<Vec<String>>,
    #[serde(default)]
    pub positions: Option<BTreeMap<String, Position>>,
    #[serde(default)]
    pub auto_conversation: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn debate_request() -> CreateRoomRequest {
        CreateRoomRequest {
            title: "Should cities ban cars?".into(),
            dialogue_type: DialogueType::Debate,
            users: vec!["userA".into()],
            npcs: vec!["npc1".into(), "npc2".into(), "npc3".into()],
            positions: BTreeMap::from([
                ("npc1".to_string(), Position::Pro),
                ("userA".to_string(), Position::Pro),
                ("npc2".to_string(), Position::Con),
            ]),
            ..Default::default()
        }
    }

    fn free_room() -> Room {
        CreateRoomRequest {
            title: "chat".into(),
            users: vec!["alice".into()],
            npcs: vec!["sage".into()],
            ..Default::default()
        }
        .into_room()
        .unwrap()
    }

    #[test]
    fn same_message_twice_is_stored_once() {
        let mut room = free_room();
        let message = ChatMessage::user("alice", "hi");
        assert_eq!(room.insert_message(message.clone()), InsertOutcome::Inserted);
        assert_eq!(room.insert_message(message.clone()), InsertOutcome::Duplicate);
        assert_eq!(room.messages.iter().filter(|m| m.id == message.id).count(), 1);
    }

    #[test]
    fn real_message_replaces_senders_placeholder() {
        let mut room = free_room();
        room.insert_message(ChatMessage::user("alice", "question"));
        room.insert_message(ChatMessage::placeholder_for("sage"));
        assert_eq!(room.insert_message(ChatMessage::placeholder_for("sage")), InsertOutcome::Duplicate);

        let reply = ChatMessage::npc("sage", "answer", Vec::new());
        assert_eq!(room.insert_message(reply.clone()), InsertOutcome::Replaced);
        assert_eq!(room.messages.len(), 2);
        assert_eq!(room.messages[1], reply);
        assert!(room.messages.iter().all(|m| !m.placeholder));
    }

    #[test]
    fn merge_unions_by_id_and_sorts_by_timestamp() {
        let mut room = free_room();
        let base = Utc::now();
        let mut first = ChatMessage::user("alice", "one").with_id("a");
        first.timestamp = base;
        let mut second = ChatMessage::npc("sage", "two", Vec::new()).with_id("b");
        second.timestamp = base + Duration::seconds(1);
        let mut third = ChatMessage::user("alice", "three").with_id("c");
        third.timestamp = base + Duration::seconds(2);

        room.messages = vec![third.clone(), first.clone()];
        room.merge_messages(vec![second.clone(), first.clone(), third.clone()]);

        let ids: Vec<&str> = room.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(room.last_activity >= third.timestamp);
    }

    #[test]
    fn recent_messages_returns_tail() {
        let mut room = free_room();
        for i in 0..15 {
            room.insert_message(ChatMessage::user("alice", format!("m{i}")));
        }
        let recent = room.recent_messages(10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].text, "m5");
        assert_eq!(room.recent_messages(100).len(), 15);
    }

    #[test]
    fn empty_participant_list_is_rejected() {
        let request = CreateRoomRequest { title: "t".into(), ..Default::default() };
        assert!(matches!(request.into_room(), Err(ChatError::Validation(_))));
    }

    #[test]
    fn blank_title_is_rejected() {
        let request = CreateRoomRequest {
            title: "   ".into(),
            users: vec!["alice".into()],
            ..Default::default()
        };
        assert!(matches!(request.into_room(), Err(ChatError::Validation(_))));
    }

    #[test]
    fn participant_cannot_be_user_and_npc() {
        let request = CreateRoomRequest {
            title: "t".into(),
            users: vec!["x".into()],
            npcs: vec!["x".into()],
            ..Default::default()
        };
        assert!(request.into_room().is_err());
    }

    #[test]
    fn debate_positions_cover_every_participant() {
        let room = debate_request().into_room().unwrap();
        let positions = room.positions.as_ref().unwrap();
        assert_eq!(positions.pro, ["userA", "npc1"]);
        assert_eq!(positions.con, ["npc2"]);
        assert_eq!(positions.neutral, ["npc3"]);
        positions.validate(&room.participants).unwrap();
        assert_eq!(room.position_of("npc3"), Some(Position::Neutral));
        assert_eq!(room.position_of("moderator"), None);
    }

    #[test]
    fn position_for_unknown_participant_is_rejected() {
        let mut request = debate_request();
        request.positions.insert("ghost".into(), Position::Con);
        assert!(matches!(request.into_room(), Err(ChatError::Validation(_))));
    }

    #[test]
    fn validate_catches_overlapping_sides() {
        let room = debate_request().into_room().unwrap();
        let mut positions = room.positions.clone().unwrap();
        positions.con.push("npc1".into());
        assert!(positions.validate(&room.participants).is_err());
    }

    #[test]
    fn free_room_ignores_positions() {
        let mut request = debate_request();
        request.dialogue_type = DialogueType::Free;
        assert!(request.into_room().unwrap().positions.is_none());
    }

    #[test]
    fn update_keeps_existing_sides_for_remaining_members() {
        let mut room = debate_request().into_room().unwrap();
        room.apply_update(ParticipantUpdate {
            npcs: Some(vec!["npc1".into(), "npc2".into(), "npc4".into()]),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(room.position_of("npc1"), Some(Position::Pro));
        assert_eq!(room.position_of("npc4"), Some(Position::Neutral));
        assert_eq!(room.position_of("npc3"), None);
    }

    #[test]
    fn update_to_empty_participants_is_rejected_without_change() {
        let mut room = free_room();
        let before = room.clone();
        let result = room.apply_update(ParticipantUpdate {
            users: Some(Vec::new()),
            npcs: Some(Vec::new()),
            ..Default::default()
        });
        assert!(result.is_err());
        assert_eq!(room, before);
    }

    #[test]
    fn canonical_id_trims() {
        assert_eq!(canonical_room_id("  abc \n"), "abc");
    }
}
