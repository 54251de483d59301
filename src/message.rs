use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::room::Position;

/// Sender id used for every moderator message.
pub const MODERATOR_ID: &str = "moderator";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Who produced a message. Only the fields meaningful for a sender type exist
/// on its variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "senderType", rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Npc {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        citations: Vec<Citation>,
    },
    Moderator,
    System,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.stage.is_none() && self.event.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender: String,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "MessageMetadata::is_empty")]
    pub metadata: MessageMetadata,
    /// Transient "generating…" stand-in, replaced by the sender's real message.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,
}

impl ChatMessage {
    fn new(kind: MessageKind, sender: impl Into<String>, text: impl Into<String>) -> Self {
        ChatMessage {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            sender: sender.into(),
            kind,
            timestamp: Utc::now(),
            metadata: MessageMetadata::default(),
            placeholder: false,
        }
    }

    pub fn user(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(MessageKind::User, sender, text)
    }

    pub fn npc(sender: impl Into<String>, text: impl Into<String>, citations: Vec<Citation>) -> Self {
        Self::new(MessageKind::Npc { citations }, sender, text)
    }

    pub fn moderator(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Moderator, MODERATOR_ID, text)
    }

    pub fn placeholder_for(sender: impl Into<String>) -> Self {
        let sender = sender.into();
        let kind = if sender == MODERATOR_ID {
            MessageKind::Moderator
        } else {
            MessageKind::Npc { citations: Vec::new() }
        };
        let mut message = Self::new(kind, sender, "generating…");
        message.placeholder = true;
        message
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_stage(mut self, stage: Option<String>) -> Self {
        self.metadata.stage = stage;
        self
    }

    pub fn is_user(&self) -> bool {
        matches!(self.kind, MessageKind::User)
    }

    pub fn is_moderator(&self) -> bool {
        matches!(self.kind, MessageKind::Moderator)
    }

    pub fn citations(&self) -> &[Citation] {
        match &self.kind {
            MessageKind::Npc { citations } => citations,
            _ => &[],
        }
    }
}
