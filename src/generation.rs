use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RetryPolicy;
use crate::error::{ChatError, Result};
use crate::message::{ChatMessage, Citation};
use crate::retry::RetryingRequestClient;
use crate::room::{DialogueType, Position, Room};
use crate::turn::NextSpeaker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantKind {
    User,
    Npc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDescriptor {
    pub id: String,
    pub kind: ParticipantKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub room_id: String,
    pub topic: String,
    pub dialogue_type: DialogueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderator_style: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub participants: Vec<ParticipantDescriptor>,
}

impl GenerationRequest {
    /// Context for the next reply: the last `history` messages plus every
    /// participant with their debate side.
    pub fn for_room(room: &Room, history: usize) -> Self {
        let participants = room
            .participants
            .iter()
            .map(|id| ParticipantDescriptor {
                id: id.clone(),
                kind: if room.participants.is_user(id) {
                    ParticipantKind::User
                } else {
                    ParticipantKind::Npc
                },
                position: room.position_of(id),
            })
            .collect();
        GenerationRequest {
            room_id: room.id.clone(),
            topic: room.title.clone(),
            dialogue_type: room.dialogue_type,
            moderator_style: room.moderator_style.clone(),
            messages: room
                .recent_messages(history)
                .iter()
                .filter(|m| !m.placeholder)
                .cloned()
                .collect(),
            participants,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReply {
    pub reply_text: String,
    #[serde(default)]
    pub speaker_id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    /// Who speaks after this reply, when the service decides it.
    #[serde(default)]
    pub next_speaker: Option<NextSpeaker>,
}

/// The content-generation collaborator.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationReply>;
}

pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    retry: RetryingRequestClient,
}

impl HttpGenerator {
    pub fn new(endpoint: impl Into<String>, max_attempts: u32) -> Self {
        let policy = RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        };
        Self::with_policy(endpoint, policy)
    }

    pub fn with_policy(endpoint: impl Into<String>, policy: RetryPolicy) -> Self {
        HttpGenerator {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            retry: RetryingRequestClient::new(policy),
        }
    }

    async fn call(&self, request: &GenerationRequest) -> Result<GenerationReply> {
        let resp = self.client.post(&self.endpoint).json(request).send().await?;
        if !resp.status().is_success() {
            return Err(ChatError::Generation(format!(
                "{} returned {}",
                self.endpoint,
                resp.status()
            )));
        }
        let reply: GenerationReply = resp.json().await?;
        if reply.reply_text.trim().is_empty() {
            return Err(ChatError::Generation("empty reply".into()));
        }
        Ok(reply)
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationReply> {
        self.retry
            .execute(|| self.call(&request))
            .await
            .map_err(|e| match e {
                ChatError::Generation(_) => e,
                other => ChatError::Generation(other.to_string()),
            })
    }
}

/// Stands in when no generation endpoint is configured.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    async fn generate(&self, _request: GenerationRequest) -> Result<GenerationReply> {
        Err(ChatError::Generation("no generator configured".into()))
    }
}
