use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::api::PostMessage;
use crate::error::{ChatError, Result};
use crate::message::ChatMessage;
use crate::room::{CreateRoomRequest, ParticipantUpdate, Room};
use crate::turn::SpeakerRole;

use super::cache::RoomSource;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    speaker_id: Option<String>,
    #[serde(default)]
    role: Option<SpeakerRole>,
}

/// Request/response path to the room server, used for room lifecycle and
/// whenever the real-time channel is down.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        RestClient {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn create_room(&self, request: &CreateRoomRequest) -> Result<Room> {
        let resp = self.client.post(self.url("/api/rooms")).json(request).send().await?;
        decode(resp).await
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Option<Room>> {
        let resp = self
            .client
            .get(self.url(&format!("/api/rooms/{}", room_id.trim())))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(resp).await.map(Some)
    }

    pub async fn messages(&self, room_id: &str) -> Result<Vec<ChatMessage>> {
        let resp = self
            .client
            .get(self.url(&format!("/api/rooms/{}/messages", room_id.trim())))
            .send()
            .await?;
        decode(resp).await
    }

    /// Idempotent when `body.message_id` is set.
    pub async fn append_message(&self, room_id: &str, body: &PostMessage) -> Result<ChatMessage> {
        let resp = self
            .client
            .post(self.url(&format!("/api/rooms/{}/messages", room_id.trim())))
            .json(body)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn update_participants(&self, room_id: &str, update: &ParticipantUpdate) -> Result<Room> {
        let resp = self
            .client
            .put(self.url(&format!("/api/rooms/{}/participants", room_id.trim())))
            .json(update)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn request_next(&self, room_id: &str) -> Result<ChatMessage> {
        let resp = self
            .client
            .post(self.url(&format!("/api/rooms/{}/next", room_id.trim())))
            .send()
            .await?;
        decode(resp).await
    }

    /// Fails with [`ChatError::NotYourTurn`] naming the current speaker when
    /// the server disagrees about whose turn it is.
    pub async fn submit_turn(&self, room_id: &str, body: &PostMessage) -> Result<ChatMessage> {
        let resp = self
            .client
            .post(self.url(&format!("/api/rooms/{}/turns", room_id.trim())))
            .json(body)
            .send()
            .await?;
        decode(resp).await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let body: ErrorBody = resp.json().await.unwrap_or(ErrorBody {
        error: status.to_string(),
        speaker_id: None,
        role: None,
    });
    Err(match (status, body) {
        (StatusCode::BAD_REQUEST, body) => ChatError::Validation(body.error),
        (StatusCode::NOT_FOUND, body) => ChatError::RoomNotFound(body.error),
        (
            StatusCode::CONFLICT,
            ErrorBody {
                speaker_id: Some(speaker_id),
                role: Some(role),
                ..
            },
        ) => ChatError::NotYourTurn { speaker_id, role },
        (StatusCode::BAD_GATEWAY, body) => ChatError::Generation(body.error),
        (status, body) => ChatError::Transport(format!("{status}: {}", body.error)),
    })
}

#[async_trait]
impl RoomSource for RestClient {
    async fn fetch_room(&self, room_id: &str) -> Result<Option<Room>> {
        self.get_room(room_id).await
    }

    async fn fetch_message_log(&self, room_id: &str) -> Result<Vec<ChatMessage>> {
        match self.messages(room_id).await {
            Err(ChatError::RoomNotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn room_json(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "title": "Chat",
            "dialogueType": "free",
            "participants": {"users": ["alice"], "npcs": ["sage"]},
            "autoConversation": false,
            "messages": [],
            "lastActivity": "2026-01-01T00:00:00Z"
        })
    }

    #[tokio::test]
    async fn missing_room_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/rooms/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "room gone not found"})))
            .mount(&server)
            .await;

        let client = RestClient::new(server.uri());
        assert!(client.get_room("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetches_room_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/rooms/r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(room_json("r1")))
            .mount(&server)
            .await;

        let client = RestClient::new(format!("{}/", server.uri()));
        let room = client.fetch_room(" r1 ").await.unwrap().unwrap();
        assert_eq!(room.id, "r1");
        assert!(room.participants.is_user("alice"));
    }

    #[tokio::test]
    async fn conflict_names_current_speaker() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/rooms/r1/turns"))
            .and(body_partial_json(json!({"sender": "userA"})))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error": "not your turn",
                "speakerId": "userB",
                "role": "con"
            })))
            .mount(&server)
            .await;

        let client = RestClient::new(server.uri());
        let body = PostMessage {
            sender: "userA".into(),
            text: "Point".into(),
            message_id: None,
        };
        match client.submit_turn("r1", &body).await.unwrap_err() {
            ChatError::NotYourTurn { speaker_id, role } => {
                assert_eq!(speaker_id, "userB");
                assert_eq!(role, SpeakerRole::Con);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn validation_errors_carry_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/rooms"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "at least one participant is required"})),
            )
            .mount(&server)
            .await;

        let client = RestClient::new(server.uri());
        let err = client
            .create_room(&CreateRoomRequest {
                title: "Empty".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(msg) if msg.contains("participant")));
    }

    #[tokio::test]
    async fn server_errors_are_transport_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = RestClient::new(server.uri());
        assert!(matches!(client.get_room("r1").await, Err(ChatError::Transport(_))));
    }
}
