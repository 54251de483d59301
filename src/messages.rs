use serde::{Deserialize, Serialize};

use crate::message::ChatMessage;
use crate::room::Room;
use crate::turn::NextSpeaker;

/// Client to server. On the wire: `{"event": "join-room", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String, identity: String },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String, identity: String },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: String,
        message: String,
        sender: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RequestNextMessage { room_id: String },
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom { .. } => "leave-room",
            ClientMessage::SendMessage { .. } => "send-message",
            ClientMessage::RequestNextMessage { .. } => "request-next-message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    NewMessage { room_id: String, message: ChatMessage },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        room_id: String,
        username: String,
        users_in_room: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        room_id: String,
        username: String,
        users_in_room: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    NextSpeakerUpdate { room_id: String, next_speaker: NextSpeaker },
    RoomCreated { room: Room },
    Error { message: String },
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::NewMessage { .. } => "new-message",
            ServerMessage::UserJoined { .. } => "user-joined",
            ServerMessage::UserLeft { .. } => "user-left",
            ServerMessage::NextSpeakerUpdate { .. } => "next-speaker-update",
            ServerMessage::RoomCreated { .. } => "room-created",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::SpeakerRole;

    #[test]
    fn join_room_parses_from_event_envelope() {
        let raw = r#"{"event":"join-room","data":{"roomId":"r1","identity":"alice"}}"#;
        let parsed: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::JoinRoom { room_id: "r1".into(), identity: "alice".into() }
        );
        assert_eq!(parsed.event_name(), "join-room");
    }

    #[test]
    fn send_message_id_is_optional() {
        let raw = r#"{"event":"send-message","data":{"roomId":"r1","message":"hi","sender":"alice"}}"#;
        match serde_json::from_str::<ClientMessage>(raw).unwrap() {
            ClientMessage::SendMessage { message_id, message, .. } => {
                assert!(message_id.is_none());
                assert_eq!(message, "hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn next_speaker_update_uses_camel_case_payload() {
        let update = ServerMessage::NextSpeakerUpdate {
            room_id: "r1".into(),
            next_speaker: NextSpeaker {
                speaker_id: "userA".into(),
                role: SpeakerRole::Pro,
                is_user: true,
            },
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["event"], "next-speaker-update");
        assert_eq!(json["data"]["roomId"], "r1");
        assert_eq!(json["data"]["nextSpeaker"]["speakerId"], "userA");
        assert_eq!(json["data"]["nextSpeaker"]["role"], "pro");
        assert_eq!(json["data"]["nextSpeaker"]["isUser"], true);
        assert_eq!(update.event_name(), "next-speaker-update");
    }

    #[test]
    fn unknown_event_is_rejected() {
        let raw = r#"{"event":"upload-file","data":{}}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }
}
