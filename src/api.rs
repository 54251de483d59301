//! HTTP surface: the WebSocket upgrade at `/ws`, the room REST API under
//! `/api/rooms`, and `/health`.

use std::convert::Infallible;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use warp::http::StatusCode;
use warp::reply::{Reply, Response};
use warp::{Filter, Rejection};

use crate::error::{ChatError, Result};
use crate::messages::ServerMessage;
use crate::room::{CreateRoomRequest, DialogueType, ParticipantUpdate, Room};
use crate::router::SendMessage;
use crate::server::Server;

/// Body of `POST /api/rooms/{id}/messages` and `POST /api/rooms/{id}/turns`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessage {
    pub sender: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl PostMessage {
    fn into_request(self, room_id: String) -> SendMessage {
        SendMessage {
            room_id,
            text: self.text,
            sender: self.sender,
            message_id: self.message_id,
        }
    }
}

pub fn status_for(error: &ChatError) -> StatusCode {
    match error {
        ChatError::Validation(_) | ChatError::Unsupported(_) | ChatError::Serialization(_) => StatusCode::BAD_REQUEST,
        ChatError::RoomNotFound(_) => StatusCode::NOT_FOUND,
        ChatError::NotYourTurn { .. } => StatusCode::CONFLICT,
        ChatError::Generation(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(error: &ChatError) -> Response {
    let body = match error {
        ChatError::NotYourTurn { speaker_id, role } => json!({
            "error": error.to_string(),
            "speakerId": speaker_id,
            "role": role,
        }),
        _ => json!({ "error": error.to_string() }),
    };
    warp::reply::with_status(warp::reply::json(&body), status_for(error)).into_response()
}

fn into_reply<T: Serialize>(result: Result<T>, success: StatusCode) -> Response {
    match result {
        Ok(body) => warp::reply::with_status(warp::reply::json(&body), success).into_response(),
        Err(e) => {
            if status_for(&e).is_server_error() {
                warn!("Request failed: {}", e);
            }
            error_reply(&e)
        }
    }
}

fn with_server(server: Server) -> impl Filter<Extract = (Server,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

/// Every route the server exposes, ready for `warp::serve`.
pub fn routes(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let ws = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_server(server.clone()))
        .map(|ws: warp::ws::Ws, server: Server| {
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket).await;
            })
        });

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server.clone()))
        .map(|server: Server| {
            warp::reply::json(&json!({
                "status": "ok",
                "connections": server.registry().len(),
            }))
        });

    ws.or(health).or(rest(server))
}

pub fn rest(server: Server) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let create = warp::path!("api" / "rooms")
        .and(warp::post())
        .and(warp::body::json::<CreateRoomRequest>())
        .and(with_server(server.clone()))
        .then(create_room);

    let get = warp::path!("api" / "rooms" / String)
        .and(warp::get())
        .and(with_server(server.clone()))
        .then(get_room);

    let list_messages = warp::path!("api" / "rooms" / String / "messages")
        .and(warp::get())
        .and(with_server(server.clone()))
        .then(|room_id: String, server: Server| async move {
            into_reply(server.store().messages(&room_id).await, StatusCode::OK)
        });

    let post_message = warp::path!("api" / "rooms" / String / "messages")
        .and(warp::post())
        .and(warp::body::json::<PostMessage>())
        .and(with_server(server.clone()))
        .then(post_message);

    let update = warp::path!("api" / "rooms" / String / "participants")
        .and(warp::put())
        .and(warp::body::json::<ParticipantUpdate>())
        .and(with_server(server.clone()))
        .then(update_participants);

    let next = warp::path!("api" / "rooms" / String / "next")
        .and(warp::post())
        .and(with_server(server.clone()))
        .then(request_next);

    let turns = warp::path!("api" / "rooms" / String / "turns")
        .and(warp::post())
        .and(warp::body::json::<PostMessage>())
        .and(with_server(server))
        .then(|room_id: String, body: PostMessage, server: Server| async move {
            let result = server.routers().debate.submit_turn(body.into_request(room_id)).await;
            into_reply(result, StatusCode::CREATED)
        });

    create
        .or(get)
        .unify()
        .or(list_messages)
        .unify()
        .or(post_message)
        .unify()
        .or(update)
        .unify()
        .or(next)
        .unify()
        .or(turns)
        .unify()
        .recover(handle_rejection)
}

async fn create_room(request: CreateRoomRequest, server: Server) -> Response {
    let result = async {
        let room = request.into_room()?;
        let room = server.store().create_room(room).await?;
        info!("Created {} room {} ({})", room.dialogue_type, room.id, room.title);
        let notice = ServerMessage::RoomCreated { room: room.clone() };
        server.hub().broadcast_to_all(&notice).await;
        Ok::<Room, ChatError>(room)
    }
    .await;
    into_reply(result, StatusCode::CREATED)
}

async fn get_room(room_id: String, server: Server) -> Response {
    let result = server
        .store()
        .get_room(&room_id)
        .await
        .and_then(|room| room.ok_or_else(|| ChatError::RoomNotFound(room_id.trim().to_string())));
    into_reply(result, StatusCode::OK)
}

async fn post_message(room_id: String, body: PostMessage, server: Server) -> Response {
    let result = async {
        let room = server
            .store()
            .get_room(&room_id)
            .await?
            .ok_or_else(|| ChatError::RoomNotFound(room_id.trim().to_string()))?;
        server
            .routers()
            .for_type(room.dialogue_type)
            .handle_send(None, body.into_request(room.id))
            .await
    }
    .await;
    into_reply(result, StatusCode::CREATED)
}

async fn update_participants(room_id: String, update: ParticipantUpdate, server: Server) -> Response {
    let result = server.store().update_participants(&room_id, update).await;
    if let Ok(room) = &result {
        if room.dialogue_type == DialogueType::Debate {
            server.routers().debate.reconcile(room).await;
        }
    }
    into_reply(result, StatusCode::OK)
}

async fn request_next(room_id: String, server: Server) -> Response {
    let result = async {
        let room = server
            .store()
            .get_room(&room_id)
            .await?
            .ok_or_else(|| ChatError::RoomNotFound(room_id.trim().to_string()))?;
        if room.dialogue_type != DialogueType::Debate {
            return Err(ChatError::Unsupported("request-next-message"));
        }
        server.routers().for_type(room.dialogue_type).handle_request_next(&room.id).await
    }
    .await;
    into_reply(result, StatusCode::CREATED)
}

async fn handle_rejection(rejection: Rejection) -> std::result::Result<Response, Rejection> {
    if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        let body = json!({ "error": format!("invalid request body: {e}") });
        return Ok(warp::reply::with_status(warp::reply::json(&body), StatusCode::BAD_REQUEST).into_response());
    }
    Err(rejection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::DisabledGenerator;
    use crate::room::Position;
    use crate::store::MemoryStore;
    use crate::turn::SpeakerRole;
    use std::sync::Arc;
    use warp::hyper::body::Bytes;

    fn server() -> Server {
        Server::new(Arc::new(MemoryStore::new()), Arc::new(DisabledGenerator), 10)
    }

    async fn create(server: &Server, body: serde_json::Value) -> warp::http::Response<Bytes> {
        warp::test::request()
            .method("POST")
            .path("/api/rooms")
            .json(&body)
            .reply(&routes(server.clone()))
            .await
    }

    fn json_of(resp: &warp::http::Response<Bytes>) -> serde_json::Value {
        serde_json::from_slice(resp.body()).unwrap()
    }

    #[tokio::test]
    async fn create_then_fetch_room() {
        let server = server();
        let resp = create(
            &server,
            json!({"title": "Lunch", "users": ["alice"], "npcs": ["chef"]}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let id = json_of(&resp)["id"].as_str().unwrap().to_string();

        let fetched = warp::test::request()
            .path(&format!("/api/rooms/{id}"))
            .reply(&routes(server.clone()))
            .await;
        assert_eq!(fetched.status(), StatusCode::OK);
        let room: Room = serde_json::from_slice(fetched.body()).unwrap();
        assert_eq!(room.title, "Lunch");
    }

    #[tokio::test]
    async fn empty_participants_are_rejected_without_side_effects() {
        let server = server();
        let resp = create(&server, json!({"title": "Nobody", "users": [], "npcs": []})).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json_of(&resp)["error"].as_str().unwrap().contains("participant"));

        let missing_title = create(&server, json!({"title": "  ", "users": ["alice"]})).await;
        assert_eq!(missing_title.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_room_is_404() {
        let resp = warp::test::request()
            .path("/api/rooms/nope")
            .reply(&routes(server()))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn appending_twice_with_same_id_stores_once() {
        let server = server();
        let resp = create(
            &server,
            json!({"title": "Lunch", "users": ["alice"], "npcs": ["chef"], "autoConversation": true}),
        )
        .await;
        let id = json_of(&resp)["id"].as_str().unwrap().to_string();

        for _ in 0..2 {
            let resp = warp::test::request()
                .method("POST")
                .path(&format!("/api/rooms/{id}/messages"))
                .json(&json!({"sender": "alice", "text": "soup?", "messageId": "m-1"}))
                .reply(&routes(server.clone()))
                .await;
            assert_eq!(resp.status(), StatusCode::CREATED);
        }

        let log = warp::test::request()
            .path(&format!("/api/rooms/{id}/messages"))
            .reply(&routes(server.clone()))
            .await;
        let messages: Vec<serde_json::Value> = serde_json::from_slice(log.body()).unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn out_of_turn_submission_is_409_naming_the_speaker() {
        let server = server();
        let resp = create(
            &server,
            json!({
                "title": "Homework",
                "dialogueType": "debate",
                "users": ["userA", "userB"],
                "positions": {"userA": "pro", "userB": "con"}
            }),
        )
        .await;
        let id = json_of(&resp)["id"].as_str().unwrap().to_string();

        let first = warp::test::request()
            .method("POST")
            .path(&format!("/api/rooms/{id}/turns"))
            .json(&json!({"sender": "userA", "text": "Ban it."}))
            .reply(&routes(server.clone()))
            .await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let again = warp::test::request()
            .method("POST")
            .path(&format!("/api/rooms/{id}/turns"))
            .json(&json!({"sender": "userA", "text": "And another thing."}))
            .reply(&routes(server.clone()))
            .await;
        assert_eq!(again.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = serde_json::from_slice(again.body()).unwrap();
        assert_eq!(body["speakerId"], "userB");
        assert_eq!(body["role"], serde_json::to_value(SpeakerRole::Con).unwrap());
    }

    #[tokio::test]
    async fn participant_update_keeps_sides() {
        let server = server();
        let resp = create(
            &server,
            json!({
                "title": "Homework",
                "dialogueType": "debate",
                "users": ["userA"],
                "npcs": ["npc1"],
                "positions": {"userA": "pro", "npc1": "con"}
            }),
        )
        .await;
        let id = json_of(&resp)["id"].as_str().unwrap().to_string();

        let resp = warp::test::request()
            .method("PUT")
            .path(&format!("/api/rooms/{id}/participants"))
            .json(&json!({"npcs": ["npc1", "npc2"]}))
            .reply(&routes(server.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let room: Room = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(room.position_of("userA"), Some(Position::Pro));
        assert_eq!(room.position_of("npc2"), Some(Position::Neutral));
    }

    #[tokio::test]
    async fn removing_the_turn_holder_moves_the_floor() {
        let server = server();
        let resp = create(
            &server,
            json!({
                "title": "Cars",
                "dialogueType": "debate",
                "users": ["userA", "userB"],
                "npcs": ["npc1"],
                "positions": {"userA": "pro", "userB": "con", "npc1": "con"}
            }),
        )
        .await;
        let id = json_of(&resp)["id"].as_str().unwrap().to_string();

        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/api/rooms/{id}/turns"))
            .json(&json!({"sender": "userA", "text": "Cars must go"}))
            .reply(&routes(server.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let state = server.routers().debate.current_turn(&id).await.unwrap();
        assert_eq!(state.next_speaker_id, "userB");

        let resp = warp::test::request()
            .method("PUT")
            .path(&format!("/api/rooms/{id}/participants"))
            .json(&json!({"users": ["userA"], "positions": {"userA": "pro", "npc1": "con"}}))
            .reply(&routes(server.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let state = server.routers().debate.current_turn(&id).await.unwrap();
        assert_eq!(state.next_speaker_id, "npc1");
        assert_eq!(state.next_speaker_role, SpeakerRole::Con);
        assert!(!state.is_user_turn);
    }

    #[tokio::test]
    async fn next_without_generator_is_bad_gateway() {
        let server = server();
        let resp = create(
            &server,
            json!({"title": "T", "dialogueType": "debate", "users": ["userA"], "npcs": ["npc1"]}),
        )
        .await;
        let id = json_of(&resp)["id"].as_str().unwrap().to_string();
        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/api/rooms/{id}/next"))
            .reply(&routes(server.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let resp = warp::test::request().path("/health").reply(&routes(server())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_of(&resp)["status"], "ok");
    }
}
