use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::Mutex;

use crate::error::{ChatError, Result};
use crate::generation::GenerationRequest;
use crate::message::{ChatMessage, MODERATOR_ID};
use crate::messages::ServerMessage;
use crate::room::{canonical_room_id, DialogueType, Room};
use crate::turn::{NextSpeaker, SpeakerRole, TurnCoordinator, TurnInput, TurnState};

use super::{DialogueRouter, RouterContext, SendMessage};

/// Structured debate. Holds the authoritative turn state for each room.
pub struct DebateRouter {
    ctx: RouterContext,
    turns: Mutex<HashMap<String, TurnState>>,
}

impl DebateRouter {
    pub fn new(ctx: RouterContext) -> Self {
        DebateRouter {
            ctx,
            turns: Mutex::new(HashMap::new()),
        }
    }

    pub async fn current_turn(&self, room_id: &str) -> Option<TurnState> {
        self.turns.lock().await.get(&canonical_room_id(room_id)).cloned()
    }

    /// Accepts a user's line only if the server agrees it is their turn.
    /// Rooms with no turn state yet take anyone.
    ///
    /// The turn lock is held from the check until the floor has moved on, so
    /// two submissions for the same turn cannot both get through.
    pub async fn submit_turn(&self, request: SendMessage) -> Result<ChatMessage> {
        let room = self.ctx.load_room(&request.room_id).await?;
        if room.dialogue_type != DialogueType::Debate {
            return Err(ChatError::Unsupported("turn submission"));
        }
        let mut turns = self.turns.lock().await;
        if let Some(state) = turns.get(&room.id) {
            if state.next_speaker_id != request.sender.trim() {
                return Err(ChatError::NotYourTurn {
                    speaker_id: state.next_speaker_id.clone(),
                    role: state.next_speaker_role,
                });
            }
        }
        let message = stamped(&room, request)?;
        if self.ctx.deliver(&room.id, &message, None).await {
            self.advance(&mut turns, &room, &message, None).await;
        }
        Ok(message)
    }

    /// Re-checks the floor after the room's membership changed.
    ///
    /// A holder who is still in the room keeps the floor under their current
    /// side. Otherwise the floor is recomputed from the last message, and
    /// failing that it goes back to the moderator.
    pub async fn reconcile(&self, room: &Room) {
        let mut turns = self.turns.lock().await;
        let Some(previous) = turns.get(&room.id).cloned() else {
            return;
        };
        let coordinator = TurnCoordinator::for_room(room);
        let stage = previous.current_stage.clone();
        let state = coordinator
            .resolve_explicit(&previous.next_speaker(), stage.clone(), None)
            .or_else(|| {
                let last = room.messages.iter().rev().find(|m| !m.placeholder)?;
                let input = TurnInput {
                    last_message: last,
                    explicit: None,
                    previous: Some(&previous),
                    viewer: None,
                };
                coordinator.next_turn(&input).ok()
            })
            .unwrap_or(TurnState {
                current_stage: stage,
                next_speaker_id: MODERATOR_ID.to_string(),
                next_speaker_role: SpeakerRole::Moderator,
                is_user_turn: false,
            });
        if state == previous {
            return;
        }
        info!("Room {} floor moves to {} after a membership change", room.id, state.next_speaker_id);
        turns.insert(room.id.clone(), state);
        self.announce(&turns, &room.id).await;
    }

    /// Recomputes the floor after `message` and tells the room.
    ///
    /// When the coordinator cannot decide, the old state stays and is
    /// repeated so late listeners converge.
    async fn advance(
        &self,
        turns: &mut HashMap<String, TurnState>,
        room: &Room,
        message: &ChatMessage,
        explicit: Option<&NextSpeaker>,
    ) {
        let coordinator = TurnCoordinator::for_room(room);
        let input = TurnInput {
            last_message: message,
            explicit,
            previous: turns.get(&room.id),
            viewer: None,
        };
        match coordinator.next_turn(&input) {
            Ok(state) => {
                debug!("Room {} floor goes to {} ({})", room.id, state.next_speaker_id, state.next_speaker_role);
                turns.insert(room.id.clone(), state);
            }
            Err(reason) => debug!("Turn in room {} unchanged: {}", room.id, reason),
        }
        self.announce(turns, &room.id).await;
    }

    async fn announce(&self, turns: &HashMap<String, TurnState>, room_id: &str) {
        if let Some(state) = turns.get(room_id) {
            let update = ServerMessage::NextSpeakerUpdate {
                room_id: room_id.to_string(),
                next_speaker: state.next_speaker(),
            };
            self.ctx.hub.broadcast_to_room(room_id, &update).await;
        }
    }
}

fn stamped(room: &Room, request: SendMessage) -> Result<ChatMessage> {
    let mut message = request.into_message()?;
    message.metadata.position = room.position_of(&message.sender);
    Ok(message)
}

#[async_trait]
impl DialogueRouter for DebateRouter {
    fn dialogue_type(&self) -> DialogueType {
        DialogueType::Debate
    }

    async fn handle_send(&self, origin: Option<&str>, request: SendMessage) -> Result<ChatMessage> {
        let room = self.ctx.load_room(&request.room_id).await?;
        let message = stamped(&room, request)?;

        let mut turns = self.turns.lock().await;
        if self.ctx.deliver(&room.id, &message, origin).await {
            self.advance(&mut turns, &room, &message, None).await;
        }
        Ok(message)
    }

    /// Generates the next scripted turn (moderator or npc) and delivers it
    /// to everyone, including the requester.
    async fn handle_request_next(&self, room_id: &str) -> Result<ChatMessage> {
        let room = self.ctx.load_room(room_id).await?;
        let reply = self
            .ctx
            .generator
            .generate(GenerationRequest::for_room(&room, self.ctx.history_window))
            .await?;

        let speaker = reply.speaker_id.trim();
        let by_moderator = reply.role.as_deref() == Some("moderator") || speaker == MODERATOR_ID;
        let message = if by_moderator {
            ChatMessage::moderator(reply.reply_text).with_stage(reply.stage)
        } else {
            let speaker = if room.participants.npcs.contains(speaker) {
                speaker.to_string()
            } else {
                room.participants
                    .npcs
                    .iter()
                    .next()
                    .cloned()
                    .ok_or_else(|| ChatError::Generation(format!("room {} has no npc to speak", room.id)))?
            };
            let mut message = ChatMessage::npc(speaker, reply.reply_text, reply.citations).with_stage(reply.stage);
            message.metadata.position = room.position_of(&message.sender);
            message
        };

        info!("Generated {} turn for room {}", message.sender, room.id);
        let mut turns = self.turns.lock().await;
        if self.ctx.deliver(&room.id, &message, None).await {
            self.advance(&mut turns, &room, &message, reply.next_speaker.as_ref()).await;
        }
        Ok(message)
    }

    async fn on_join(&self, room_id: &str, conn_id: &str) {
        if let Some(state) = self.current_turn(room_id).await {
            let update = ServerMessage::NextSpeakerUpdate {
                room_id: canonical_room_id(room_id),
                next_speaker: state.next_speaker(),
            };
            self.ctx.hub.send_to(conn_id, &update);
        }
    }
}
