use async_trait::async_trait;
use log::{debug, info};

use crate::error::Result;
use crate::generation::GenerationRequest;
use crate::message::ChatMessage;
use crate::room::{DialogueType, Room};

use super::{DialogueRouter, RouterContext, SendMessage};

/// Open conversation: every user line may earn one automated reply.
pub struct FreeRouter {
    ctx: RouterContext,
}

impl FreeRouter {
    pub fn new(ctx: RouterContext) -> Self {
        FreeRouter { ctx }
    }

    /// Asks the generator for a reply and delivers it to the whole room.
    /// Failures are logged and dropped; the user can simply send again.
    async fn reply(ctx: RouterContext, room: Room) -> Option<ChatMessage> {
        let request = GenerationRequest::for_room(&room, ctx.history_window);
        let reply = match ctx.generator.generate(request).await {
            Ok(reply) => reply,
            Err(e) => {
                info!("No automated reply for room {}: {}", room.id, e);
                return None;
            }
        };
        let speaker = if room.participants.npcs.contains(reply.speaker_id.trim()) {
            reply.speaker_id.trim().to_string()
        } else {
            room.participants.npcs.iter().next()?.clone()
        };
        let message = ChatMessage::npc(speaker, reply.reply_text, reply.citations);
        ctx.deliver(&room.id, &message, None).await;
        Some(message)
    }
}

#[async_trait]
impl DialogueRouter for FreeRouter {
    fn dialogue_type(&self) -> DialogueType {
        DialogueType::Free
    }

    async fn handle_send(&self, origin: Option<&str>, request: SendMessage) -> Result<ChatMessage> {
        let mut room = self.ctx.load_room(&request.room_id).await?;
        let message = request.into_message()?;

        if !self.ctx.deliver(&room.id, &message, origin).await {
            return Ok(message);
        }
        if room.auto_conversation || room.participants.npcs.is_empty() {
            debug!("Room {} takes no automated replies", room.id);
            return Ok(message);
        }

        room.insert_message(message.clone());
        tokio::spawn(Self::reply(self.ctx.clone(), room));
        Ok(message)
    }
}
