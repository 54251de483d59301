use std::time::Duration;

use thiserror::Error;

use crate::turn::SpeakerRole;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("transport was not ready within {0:?}")]
    Timeout(Duration),
    #[error("gave up after {attempts} reconnection attempts")]
    Exhausted { attempts: u32 },
    #[error("not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("not your turn: {speaker_id} ({role}) holds the floor")]
    NotYourTurn { speaker_id: String, role: SpeakerRole },
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0} is not supported for this room")]
    Unsupported(&'static str),
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(e: std::io::Error) -> Self {
        ChatError::Persistence(e.to_string())
    }
}

/// Why the turn coordinator left the turn state alone.
///
/// Never surfaced to users: callers keep the previous state and log it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnAmbiguity {
    #[error("moderator message names no side or speaker")]
    NoModeratorCue,
    #[error("sender has no debate position")]
    SenderWithoutSide,
    #[error("sender is on the viewer's own side")]
    SameSide,
    #[error("neutral messages do not pass the turn")]
    NeutralSender,
    #[error("the side that would speak has no members")]
    EmptySide,
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
