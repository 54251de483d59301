//! Debate turn-taking.
//!
//! [`TurnCoordinator`] decides who holds the floor after a message, in
//! priority order: an explicit next-speaker record, then cues in a moderator
//! message, then pro/con alternation. When nothing matches it reports a
//! [`TurnAmbiguity`] and the caller keeps its previous state.
//!
//! The coordinator runs with or without a viewer. Without one (the server)
//! `is_user_turn` says whether the next speaker is a human participant. With
//! one (a client) it says whether that viewer may speak now.
//!
//! [`TurnTracker`] holds one client's flags. Signals are level-triggered: an
//! identical state arriving twice changes nothing.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::TurnAmbiguity;
use crate::message::{ChatMessage, MODERATOR_ID};
use crate::room::{DebatePositions, Position, Room};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerRole {
    Moderator,
    Pro,
    Con,
    Neutral,
}

impl SpeakerRole {
    pub fn side(self) -> Option<Position> {
        match self {
            SpeakerRole::Moderator => None,
            SpeakerRole::Pro => Some(Position::Pro),
            SpeakerRole::Con => Some(Position::Con),
            SpeakerRole::Neutral => Some(Position::Neutral),
        }
    }
}

impl From<Position> for SpeakerRole {
    fn from(side: Position) -> Self {
        match side {
            Position::Pro => SpeakerRole::Pro,
            Position::Con => SpeakerRole::Con,
            Position::Neutral => SpeakerRole::Neutral,
        }
    }
}

impl fmt::Display for SpeakerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeakerRole::Moderator => write!(f, "moderator"),
            SpeakerRole::Pro => write!(f, "pro"),
            SpeakerRole::Con => write!(f, "con"),
            SpeakerRole::Neutral => write!(f, "neutral"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextSpeaker {
    pub speaker_id: String,
    pub role: SpeakerRole,
    pub is_user: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    pub next_speaker_id: String,
    pub next_speaker_role: SpeakerRole,
    pub is_user_turn: bool,
}

impl TurnState {
    /// Wire form of a viewer-less state.
    pub fn next_speaker(&self) -> NextSpeaker {
        NextSpeaker {
            speaker_id: self.next_speaker_id.clone(),
            role: self.next_speaker_role,
            is_user: self.is_user_turn,
        }
    }
}

pub struct TurnInput<'a> {
    pub last_message: &'a ChatMessage,
    pub explicit: Option<&'a NextSpeaker>,
    pub previous: Option<&'a TurnState>,
    pub viewer: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cue {
    Speaker(String),
    Side(Position),
}

struct CueGrammar {
    handoff: Regex,
    possessive: Regex,
    side_phrase: Regex,
    bare_side: Regex,
}

fn grammar() -> &'static CueGrammar {
    static GRAMMAR: OnceLock<CueGrammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| CueGrammar {
        handoff: Regex::new(
            r"(?i)\b(?:next\s+(?:up\s+)?(?:is|will\s+be|we\s+have)|over\s+to|floor\s+to|turn\s+(?:goes\s+)?to|call\s+on|hear\s+from)\s+(?:the\s+)?([\w-]+)",
        )
        .unwrap_or_else(|e| unreachable!("handoff pattern: {e}")),
        possessive: Regex::new(r"(?i)([\w-]+)['’]s\s+turn")
            .unwrap_or_else(|e| unreachable!("possessive pattern: {e}")),
        side_phrase: Regex::new(
            r"(?i)\b(?:(pro|con|affirmative|negative|opposition|neutral)\s+(?:side|team|camp|position)\b|now\s+(?:for|to)\s+the\s+(pro|con|affirmative|negative|opposition|neutral)\b)",
        )
        .unwrap_or_else(|e| unreachable!("side pattern: {e}")),
        bare_side: Regex::new(r"(?i)\b(pro|con|affirmative|negative|opposition)\b")
            .unwrap_or_else(|e| unreachable!("bare side pattern: {e}")),
    })
}

fn side_word(word: &str) -> Option<Position> {
    match word.to_ascii_lowercase().as_str() {
        "pro" | "affirmative" => Some(Position::Pro),
        "con" | "negative" | "opposition" => Some(Position::Con),
        "neutral" => Some(Position::Neutral),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct TurnCoordinator {
    positions: DebatePositions,
    users: BTreeSet<String>,
    everyone: BTreeSet<String>,
}

impl TurnCoordinator {
    pub fn new(positions: DebatePositions, users: BTreeSet<String>) -> Self {
        let everyone = positions
            .pro
            .iter()
            .chain(&positions.con)
            .chain(&positions.neutral)
            .chain(&users)
            .cloned()
            .collect();
        Self { positions, users, everyone }
    }

    pub fn for_room(room: &Room) -> Self {
        Self::new(room.positions.clone().unwrap_or_default(), room.participants.users.clone())
    }

    pub fn next_turn(&self, input: &TurnInput<'_>) -> Result<TurnState, TurnAmbiguity> {
        let stage = input
            .last_message
            .metadata
            .stage
            .clone()
            .or_else(|| input.previous.and_then(|p| p.current_stage.clone()));

        if let Some(explicit) = input.explicit {
            match self.resolve_explicit(explicit, stage.clone(), input.viewer) {
                Some(state) => return Ok(state),
                None => debug!("Ignoring next-speaker record for unknown {}", explicit.speaker_id),
            }
        }
        if input.last_message.is_moderator() {
            let cue = self
                .moderator_cue(&input.last_message.text)
                .ok_or(TurnAmbiguity::NoModeratorCue)?;
            return self.resolve_cue(cue, stage, input.viewer);
        }
        self.alternate(&input.last_message.sender, stage, input.viewer)
    }

    /// Adopts an explicit next-speaker record. The speaker must be the
    /// moderator or hold a side; role and humanity come from the room, not
    /// the record. `None` for anyone else.
    pub fn resolve_explicit(&self, next: &NextSpeaker, stage: Option<String>, viewer: Option<&str>) -> Option<TurnState> {
        let speaker = next.speaker_id.trim();
        let role = if speaker == MODERATOR_ID {
            SpeakerRole::Moderator
        } else {
            self.position_of(speaker)?.into()
        };
        let is_user_turn = match viewer {
            None => self.is_human(speaker),
            Some(viewer) => speaker == viewer && self.is_human(viewer),
        };
        Some(TurnState {
            current_stage: stage,
            next_speaker_id: speaker.to_string(),
            next_speaker_role: role,
            is_user_turn,
        })
    }

    pub fn position_of(&self, id: &str) -> Option<Position> {
        self.positions.position_of(id)
    }

    fn is_human(&self, id: &str) -> bool {
        self.users.contains(id)
    }

    /// A human on the side gets the floor before an automated member.
    fn floor_holder(&self, side: Position) -> Option<&String> {
        let members = self.positions.members(side);
        members.iter().find(|m| self.is_human(m)).or_else(|| members.first())
    }

    fn resolve_participant(&self, token: &str) -> Option<Cue> {
        if token.eq_ignore_ascii_case(MODERATOR_ID) {
            return Some(Cue::Speaker(MODERATOR_ID.to_string()));
        }
        self.everyone
            .iter()
            .find(|id| id.eq_ignore_ascii_case(token))
            .map(|id| Cue::Speaker(id.clone()))
    }

    fn moderator_cue(&self, text: &str) -> Option<Cue> {
        let grammar = grammar();

        let handoff = grammar
            .handoff
            .captures_iter(text)
            .chain(grammar.possessive.captures_iter(text))
            .filter_map(|caps| {
                let token = caps.get(1)?;
                let cue = self
                    .resolve_participant(token.as_str())
                    .or_else(|| side_word(token.as_str()).map(Cue::Side))?;
                Some((token.start(), cue))
            })
            .max_by_key(|(start, _)| *start);
        if let Some((_, cue)) = handoff {
            return Some(cue);
        }

        let side = grammar
            .side_phrase
            .captures_iter(text)
            .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
            .filter_map(|word| side_word(word.as_str()))
            .last();
        if let Some(side) = side {
            return Some(Cue::Side(side));
        }

        let mentions = grammar
            .bare_side
            .find_iter(text)
            .filter_map(|word| side_word(word.as_str()).map(Cue::Side))
            .chain(
                text.split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
                    .filter(|token| !token.is_empty())
                    .filter_map(|token| match self.resolve_participant(token) {
                        Some(Cue::Speaker(id)) if self.is_human(&id) => Some(Cue::Speaker(id)),
                        _ => None,
                    }),
            );
        let mut bare: Vec<Cue> = Vec::new();
        for cue in mentions {
            if !bare.contains(&cue) {
                bare.push(cue);
            }
        }
        match bare.len() {
            1 => bare.pop(),
            _ => None,
        }
    }

    fn resolve_cue(&self, cue: Cue, stage: Option<String>, viewer: Option<&str>) -> Result<TurnState, TurnAmbiguity> {
        match cue {
            Cue::Speaker(id) => {
                let role = if id == MODERATOR_ID {
                    SpeakerRole::Moderator
                } else {
                    self.position_of(&id).map_or(SpeakerRole::Neutral, SpeakerRole::from)
                };
                let is_user_turn = match viewer {
                    None => self.is_human(&id),
                    Some(viewer) => viewer == id && self.is_human(viewer),
                };
                Ok(TurnState {
                    current_stage: stage,
                    next_speaker_id: id,
                    next_speaker_role: role,
                    is_user_turn,
                })
            }
            Cue::Side(side) => self.give_floor(side, stage, viewer),
        }
    }

    fn alternate(&self, sender: &str, stage: Option<String>, viewer: Option<&str>) -> Result<TurnState, TurnAmbiguity> {
        let sender_side = self.position_of(sender).ok_or(TurnAmbiguity::SenderWithoutSide)?;
        let next_side = sender_side.opposite().ok_or(TurnAmbiguity::NeutralSender)?;
        if let Some(viewer) = viewer {
            if self.position_of(viewer) == Some(sender_side) {
                return Err(TurnAmbiguity::SameSide);
            }
        }
        self.give_floor(next_side, stage, viewer)
    }

    fn give_floor(&self, side: Position, stage: Option<String>, viewer: Option<&str>) -> Result<TurnState, TurnAmbiguity> {
        let viewer_speaks = viewer.filter(|v| self.is_human(v) && self.position_of(v) == Some(side));
        let speaker = match viewer_speaks {
            Some(viewer) => viewer.to_string(),
            None => self.floor_holder(side).cloned().ok_or(TurnAmbiguity::EmptySide)?,
        };
        let is_user_turn = match viewer {
            None => self.is_human(&speaker),
            Some(_) => viewer_speaks.is_some(),
        };
        Ok(TurnState {
            current_stage: stage,
            next_speaker_id: speaker,
            next_speaker_role: side.into(),
            is_user_turn,
        })
    }
}

/// One client's view of the debate floor.
#[derive(Debug, Clone)]
pub struct TurnTracker {
    coordinator: TurnCoordinator,
    viewer: String,
    state: Option<TurnState>,
    my_turn: bool,
}

impl TurnTracker {
    pub fn new(coordinator: TurnCoordinator, viewer: impl Into<String>) -> Self {
        Self {
            coordinator,
            viewer: viewer.into(),
            state: None,
            my_turn: false,
        }
    }

    pub fn state(&self) -> Option<&TurnState> {
        self.state.as_ref()
    }

    pub fn is_my_turn(&self) -> bool {
        self.my_turn
    }

    /// Returns whether anything changed.
    pub fn apply_signal(&mut self, next: &NextSpeaker) -> bool {
        let stage = self.state.as_ref().and_then(|s| s.current_stage.clone());
        match self.coordinator.resolve_explicit(next, stage, Some(&self.viewer)) {
            Some(state) => self.adopt(state),
            None => {
                debug!("Ignoring next-speaker update for unknown {}", next.speaker_id);
                false
            }
        }
    }

    pub fn observe(&mut self, message: &ChatMessage) -> bool {
        let input = TurnInput {
            last_message: message,
            explicit: None,
            previous: self.state.as_ref(),
            viewer: Some(&self.viewer),
        };
        match self.coordinator.next_turn(&input) {
            Ok(state) => self.adopt(state),
            Err(reason) => {
                debug!("Turn unchanged after message {}: {}", message.id, reason);
                false
            }
        }
    }

    /// Clears the local flag before the server confirms, so one turn yields one submission.
    pub fn mark_submitted(&mut self) {
        self.my_turn = false;
    }

    /// Gives the floor back after a submission that never reached the
    /// server, so the user can try again.
    pub fn restore_turn(&mut self) {
        self.my_turn = self.state.as_ref().is_some_and(|s| s.is_user_turn);
    }

    /// Adopts the server's view after a rejected submission.
    pub fn correct(&mut self, speaker_id: &str, role: SpeakerRole) {
        let next = NextSpeaker {
            speaker_id: speaker_id.to_string(),
            role,
            is_user: false,
        };
        let stage = self.state.as_ref().and_then(|s| s.current_stage.clone());
        self.my_turn = false;
        if let Some(state) = self.coordinator.resolve_explicit(&next, stage, Some(&self.viewer)) {
            self.state = Some(state);
        }
    }

    fn adopt(&mut self, state: TurnState) -> bool {
        if self.state.as_ref() == Some(&state) {
            return false;
        }
        self.my_turn = state.is_user_turn;
        self.state = Some(state);
        true
    }
}
