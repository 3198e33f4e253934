use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::geo::AreaPolygon;

pub const ROOM_CODE_LEN: usize = 6;
/// Room code alphabet; 0/O and 1/I are left out so codes survive being read aloud.
pub const ROOM_CODE_ALPHABET: &str = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Fallback label used when no username is known for the identity.
    pub fn short_label(&self) -> String {
        let simple = self.0.simple().to_string();
        format!("User {}", &simple[..5])
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaceId(pub String);

impl PlaceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Canonical (uppercase) room code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Parses user input: surrounding whitespace is dropped and letters are uppercased
    /// before validation.
    pub fn parse(value: &str) -> Result<Self, RoomCodeError> {
        let canonical = value.trim().to_ascii_uppercase();
        let found = canonical.chars().count();
        if found != ROOM_CODE_LEN {
            return Err(RoomCodeError::InvalidLength {
                expected: ROOM_CODE_LEN,
                found,
            });
        }
        if let Some((index, ch)) = canonical
            .chars()
            .enumerate()
            .find(|(_, ch)| !ROOM_CODE_ALPHABET.contains(*ch))
        {
            return Err(RoomCodeError::InvalidCharacter { ch, index });
        }
        Ok(Self(canonical))
    }

    /// Draws a fresh code uniformly from [`ROOM_CODE_ALPHABET`].
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let alphabet = ROOM_CODE_ALPHABET.as_bytes();
        let code = (0..ROOM_CODE_LEN)
            .map(|_| char::from(alphabet[rng.gen_range(0..alphabet.len())]))
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RoomCode {
    type Err = RoomCodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = RoomCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(value: RoomCode) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomCodeError {
    #[error("room code must be {expected} characters, got {found}")]
    InvalidLength { expected: usize, found: usize },
    #[error("invalid character '{ch}' at position {index}")]
    InvalidCharacter { ch: char, index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Lobby,
    AreaSelection,
    PlaceSelection,
    Voting,
    Resolved,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Lobby => "lobby",
            Phase::AreaSelection => "area_selection",
            Phase::PlaceSelection => "place_selection",
            Phase::Voting => "voting",
            Phase::Resolved => "resolved",
        }
    }

    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Lobby => Some(Phase::AreaSelection),
            Phase::AreaSelection => Some(Phase::PlaceSelection),
            Phase::PlaceSelection => Some(Phase::Voting),
            Phase::Voting => Some(Phase::Resolved),
            Phase::Resolved => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "lobby" => Ok(Phase::Lobby),
            "area_selection" => Ok(Phase::AreaSelection),
            "place_selection" => Ok(Phase::PlaceSelection),
            "voting" => Ok(Phase::Voting),
            "resolved" => Ok(Phase::Resolved),
            other => Err(UnknownPhase(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown room phase '{0}'")]
pub struct UnknownPhase(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub code: RoomCode,
    pub owner_id: UserId,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<AreaPolygon>,
}

impl Room {
    pub fn is_owner(&self, user_id: UserId) -> bool {
        self.owner_id == user_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub room_code: RoomCode,
    pub user_id: UserId,
    pub is_owner: bool,
    pub joined_at: DateTime<Utc>,
}

/// A place reference as proposed by a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedPlace {
    pub id: PlaceId,
    #[serde(default)]
    pub name: Option<String>,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub room_code: RoomCode,
    pub user_id: UserId,
    pub places: Vec<SelectedPlace>,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub room_code: RoomCode,
    pub user_id: UserId,
    pub place_id: PlaceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intention {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub task_description: String,
}

impl Intention {
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| self.user_id.short_label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub ready_count: usize,
    pub total_count: usize,
    pub all_ready: bool,
}

impl Readiness {
    pub fn new(ready_count: usize, total_count: usize) -> Self {
        Self {
            ready_count,
            total_count,
            all_ready: total_count > 0 && ready_count == total_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceTally {
    pub place_id: PlaceId,
    pub votes: usize,
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
