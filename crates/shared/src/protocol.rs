use serde::{Deserialize, Serialize};

use crate::domain::{Intention, Participant, PlaceId, PlaceTally, Readiness, Room, RoomCode, SelectedPlace};

/// Tables whose changes are announced on the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreTable {
    Rooms,
    Participants,
    Selections,
    Votes,
    Intentions,
}

impl StoreTable {
    pub const ALL: [StoreTable; 5] = [
        StoreTable::Rooms,
        StoreTable::Participants,
        StoreTable::Selections,
        StoreTable::Votes,
        StoreTable::Intentions,
    ];
}

/// "Something changed in `table` for `room_code`". Carries no row data;
/// receivers re-read the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSignal {
    pub table: StoreTable,
    pub room_code: RoomCode,
}

/// Everything a client renders for a room, derived from one round of reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room: Room,
    pub participants: Vec<Participant>,
    pub readiness: Readiness,
    pub candidates: Vec<SelectedPlace>,
    pub tally: Vec<PlaceTally>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<PlaceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceReview {
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub relative_time_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceDetails {
    pub id: PlaceId,
    pub name: String,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub reviews: Vec<PlaceReview>,
    pub lat: f64,
    pub lon: f64,
}

impl PlaceDetails {
    /// The record shown when the lookup service has nothing better.
    pub fn minimal(place: &SelectedPlace) -> Self {
        Self {
            id: place.id.clone(),
            name: place
                .name
                .clone()
                .unwrap_or_else(|| "Unknown Location".to_string()),
            rating: None,
            reviews: Vec::new(),
            lat: place.lat,
            lon: place.lon,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentionsView {
    pub intentions: Vec<Intention>,
    pub merged: String,
}
