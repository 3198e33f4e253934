//! Room coordination: how independent clients sharing one store move a room
//! from creation to an agreed destination.
//!
//! The coordinator keeps no state of its own. Every operation reads what it
//! needs from the [`SharedStore`], and every derived value (readiness,
//! candidates, winner) is recomputed from fresh reads.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::{
        Intention, Phase, PlaceId, PlaceTally, Readiness, Room, RoomCode, SelectedPlace, UserId,
    },
    geo::AreaPolygon,
    protocol::RoomSnapshot,
};
use tracing::{debug, info, warn};

pub mod codes;
pub mod debounce;
pub mod derive;
pub mod error;
pub mod store;
pub mod subscription;
pub mod watcher;

pub use codes::{RandomRoomCodes, RoomCodeSource};
pub use debounce::{AreaEditor, Debouncer};
pub use error::{CoordinatorError, Result};
pub use store::{InsertOutcome, JoinOutcome, SharedStore};
pub use subscription::{subscribe, ChangeFilter, Subscription};
pub use watcher::{RoomEvent, RoomWatcher, Stage};

/// A colliding code is regenerated once; a second collision is fatal.
const CREATE_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct RoomRules {
    pub capacity: usize,
    pub max_selections: usize,
    pub max_area_km2: f64,
    pub area_debounce: Duration,
}

impl Default for RoomRules {
    fn default() -> Self {
        Self {
            capacity: 3,
            max_selections: 2,
            max_area_km2: 5.0,
            area_debounce: Duration::from_millis(400),
        }
    }
}

impl RoomRules {
    /// Accepts areas up to and including the maximum.
    pub fn check_area_km2(&self, area_km2: f64) -> Result<()> {
        if area_km2 > self.max_area_km2 {
            return Err(CoordinatorError::AreaTooLarge {
                area_km2,
                max_km2: self.max_area_km2,
            });
        }
        Ok(())
    }

    pub fn check_area(&self, polygon: &AreaPolygon) -> Result<f64> {
        let area_km2 = polygon.area_km2();
        self.check_area_km2(area_km2)?;
        Ok(area_km2)
    }

    pub fn check_selection(&self, places: &[SelectedPlace]) -> Result<()> {
        if places.len() > self.max_selections {
            return Err(CoordinatorError::TooManyPlaces {
                max: self.max_selections,
                found: places.len(),
            });
        }
        Ok(())
    }
}

/// Result of an area write: whether the owner check let it through, and the
/// validated area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaWrite {
    pub saved: bool,
    pub area_km2: f64,
}

#[derive(Clone)]
pub struct RoomCoordinator {
    store: Arc<dyn SharedStore>,
    codes: Arc<dyn RoomCodeSource>,
    rules: RoomRules,
}

impl RoomCoordinator {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            codes: Arc::new(RandomRoomCodes),
            rules: RoomRules::default(),
        }
    }

    pub fn with_rules(mut self, rules: RoomRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_code_source(mut self, codes: Arc<dyn RoomCodeSource>) -> Self {
        self.codes = codes;
        self
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn rules(&self) -> &RoomRules {
        &self.rules
    }

    pub async fn create_room(&self, owner_id: UserId) -> Result<Room> {
        for attempt in 1..=CREATE_ATTEMPTS {
            let code = self.codes.next_code();
            match self.store.insert_room(&code, owner_id).await? {
                InsertOutcome::Inserted => {
                    info!(room_code = %code, owner_id = %owner_id, attempt, "room created");
                    return Ok(Room {
                        code,
                        owner_id,
                        phase: Phase::Lobby,
                        area: None,
                    });
                }
                InsertOutcome::Collision => {
                    warn!(room_code = %code, attempt, "room code already taken");
                }
            }
        }
        Err(CoordinatorError::CodeCollision)
    }

    /// Joining twice is harmless: an existing member gets the room back
    /// without a write, even when the room is full.
    pub async fn join_room(&self, code: &RoomCode, user_id: UserId) -> Result<Room> {
        let room = self.require_room(code).await?;
        match self
            .store
            .insert_participant_within(code, user_id, self.rules.capacity)
            .await?
        {
            JoinOutcome::Joined => {
                info!(room_code = %code, user_id = %user_id, "participant joined");
                Ok(room)
            }
            JoinOutcome::AlreadyMember => {
                debug!(room_code = %code, user_id = %user_id, "already joined");
                Ok(room)
            }
            JoinOutcome::RoomFull => Err(CoordinatorError::RoomFull {
                capacity: self.rules.capacity,
            }),
        }
    }

    /// Owner-only `Lobby -> AreaSelection`. Returns whether this call made the
    /// transition; a non-owner or a repeated call changes nothing.
    pub async fn begin_planning(&self, code: &RoomCode, caller: UserId) -> Result<bool> {
        self.transition(code, Phase::Lobby, Phase::AreaSelection, Some(caller))
            .await
    }

    /// Immediate, owner-conditional write of a validated area.
    pub async fn write_area_polygon(
        &self,
        code: &RoomCode,
        caller: UserId,
        polygon: &AreaPolygon,
    ) -> Result<AreaWrite> {
        let area_km2 = self.rules.check_area(polygon)?;
        let saved = self.store.update_area(code, caller, Some(polygon)).await?;
        if saved {
            debug!(room_code = %code, area_km2, "area updated");
        } else {
            self.require_room(code).await?;
        }
        Ok(AreaWrite { saved, area_km2 })
    }

    pub async fn clear_area_polygon(&self, code: &RoomCode, caller: UserId) -> Result<bool> {
        let cleared = self.store.update_area(code, caller, None).await?;
        if !cleared {
            self.require_room(code).await?;
        }
        Ok(cleared)
    }

    /// A debounced editor for the owner's drawing session.
    pub fn area_editor(&self, code: RoomCode, caller: UserId) -> AreaEditor {
        AreaEditor::new(self.clone(), code, caller)
    }

    /// Owner-only `AreaSelection -> PlaceSelection`; needs a saved area.
    pub async fn confirm_area(&self, code: &RoomCode, caller: UserId) -> Result<bool> {
        let room = self.require_room(code).await?;
        if !room.is_owner(caller) {
            return Ok(false);
        }
        if room.area.is_none() {
            return Err(CoordinatorError::AreaMissing);
        }
        self.transition(code, Phase::AreaSelection, Phase::PlaceSelection, Some(caller))
            .await
    }

    pub async fn submit_intention(
        &self,
        code: &RoomCode,
        user_id: UserId,
        task_description: &str,
    ) -> Result<()> {
        let task_description = task_description.trim();
        if task_description.is_empty() {
            return Err(CoordinatorError::EmptyIntention);
        }
        self.require_participant(code, user_id).await?;
        self.store
            .upsert_intention(code, user_id, task_description)
            .await?;
        Ok(())
    }

    pub async fn list_intentions(&self, code: &RoomCode) -> Result<Vec<Intention>> {
        self.require_room(code).await?;
        Ok(self.store.list_intentions(code).await?)
    }

    pub async fn merged_intentions(&self, code: &RoomCode) -> Result<String> {
        let intentions = self.list_intentions(code).await?;
        Ok(derive::merge_intentions(&intentions))
    }

    /// Records the caller's places as ready, then fills in a ready selection,
    /// copied from the caller's places, for every participant who has none.
    ///
    /// That fill-in ("laggard override") lets the room reach all-ready without
    /// every member submitting. It only ever inserts where no row exists, so a
    /// member's own submission is never replaced. Returns how many rows it
    /// filled in.
    pub async fn submit_selection(
        &self,
        code: &RoomCode,
        user_id: UserId,
        places: &[SelectedPlace],
    ) -> Result<usize> {
        self.rules.check_selection(places)?;
        self.require_participant(code, user_id).await?;
        self.store
            .upsert_selection(code, user_id, places, true)
            .await?;

        let participants = self.store.list_participants(code).await?;
        let selections = self.store.list_selections(code).await?;
        let mut filled = 0;
        for participant in participants {
            if selections.iter().any(|s| s.user_id == participant.user_id) {
                continue;
            }
            if self
                .store
                .insert_selection_if_absent(code, participant.user_id, places)
                .await?
            {
                filled += 1;
            }
        }
        info!(room_code = %code, user_id = %user_id, places = places.len(), filled, "selection submitted");
        Ok(filled)
    }

    pub async fn compute_readiness(&self, code: &RoomCode) -> Result<Readiness> {
        let ready = self.store.count_ready_selections(code).await?;
        let total = self.store.count_participants(code).await?;
        Ok(Readiness::new(ready, total))
    }

    /// Any client may call this; it only acts once everyone is ready.
    pub async fn advance_to_voting(&self, code: &RoomCode) -> Result<bool> {
        if !self.compute_readiness(code).await?.all_ready {
            return Ok(false);
        }
        self.transition(code, Phase::PlaceSelection, Phase::Voting, None)
            .await
    }

    pub async fn candidate_places(&self, code: &RoomCode) -> Result<Vec<SelectedPlace>> {
        let selections = self.store.list_selections(code).await?;
        Ok(derive::candidate_places(&selections))
    }

    /// Re-voting replaces the caller's previous vote.
    pub async fn cast_vote(&self, code: &RoomCode, user_id: UserId, place_id: &PlaceId) -> Result<()> {
        let room = self.require_participant(code, user_id).await?;
        if room.phase == Phase::Resolved {
            return Err(CoordinatorError::VotingClosed);
        }
        let candidates = self.candidate_places(code).await?;
        if !candidates.iter().any(|place| &place.id == place_id) {
            return Err(CoordinatorError::UnknownPlace(place_id.clone()));
        }
        self.store.upsert_vote(code, user_id, place_id).await?;
        info!(room_code = %code, user_id = %user_id, place_id = %place_id, "vote cast");
        Ok(())
    }

    pub async fn retract_vote(&self, code: &RoomCode, user_id: UserId) -> Result<bool> {
        let room = self.require_participant(code, user_id).await?;
        if room.phase == Phase::Resolved {
            return Err(CoordinatorError::VotingClosed);
        }
        Ok(self.store.delete_vote(code, user_id).await?)
    }

    pub async fn tally(&self, code: &RoomCode) -> Result<Vec<PlaceTally>> {
        let candidates = self.candidate_places(code).await?;
        let votes = self.store.list_votes(code).await?;
        Ok(derive::tally_votes(&candidates, &votes))
    }

    /// Read-only; safe to call on every vote signal until it yields a place.
    pub async fn resolve_winner(&self, code: &RoomCode) -> Result<Option<PlaceId>> {
        let votes = self.store.list_votes(code).await?;
        let participant_count = self.store.count_participants(code).await?;
        Ok(derive::unanimous_winner(&votes, participant_count))
    }

    /// `Voting -> Resolved`, only once a unanimous winner exists.
    pub async fn mark_resolved(&self, code: &RoomCode) -> Result<bool> {
        if self.resolve_winner(code).await?.is_none() {
            return Ok(false);
        }
        self.transition(code, Phase::Voting, Phase::Resolved, None)
            .await
    }

    pub async fn snapshot(&self, code: &RoomCode) -> Result<RoomSnapshot> {
        let room = self.require_room(code).await?;
        let participants = self.store.list_participants(code).await?;
        let selections = self.store.list_selections(code).await?;
        let votes = self.store.list_votes(code).await?;

        let ready_count = selections.iter().filter(|s| s.ready).count();
        let readiness = Readiness::new(ready_count, participants.len());
        let candidates = derive::candidate_places(&selections);
        let tally = derive::tally_votes(&candidates, &votes);
        let winner = derive::unanimous_winner(&votes, participants.len());

        Ok(RoomSnapshot {
            room,
            participants,
            readiness,
            candidates,
            tally,
            winner,
        })
    }

    async fn transition(
        &self,
        code: &RoomCode,
        from: Phase,
        to: Phase,
        owner_id: Option<UserId>,
    ) -> Result<bool> {
        let changed = self.store.update_phase(code, from, to, owner_id).await?;
        if changed {
            info!(room_code = %code, %from, %to, "phase advanced");
        } else {
            self.require_room(code).await?;
            debug!(room_code = %code, %from, %to, "phase transition was a no-op");
        }
        Ok(changed)
    }

    async fn require_room(&self, code: &RoomCode) -> Result<Room> {
        self.store
            .load_room(code)
            .await?
            .ok_or_else(|| CoordinatorError::RoomNotFound(code.clone()))
    }

    async fn require_participant(&self, code: &RoomCode, user_id: UserId) -> Result<Room> {
        let room = self.require_room(code).await?;
        let participants = self.store.list_participants(code).await?;
        if !participants.iter().any(|p| p.user_id == user_id) {
            return Err(CoordinatorError::NotParticipant {
                room_code: code.clone(),
                user_id,
            });
        }
        Ok(room)
    }
}

#[cfg(test)]
#[path = "tests/memory_store.rs"]
mod memory_store;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
