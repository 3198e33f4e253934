use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{
        Intention, Participant, Phase, PlaceId, Room, RoomCode, SelectedPlace, Selection, UserId,
        Vote,
    },
    geo::AreaPolygon,
    protocol::{ChangeSignal, StoreTable},
};
use tokio::sync::broadcast;

use crate::store::{InsertOutcome, JoinOutcome, SharedStore};

#[derive(Default)]
struct Tables {
    rooms: Vec<Room>,
    participants: Vec<Participant>,
    selections: Vec<Selection>,
    votes: Vec<Vote>,
    intentions: Vec<(RoomCode, Intention)>,
}

/// In-process stand-in for the shared store, with the same conflict targets
/// and conditional-update semantics as the SQL schema.
pub(crate) struct MemoryStore {
    tables: Mutex<Tables>,
    changes: broadcast::Sender<ChangeSignal>,
    fail_reads: Mutex<bool>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            tables: Mutex::new(Tables::default()),
            changes,
            fail_reads: Mutex::new(false),
        }
    }

    pub(crate) fn set_fail_reads(&self, fail: bool) {
        *self.fail_reads.lock().unwrap() = fail;
    }

    fn publish(&self, table: StoreTable, code: &RoomCode) {
        let _ = self.changes.send(ChangeSignal {
            table,
            room_code: code.clone(),
        });
    }

    fn check_reads(&self) -> Result<()> {
        if *self.fail_reads.lock().unwrap() {
            return Err(anyhow!("store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn insert_room(&self, code: &RoomCode, owner_id: UserId) -> Result<InsertOutcome> {
        {
            let mut tables = self.tables.lock().unwrap();
            if tables.rooms.iter().any(|room| &room.code == code) {
                return Ok(InsertOutcome::Collision);
            }
            tables.rooms.push(Room {
                code: code.clone(),
                owner_id,
                phase: Phase::Lobby,
                area: None,
            });
            tables.participants.push(Participant {
                room_code: code.clone(),
                user_id: owner_id,
                is_owner: true,
                joined_at: Utc::now(),
            });
        }
        self.publish(StoreTable::Rooms, code);
        self.publish(StoreTable::Participants, code);
        Ok(InsertOutcome::Inserted)
    }

    async fn load_room(&self, code: &RoomCode) -> Result<Option<Room>> {
        self.check_reads()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables.rooms.iter().find(|room| &room.code == code).cloned())
    }

    async fn update_phase(
        &self,
        code: &RoomCode,
        from: Phase,
        to: Phase,
        owner_id: Option<UserId>,
    ) -> Result<bool> {
        let updated = {
            let mut tables = self.tables.lock().unwrap();
            match tables.rooms.iter_mut().find(|room| {
                &room.code == code
                    && room.phase == from
                    && owner_id.map_or(true, |owner| room.owner_id == owner)
            }) {
                Some(room) => {
                    room.phase = to;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.publish(StoreTable::Rooms, code);
        }
        Ok(updated)
    }

    async fn update_area(
        &self,
        code: &RoomCode,
        owner_id: UserId,
        area: Option<&AreaPolygon>,
    ) -> Result<bool> {
        let updated = {
            let mut tables = self.tables.lock().unwrap();
            match tables
                .rooms
                .iter_mut()
                .find(|room| &room.code == code && room.owner_id == owner_id)
            {
                Some(room) => {
                    room.area = area.cloned();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.publish(StoreTable::Rooms, code);
        }
        Ok(updated)
    }

    async fn insert_participant_within(
        &self,
        code: &RoomCode,
        user_id: UserId,
        capacity: usize,
    ) -> Result<JoinOutcome> {
        {
            let mut tables = self.tables.lock().unwrap();
            let members: Vec<_> = tables
                .participants
                .iter()
                .filter(|p| &p.room_code == code)
                .collect();
            if members.iter().any(|p| p.user_id == user_id) {
                return Ok(JoinOutcome::AlreadyMember);
            }
            if members.len() >= capacity {
                return Ok(JoinOutcome::RoomFull);
            }
            tables.participants.push(Participant {
                room_code: code.clone(),
                user_id,
                is_owner: false,
                joined_at: Utc::now(),
            });
        }
        self.publish(StoreTable::Participants, code);
        Ok(JoinOutcome::Joined)
    }

    async fn list_participants(&self, code: &RoomCode) -> Result<Vec<Participant>> {
        self.check_reads()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .participants
            .iter()
            .filter(|p| &p.room_code == code)
            .cloned()
            .collect())
    }

    async fn count_participants(&self, code: &RoomCode) -> Result<usize> {
        Ok(self.list_participants(code).await?.len())
    }

    async fn upsert_selection(
        &self,
        code: &RoomCode,
        user_id: UserId,
        places: &[SelectedPlace],
        ready: bool,
    ) -> Result<()> {
        {
            let mut tables = self.tables.lock().unwrap();
            match tables
                .selections
                .iter_mut()
                .find(|s| &s.room_code == code && s.user_id == user_id)
            {
                Some(existing) => {
                    existing.places = places.to_vec();
                    existing.ready = ready;
                }
                None => tables.selections.push(Selection {
                    room_code: code.clone(),
                    user_id,
                    places: places.to_vec(),
                    ready,
                }),
            }
        }
        self.publish(StoreTable::Selections, code);
        Ok(())
    }

    async fn insert_selection_if_absent(
        &self,
        code: &RoomCode,
        user_id: UserId,
        places: &[SelectedPlace],
    ) -> Result<bool> {
        let inserted = {
            let mut tables = self.tables.lock().unwrap();
            if tables
                .selections
                .iter()
                .any(|s| &s.room_code == code && s.user_id == user_id)
            {
                false
            } else {
                tables.selections.push(Selection {
                    room_code: code.clone(),
                    user_id,
                    places: places.to_vec(),
                    ready: true,
                });
                true
            }
        };
        if inserted {
            self.publish(StoreTable::Selections, code);
        }
        Ok(inserted)
    }

    async fn list_selections(&self, code: &RoomCode) -> Result<Vec<Selection>> {
        self.check_reads()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .selections
            .iter()
            .filter(|s| &s.room_code == code)
            .cloned()
            .collect())
    }

    async fn count_ready_selections(&self, code: &RoomCode) -> Result<usize> {
        Ok(self
            .list_selections(code)
            .await?
            .iter()
            .filter(|s| s.ready)
            .count())
    }

    async fn upsert_vote(
        &self,
        code: &RoomCode,
        user_id: UserId,
        place_id: &PlaceId,
    ) -> Result<()> {
        {
            let mut tables = self.tables.lock().unwrap();
            match tables
                .votes
                .iter_mut()
                .find(|v| &v.room_code == code && v.user_id == user_id)
            {
                Some(existing) => existing.place_id = place_id.clone(),
                None => tables.votes.push(Vote {
                    room_code: code.clone(),
                    user_id,
                    place_id: place_id.clone(),
                }),
            }
        }
        self.publish(StoreTable::Votes, code);
        Ok(())
    }

    async fn delete_vote(&self, code: &RoomCode, user_id: UserId) -> Result<bool> {
        let deleted = {
            let mut tables = self.tables.lock().unwrap();
            let before = tables.votes.len();
            tables
                .votes
                .retain(|v| !(&v.room_code == code && v.user_id == user_id));
            tables.votes.len() != before
        };
        if deleted {
            self.publish(StoreTable::Votes, code);
        }
        Ok(deleted)
    }

    async fn list_votes(&self, code: &RoomCode) -> Result<Vec<Vote>> {
        self.check_reads()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .votes
            .iter()
            .filter(|v| &v.room_code == code)
            .cloned()
            .collect())
    }

    async fn upsert_intention(
        &self,
        code: &RoomCode,
        user_id: UserId,
        task_description: &str,
    ) -> Result<()> {
        {
            let mut tables = self.tables.lock().unwrap();
            match tables
                .intentions
                .iter_mut()
                .find(|(room, i)| room == code && i.user_id == user_id)
            {
                Some((_, existing)) => existing.task_description = task_description.to_string(),
                None => tables.intentions.push((
                    code.clone(),
                    Intention {
                        user_id,
                        username: None,
                        task_description: task_description.to_string(),
                    },
                )),
            }
        }
        self.publish(StoreTable::Intentions, code);
        Ok(())
    }

    async fn list_intentions(&self, code: &RoomCode) -> Result<Vec<Intention>> {
        self.check_reads()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .intentions
            .iter()
            .filter(|(room, _)| room == code)
            .map(|(_, intention)| intention.clone())
            .collect())
    }

    fn changes(&self) -> broadcast::Receiver<ChangeSignal> {
        self.changes.subscribe()
    }
}
