use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{
        Intention, Participant, Phase, PlaceId, Room, RoomCode, SelectedPlace, Selection, UserId,
        Vote,
    },
    geo::AreaPolygon,
    protocol::ChangeSignal,
};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The code is already taken; nothing was written.
    Collision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// The user was already a member; nothing was written.
    AlreadyMember,
    /// The room already holds `capacity` members; nothing was written.
    RoomFull,
}

/// The shared relational store every client reads and writes.
///
/// Row-level atomicity of the upserts (conflict target `(room, user)`) and of
/// the conditional updates is the only concurrency control the coordinator
/// relies on. Every mutation that touches a row publishes a [`ChangeSignal`]
/// on [`SharedStore::changes`].
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Inserts the room in `Lobby` together with the owner's participant row.
    async fn insert_room(&self, code: &RoomCode, owner_id: UserId) -> Result<InsertOutcome>;
    async fn load_room(&self, code: &RoomCode) -> Result<Option<Room>>;
    /// `UPDATE .. SET phase = to WHERE code = ? AND phase = from [AND owner_id = ?]`.
    /// Returns whether a row matched.
    async fn update_phase(
        &self,
        code: &RoomCode,
        from: Phase,
        to: Phase,
        owner_id: Option<UserId>,
    ) -> Result<bool>;
    /// Owner-conditional write of the area; `None` clears it.
    async fn update_area(
        &self,
        code: &RoomCode,
        owner_id: UserId,
        area: Option<&AreaPolygon>,
    ) -> Result<bool>;

    /// Adds a non-owner member only while the room holds fewer than
    /// `capacity` members. The count check and the insert are one atomic step.
    async fn insert_participant_within(
        &self,
        code: &RoomCode,
        user_id: UserId,
        capacity: usize,
    ) -> Result<JoinOutcome>;
    async fn list_participants(&self, code: &RoomCode) -> Result<Vec<Participant>>;
    async fn count_participants(&self, code: &RoomCode) -> Result<usize>;

    async fn upsert_selection(
        &self,
        code: &RoomCode,
        user_id: UserId,
        places: &[SelectedPlace],
        ready: bool,
    ) -> Result<()>;
    /// Inserts a ready selection unless the user already has one.
    async fn insert_selection_if_absent(
        &self,
        code: &RoomCode,
        user_id: UserId,
        places: &[SelectedPlace],
    ) -> Result<bool>;
    async fn list_selections(&self, code: &RoomCode) -> Result<Vec<Selection>>;
    async fn count_ready_selections(&self, code: &RoomCode) -> Result<usize>;

    async fn upsert_vote(&self, code: &RoomCode, user_id: UserId, place_id: &PlaceId)
        -> Result<()>;
    async fn delete_vote(&self, code: &RoomCode, user_id: UserId) -> Result<bool>;
    /// Votes in the order they were first cast.
    async fn list_votes(&self, code: &RoomCode) -> Result<Vec<Vote>>;

    async fn upsert_intention(
        &self,
        code: &RoomCode,
        user_id: UserId,
        task_description: &str,
    ) -> Result<()>;
    async fn list_intentions(&self, code: &RoomCode) -> Result<Vec<Intention>>;

    /// A fresh receiver on the change feed. Signals carry no row data.
    fn changes(&self) -> broadcast::Receiver<ChangeSignal>;
}
