use shared::{
    domain::{PlaceId, RoomCode, RoomCodeError, UserId},
    geo::GeoError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("room {0} not found")]
    RoomNotFound(RoomCode),
    #[error("user {user_id} has not joined room {room_code}")]
    NotParticipant { room_code: RoomCode, user_id: UserId },
    #[error("room is full (capacity {capacity})")]
    RoomFull { capacity: usize },
    #[error("too many places selected: {found} (max {max})")]
    TooManyPlaces { max: usize, found: usize },
    #[error("area of {area_km2:.4} km² exceeds the {max_km2} km² maximum")]
    AreaTooLarge { area_km2: f64, max_km2: f64 },
    #[error("no search area has been drawn yet")]
    AreaMissing,
    #[error("invalid polygon: {0}")]
    InvalidPolygon(#[from] GeoError),
    #[error("invalid room code: {0}")]
    InvalidRoomCode(#[from] RoomCodeError),
    #[error("place {0} is not one of this room's candidates")]
    UnknownPlace(PlaceId),
    #[error("intention text cannot be empty")]
    EmptyIntention,
    #[error("voting in this room is closed")]
    VotingClosed,
    #[error("area editor has stopped; edits are no longer saved")]
    EditorClosed,
    #[error("could not allocate a unique room code")]
    CodeCollision,
    #[error("store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl CoordinatorError {
    /// Errors the user can fix by changing their input.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::RoomFull { .. }
                | CoordinatorError::TooManyPlaces { .. }
                | CoordinatorError::AreaTooLarge { .. }
                | CoordinatorError::AreaMissing
                | CoordinatorError::InvalidPolygon(_)
                | CoordinatorError::InvalidRoomCode(_)
                | CoordinatorError::UnknownPlace(_)
                | CoordinatorError::EmptyIntention
                | CoordinatorError::VotingClosed
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoordinatorError::RoomNotFound(_) | CoordinatorError::NotParticipant { .. }
        )
    }

    /// Store failures may be retried by re-invoking the same operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoordinatorError::Store(_))
    }
}

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;
