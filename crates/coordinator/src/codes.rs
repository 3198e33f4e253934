use shared::domain::RoomCode;

/// Where new room codes come from.
pub trait RoomCodeSource: Send + Sync {
    fn next_code(&self) -> RoomCode;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomRoomCodes;

impl RoomCodeSource for RandomRoomCodes {
    fn next_code(&self) -> RoomCode {
        RoomCode::random(&mut rand::thread_rng())
    }
}
