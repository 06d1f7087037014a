use crate::model::UserId;
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    SlotNotFound(u32),
    UserNotFound(UserId),
    UserInactive(UserId),
    /// The user already holds a booking on the named slot.
    AlreadyBooked(u32),
    SlotUnavailable(u32),
    SlotNotOccupiedOrParked(u32),
    Unauthorized(u32),
    InvalidWindow,
    Store(StoreError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotNotFound(n) => write!(f, "slot not found: {n}"),
            EngineError::UserNotFound(id) => write!(f, "user not found: {id}"),
            EngineError::UserInactive(id) => write!(f, "user account is not active: {id}"),
            EngineError::AlreadyBooked(n) => {
                write!(f, "you already have a booked slot: {n}")
            }
            EngineError::SlotUnavailable(n) => write!(f, "slot {n} is not available"),
            EngineError::SlotNotOccupiedOrParked(n) => {
                write!(f, "slot {n} is not currently occupied or parked")
            }
            EngineError::Unauthorized(n) => {
                write!(f, "you are not authorized to release slot {n}")
            }
            EngineError::InvalidWindow => write!(f, "booking window start must be before end"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}
