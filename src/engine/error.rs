use crate::model::{BookingId, Ms};

/// Business-rule rejection of a candidate booking. These are expected
/// outcomes returned as values, surfaced verbatim to the end user, and
/// never logged as faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidDuration,
    MultiDayUnsupported,
    PastDayRestricted,
    RoomConflict,
    UserConflict,
}

impl Rejection {
    /// The user-facing message for this rejection.
    pub fn message(&self) -> &'static str {
        match self {
            Rejection::InvalidDuration => "Booking must have a duration.",
            Rejection::MultiDayUnsupported => {
                "Bookings across multiple days are not yet supported."
            }
            Rejection::PastDayRestricted => {
                "Bookings for previous days can't be created or updated."
            }
            Rejection::RoomConflict => "Booking can't overlap with other bookings.",
            Rejection::UserConflict => "User can't be in multiple places at once.",
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::InvalidDuration => "invalid_duration",
            Rejection::MultiDayUnsupported => "multi_day",
            Rejection::PastDayRestricted => "past_day",
            Rejection::RoomConflict => "room_conflict",
            Rejection::UserConflict => "user_conflict",
        }
    }
}

/// Storage and lookup faults. Unlike `Rejection`, these are logged at the
/// boundary and surfaced to users as generic failure messages.
#[derive(Debug)]
pub enum EngineError {
    NotFound(BookingId),
    /// Primary-key collision on an explicitly supplied booking id.
    BookingExists(BookingId),
    RoomNotFound { facility_name: String, name: String },
    RoomExists { facility_name: String, name: String },
    /// Uniqueness constraint on (facility, room, start_at), enforced by
    /// the store independently of the validator.
    DuplicateStart { facility_name: String, room_name: String, start_at: Ms },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::BookingExists(id) => write!(f, "booking already exists: {id}"),
            EngineError::RoomNotFound { facility_name, name } => {
                write!(f, "room not found: {facility_name}/{name}")
            }
            EngineError::RoomExists { facility_name, name } => {
                write!(f, "room already exists: {facility_name}/{name}")
            }
            EngineError::DuplicateStart { facility_name, room_name, start_at } => {
                write!(
                    f,
                    "duplicate booking start in {facility_name}/{room_name} at {start_at}"
                )
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
