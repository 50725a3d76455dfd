use crate::model::*;

use super::error::{EngineError, Rejection};
use super::store::Store;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Range-check timestamps before they enter the store.
pub(crate) fn validate_timestamps(start_at: Ms, end_at: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if start_at < MIN_VALID_TIMESTAMP_MS
        || end_at < MIN_VALID_TIMESTAMP_MS
        || start_at > MAX_VALID_TIMESTAMP_MS
        || end_at > MAX_VALID_TIMESTAMP_MS
    {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// The conflict validator. Pure: decides from the store state it is given.
///
/// `candidate` is already tentatively present in `store` (the
/// insert-then-validate pattern), so overlap scans exclude its own id.
/// Checks run in order and the first failure wins:
/// duration → same-day → provider past-day cutoff → room overlap → user overlap.
pub(crate) fn validate_booking(
    store: &Store,
    candidate: &Booking,
    actor: &Actor,
    offset_minutes: i32,
    now: Ms,
) -> Result<(), Rejection> {
    if candidate.start_at >= candidate.end_at {
        return Err(Rejection::InvalidDuration);
    }

    // Both endpoints must land on the same local day. A booking ending
    // exactly at local midnight counts as touching the next day.
    let start_day = local_day(candidate.start_at, offset_minutes);
    let end_day = local_day(candidate.end_at, offset_minutes);
    if start_day != end_day {
        return Err(Rejection::MultiDayUnsupported);
    }

    if start_day < local_day(now, offset_minutes) && actor.role == Role::Provider {
        return Err(Rejection::PastDayRestricted);
    }

    let query = candidate.span();
    if !store
        .room_overlapping(
            &candidate.facility_name,
            &candidate.room_name,
            &query,
            candidate.id,
        )
        .is_empty()
    {
        return Err(Rejection::RoomConflict);
    }

    if !store
        .user_overlapping(&candidate.username, &query, candidate.id)
        .is_empty()
    {
        return Err(Rejection::UserConflict);
    }

    Ok(())
}
