use std::collections::HashMap;

use crate::model::*;

use super::store::Store;

// ── Usage aggregation ─────────────────────────────────────────────
//
// Read-side derived view over completed bookings (`end_at < now`).
// Never consulted by the validator — conflict checks always go back to
// the interval indexes.

/// Minutes of completed use per room of a facility, optionally filtered
/// to one user's own bookings (applied for the provider role).
pub(super) fn minutes_by_room(
    store: &Store,
    facility_name: &str,
    only_username: Option<&str>,
    now: Ms,
) -> HashMap<String, i64> {
    let mut minutes: HashMap<String, i64> = HashMap::new();
    for booking in store.facility_bookings(facility_name) {
        if booking.end_at >= now {
            continue;
        }
        if let Some(user) = only_username
            && booking.username != user {
                continue;
            }
        *minutes.entry(booking.room_name.clone()).or_default() +=
            booking.duration_minutes();
    }
    minutes
}

/// Minutes of completed use per user of a facility, ranked descending.
/// Ties keep first-seen order (stable sort over id-ordered input).
pub(super) fn minutes_by_user(store: &Store, facility_name: &str, now: Ms) -> Vec<UserUsage> {
    let mut minutes: HashMap<String, i64> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut rows: Vec<&Booking> = store.facility_bookings(facility_name).collect();
    rows.sort_by_key(|b| b.id);
    for booking in rows {
        if booking.end_at >= now {
            continue;
        }
        if !minutes.contains_key(&booking.username) {
            order.push(booking.username.clone());
        }
        *minutes.entry(booking.username.clone()).or_default() += booking.duration_minutes();
    }

    let mut usage: Vec<UserUsage> = order
        .into_iter()
        .map(|username| {
            let minutes_used = minutes[&username];
            UserUsage { username, minutes_used }
        })
        .collect();
    usage.sort_by(|a, b| b.minutes_used.cmp(&a.minutes_used));
    usage
}

/// Total completed minutes for one room, optionally one user's share only.
pub(super) fn minutes_used(
    store: &Store,
    facility_name: &str,
    room_name: &str,
    only_username: Option<&str>,
    now: Ms,
) -> i64 {
    minutes_by_room(store, facility_name, only_username, now)
        .remove(room_name)
        .unwrap_or(0)
}
