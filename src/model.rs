use serde::{Deserialize, Serialize};

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Booking ids are store-assigned integers.
pub type BookingId = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open query window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Calendar day index as seen by the acting user. `offset_minutes` follows
/// the JS `getTimezoneOffset` convention (UTC minus local, in minutes), so
/// a user at UTC-2 supplies 120.
pub fn local_day(at: Ms, offset_minutes: i32) -> i64 {
    (at - Ms::from(offset_minutes) * MINUTE_MS).div_euclid(DAY_MS)
}

/// The absolute window `[day start, next day start)` of the local day
/// containing `at`.
pub fn local_day_bounds(at: Ms, offset_minutes: i32) -> Span {
    let offset = Ms::from(offset_minutes) * MINUTE_MS;
    let start = local_day(at, offset_minutes) * DAY_MS + offset;
    Span::new(start, start + DAY_MS)
}

/// Acting-user role. Providers are subject to the past-day cutoff;
/// staff and admin are exempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Provider,
    Staff,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "provider" => Some(Role::Provider),
            "staff" => Some(Role::Staff),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Provider => "provider",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }
}

/// The acting user, as supplied by the (external) auth layer. The engine
/// never authenticates — it only applies role cutoffs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub username: String,
    pub role: Role,
}

/// A reserved time interval for one room and one user.
/// Invariant once committed: `start_at < end_at`, both on the same local day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub facility_name: String,
    pub room_name: String,
    pub username: String,
    pub start_at: Ms,
    pub end_at: Ms,
    /// Transient annotation, resolved independently of scheduling.
    pub flag: Option<String>,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(self.start_at, self.end_at)
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end_at - self.start_at) / MINUTE_MS
    }
}

/// A bookable resource within a facility. `minutes_used` is derived at
/// read time, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub facility_name: String,
    pub name: String,
    /// Ordered, user-editable classification.
    pub tags: Vec<String>,
    pub flag: Option<String>,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated { room: Room },
    RoomUpdated { room: Room },
    BookingCreated { booking: Booking },
    BookingUpdated { booking: Booking },
    BookingDeleted { id: BookingId },
}

impl Event {
    /// The facility whose calendar this event invalidates.
    pub fn facility_name(&self) -> Option<&str> {
        match self {
            Event::RoomCreated { room } | Event::RoomUpdated { room } => {
                Some(&room.facility_name)
            }
            Event::BookingCreated { booking } | Event::BookingUpdated { booking } => {
                Some(&booking.facility_name)
            }
            Event::BookingDeleted { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A room plus its derived usage, as returned by room listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomView {
    pub name: String,
    pub tags: Vec<String>,
    pub flag: Option<String>,
    pub minutes_used: i64,
}

/// Per-user cumulative usage within one facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUsage {
    pub username: String,
    pub minutes_used: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn local_day_at_utc() {
        assert_eq!(local_day(0, 0), 0);
        assert_eq!(local_day(DAY_MS - 1, 0), 0);
        assert_eq!(local_day(DAY_MS, 0), 1);
        assert_eq!(local_day(-1, 0), -1);
    }

    #[test]
    fn local_day_with_offset() {
        // 23:30 UTC on day 0; a user at UTC+2 (offset -120) is already on day 1.
        let t = DAY_MS - 30 * MINUTE_MS;
        assert_eq!(local_day(t, 0), 0);
        assert_eq!(local_day(t, -120), 1);
        // A user at UTC-2 (offset 120) at 00:30 UTC day 1 is still on day 0.
        let t = DAY_MS + 30 * MINUTE_MS;
        assert_eq!(local_day(t, 120), 0);
    }

    #[test]
    fn local_day_bounds_cover_instant() {
        for &offset in &[0, 120, -120, 330] {
            let t = 3 * DAY_MS + 7 * 3_600_000;
            let bounds = local_day_bounds(t, offset);
            assert!(bounds.contains_instant(t));
            assert_eq!(bounds.duration_ms(), DAY_MS);
            assert_eq!(local_day(bounds.start, offset), local_day(t, offset));
            // The last instant of the window is still the same local day.
            assert_eq!(local_day(bounds.end - 1, offset), local_day(t, offset));
        }
    }

    #[test]
    fn role_parse_is_closed() {
        assert_eq!(Role::parse("provider"), Some(Role::Provider));
        assert_eq!(Role::parse("staff"), Some(Role::Staff));
        assert_eq!(Role::parse("admin"), Some(Role::Admin));
        assert_eq!(Role::parse("superuser"), None);
        assert_eq!(Role::parse("Provider"), None);
    }

    #[test]
    fn booking_duration_minutes() {
        let b = Booking {
            id: 1,
            facility_name: "clinic".into(),
            room_name: "or-1".into(),
            username: "alice".into(),
            start_at: 9 * 3_600_000,
            end_at: 10 * 3_600_000 + 30 * MINUTE_MS,
            flag: None,
        };
        assert_eq!(b.duration_minutes(), 90);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: Booking {
                id: 7,
                facility_name: "clinic".into(),
                room_name: "or-1".into(),
                username: "alice".into(),
                start_at: 1000,
                end_at: 2000,
                flag: Some("double-check equipment".into()),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
