use std::collections::{BTreeMap, HashMap};

use crate::model::*;

use super::EngineError;

/// Key of a room: (facility_name, room_name).
pub type RoomKey = (String, String);

/// A booking's footprint in an index, sorted by `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    start: Ms,
    end: Ms,
    id: BookingId,
}

/// The interval store for one tenant: bookings by id plus per-room and
/// per-user slot lists kept sorted by start time for bounded overlap scans.
/// All mutation goes through the Engine's write lock; readers get
/// immutable snapshots of the rows they ask for.
#[derive(Debug, Default)]
pub struct Store {
    bookings: HashMap<BookingId, Booking>,
    /// Ordered by (facility, name) so listings are stable.
    rooms: BTreeMap<RoomKey, Room>,
    by_room: HashMap<RoomKey, Vec<Slot>>,
    by_user: HashMap<String, Vec<Slot>>,
    next_id: BookingId,
}

fn insert_sorted(slots: &mut Vec<Slot>, slot: Slot) {
    let pos = slots
        .binary_search_by_key(&(slot.start, slot.id), |s| (s.start, s.id))
        .unwrap_or_else(|e| e);
    slots.insert(pos, slot);
}

fn remove_slot(slots: &mut Vec<Slot>, id: BookingId) {
    if let Some(pos) = slots.iter().position(|s| s.id == id) {
        slots.remove(pos);
    }
}

/// Slots overlapping `query`, half-open: a slot ending exactly at
/// `query.start` does not overlap. Binary search skips everything
/// starting at or after `query.end`.
fn overlapping<'a>(slots: &'a [Slot], query: &Span) -> impl Iterator<Item = &'a Slot> {
    let right_bound = slots.partition_point(|s| s.start < query.end);
    let query_start = query.start;
    slots[..right_bound].iter().filter(move |s| s.end > query_start)
}

impl Store {
    pub fn new() -> Self {
        Self {
            bookings: HashMap::new(),
            rooms: BTreeMap::new(),
            by_room: HashMap::new(),
            by_user: HashMap::new(),
            next_id: 1,
        }
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub fn get_booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.get(&id)
    }

    /// Next free id. Ids only grow; deleting a booking never frees its id.
    pub fn allocate_id(&mut self) -> BookingId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Insert a booking row. Enforces the primary key and the
    /// (facility, room, start_at) uniqueness constraint beneath the
    /// validator.
    pub fn insert_booking(&mut self, booking: Booking) -> Result<(), EngineError> {
        if self.bookings.contains_key(&booking.id) {
            return Err(EngineError::BookingExists(booking.id));
        }
        let key = (booking.facility_name.clone(), booking.room_name.clone());
        if let Some(slots) = self.by_room.get(&key)
            && slots.iter().any(|s| s.start == booking.start_at) {
                return Err(EngineError::DuplicateStart {
                    facility_name: booking.facility_name,
                    room_name: booking.room_name,
                    start_at: booking.start_at,
                });
            }

        let slot = Slot {
            start: booking.start_at,
            end: booking.end_at,
            id: booking.id,
        };
        insert_sorted(self.by_room.entry(key).or_default(), slot);
        insert_sorted(self.by_user.entry(booking.username.clone()).or_default(), slot);
        if booking.id >= self.next_id {
            self.next_id = booking.id + 1;
        }
        self.bookings.insert(booking.id, booking);
        Ok(())
    }

    /// Remove a booking row and its index entries.
    pub fn remove_booking(&mut self, id: BookingId) -> Option<Booking> {
        let booking = self.bookings.remove(&id)?;
        let key = (booking.facility_name.clone(), booking.room_name.clone());
        let room_empty = match self.by_room.get_mut(&key) {
            Some(slots) => {
                remove_slot(slots, id);
                slots.is_empty()
            }
            None => false,
        };
        if room_empty {
            self.by_room.remove(&key);
        }
        let user_empty = match self.by_user.get_mut(&booking.username) {
            Some(slots) => {
                remove_slot(slots, id);
                slots.is_empty()
            }
            None => false,
        };
        if user_empty {
            self.by_user.remove(&booking.username);
        }
        Some(booking)
    }

    /// Replace a booking row in place (same id, possibly different room,
    /// user, or times). The constraint check skips the row itself.
    pub fn replace_booking(&mut self, booking: Booking) -> Result<(), EngineError> {
        let old = self
            .remove_booking(booking.id)
            .ok_or(EngineError::NotFound(booking.id))?;
        match self.insert_booking(booking) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Constraint hit — put the old row back untouched.
                self.insert_booking(old).expect("restoring removed row");
                Err(e)
            }
        }
    }

    /// Ids of bookings in the given room overlapping `query`, excluding
    /// `exclude_id` (a candidate's own row during validation).
    pub fn room_overlapping(
        &self,
        facility_name: &str,
        room_name: &str,
        query: &Span,
        exclude_id: BookingId,
    ) -> Vec<BookingId> {
        let key = (facility_name.to_string(), room_name.to_string());
        match self.by_room.get(&key) {
            Some(slots) => overlapping(slots, query)
                .filter(|s| s.id != exclude_id)
                .map(|s| s.id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Ids of bookings for the given user overlapping `query`, across all
    /// rooms of all facilities, excluding `exclude_id`.
    pub fn user_overlapping(
        &self,
        username: &str,
        query: &Span,
        exclude_id: BookingId,
    ) -> Vec<BookingId> {
        match self.by_user.get(username) {
            Some(slots) => overlapping(slots, query)
                .filter(|s| s.id != exclude_id)
                .map(|s| s.id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Bookings in a facility whose `start_at` falls inside `window`,
    /// ordered by start time.
    pub fn bookings_starting_in(&self, facility_name: &str, window: &Span) -> Vec<Booking> {
        let mut rows: Vec<Booking> = self
            .bookings
            .values()
            .filter(|b| {
                b.facility_name == facility_name && window.contains_instant(b.start_at)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|b| (b.start_at, b.id));
        rows
    }

    /// All bookings in a facility, unordered. Read-side aggregation input.
    pub fn facility_bookings(&self, facility_name: &str) -> impl Iterator<Item = &Booking> {
        self.bookings
            .values()
            .filter(move |b| b.facility_name == facility_name)
    }

    // ── Rooms ────────────────────────────────────────────────

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn get_room(&self, facility_name: &str, name: &str) -> Option<&Room> {
        self.rooms
            .get(&(facility_name.to_string(), name.to_string()))
    }

    pub fn insert_room(&mut self, room: Room) {
        self.rooms
            .insert((room.facility_name.clone(), room.name.clone()), room);
    }

    /// Rooms of one facility, in name order.
    pub fn facility_rooms(&self, facility_name: &str) -> impl Iterator<Item = &Room> {
        self.rooms
            .range(
                (facility_name.to_string(), String::new())
                    ..(format!("{facility_name}\u{0}"), String::new()),
            )
            .map(|(_, room)| room)
    }

    pub fn all_rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn all_bookings_sorted(&self) -> Vec<Booking> {
        let mut rows: Vec<Booking> = self.bookings.values().cloned().collect();
        rows.sort_by_key(|b| b.id);
        rows
    }

    // ── Event application (WAL replay) ───────────────────────

    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::RoomCreated { room } | Event::RoomUpdated { room } => {
                self.insert_room(room.clone());
            }
            Event::BookingCreated { booking } => {
                // Replay is trusted — the event was validated before commit.
                let _ = self.insert_booking(booking.clone());
            }
            Event::BookingUpdated { booking } => {
                self.remove_booking(booking.id);
                let _ = self.insert_booking(booking.clone());
            }
            Event::BookingDeleted { id } => {
                self.remove_booking(*id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(id: BookingId, room: &str, user: &str, start: Ms, end: Ms) -> Booking {
        Booking {
            id,
            facility_name: "clinic".into(),
            room_name: room.into(),
            username: user.into(),
            start_at: start,
            end_at: end,
            flag: None,
        }
    }

    #[test]
    fn insert_and_get() {
        let mut store = Store::new();
        store.insert_booking(booking(1, "or-1", "alice", 100, 200)).unwrap();
        assert_eq!(store.get_booking(1).unwrap().room_name, "or-1");
        assert_eq!(store.booking_count(), 1);
    }

    #[test]
    fn allocate_id_skips_explicit_ids() {
        let mut store = Store::new();
        store.insert_booking(booking(10, "or-1", "alice", 100, 200)).unwrap();
        assert_eq!(store.allocate_id(), 11);
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut store = Store::new();
        store.insert_booking(booking(1, "or-1", "alice", 100, 200)).unwrap();
        let result = store.insert_booking(booking(1, "or-2", "bob", 500, 600));
        assert!(matches!(result, Err(EngineError::BookingExists(1))));
        // The original row and its indexes are untouched.
        assert_eq!(store.get_booking(1).unwrap().room_name, "or-1");
        assert_eq!(store.room_overlapping("clinic", "or-1", &Span::new(0, 1000), 0), vec![1]);
    }

    #[test]
    fn duplicate_start_same_room_rejected() {
        let mut store = Store::new();
        store.insert_booking(booking(1, "or-1", "alice", 100, 200)).unwrap();
        let result = store.insert_booking(booking(2, "or-1", "bob", 100, 300));
        assert!(matches!(result, Err(EngineError::DuplicateStart { .. })));
        // Same start in a different room is fine.
        store.insert_booking(booking(3, "or-2", "bob", 100, 300)).unwrap();
    }

    #[test]
    fn room_overlap_half_open() {
        let mut store = Store::new();
        store.insert_booking(booking(1, "or-1", "alice", 100, 200)).unwrap();

        // Touching at the boundary is not overlapping.
        let hits = store.room_overlapping("clinic", "or-1", &Span::new(200, 300), 0);
        assert!(hits.is_empty());

        let hits = store.room_overlapping("clinic", "or-1", &Span::new(199, 300), 0);
        assert_eq!(hits, vec![1]);

        // Other rooms are unaffected.
        let hits = store.room_overlapping("clinic", "or-2", &Span::new(100, 200), 0);
        assert!(hits.is_empty());
    }

    #[test]
    fn room_overlap_excludes_own_id() {
        let mut store = Store::new();
        store.insert_booking(booking(1, "or-1", "alice", 100, 200)).unwrap();
        let hits = store.room_overlapping("clinic", "or-1", &Span::new(100, 200), 1);
        assert!(hits.is_empty());
    }

    #[test]
    fn user_overlap_spans_rooms_and_facilities() {
        let mut store = Store::new();
        store.insert_booking(booking(1, "or-1", "alice", 100, 200)).unwrap();
        let mut other = booking(2, "or-9", "alice", 150, 250);
        other.facility_name = "westside".into();
        store.insert_booking(other).unwrap();

        let hits = store.user_overlapping("alice", &Span::new(120, 160), 0);
        assert_eq!(hits.len(), 2);

        let hits = store.user_overlapping("bob", &Span::new(120, 160), 0);
        assert!(hits.is_empty());
    }

    #[test]
    fn overlap_scan_skips_far_future() {
        let mut store = Store::new();
        for i in 0..10 {
            store
                .insert_booking(booking(i + 1, "or-1", "alice", i * 1000, i * 1000 + 500))
                .unwrap();
        }
        let hits = store.room_overlapping("clinic", "or-1", &Span::new(2100, 3200), 0);
        assert_eq!(hits, vec![3, 4]);
    }

    #[test]
    fn remove_cleans_indexes() {
        let mut store = Store::new();
        store.insert_booking(booking(1, "or-1", "alice", 100, 200)).unwrap();
        let removed = store.remove_booking(1).unwrap();
        assert_eq!(removed.id, 1);
        assert!(store.remove_booking(1).is_none());
        assert!(store
            .room_overlapping("clinic", "or-1", &Span::new(0, 1000), 0)
            .is_empty());
        assert!(store
            .user_overlapping("alice", &Span::new(0, 1000), 0)
            .is_empty());
    }

    #[test]
    fn replace_moves_index_entries() {
        let mut store = Store::new();
        store.insert_booking(booking(1, "or-1", "alice", 100, 200)).unwrap();
        store.replace_booking(booking(1, "or-2", "bob", 300, 400)).unwrap();

        assert!(store
            .room_overlapping("clinic", "or-1", &Span::new(0, 1000), 0)
            .is_empty());
        assert_eq!(
            store.room_overlapping("clinic", "or-2", &Span::new(0, 1000), 0),
            vec![1]
        );
        assert!(store.user_overlapping("alice", &Span::new(0, 1000), 0).is_empty());
        assert_eq!(store.user_overlapping("bob", &Span::new(0, 1000), 0), vec![1]);
    }

    #[test]
    fn replace_restores_on_constraint_hit() {
        let mut store = Store::new();
        store.insert_booking(booking(1, "or-1", "alice", 100, 200)).unwrap();
        store.insert_booking(booking(2, "or-1", "bob", 500, 600)).unwrap();

        // Moving booking 2 onto booking 1's exact start hits the constraint.
        let result = store.replace_booking(booking(2, "or-1", "bob", 100, 300));
        assert!(matches!(result, Err(EngineError::DuplicateStart { .. })));

        // Old row is intact.
        let current = store.get_booking(2).unwrap();
        assert_eq!(current.start_at, 500);
        assert_eq!(store.user_overlapping("bob", &Span::new(500, 600), 0), vec![2]);
    }

    #[test]
    fn bookings_starting_in_is_ordered() {
        let mut store = Store::new();
        store.insert_booking(booking(1, "or-1", "alice", 3000, 4000)).unwrap();
        store.insert_booking(booking(2, "or-2", "bob", 1000, 2000)).unwrap();
        store.insert_booking(booking(3, "or-3", "carol", 9000, 9500)).unwrap();

        let rows = store.bookings_starting_in("clinic", &Span::new(0, 5000));
        let ids: Vec<BookingId> = rows.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn facility_rooms_in_name_order() {
        let mut store = Store::new();
        for name in ["zeta", "alpha", "mid"] {
            store.insert_room(Room {
                facility_name: "clinic".into(),
                name: name.into(),
                tags: Vec::new(),
                flag: None,
            });
        }
        store.insert_room(Room {
            facility_name: "westside".into(),
            name: "aaa".into(),
            tags: Vec::new(),
            flag: None,
        });

        let names: Vec<&str> = store
            .facility_rooms("clinic")
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn apply_event_roundtrip() {
        let mut store = Store::new();
        store.apply_event(&Event::BookingCreated {
            booking: booking(5, "or-1", "alice", 100, 200),
        });
        store.apply_event(&Event::BookingUpdated {
            booking: booking(5, "or-2", "alice", 300, 400),
        });
        assert_eq!(store.get_booking(5).unwrap().room_name, "or-2");
        store.apply_event(&Event::BookingDeleted { id: 5 });
        assert!(store.get_booking(5).is_none());
        // Replayed ids advance the allocator.
        assert_eq!(store.allocate_id(), 6);
    }
}
