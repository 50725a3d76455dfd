use crate::model::*;

use super::usage;
use super::validate::now_ms;
use super::Engine;

impl Engine {
    /// All bookings whose `start_at` falls within the local day of `date`,
    /// ordered by start time. `date` may be any instant of that day.
    pub async fn bookings_for_day(
        &self,
        facility_name: &str,
        date: Ms,
        offset_minutes: i32,
    ) -> Vec<Booking> {
        let window = local_day_bounds(date, offset_minutes);
        let store = self.read_store().await;
        store.bookings_starting_in(facility_name, &window)
    }

    pub async fn get_booking(&self, id: BookingId) -> Option<Booking> {
        self.read_store().await.get_booking(id).cloned()
    }

    /// Rooms of a facility with their derived usage, ranked by minutes
    /// descending; ties keep name order. Providers only see their own
    /// historical usage.
    pub async fn rooms_with_usage(&self, facility_name: &str, actor: &Actor) -> Vec<RoomView> {
        let only_username = match actor.role {
            Role::Provider => Some(actor.username.as_str()),
            Role::Staff | Role::Admin => None,
        };
        let store = self.read_store().await;
        let minutes = usage::minutes_by_room(&store, facility_name, only_username, now_ms());

        let mut views: Vec<RoomView> = store
            .facility_rooms(facility_name)
            .map(|room| RoomView {
                name: room.name.clone(),
                tags: room.tags.clone(),
                flag: room.flag.clone(),
                minutes_used: minutes.get(&room.name).copied().unwrap_or(0),
            })
            .collect();
        views.sort_by(|a, b| b.minutes_used.cmp(&a.minutes_used));
        views
    }

    /// Per-user completed minutes within a facility, ranked descending.
    pub async fn user_usage(&self, facility_name: &str) -> Vec<UserUsage> {
        let store = self.read_store().await;
        usage::minutes_by_user(&store, facility_name, now_ms())
    }

    /// Completed minutes for one room, optionally one user's share only.
    pub async fn minutes_used(
        &self,
        facility_name: &str,
        room_name: &str,
        only_username: Option<&str>,
    ) -> i64 {
        let store = self.read_store().await;
        usage::minutes_used(&store, facility_name, room_name, only_username, now_ms())
    }

    pub async fn get_room(&self, facility_name: &str, name: &str) -> Option<Room> {
        self.read_store()
            .await
            .get_room(facility_name, name)
            .cloned()
    }
}
