use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY per facility. Successful mutations are
/// published here so calendar/usage caches can be invalidated and refetched.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to change events for a facility. Creates the channel if needed.
    pub fn subscribe(&self, facility_name: &str) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(facility_name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, facility_name: &str, event: &Event) {
        if let Some(sender) = self.channels.get(facility_name) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel.
    #[allow(dead_code)]
    pub fn remove(&self, facility_name: &str) {
        self.channels.remove(facility_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Room;

    fn room_event(facility: &str) -> Event {
        Event::RoomCreated {
            room: Room {
                facility_name: facility.into(),
                name: "or-1".into(),
                tags: Vec::new(),
                flag: None,
            },
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("clinic");

        let event = room_event("clinic");
        hub.send("clinic", &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber — should not panic
        hub.send("clinic", &room_event("clinic"));
    }

    #[tokio::test]
    async fn facilities_are_isolated() {
        let hub = NotifyHub::new();
        let mut rx_east = hub.subscribe("east");
        let _rx_west = hub.subscribe("west");

        hub.send("west", &room_event("west"));
        assert!(rx_east.try_recv().is_err());
    }
}
