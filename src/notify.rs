use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed writes, per location plus one stream of
/// everything.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
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
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to writes at a location. Creates the channel if needed.
    pub fn subscribe(&self, location_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(location_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// Send to every location the event touches. No-op if nobody is listening.
    pub fn publish(&self, event: &Event) {
        for location_id in event.location_ids() {
            if let Some(sender) = self.channels.get(&location_id) {
                let _ = sender.send(event.clone());
            }
        }
        let _ = self.all.send(event.clone());
    }

    /// Drop a location channel; its receivers see the stream close.
    pub fn remove(&self, location_id: &Ulid) {
        self.channels.remove(location_id);
    }
}
