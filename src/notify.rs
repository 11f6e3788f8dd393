use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Reservation;

const CHANNEL_CAPACITY: usize = 256;

/// Per-resource broadcast of committed reservations. This is the hand-off
/// point for whatever delivers notifications to people.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Reservation>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to commits on `resource`. Creates the channel if needed.
    pub fn subscribe(&self, resource: &str) -> broadcast::Receiver<Reservation> {
        self.channels
            .entry(resource.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, reservation: &Reservation) {
        if let Some(sender) = self.channels.get(&reservation.resource) {
            let _ = sender.send(reservation.clone());
        }
    }
}
