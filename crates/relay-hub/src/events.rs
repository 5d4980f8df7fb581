//! In-process event bus for change notifications.
//!
//! The player reports changes through its callback; the bus fans them out to
//! front-end connections waiting in `idle`.

use tokio::sync::broadcast;

/// Subsystems a client can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Player,
    Playlist,
}

impl Subsystem {
    pub fn name(self) -> &'static str {
        match self {
            Subsystem::Player => "player",
            Subsystem::Playlist => "playlist",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "player" => Some(Subsystem::Player),
            "playlist" => Some(Subsystem::Playlist),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Subsystem>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new event bus with a bounded broadcast channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Subsystem> {
        self.sender.subscribe()
    }

    pub fn publish(&self, subsystem: Subsystem) {
        let _ = self.sender.send(subsystem);
    }

    /// Publish by subsystem name; unknown names are dropped.
    pub fn publish_named(&self, name: &str) {
        match Subsystem::from_name(name) {
            Some(subsystem) => self.publish(subsystem),
            None => tracing::debug!(name, "ignoring change for unknown subsystem"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn named_changes_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish_named("playlist");
        bus.publish_named("mixer");
        bus.publish(Subsystem::Player);
        assert_eq!(rx.recv().await.unwrap(), Subsystem::Playlist);
        assert_eq!(rx.recv().await.unwrap(), Subsystem::Player);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        EventBus::new().publish(Subsystem::Player);
    }
}
