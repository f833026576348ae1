//! Ready-made [`EventSink`] implementations.
//!
//! [`TracingSink`] logs every event and is what a session uses when no sink is given.
//! [`CollectingSink`] stores events so a UI thread (or a test) can drain them later.

use parking_lot::Mutex;
use tracing::info;

use crate::{EventSink, NetplayEvent};

/// Logs every event at `info` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: &NetplayEvent) {
        info!(?event, "netplay event");
    }
}

/// Stores events in arrival order.
///
/// # Example
///
/// ```
/// use fortress_lockstep::{CollectingSink, EventSink, NetplayEvent};
///
/// let sink = CollectingSink::new();
/// sink.on_event(&NetplayEvent::GameRemoved { game_id: 7 });
/// assert_eq!(sink.drain(), vec![NetplayEvent::GameRemoved { game_id: 7 }]);
/// assert!(sink.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<NetplayEvent>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every event received so far.
    #[must_use]
    pub fn events(&self) -> Vec<NetplayEvent> {
        self.events.lock().clone()
    }

    /// Removes and returns every stored event.
    #[must_use]
    pub fn drain(&self) -> Vec<NetplayEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for CollectingSink {
    fn on_event(&self, event: &NetplayEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::LobbyState;
    use std::sync::Arc;

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = Arc::new(CollectingSink::new());
        let shared: Arc<dyn EventSink> = sink.clone();
        shared.on_event(&NetplayEvent::LobbyStateChanged {
            from: LobbyState::None,
            to: LobbyState::Listing,
        });
        shared.on_event(&NetplayEvent::GameListUpdated { games: 1 });
        assert_eq!(sink.len(), 2);
        assert_eq!(
            sink.events()[1],
            NetplayEvent::GameListUpdated { games: 1 }
        );
    }

    #[test]
    fn tracing_sink_accepts_events() {
        TracingSink.on_event(&NetplayEvent::GameRemoved { game_id: 3 });
    }
}
