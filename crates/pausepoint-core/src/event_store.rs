//! Broadcast + history event store for late-joining controllers.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{Config, SessionEvent};

#[derive(Clone)]
struct StoredEvent {
    event: SessionEvent,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredEvent>,
    total_bytes: usize,
}

/// Event store with broadcast and history support.
///
/// A controller that attaches while a session is already paused receives the
/// history first, then live events.
pub struct EventStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SessionEvent>,
    history_bytes: usize,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    /// Create a store with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    /// Create a store sized by configuration.
    #[must_use]
    pub fn with_config(config: &Config) -> Self {
        let (sender, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
            history_bytes: config.event_history_bytes,
        }
    }

    /// Push an event to both live listeners and history.
    pub fn push(&self, event: SessionEvent) {
        let _ = self.sender.send(event.clone()); // live listeners
        let bytes = event.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.total_bytes.saturating_add(bytes) > self.history_bytes {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredEvent { event, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<SessionEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.event.clone())
            .collect()
    }

    /// Stream that yields history first, then live updates.
    ///
    /// Lagged receivers silently skip the events they missed.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| future::ready(res.ok()));

        Box::pin(hist.chain(live))
    }

    /// Live stream that ends right after the next `Finished` event.
    #[must_use]
    pub fn until_finished(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let rx = self.get_receiver();
        futures::stream::unfold((rx, false), |(mut rx, done)| async move {
            if done {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let finished = event.is_finished();
                        return Some((event, (rx, finished)));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use uuid::Uuid;

    use super::*;
    use crate::event::Outcome;

    fn executing(command: &str) -> SessionEvent {
        SessionEvent::Executing {
            command: command.to_string(),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let config = Config {
            event_history_bytes: 100,
            ..Config::default()
        };
        let store = EventStore::with_config(&config);
        for i in 0..10 {
            store.push(executing(&format!("cmd-{i}")));
        }
        let history = store.get_history();
        assert!(history.len() < 10);
        assert_eq!(history.last(), Some(&executing("cmd-9")));
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let store = EventStore::new();
        store.push(executing("first"));

        let mut stream = store.history_plus_stream();
        store.push(executing("second"));

        assert_eq!(stream.next().await, Some(executing("first")));
        assert_eq!(stream.next().await, Some(executing("second")));
    }

    #[test]
    fn test_until_finished_stops_after_finish() {
        let store = EventStore::new();
        let stream = store.until_finished();
        let session_id = Uuid::new_v4();

        store.push(executing("a"));
        store.push(SessionEvent::Finished {
            session_id,
            outcome: Outcome::NoValue,
        });
        store.push(executing("after"));

        let events: Vec<_> = tokio_test::block_on(stream.collect());
        assert_eq!(events.len(), 2);
        assert!(events[1].is_finished());
    }
}
