//! Dashboard event fan-out.
//!
//! Events go out on a `tokio::sync::broadcast` channel. Sequence numbers are assigned
//! under the same lock that sends, so every subscriber sees a session's events in
//! increasing order. Nothing is replayed to late subscribers.

use crate::shared::{DashboardEvent, EventPayload};
use futures_util::Stream;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

pub struct EventBroadcaster {
    tx: broadcast::Sender<DashboardEvent>,
    sequences: Mutex<HashMap<String, u64>>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Stamp and send. Having no subscribers is not an error.
    pub fn publish(&self, session_id: &str, payload: EventPayload) -> DashboardEvent {
        let mut sequences = self
            .sequences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = sequences.entry(session_id.to_string()).or_insert(0);
        *next += 1;
        let event = DashboardEvent {
            session_id: session_id.to_string(),
            sequence: *next,
            payload,
        };
        if self.tx.send(event.clone()).is_err() {
            debug!(session = %session_id, seq = event.sequence, "no dashboard subscribers");
        }
        event
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Live view of the event stream from the moment of subscription. Drop it to unsubscribe.
pub struct EventSubscription {
    rx: broadcast::Receiver<DashboardEvent>,
}

impl EventSubscription {
    /// Next event, or `None` once the broadcaster is gone. Lagged events are skipped;
    /// the gap shows up in the sequence numbers.
    pub async fn recv(&mut self) -> Option<DashboardEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("dashboard subscriber lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(mut self) -> impl Stream<Item = DashboardEvent> + Send + 'static {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}
