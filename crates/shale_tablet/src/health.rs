//! Health snapshot fan-out.
//!
//! Subscribers get a dedicated bounded channel; broadcasts never block, so a
//! slow subscriber only drops its own snapshots. The last snapshot is cached
//! with an expiry so late subscribers can be primed immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::types::StreamHealthResponse;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 10;

#[derive(Default)]
struct HealthState {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<Arc<StreamHealthResponse>>>,
    last: Option<Arc<StreamHealthResponse>>,
    last_expiry: Option<Instant>,
}

/// Fan-out hub for health snapshots.
#[derive(Default)]
pub struct HealthStreamer {
    state: Mutex<HealthState>,
}

impl HealthStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. The id must be passed back to [`unregister`].
    ///
    /// [`unregister`]: HealthStreamer::unregister
    pub fn register(&self) -> (u64, mpsc::Receiver<Arc<StreamHealthResponse>>) {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        state.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.state.lock().unwrap().subscribers.remove(&id);
    }

    /// Deliver `response` to every subscriber without blocking, and cache it
    /// for `max_cache`.
    pub fn broadcast(&self, response: StreamHealthResponse, max_cache: Duration) {
        let response = Arc::new(response);
        let mut state = self.state.lock().unwrap();
        for sender in state.subscribers.values() {
            // A full channel means the subscriber is behind; drop rather
            // than stall the broadcaster.
            let _ = sender.try_send(response.clone());
        }
        state.last = Some(response);
        state.last_expiry = Some(Instant::now() + max_cache);
    }

    /// The cached snapshot, if still fresh.
    pub fn cached(&self) -> Option<Arc<StreamHealthResponse>> {
        let state = self.state.lock().unwrap();
        match (&state.last, state.last_expiry) {
            (Some(last), Some(expiry)) if Instant::now() < expiry => Some(last.clone()),
            _ => None,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RealtimeStats, TabletAlias, Target, TabletType};

    fn snapshot(serving: bool) -> StreamHealthResponse {
        StreamHealthResponse {
            target: Target::new("ks", "-80", TabletType::Master),
            tablet_alias: TabletAlias {
                cell: "zone1".to_string(),
                uid: 1,
            },
            serving,
            tablet_externally_reparented_timestamp: 0,
            realtime_stats: RealtimeStats::default(),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let streamer = HealthStreamer::new();
        let (id_a, mut rx_a) = streamer.register();
        let (_id_b, mut rx_b) = streamer.register();

        streamer.broadcast(snapshot(true), Duration::from_secs(5));
        assert!(rx_a.recv().await.unwrap().serving);
        assert!(rx_b.recv().await.unwrap().serving);

        streamer.unregister(id_a);
        assert_eq!(streamer.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking_others() {
        let streamer = HealthStreamer::new();
        let (_id_full, mut rx_full) = streamer.register();
        let (_id_live, mut rx_live) = streamer.register();

        // The live subscriber keeps draining and sees every broadcast; the
        // stalled one silently loses the overflow.
        for _ in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 5) {
            streamer.broadcast(snapshot(true), Duration::from_secs(5));
            assert!(rx_live.try_recv().is_ok(), "live subscriber missed a broadcast");
        }

        let mut full_received = 0;
        while rx_full.try_recv().is_ok() {
            full_received += 1;
        }
        assert_eq!(full_received, SUBSCRIBER_CHANNEL_CAPACITY);
    }

    #[test]
    fn cache_expires() {
        let streamer = HealthStreamer::new();
        assert!(streamer.cached().is_none());
        streamer.broadcast(snapshot(false), Duration::from_secs(5));
        assert!(streamer.cached().is_some());

        streamer.broadcast(snapshot(false), Duration::ZERO);
        assert!(streamer.cached().is_none());
    }
}
