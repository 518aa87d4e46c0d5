//! Event Bus (C8): fans out kernel events to subscribers in order. Bounded
//! per-run broadcast channels; a lagging subscriber gets a `stream_gap`
//! marker instead of silently missing events (spec §4.8).

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stepflow_core::{Event, EventKind};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

struct RunChannel {
    sender: broadcast::Sender<Event>,
    next_seq: AtomicU64,
}

/// Owns one broadcast channel per run. Shared across the runtime; cheap to
/// clone (an `Arc` internally).
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<DashMap<String, Arc<RunChannel>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }

    fn channel(&self, run_id: &str) -> Arc<RunChannel> {
        self.channels
            .entry(run_id.to_string())
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
                Arc::new(RunChannel {
                    sender,
                    next_seq: AtomicU64::new(1),
                })
            })
            .clone()
    }

    /// Allocate the next `seq` for `run_id`. The kernel calls this once per
    /// emitted event so `seq` stays strictly monotone per run (spec §5).
    pub fn next_seq(&self, run_id: &str) -> u64 {
        self.channel(run_id).next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish an already-sequenced event. Silently dropped if there are no
    /// subscribers — the event log, not the bus, is the durable record.
    pub fn publish(&self, event: Event) {
        let channel = self.channel(&event.run_id);
        let _ = channel.sender.send(event);
    }

    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<Event> {
        self.channel(run_id).sender.subscribe()
    }

    /// Drop the channel for a run once it reaches a terminal state and no
    /// further events will be published.
    pub fn close(&self, run_id: &str) {
        self.channels.remove(run_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a `broadcast::Receiver` into an ordered stream for a subscriber,
/// synthesizing a `stream_gap` event when the receiver falls behind and the
/// channel overwrites unread events (spec §4.8: "MAY drop on slow consumers
/// but then MUST emit a stream_gap marker").
pub async fn next_event(
    run_id: &str,
    receiver: &mut broadcast::Receiver<Event>,
    last_contiguous_seq: &mut u64,
) -> Option<Event> {
    loop {
        match receiver.recv().await {
            Ok(event) => {
                *last_contiguous_seq = event.seq;
                return Some(event);
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                let gap = Event::new(
                    run_id.to_string(),
                    *last_contiguous_seq,
                    chrono::Utc::now(),
                    EventKind::StreamGap {
                        last_contiguous_seq: *last_contiguous_seq,
                    },
                );
                return Some(gap);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::EventKind;

    fn ev(run_id: &str, seq: u64) -> Event {
        Event::new(run_id.to_string(), seq, chrono::Utc::now(), EventKind::Heartbeat)
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("run-1");
        bus.publish(ev("run-1", 1));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.seq, 1);
    }

    #[test]
    fn next_seq_is_monotone() {
        let bus = EventBus::new();
        assert_eq!(bus.next_seq("run-1"), 1);
        assert_eq!(bus.next_seq("run-1"), 2);
        assert_eq!(bus.next_seq("run-1"), 3);
    }

    #[tokio::test]
    async fn subscribers_are_isolated_per_run() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe("run-a");
        let _rx_b = bus.subscribe("run-b");

        bus.publish(ev("run-a", 1));
        let received = rx_a.recv().await.unwrap();
        assert_eq!(received.run_id, "run-a");
    }
}
