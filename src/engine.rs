use std::sync::Arc;

use log::{debug, info};
use tokio::sync::mpsc;

use crate::manager::Shutdown;
use crate::messages::{EventSource, PresenceEvent, Report, TaskKey};
use crate::queue::{DeliveryQueue, DeliveryTask};
use crate::store::{DeviceRecord, StateStore};

/// Location labels sent for present and absent devices.
#[derive(Clone, Debug)]
pub struct Labels {
    pub home: String,
    pub away: String,
}

impl Labels {
    fn resolve(&self, present: bool) -> &str {
        if present { &self.home } else { &self.away }
    }
}

/// Turns presence events into delivery tasks.
///
/// Realtime notifications are trusted as-is. Poll results only report a
/// device away after `offline_after` consecutive misses. Full syncs are always
/// forwarded.
pub struct Reconciler {
    store: Arc<StateStore>,
    queue: Arc<DeliveryQueue>,
    labels: Labels,
    offline_after: u32,
}

impl Reconciler {
    pub fn new(
        store: Arc<StateStore>,
        queue: Arc<DeliveryQueue>,
        labels: Labels,
        offline_after: u32,
    ) -> Self {
        Reconciler {
            store,
            queue,
            labels,
            offline_after: offline_after.max(1),
        }
    }

    pub fn process(&self, event: PresenceEvent) -> Option<DeliveryTask> {
        // the queue upsert happens under the store lock so two events for the
        // same device can never be enqueued out of order
        self.store.update(&event.id, |record| {
            let changed = record.present != event.present;
            if !self.accept(record, &event) {
                return None;
            }

            let label = self.labels.resolve(event.present);
            if changed {
                record.present = event.present;
                record.changed_at = event.observed_at;
                info!("Device {} is now at {} ({})", record.id, label, event.source);
            } else {
                debug!("Resending {} for device {} ({})", label, record.id, event.source);
            }

            let report = Report::seen(&record.id, record.present, label, &record.metadata);
            Some(self.queue.upsert(TaskKey::Device(record.id.clone()), report))
        })
    }

    fn accept(&self, record: &mut DeviceRecord, event: &PresenceEvent) -> bool {
        if event.present {
            record.misses = 0;
            record.last_seen = Some(event.observed_at);
        }

        match event.source {
            EventSource::Realtime => record.present != event.present,
            EventSource::Poll if event.present => !record.present,
            EventSource::Poll => {
                record.misses = record.misses.saturating_add(1);
                record.present && record.misses >= self.offline_after
            }
            EventSource::FullSync => true,
        }
    }

    /// Consume events until the channel closes or shutdown is requested.
    pub async fn run(self, mut events: mpsc::Receiver<PresenceEvent>, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.process(event);
                    }
                    None => {
                        debug!("Event channel closed");
                        break;
                    }
                },
                _ = shutdown.wait() => break,
            }
        }
        debug!("Reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::messages::DeviceId;
    use crate::queue::Backoff;

    struct Harness {
        store: Arc<StateStore>,
        queue: Arc<DeliveryQueue>,
        reconciler: Reconciler,
    }

    fn harness(offline_after: u32) -> Harness {
        let store = Arc::new(StateStore::new(HashMap::new()));
        let queue = Arc::new(DeliveryQueue::new(Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
        }));
        let labels = Labels {
            home: "home".into(),
            away: "not_home".into(),
        };
        let reconciler = Reconciler::new(store.clone(), queue.clone(), labels, offline_after);
        Harness {
            store,
            queue,
            reconciler,
        }
    }

    fn id(s: &str) -> DeviceId {
        DeviceId::parse(s, None).unwrap()
    }

    fn event(id: &DeviceId, present: bool, source: EventSource) -> PresenceEvent {
        PresenceEvent::now(id.clone(), present, source)
    }

    fn pending_present(queue: &DeliveryQueue, id: &DeviceId) -> Option<bool> {
        match queue.get(&TaskKey::Device(id.clone()))?.report {
            Report::Seen { present, .. } => Some(present),
            Report::Version { .. } => None,
        }
    }

    #[tokio::test]
    async fn test_realtime_follows_latest_event() {
        let h = harness(3);
        let a = id("aa:00:00:00:00:01");

        let sequence = [true, true, false, true, false, false, true];
        for present in sequence {
            h.reconciler.process(event(&a, present, EventSource::Realtime));
            assert_eq!(h.store.get(&a).unwrap().present, present);
        }
        assert_eq!(h.queue.len(), 1);
        assert_eq!(pending_present(&h.queue, &a), Some(true));
    }

    #[tokio::test]
    async fn test_realtime_duplicate_is_debounced() {
        let h = harness(3);
        let a = id("aa:00:00:00:00:01");

        assert!(h.reconciler.process(event(&a, true, EventSource::Realtime)).is_some());
        assert!(h.reconciler.process(event(&a, true, EventSource::Realtime)).is_none());
        // a leave for a never-seen device is not a change
        let b = id("aa:00:00:00:00:02");
        assert!(h.reconciler.process(event(&b, false, EventSource::Realtime)).is_none());
        assert_eq!(h.store.len(), 2);
    }

    #[tokio::test]
    async fn test_join_then_leave_before_delivery_leaves_one_task() {
        let h = harness(3);
        let a = id("aa:00:00:00:00:01");

        let join = h.reconciler.process(event(&a, true, EventSource::Realtime)).unwrap();
        let leave = h.reconciler.process(event(&a, false, EventSource::Realtime)).unwrap();

        assert_eq!(h.queue.len(), 1);
        assert!(leave.generation > join.generation);
        assert_eq!(pending_present(&h.queue, &a), Some(false));
    }

    #[tokio::test]
    async fn test_poll_presence_is_immediate() {
        let h = harness(3);
        let a = id("aa:00:00:00:00:01");

        let task = h.reconciler.process(event(&a, true, EventSource::Poll));
        assert!(task.is_some());
        assert!(h.store.get(&a).unwrap().present);
        assert!(h.store.get(&a).unwrap().last_seen.is_some());
        assert!(h.reconciler.process(event(&a, true, EventSource::Poll)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_at_tracks_transitions_only() {
        let h = harness(1);
        let a = id("aa:00:00:00:00:01");

        tokio::time::advance(Duration::from_secs(5)).await;
        let joined = event(&a, true, EventSource::Realtime);
        let joined_at = joined.observed_at;
        h.reconciler.process(joined);
        assert_eq!(h.store.get(&a).unwrap().changed_at, joined_at);

        // an unchanged full sync does not move it
        tokio::time::advance(Duration::from_secs(5)).await;
        h.reconciler.process(event(&a, true, EventSource::FullSync));
        assert_eq!(h.store.get(&a).unwrap().changed_at, joined_at);
    }

    #[tokio::test]
    async fn test_poll_absence_needs_consecutive_misses() {
        let h = harness(3);
        let a = id("aa:00:00:00:00:01");
        let key = TaskKey::Device(a.clone());

        h.reconciler.process(event(&a, true, EventSource::Poll));
        let sent = h.queue.get(&key).unwrap();
        h.queue.ack(&key, sent.generation);

        assert!(h.reconciler.process(event(&a, false, EventSource::Poll)).is_none());
        assert!(h.reconciler.process(event(&a, false, EventSource::Poll)).is_none());
        assert!(h.store.get(&a).unwrap().present);

        let task = h.reconciler.process(event(&a, false, EventSource::Poll));
        assert!(task.is_some());
        assert!(!h.store.get(&a).unwrap().present);
        assert_eq!(pending_present(&h.queue, &a), Some(false));

        // further misses do not resend
        assert!(h.reconciler.process(event(&a, false, EventSource::Poll)).is_none());
    }

    #[tokio::test]
    async fn test_poll_sighting_resets_miss_counter() {
        let h = harness(3);
        let b = id("aa:00:00:00:00:02");
        let key = TaskKey::Device(b.clone());

        h.reconciler.process(event(&b, true, EventSource::Poll));
        let sent = h.queue.get(&key).unwrap();
        h.queue.ack(&key, sent.generation);

        h.reconciler.process(event(&b, false, EventSource::Poll));
        h.reconciler.process(event(&b, false, EventSource::Poll));
        assert_eq!(h.store.get(&b).unwrap().misses, 2);

        assert!(h.reconciler.process(event(&b, true, EventSource::Poll)).is_none());
        assert_eq!(h.store.get(&b).unwrap().misses, 0);

        h.reconciler.process(event(&b, false, EventSource::Poll));
        h.reconciler.process(event(&b, false, EventSource::Poll));
        assert!(h.store.get(&b).unwrap().present);
        assert!(h.queue.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_realtime_join_resets_miss_counter() {
        let h = harness(2);
        let a = id("aa:00:00:00:00:01");

        h.reconciler.process(event(&a, true, EventSource::Realtime));
        h.reconciler.process(event(&a, false, EventSource::Poll));
        h.reconciler.process(event(&a, true, EventSource::Realtime));
        assert!(h.reconciler.process(event(&a, false, EventSource::Poll)).is_none());
        assert!(h.store.get(&a).unwrap().present);
    }

    #[tokio::test]
    async fn test_full_sync_always_enqueues() {
        let h = harness(3);
        let a = id("aa:00:00:00:00:01");
        let key = TaskKey::Device(a.clone());

        for _ in 0..2 {
            let task = h.reconciler.process(event(&a, true, EventSource::FullSync)).unwrap();
            assert_eq!(h.queue.ack(&key, task.generation), crate::queue::Ack::Delivered);
            assert!(h.store.get(&a).unwrap().present);
        }

        let task = h.reconciler.process(event(&a, false, EventSource::FullSync));
        assert!(task.is_some());
        assert!(!h.store.get(&a).unwrap().present);
    }

    #[tokio::test]
    async fn test_payload_uses_labels() {
        let h = harness(1);
        let a = id("aa:00:00:00:00:01");

        let task = h.reconciler.process(event(&a, true, EventSource::Realtime)).unwrap();
        let Report::Seen { body, .. } = task.report else {
            panic!("expected a seen report");
        };
        assert_eq!(body["location_name"], serde_json::json!("home"));
        assert_eq!(body["mac"], serde_json::json!("aa:00:00:00:00:01"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(3);
        let (tx, rx) = mpsc::channel(8);
        let (trigger, shutdown) = Shutdown::channel();
        let a = id("aa:00:00:00:00:01");

        let queue = h.queue.clone();
        let handle = tokio::spawn(h.reconciler.run(rx, shutdown));
        tx.send(event(&a, true, EventSource::Realtime)).await.unwrap();
        while queue.len() == 0 {
            tokio::task::yield_now().await;
        }

        trigger.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(queue.len(), 1);
    }
}
