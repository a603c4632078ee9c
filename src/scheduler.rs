use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::{Interval, MissedTickBehavior, interval};

use crate::manager::Shutdown;
use crate::messages::{DeviceId, EventSource, Report, TaskKey};
use crate::queue::DeliveryQueue;
use crate::scanner::{EventSink, RosterSource};
use crate::store::StateStore;
use crate::worker::RemoteStatus;

/// Every device currently on the roster, plus every device still recorded as
/// present that is not, paired with whether it was on the roster.
fn roster_sweep(
    sink: &EventSink,
    store: &StateStore,
    roster: &[mac_address::MacAddress],
) -> Vec<(DeviceId, bool)> {
    let online: BTreeSet<DeviceId> = roster.iter().map(|mac| sink.device_id(*mac)).collect();
    let departed: Vec<_> = store
        .present_ids()
        .into_iter()
        .filter(|id| !online.contains(id))
        .map(|id| (id, false))
        .collect();
    online.into_iter().map(|id| (id, true)).chain(departed).collect()
}

/// Fetch the roster and emit one event per device. Returns the number of
/// events emitted, or `None` if the roster could not be fetched.
async fn sweep<S: RosterSource>(
    source: &S,
    sink: &EventSink,
    store: &StateStore,
    event_source: EventSource,
) -> Option<usize> {
    for id in store.forget_stale() {
        debug!("Forgetting {}, absent past retention", id);
    }

    let roster = match source.online_devices().await {
        Ok(roster) => roster,
        Err(err) => {
            warn!("Skipping {} cycle, roster unavailable: {:#}", event_source, err);
            return None;
        }
    };

    let mut emitted = 0;
    for (id, present) in roster_sweep(sink, store, &roster) {
        if !sink.emit(id, present, event_source).await {
            break;
        }
        emitted += 1;
    }
    Some(emitted)
}

fn ticker(every: Duration) -> Interval {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Periodically compares the client list against known devices. The first
/// poll runs immediately.
pub struct Poller<S> {
    source: Arc<S>,
    store: Arc<StateStore>,
    sink: EventSink,
    every: Duration,
}

impl<S: RosterSource> Poller<S> {
    pub fn new(source: Arc<S>, store: Arc<StateStore>, sink: EventSink, every: Duration) -> Self {
        Poller {
            source,
            store,
            sink,
            every,
        }
    }

    pub async fn poll_once(&self) -> Option<usize> {
        let polled = sweep(&*self.source, &self.sink, &self.store, EventSource::Poll).await;
        debug!("Polled {:?} devices, tracking {}", polled, self.store.len());
        polled
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        let mut ticker = ticker(self.every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.wait() => break,
            }
        }
        debug!("Poller stopped");
    }
}

/// Rebroadcasts every known device right after the remote service recovers
/// from an outage, and on a fixed interval when one is set.
pub struct FullSync<S> {
    source: Arc<S>,
    store: Arc<StateStore>,
    sink: EventSink,
    queue: Arc<DeliveryQueue>,
    status: Arc<RemoteStatus>,
    version: Report,
    every: Option<Duration>,
}

impl<S: RosterSource> FullSync<S> {
    pub fn new(
        source: Arc<S>,
        store: Arc<StateStore>,
        sink: EventSink,
        queue: Arc<DeliveryQueue>,
        status: Arc<RemoteStatus>,
        version: Report,
        every: Option<Duration>,
    ) -> Self {
        FullSync {
            source,
            store,
            sink,
            queue,
            status,
            version,
            every,
        }
    }

    pub async fn sync_once(&self) -> Option<usize> {
        let synced = sweep(&*self.source, &self.sink, &self.store, EventSource::FullSync).await;
        if let Some(count) = synced {
            info!("Full sync of {} devices", count);
        }
        synced
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        let mut ticker = self.every.map(ticker);
        loop {
            tokio::select! {
                _ = next_tick(&mut ticker) => {
                    self.sync_once().await;
                }
                _ = self.status.recovered() => {
                    info!("Remote service recovered, resyncing");
                    self.queue.upsert(TaskKey::SourceVersion, self.version.clone());
                    self.sync_once().await;
                }
                _ = shutdown.wait() => break,
            }
        }
        debug!("Full sync stopped");
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}
