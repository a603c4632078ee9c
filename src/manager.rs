use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{AppConfig, DeviceFilter};
use crate::engine::{Labels, Reconciler};
use crate::messages::{Report, TaskKey};
use crate::queue::{Backoff, DeliveryQueue};
use crate::scanner::{EventSink, RosterSource, Watcher};
use crate::scheduler::{FullSync, Poller};
use crate::store::StateStore;
use crate::worker::{DeliveryWorker, RemoteStatus, Reporter};

const EVENT_BUFFER: usize = 256;

/// Cooperative stop signal handed to every task.
#[derive(Clone, Debug)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown(rx))
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is requested or the trigger is dropped.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

/// Shared state of a running manager that outlives task startup.
#[derive(Clone)]
pub struct Tracker {
    store: Arc<StateStore>,
    queue: Arc<DeliveryQueue>,
    sink: EventSink,
}

impl Tracker {
    /// Install a new allow/deny list and forget every device it excludes,
    /// along with any report still pending for it. Returns how many devices
    /// were dropped.
    pub fn apply_filter(&self, filter: DeviceFilter) -> usize {
        self.sink.set_filter(filter);
        let mut dropped = 0;
        for id in self.store.known_ids() {
            if self.sink.should_handle(&id.mac()) {
                continue;
            }
            self.store.remove(&id);
            if self.queue.remove(&TaskKey::Device(id.clone())).is_some() {
                debug!("Discarded pending report for {}", id);
            }
            info!("No longer tracking {}", id);
            dropped += 1;
        }
        dropped
    }
}

pub struct Manager<R, S> {
    config: AppConfig,
    config_path: Option<PathBuf>,
    reporter: Arc<R>,
    roster: Arc<S>,
}

impl<R: Reporter, S: RosterSource> Manager<R, S> {
    pub fn new(config: AppConfig, reporter: R, roster: S) -> Self {
        Manager {
            config,
            config_path: None,
            reporter: Arc::new(reporter),
            roster: Arc::new(roster),
        }
    }

    /// Re-read the device filter from `path` on SIGHUP.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Wire up the store, queue and every task, and start them.
    pub fn start(&self, shutdown: Shutdown) -> anyhow::Result<(Tracker, Vec<JoinHandle<()>>)> {
        let config = &self.config;
        let ap_name = config.ap_name.clone();

        let mut store = StateStore::new(config.device_metadata()?);
        if let Some(retention) = config.sync.forget_after() {
            store = store.with_retention(retention);
        }
        let store = Arc::new(store);
        let queue = Arc::new(DeliveryQueue::new(Backoff {
            initial: config.sync.retry_initial(),
            max: config.sync.retry_max(),
        }));
        let status = Arc::new(RemoteStatus::default());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let sink = EventSink::new(tx, config.filter.device_filter()?, ap_name.clone());

        let version = Report::version(ap_name.as_deref());
        queue.upsert(TaskKey::SourceVersion, version.clone());

        let tracker = Tracker {
            store: store.clone(),
            queue: queue.clone(),
            sink: sink.clone(),
        };
        let mut handles = Vec::new();

        let labels = Labels {
            home: config.location().to_string(),
            away: config.away().to_string(),
        };
        let reconciler = Reconciler::new(
            store.clone(),
            queue.clone(),
            labels,
            config.sync.offline_after(),
        );
        handles.push(tokio::spawn(reconciler.run(rx, shutdown.clone())));

        for id in 0..config.sync.delivery_workers() {
            let worker =
                DeliveryWorker::new(id, queue.clone(), self.reporter.clone(), status.clone());
            handles.push(tokio::spawn(worker.run(shutdown.clone())));
        }

        for interface in config.interfaces() {
            let watcher = Watcher::new(interface, sink.clone());
            handles.push(tokio::spawn(watcher.run(shutdown.clone())));
        }

        let poll_interval = config.sync.poll_interval();
        if poll_interval.is_zero() {
            info!("Polling disabled");
        } else {
            let poller = Poller::new(
                self.roster.clone(),
                store.clone(),
                sink.clone(),
                poll_interval,
            );
            handles.push(tokio::spawn(poller.run(shutdown.clone())));
        }

        // always running, it also answers remote recovery
        let full_sync_interval = config.sync.full_sync_interval();
        let every = if full_sync_interval.is_zero() {
            info!("Periodic full sync disabled");
            None
        } else {
            Some(full_sync_interval)
        };
        let full_sync = FullSync::new(
            self.roster.clone(),
            store,
            sink,
            queue,
            status,
            version,
            every,
        );
        handles.push(tokio::spawn(full_sync.run(shutdown)));

        Ok((tracker, handles))
    }

    pub async fn run_loop(self) -> anyhow::Result<()> {
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;

        let (trigger, shutdown) = Shutdown::channel();
        let (tracker, handles) = self.start(shutdown)?;
        info!("Started {} tasks", handles.len());

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    break;
                }
                _ = terminate.recv() => {
                    debug!("Received SIGTERM");
                    break;
                }
                _ = hangup.recv() => self.reload(&tracker),
            }
        }
        info!("Stopping...");
        trigger.send_replace(true);

        for result in join_all(handles).await {
            if let Err(err) = result {
                error!("Task failed: {:?}", err);
            }
        }
        info!("Exiting manager event loop");
        Ok(())
    }

    /// Only the device filter is picked up; other settings need a restart.
    fn reload(&self, tracker: &Tracker) {
        let Some(path) = &self.config_path else {
            debug!("Ignoring SIGHUP, no config file to reload");
            return;
        };
        let filter = AppConfig::load(path).and_then(|config| config.filter.device_filter());
        match filter {
            Ok(filter) => {
                let dropped = tracker.apply_filter(filter);
                info!(
                    "Reloaded device filter from {} ({} devices dropped)",
                    path.display(),
                    dropped
                );
            }
            Err(err) => warn!("Keeping current device filter: {:#}", err),
        }
    }
}
