use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::messages::{Attributes, DeviceId};

#[derive(Clone, Debug)]
pub struct DeviceRecord {
    pub id: DeviceId,
    /// Last state accepted for delivery (not necessarily delivered yet).
    pub present: bool,
    pub last_seen: Option<Instant>,
    /// When `present` last flipped, or when the record was created.
    pub changed_at: Instant,
    /// Consecutive polls that did not find the device.
    pub misses: u32,
    pub metadata: Arc<Attributes>,
}

/// Last known presence of every device seen since startup.
///
/// Records are only mutated through [`StateStore::update`], which runs the
/// caller's closure under the store lock so a read-decide-write sequence for
/// one device cannot interleave with another.
pub struct StateStore {
    records: Mutex<HashMap<DeviceId, DeviceRecord>>,
    metadata: HashMap<[u8; 6], Arc<Attributes>>,
    no_metadata: Arc<Attributes>,
    /// How long an absent device is remembered. `None` keeps it forever.
    retention: Option<Duration>,
}

impl StateStore {
    pub fn new(metadata: HashMap<[u8; 6], Arc<Attributes>>) -> Self {
        StateStore {
            records: Mutex::new(HashMap::new()),
            metadata,
            no_metadata: Arc::new(Attributes::new()),
            retention: None,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Compare-and-update the record for `id`, creating an absent record on
    /// first sighting.
    pub fn update<T>(&self, id: &DeviceId, f: impl FnOnce(&mut DeviceRecord) -> T) -> T {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records.entry(id.clone()).or_insert_with(|| DeviceRecord {
            id: id.clone(),
            present: false,
            last_seen: None,
            changed_at: Instant::now(),
            misses: 0,
            metadata: self
                .metadata
                .get(&id.mac().bytes())
                .cloned()
                .unwrap_or_else(|| self.no_metadata.clone()),
        });
        f(record)
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.get(id).cloned()
    }

    /// Forget a device entirely.
    pub fn remove(&self, id: &DeviceId) -> Option<DeviceRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.remove(id)
    }

    /// Drop devices that have been absent for longer than the retention
    /// window and return them.
    pub fn forget_stale(&self) -> Vec<DeviceId> {
        let Some(retention) = self.retention else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stale: Vec<DeviceId> = records
            .values()
            .filter(|record| {
                !record.present && now.duration_since(record.changed_at) >= retention
            })
            .map(|record| record.id.clone())
            .collect();
        stale.sort();
        for id in &stale {
            records.remove(id);
        }
        stale
    }

    /// Devices whose last accepted state is present.
    pub fn present_ids(&self) -> Vec<DeviceId> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = records
            .values()
            .filter(|record| record.present)
            .map(|record| record.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn known_ids(&self) -> Vec<DeviceId> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
