use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr as _;

use mac_address::{MacAddress, MacParseError};
use serde_json::{Map, Value};
use tokio::time::Instant;

/// Free-form per-device attributes merged into every presence report.
pub type Attributes = Map<String, Value>;

/// Stable identity of a tracked client: its hardware address, optionally
/// namespaced by the access point it was observed on.
#[derive(Clone, Debug)]
pub struct DeviceId {
    ap_name: Option<String>,
    mac: MacAddress,
}

impl DeviceId {
    pub fn new(mac: MacAddress, ap_name: Option<&str>) -> Self {
        DeviceId {
            ap_name: ap_name.map(str::to_string),
            mac,
        }
    }

    pub fn parse(address: &str, ap_name: Option<&str>) -> Result<Self, MacParseError> {
        Ok(Self::new(MacAddress::from_str(address.trim())?, ap_name))
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    fn sort_key(&self) -> (Option<&str>, [u8; 6]) {
        (self.ap_name.as_deref(), self.mac.bytes())
    }
}

impl PartialEq for DeviceId {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for DeviceId {}

impl Hash for DeviceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sort_key().hash(state)
    }
}

impl PartialOrd for DeviceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeviceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mac = self.mac.to_string().to_lowercase();
        match &self.ap_name {
            Some(ap_name) => write!(f, "{ap_name}_{mac}"),
            None => f.write_str(&mac),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSource {
    /// `ubus subscribe` assoc/disassoc notification.
    Realtime,
    /// Periodic client list poll.
    Poll,
    /// Unconditional resynchronization broadcast.
    FullSync,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventSource::Realtime => "realtime",
            EventSource::Poll => "poll",
            EventSource::FullSync => "full_sync",
        })
    }
}

#[derive(Clone, Debug)]
pub struct PresenceEvent {
    pub id: DeviceId,
    pub present: bool,
    pub observed_at: Instant,
    pub source: EventSource,
}

impl PresenceEvent {
    pub fn now(id: DeviceId, present: bool, source: EventSource) -> Self {
        PresenceEvent {
            id,
            present,
            observed_at: Instant::now(),
            source,
        }
    }
}

/// Queue key. Every device gets its own slot, the version report shares one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Device(DeviceId),
    SourceVersion,
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Device(id) => id.fmt(f),
            TaskKey::SourceVersion => f.write_str("<version>"),
        }
    }
}

/// Outbound payload, snapshotted when the task is enqueued.
#[derive(Clone, Debug, PartialEq)]
pub enum Report {
    /// `device_tracker.see` call. `body` is the complete JSON request body.
    Seen {
        device: DeviceId,
        present: bool,
        body: Value,
    },
    /// State update of the `sensor.<ap>_presence_detector_version` entity.
    Version { entity_id: String, version: String },
}

impl Report {
    pub fn seen(
        device: &DeviceId,
        present: bool,
        location_name: &str,
        metadata: &Attributes,
    ) -> Self {
        let mut body = Attributes::new();
        body.insert("mac".into(), Value::String(device.to_string()));
        body.insert("location_name".into(), Value::String(location_name.into()));
        body.insert("source_type".into(), Value::String("router".into()));
        body.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        if device.ap_name.is_some() {
            // namespaced identity wins over any configured override
            body.insert("mac".into(), Value::String(device.to_string()));
        }

        Report::Seen {
            device: device.clone(),
            present,
            body: Value::Object(body),
        }
    }

    pub fn version(ap_name: Option<&str>) -> Self {
        let slug = ap_name
            .map(entity_slug)
            .unwrap_or_else(|| "openwrt_router".to_string());
        Report::Version {
            entity_id: format!("sensor.{slug}_presence_detector_version"),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn entity_slug(name: &str) -> String {
    name.replace('-', "_").to_lowercase()
}
