use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, bail};
use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::messages::Attributes;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub hass: HassConfig,
    pub interfaces: Option<Vec<String>>,
    pub ap_name: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub filter: FilterConfig,
    /// Extra `device_tracker.see` attributes keyed by MAC address.
    #[serde(default)]
    pub params: HashMap<String, Attributes>,
    pub location: Option<String>,
    pub away: Option<String>,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct HassConfig {
    pub url: Option<String>,
    pub token: String,
    pub timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct FilterConfig {
    pub is_denylist: Option<bool>,
    #[serde(default)]
    pub devices: Vec<String>,
}

/// Parsed allow/deny list.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    pub is_denylist: bool,
    pub devices: Vec<MacAddress>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct SyncConfig {
    pub poll_interval_seconds: Option<u64>,
    pub offline_after: Option<u32>,
    pub full_sync_interval_seconds: Option<u64>,
    pub retry_initial_seconds: Option<u64>,
    pub retry_max_seconds: Option<u64>,
    pub delivery_workers: Option<usize>,
    pub forget_after_seconds: Option<u64>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sync.offline_after() == 0 {
            bail!("sync.offline_after must be at least 1");
        }
        if self.sync.delivery_workers() == 0 {
            bail!("sync.delivery_workers must be at least 1");
        }
        if self.sync.retry_initial() > self.sync.retry_max() {
            bail!("sync.retry_initial_seconds must not exceed sync.retry_max_seconds");
        }
        if self.sync.retry_initial().is_zero() {
            bail!("sync.retry_initial_seconds must be at least 1");
        }
        self.filter.device_filter()?;
        self.device_metadata()?;
        Ok(())
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.interfaces
            .clone()
            .unwrap_or_else(|| vec!["hostapd.wlan0".to_string()])
    }

    pub fn location(&self) -> &str {
        self.location.as_deref().unwrap_or("home")
    }

    pub fn away(&self) -> &str {
        self.away.as_deref().unwrap_or("not_home")
    }

    /// Per-device attributes, keyed by parsed hardware address.
    pub fn device_metadata(&self) -> anyhow::Result<HashMap<[u8; 6], Arc<Attributes>>> {
        self.params
            .iter()
            .map(|(address, attributes)| {
                let mac = MacAddress::from_str(address)
                    .with_context(|| format!("invalid MAC address in params: {address}"))?;
                Ok((mac.bytes(), Arc::new(attributes.clone())))
            })
            .collect()
    }
}

impl HassConfig {
    pub fn url(&self) -> &str {
        self.url
            .as_deref()
            .unwrap_or("http://homeassistant.local:8123")
            .trim_end_matches('/')
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(5))
    }
}

impl FilterConfig {
    pub fn device_filter(&self) -> anyhow::Result<DeviceFilter> {
        let devices = self
            .devices
            .iter()
            .map(|address| {
                MacAddress::from_str(address)
                    .with_context(|| format!("invalid MAC address in filter: {address}"))
            })
            .collect::<anyhow::Result<_>>()?;
        Ok(DeviceFilter {
            is_denylist: self.is_denylist.unwrap_or(true),
            devices,
        })
    }
}

impl Default for DeviceFilter {
    /// An empty deny list, which lets every device through.
    fn default() -> Self {
        DeviceFilter {
            is_denylist: true,
            devices: Vec::new(),
        }
    }
}

impl DeviceFilter {
    /// Deny list: handle everything not listed. Allow list: handle only what is listed.
    pub fn should_handle(&self, mac: &MacAddress) -> bool {
        if self.devices.contains(mac) {
            !self.is_denylist
        } else {
            self.is_denylist
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.unwrap_or(30))
    }

    pub fn offline_after(&self) -> u32 {
        self.offline_after.unwrap_or(3)
    }

    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_secs(self.full_sync_interval_seconds.unwrap_or(0))
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_secs(self.retry_initial_seconds.unwrap_or(5))
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_secs(self.retry_max_seconds.unwrap_or(300))
    }

    pub fn delivery_workers(&self) -> usize {
        self.delivery_workers.unwrap_or(2)
    }

    /// How long an absent device stays tracked. `None` when set to 0.
    pub fn forget_after(&self) -> Option<Duration> {
        let seconds = self.forget_after_seconds.unwrap_or(86_400);
        (seconds > 0).then(|| Duration::from_secs(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddress {
        MacAddress::from_str(s).unwrap()
    }

    #[test]
    fn test_config() {
        let config_str = r#"
            interfaces = ["hostapd.wlan0", "hostapd.wlan1"]
            ap_name = "attic"
            location = "casa"

            [hass]
            url = "http://hass.lan:8123/"
            token = "secret"

            [filter]
            is_denylist = false
            devices = ["AA:BB:CC:DD:EE:FF"]

            [params."aa:bb:cc:dd:ee:ff"]
            dev_id = "phone"
            gps_accuracy = 10

            [sync]
            poll_interval_seconds = 10
            offline_after = 2
            full_sync_interval_seconds = 60
            forget_after_seconds = 0
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.hass.url(), "http://hass.lan:8123");
        assert_eq!(config.hass.timeout(), Duration::from_secs(5));
        assert_eq!(config.interfaces().len(), 2);
        assert_eq!(config.location(), "casa");
        assert_eq!(config.away(), "not_home");
        assert_eq!(config.sync.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.sync.offline_after(), 2);
        assert_eq!(config.sync.full_sync_interval(), Duration::from_secs(60));
        assert_eq!(config.sync.retry_max(), Duration::from_secs(300));
        assert_eq!(config.sync.forget_after(), None);

        let metadata = config.device_metadata().unwrap();
        let phone = &metadata[&mac("aa:bb:cc:dd:ee:ff").bytes()];
        assert_eq!(phone["dev_id"], serde_json::json!("phone"));
        assert_eq!(phone["gps_accuracy"], serde_json::json!(10));
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config: AppConfig = toml::de::from_str("[hass]\ntoken = \"t\"").unwrap();
        config.validate().unwrap();

        assert_eq!(config.hass.url(), "http://homeassistant.local:8123");
        assert_eq!(config.interfaces(), vec!["hostapd.wlan0".to_string()]);
        assert_eq!(config.sync.full_sync_interval(), Duration::ZERO);
        assert_eq!(config.sync.delivery_workers(), 2);
        assert_eq!(config.sync.forget_after(), Some(Duration::from_secs(86_400)));
        assert!(!config.debug);
    }

    #[test]
    fn test_invalid_params_key() {
        let config: AppConfig =
            toml::de::from_str("[hass]\ntoken = \"t\"\n[params.bogus]\nname = \"x\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_offline_after_rejected() {
        let config: AppConfig =
            toml::de::from_str("[hass]\ntoken = \"t\"\n[sync]\noffline_after = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_filter() {
        let listed = mac("aa:bb:cc:dd:ee:ff");
        let other = mac("11:22:33:44:55:66");

        let deny = FilterConfig {
            is_denylist: None,
            devices: vec!["AA:BB:CC:DD:EE:FF".to_string()],
        }
        .device_filter()
        .unwrap();
        assert!(!deny.should_handle(&listed));
        assert!(deny.should_handle(&other));

        let allow = FilterConfig {
            is_denylist: Some(false),
            devices: vec!["aa:bb:cc:dd:ee:ff".to_string()],
        }
        .device_filter()
        .unwrap();
        assert!(allow.should_handle(&listed));
        assert!(!allow.should_handle(&other));

        assert!(DeviceFilter::default().should_handle(&listed));
    }

    #[test]
    fn test_invalid_filter_address() {
        let config: AppConfig =
            toml::de::from_str("[hass]\ntoken = \"t\"\n[filter]\ndevices = [\"nope\"]").unwrap();
        assert!(config.validate().is_err());
    }
}
