use log::debug;
use serde_json::json;

use crate::config::HassConfig;
use crate::messages::Report;
use crate::worker::{DeliveryError, Reporter};

/// Home Assistant REST client used to deliver presence reports.
#[derive(Debug, Clone)]
pub struct HassClient {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HassClient {
    pub fn new(config: &HassConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("wifi-presence/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(HassClient {
            client,
            url: config.url().to_string(),
            token: config.token.clone(),
        })
    }

    fn endpoint(&self, report: &Report) -> String {
        match report {
            Report::Seen { .. } => format!("{}/api/services/device_tracker/see", self.url),
            Report::Version { entity_id, .. } => format!("{}/api/states/{}", self.url, entity_id),
        }
    }
}

fn request_body(report: &Report) -> serde_json::Value {
    match report {
        Report::Seen { body, .. } => body.clone(),
        Report::Version { version, .. } => json!({ "state": version }),
    }
}

impl Reporter for HassClient {
    async fn report(&self, report: &Report) -> Result<(), DeliveryError> {
        let url = self.endpoint(report);
        let body = request_body(report);
        debug!("Posting to {}: {}", url, body);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        debug!("API response ({}): {}", status, text);

        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body: text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DeviceId;

    fn client() -> HassClient {
        let config: HassConfig = toml::de::from_str(
            r#"
                url = "http://hass.lan:8123/"
                token = "secret"
            "#,
        )
        .unwrap();
        HassClient::new(&config).unwrap()
    }

    #[test]
    fn test_endpoints() {
        let client = client();
        let id = DeviceId::parse("aa:bb:cc:dd:ee:ff", None).unwrap();

        let seen = Report::seen(&id, true, "home", &Default::default());
        assert_eq!(
            client.endpoint(&seen),
            "http://hass.lan:8123/api/services/device_tracker/see"
        );

        let version = Report::version(Some("attic"));
        assert_eq!(
            client.endpoint(&version),
            "http://hass.lan:8123/api/states/sensor.attic_presence_detector_version"
        );
    }

    #[test]
    fn test_version_body() {
        let body = request_body(&Report::version(None));
        assert_eq!(body, json!({ "state": env!("CARGO_PKG_VERSION") }));
    }
}
