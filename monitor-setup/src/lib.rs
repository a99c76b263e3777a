use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const MONITOR_FREQUENCY_MINUTES: u32 = 15;
pub const MONITOR_SLA_SECONDS: f64 = 7.0;
pub const MONITOR_LOCATIONS: [&str; 4] = [
    "AWS_US_EAST_1",
    "AWS_US_WEST_1",
    "AWS_EU_WEST_2",
    "AWS_AP_SOUTHEAST_2",
];

const DEFAULT_MONITOR_API: &str = "https://synthetics.newrelic.com/synthetics/api/v3";
const DEFAULT_ALERTS_API: &str = "https://api.newrelic.com/v2";
const API_KEY_HEADER: &str = "Api-Key";

const PAGE_SIZE: u32 = 100;
// The list API does not flag its last page; a short page ends the scan.
const LAST_PAGE_THRESHOLD: usize = 10;

const SCRIPT_TEMPLATE: &str = include_str!("monitor_script.js");
pub const SCRIPT_URL_PLACEHOLDER: &str = "$$URL$$";

/// The check script for one deployment, with the endpoint URL substituted
/// into the template.
pub fn monitor_script(url: &str) -> String {
    SCRIPT_TEMPLATE.replace(SCRIPT_URL_PLACEHOLDER, url)
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("monitor creation failed with status {status}: {body}")]
    MonitorCreation { status: u16, body: String },
    #[error("script update failed with status {status}: {body}")]
    ScriptUpdate { status: u16, body: String },
    #[error("channel creation failed with status {status}: {body}")]
    ChannelCreation { status: u16, body: String },
    #[error("monitor returned by the API has no id")]
    MissingMonitorId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Monitor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub monitor_type: String,
    pub frequency: u32,
    pub locations: Vec<String>,
    #[serde(rename = "slaThreshold")]
    pub sla_threshold: f64,
    pub status: String,
}

#[derive(Deserialize, Debug)]
struct MonitorPage {
    monitors: Vec<Monitor>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ChannelConfiguration {
    #[serde(default)]
    pub recipients: String,
    #[serde(default)]
    pub include_json_attachment: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Channel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default)]
    pub configuration: ChannelConfiguration,
}

#[derive(Deserialize, Debug)]
struct ChannelPage {
    channels: Vec<Channel>,
}

pub struct SyntheticsClient {
    client: Client,
    monitor_api: String,
    alerts_api: String,
    api_key: String,
}

impl SyntheticsClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        let monitor_api =
            std::env::var("MONITOR_API_URL").unwrap_or_else(|_| DEFAULT_MONITOR_API.to_string());
        let alerts_api =
            std::env::var("ALERTS_API_URL").unwrap_or_else(|_| DEFAULT_ALERTS_API.to_string());
        Self::with_endpoints(monitor_api, alerts_api, api_key)
    }

    pub fn with_endpoints(
        monitor_api: impl Into<String>,
        alerts_api: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            monitor_api: monitor_api.into(),
            alerts_api: alerts_api.into(),
            api_key: api_key.into(),
        }
    }

    /// Scans the paginated monitor list for a monitor matching the given id
    /// or, when no id is given, the given name.
    pub async fn find_monitor(
        &self,
        name: &str,
        id: Option<&str>,
    ) -> Result<Option<Monitor>, SetupError> {
        let mut offset = 0;
        loop {
            let page: MonitorPage = self
                .client
                .get(format!("{}/monitors", self.monitor_api))
                .query(&[("offset", offset.to_string()), ("limit", PAGE_SIZE.to_string())])
                .header(API_KEY_HEADER, &self.api_key)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            let found = page.monitors.iter().find(|monitor| match id {
                Some(id) => monitor.id.as_deref() == Some(id),
                None => monitor.name == name,
            });
            if let Some(monitor) = found {
                return Ok(Some(monitor.clone()));
            }

            if page.monitors.len() < LAST_PAGE_THRESHOLD {
                return Ok(None);
            }
            offset += PAGE_SIZE;
        }
    }

    pub async fn create_monitor(&self, name: &str) -> Result<(), SetupError> {
        let monitor = Monitor {
            id: None,
            name: name.to_string(),
            monitor_type: "SCRIPT_API".to_string(),
            frequency: MONITOR_FREQUENCY_MINUTES,
            locations: MONITOR_LOCATIONS.iter().map(|s| s.to_string()).collect(),
            sla_threshold: MONITOR_SLA_SECONDS,
            status: "ENABLED".to_string(),
        };

        let response = self
            .client
            .post(format!("{}/monitors", self.monitor_api))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&monitor)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|err| err.to_string());
            return Err(SetupError::MonitorCreation {
                status: status.as_u16(),
                body,
            });
        }

        info!("Monitor {} created", name);
        Ok(())
    }

    pub async fn update_script(&self, monitor_id: &str, url: &str) -> Result<(), SetupError> {
        let payload = serde_json::json!({
            "scriptText": BASE64.encode(monitor_script(url)),
        });

        let response = self
            .client
            .put(format!("{}/monitors/{}/script", self.monitor_api, monitor_id))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|err| err.to_string());
            return Err(SetupError::ScriptUpdate {
                status: status.as_u16(),
                body,
            });
        }

        info!("Monitor script updated for {}", monitor_id);
        Ok(())
    }

    /// Uploads the check script to the named monitor, creating the monitor
    /// with fixed parameters first when it does not exist yet.
    pub async fn update_or_create_monitor(
        &self,
        url: &str,
        name: &str,
        monitor_id: Option<&str>,
    ) -> Result<(), SetupError> {
        match self.find_monitor(name, monitor_id).await? {
            Some(monitor) => {
                let id = monitor.id.as_deref().ok_or(SetupError::MissingMonitorId)?;
                info!("Updating monitor {} ({})", monitor.name, id);
                self.update_script(id, url).await
            }
            None => {
                info!("Monitor {} not found, creating it", name);
                self.create_monitor(name).await?;
                // The freshly created monitor is looked up by name; a stale
                // --monitor_id would never match it.
                Box::pin(self.update_or_create_monitor(url, name, None)).await
            }
        }
    }

    /// Finds an email notification channel whose recipient matches.
    pub async fn find_channel(&self, email: &str) -> Result<Option<Channel>, SetupError> {
        let page: ChannelPage = self
            .client
            .get(format!("{}/alerts_channels.json", self.alerts_api))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(page
            .channels
            .into_iter()
            .find(|channel| channel.channel_type == "email" && channel.configuration.recipients == email))
    }

    pub async fn create_channel(&self, name: &str, email: &str) -> Result<Channel, SetupError> {
        let channel = Channel {
            id: None,
            name: format!("{} alerts", name),
            channel_type: "email".to_string(),
            configuration: ChannelConfiguration {
                recipients: email.to_string(),
                include_json_attachment: false,
            },
        };

        let response = self
            .client
            .post(format!("{}/alerts_channels.json", self.alerts_api))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&serde_json::json!({ "channel": channel }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|err| err.to_string());
            return Err(SetupError::ChannelCreation {
                status: status.as_u16(),
                body,
            });
        }

        info!("Notification channel created for {}", email);
        Ok(channel)
    }

    /// Reuses an existing email channel when one matches, creating one
    /// otherwise.
    pub async fn ensure_channel(&self, name: &str, email: &str) -> Result<Channel, SetupError> {
        if let Some(channel) = self.find_channel(email).await? {
            info!("Reusing notification channel {}", channel.name);
            return Ok(channel);
        }
        self.create_channel(name, email).await
    }

    // Interface kept for when policy linkage lands upstream.
    pub async fn link_alert_policy(
        &self,
        name: &str,
        monitor_id: Option<&str>,
        policy_id: Option<&str>,
        channel_id: Option<u64>,
    ) -> Result<(), SetupError> {
        warn!(
            "Alert policy linkage is not implemented (name: {}, monitor: {:?}, policy: {:?}, channel: {:?})",
            name, monitor_id, policy_id, channel_id
        );
        Ok(())
    }
}
