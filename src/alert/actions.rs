//! Alert actions and the registry that builds them from rule documents.

use crate::db::AlertEvent;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Action error types.
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("invalid action configuration: {0}")]
    Config(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("action timed out after {0:?}")]
    Timeout(Duration),
}

/// One entry of a rule's action list, e.g. `{"type": "webhook", "url": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// Parse a rule's stored action list.
///
/// Entries that are not objects with a string `type` are logged and
/// dropped; the rest of the list is still returned.
pub fn parse_action_specs(raw: &str) -> Result<Vec<ActionSpec>, serde_json::Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<Value> = serde_json::from_str(trimmed)?;
    let specs = entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<ActionSpec>(entry) {
            Ok(spec) => Some(spec),
            Err(e) => {
                tracing::warn!("Ignoring malformed action entry: {}", e);
                None
            }
        })
        .collect();

    Ok(specs)
}

/// Something done when a rule triggers.
#[async_trait]
pub trait AlertAction: Send + Sync {
    fn kind(&self) -> &str;

    async fn execute(&self, event: &AlertEvent) -> Result<(), ActionError>;
}

/// Factory for one action type.
pub trait ActionPlugin: Send + Sync {
    /// The `type` value this plugin handles.
    fn kind(&self) -> &str;

    /// Build an action from the entry's remaining fields.
    fn build(&self, params: &Map<String, Value>) -> Result<Box<dyn AlertAction>, ActionError>;
}

/// Registry of available [`ActionPlugin`]s, keyed by type name.
pub struct ActionRegistry {
    plugins: HashMap<String, Box<dyn ActionPlugin>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Registry with the built-in `log`, `webhook`, `email` and `sms` actions.
    pub fn with_builtins(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(LogPlugin));
        registry.register(Box::new(WebhookPlugin { client }));
        registry.register(Box::new(EmailPlugin));
        registry.register(Box::new(SmsPlugin));
        registry
    }

    pub fn register(&mut self, plugin: Box<dyn ActionPlugin>) {
        let kind = plugin.kind().to_string();
        self.plugins.insert(kind, plugin);
    }

    /// Build the action for a spec. `None` means the type is unknown.
    pub fn build(&self, spec: &ActionSpec) -> Option<Result<Box<dyn AlertAction>, ActionError>> {
        self.plugins
            .get(&spec.kind)
            .map(|plugin| plugin.build(&spec.params))
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_builtins(reqwest::Client::new())
    }
}

fn required_str(params: &Map<String, Value>, key: &str) -> Result<String, ActionError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| ActionError::Config(format!("missing \"{key}\"")))
}

// --- log ---

struct LogPlugin;

impl ActionPlugin for LogPlugin {
    fn kind(&self) -> &str {
        "log"
    }

    fn build(&self, _params: &Map<String, Value>) -> Result<Box<dyn AlertAction>, ActionError> {
        Ok(Box::new(LogAction))
    }
}

/// Writes the alert to the service log.
pub struct LogAction;

#[async_trait]
impl AlertAction for LogAction {
    fn kind(&self) -> &str {
        "log"
    }

    async fn execute(&self, event: &AlertEvent) -> Result<(), ActionError> {
        tracing::warn!(
            alert_id = event.alert_id,
            "[ALERT] {}: {} {} {} (current: {})",
            event.alert_name,
            event.metric,
            event.condition,
            event.threshold,
            event.actual_value
        );
        Ok(())
    }
}

// --- webhook ---

struct WebhookPlugin {
    client: reqwest::Client,
}

impl ActionPlugin for WebhookPlugin {
    fn kind(&self) -> &str {
        "webhook"
    }

    fn build(&self, params: &Map<String, Value>) -> Result<Box<dyn AlertAction>, ActionError> {
        let url = required_str(params, "url")?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ActionError::Config(format!("unsupported webhook url: {url}")));
        }
        Ok(Box::new(WebhookAction {
            client: self.client.clone(),
            url,
        }))
    }
}

/// JSON body posted to webhook sinks.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload<'a> {
    pub alert_name: &'a str,
    pub metric: &'a str,
    pub condition: &'a str,
    pub threshold: f64,
    pub actual_value: f64,
    pub message: &'a str,
    pub timestamp: DateTime<Utc>,
}

impl<'a> From<&'a AlertEvent> for WebhookPayload<'a> {
    fn from(event: &'a AlertEvent) -> Self {
        Self {
            alert_name: &event.alert_name,
            metric: &event.metric,
            condition: &event.condition,
            threshold: event.threshold,
            actual_value: event.actual_value,
            message: &event.message,
            timestamp: event.triggered_at,
        }
    }
}

/// POSTs the alert as JSON to a URL. Anything but a 2xx is a failure.
pub struct WebhookAction {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl AlertAction for WebhookAction {
    fn kind(&self) -> &str {
        "webhook"
    }

    async fn execute(&self, event: &AlertEvent) -> Result<(), ActionError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload::from(event))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ActionError::Status(status));
        }

        tracing::info!(alert_id = event.alert_id, url = %self.url, "Webhook sent for alert {}", event.alert_name);
        Ok(())
    }
}

// --- email / sms ---
//
// No mail or SMS gateway is wired in; these render the notification to the
// log with its recipient so that the intent is on record.

struct EmailPlugin;

impl ActionPlugin for EmailPlugin {
    fn kind(&self) -> &str {
        "email"
    }

    fn build(&self, params: &Map<String, Value>) -> Result<Box<dyn AlertAction>, ActionError> {
        Ok(Box::new(EmailAction {
            recipient: required_str(params, "recipient")?,
        }))
    }
}

pub struct EmailAction {
    recipient: String,
}

#[async_trait]
impl AlertAction for EmailAction {
    fn kind(&self) -> &str {
        "email"
    }

    async fn execute(&self, event: &AlertEvent) -> Result<(), ActionError> {
        tracing::info!(
            alert_id = event.alert_id,
            recipient = %self.recipient,
            "Email alert: {} - {} (metric {} {} {}, current {}, at {})",
            event.alert_name,
            event.message,
            event.metric,
            event.condition,
            event.threshold,
            event.actual_value,
            event.triggered_at.to_rfc3339()
        );
        Ok(())
    }
}

struct SmsPlugin;

impl ActionPlugin for SmsPlugin {
    fn kind(&self) -> &str {
        "sms"
    }

    fn build(&self, params: &Map<String, Value>) -> Result<Box<dyn AlertAction>, ActionError> {
        Ok(Box::new(SmsAction {
            phone: required_str(params, "phone")?,
        }))
    }
}

pub struct SmsAction {
    phone: String,
}

#[async_trait]
impl AlertAction for SmsAction {
    fn kind(&self) -> &str {
        "sms"
    }

    async fn execute(&self, event: &AlertEvent) -> Result<(), ActionError> {
        tracing::info!(
            alert_id = event.alert_id,
            phone = %self.phone,
            "SMS alert: {} ({} = {})",
            event.alert_name,
            event.metric,
            event.actual_value
        );
        Ok(())
    }
}
