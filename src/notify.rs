//! # Result Notification
//!
//! ## Responsibility
//! Tell an operator how a tuning session ended.
//!
//! ## Guarantees
//! - Messages are rendered identically for every transport
//! - Delivery failures surface as [`NotifyError`]; callers log and move on
//!
//! ## NOT Responsible For
//! - Retrying failed deliveries
//! - Deciding whether a session succeeded (that belongs to `tune::session`)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::NotificationConfig;
use crate::tune::TestOutcome;

/// Errors returned by a [`Notifier`].
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The receiver answered with a non-success HTTP status.
    #[error("webhook returned HTTP {status}")]
    Http {
        /// HTTP status code.
        status: u16,
    },

    /// The request could not be delivered.
    #[error("webhook delivery failed: {0}")]
    Transport(String),
}

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// One-line summary.
    pub subject: String,
    /// Multi-line details.
    pub body: String,
}

/// Render the message for a session result.
pub fn render_message(outcome: &TestOutcome) -> Message {
    let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    if outcome.success {
        Message {
            subject: "Bitaxe Optimization Complete - Improved Performance".to_string(),
            body: format!(
                "Optimization successful.\n\
                 \n\
                 Previous hashrate: {:.1} GH/s\n\
                 New hashrate: {:.1} GH/s\n\
                 Improvement: {:.1}%\n\
                 \n\
                 Previous temperature: {:.1}°C\n\
                 New temperature: {:.1}°C\n\
                 \n\
                 Applied frequency: {} MHz\n\
                 Applied voltage: {:.2} V\n\
                 \n\
                 Time: {stamp}\n",
                outcome.hashrate_before,
                outcome.hashrate_after,
                outcome.improvement_percent,
                outcome.temperature_before,
                outcome.temperature_after,
                outcome.candidate.frequency,
                outcome.candidate.voltage,
            ),
        }
    } else {
        Message {
            subject: "Bitaxe Optimization Failed".to_string(),
            body: format!(
                "No better settings were found; the device keeps its current settings.\n\
                 \n\
                 Hashrate: {:.1} GH/s\n\
                 Temperature: {:.1}°C\n\
                 Frequency: {} MHz\n\
                 Voltage: {:.2} V\n\
                 \n\
                 Time: {stamp}\n",
                outcome.hashrate_before,
                outcome.temperature_before,
                outcome.candidate.frequency,
                outcome.candidate.voltage,
            ),
        }
    }
}

/// Delivers session results.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `outcome`.
    async fn notify_optimization_result(&self, outcome: &TestOutcome) -> Result<(), NotifyError>;
}

/// Writes results to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_optimization_result(&self, outcome: &TestOutcome) -> Result<(), NotifyError> {
        let msg = render_message(outcome);
        info!(
            subject = %msg.subject,
            success = outcome.success,
            improvement_percent = outcome.improvement_percent,
            frequency_mhz = outcome.candidate.frequency,
            voltage = outcome.candidate.voltage,
            "optimization result"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    body: &'a str,
    outcome: &'a TestOutcome,
}

/// POSTs results as JSON `{subject, body, outcome}`.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Create a notifier posting to `url`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_optimization_result(&self, outcome: &TestOutcome) -> Result<(), NotifyError> {
        let msg = render_message(outcome);
        let payload = WebhookPayload {
            subject: &msg.subject,
            body: &msg.body,
            outcome,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NotifyError::Http {
                status: resp.status().as_u16(),
            });
        }
        info!(url = %self.url, subject = %msg.subject, "notification delivered");
        Ok(())
    }
}

/// Pick the notifier described by the `[notifications]` section.
///
/// A webhook is used only when notifications are enabled, result messages
/// are wanted and a URL is configured; otherwise results are logged.
pub fn from_config(cfg: &NotificationConfig) -> Arc<dyn Notifier> {
    match &cfg.webhook_url {
        Some(url) if cfg.enabled && cfg.notify_on_optimal => Arc::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(cfg.timeout_secs),
        )),
        _ => Arc::new(LogNotifier),
    }
}
