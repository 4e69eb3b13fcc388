//! Operator alerts over Telegram.
//!
//! Alerting is best-effort: a failed delivery is logged and never propagates
//! into the control loop.

use crate::config::AlertsConfig;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    telegram: Option<(String, String)>,
}

impl Notifier {
    pub fn new(cfg: &AlertsConfig) -> Self {
        let telegram = match (&cfg.telegram_bot_token, &cfg.telegram_chat_id) {
            (Some(token), Some(chat_id)) => Some((token.clone(), chat_id.clone())),
            _ => None,
        };
        Self {
            client: reqwest::Client::new(),
            telegram,
        }
    }

    /// Send an operator alert. No-op when no transport is configured.
    pub async fn send(&self, msg: &str) {
        let Some((token, chat_id)) = &self.telegram else {
            debug!(msg, "No alert transport configured, dropping alert");
            return;
        };

        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let body = serde_json::json!({ "chat_id": chat_id, "text": msg });
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "Alert delivery rejected"),
            Err(e) => warn!(error = %e, "Alert delivery failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_notifier_is_noop() {
        let notifier = Notifier::new(&AlertsConfig::default());
        // Must not panic or attempt network I/O.
        notifier.send("test alert").await;
    }
}
