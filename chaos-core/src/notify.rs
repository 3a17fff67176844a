//! Webhook notification of cycle summaries (Apprise-style `{title, body}`
//! POST). Delivery failures are logged and swallowed; notification must
//! never affect the hop.
use std::time::Duration;

use config::SharedConfig;
use serde_json::json;
use tracing::warn;

use crate::hopper::HopSummary;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct Notifier {
    cfg: SharedConfig,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(cfg: SharedConfig) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
        }
    }

    pub async fn send_cycle_summary(&self, summary: &HopSummary) {
        let cfg = config::snapshot(&self.cfg);
        if !cfg.notifications.on_cycle_complete {
            return;
        }
        let body = format!(
            "VLAN {} | IP {} | {}s\nModules: {}",
            summary
                .vlan_id
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".into()),
            summary
                .ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "?".into()),
            summary.duration_sec,
            summary.modules_run.join(", "),
        );
        self.send("Chaos Bot — Cycle Complete", &body).await;
    }

    pub async fn send_error(&self, message: &str) {
        if !config::snapshot(&self.cfg).notifications.on_error {
            return;
        }
        self.send("Chaos Bot — Error", message).await;
    }

    async fn send(&self, title: &str, body: &str) {
        let cfg = config::snapshot(&self.cfg);
        if !cfg.notifications.enabled {
            return;
        }
        let Some(url) = cfg.notifications.apprise_url.clone() else {
            warn!("notifications enabled but no apprise_url configured");
            return;
        };
        let resp = self
            .http
            .post(&url)
            .timeout(SEND_TIMEOUT)
            .json(&json!({ "title": title, "body": body }))
            .send()
            .await;
        match resp {
            Ok(resp) if resp.status().is_client_error() || resp.status().is_server_error() => {
                warn!(status = %resp.status(), "notification endpoint returned error");
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "notification failed"),
        }
    }
}
