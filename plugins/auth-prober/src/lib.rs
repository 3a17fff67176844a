//! Authentication prober: intentionally failing logins against configured
//! protocols, source-bound, capped at `max_attempts` per target per protocol
//! per cycle. The attempt ceiling is the anti-abuse invariant; nothing here
//! may loop past it.
use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chaos_core::{
    metrics,
    module::{Binding, BoundSource, ModuleReport, Probe, ProbeStatus},
};
use cmd_exec::{CommandExecutor, ExecError};
use config::SharedConfig;
use rand::{seq::SliceRandom, thread_rng, Rng};
use serde_json::{json, Value};
use tracing::{error, info};

const SSH_TIMEOUT: Duration = Duration::from_secs(5);
const RDP_TIMEOUT: Duration = Duration::from_secs(15);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AuthProber {
    binding: Binding,
    cfg: SharedConfig,
    exec: Arc<dyn CommandExecutor>,
    http: reqwest::Client,
}

impl AuthProber {
    pub fn new(binding: Binding, cfg: SharedConfig, exec: Arc<dyn CommandExecutor>) -> Self {
        Self {
            binding,
            cfg,
            exec,
            http: reqwest::Client::new(),
        }
    }

    async fn probe(
        &self,
        proto: &str,
        bound: &BoundSource,
        target: &str,
        username: &str,
        password: &str,
    ) -> Value {
        let auth_result = match proto {
            "ssh" => self.probe_ssh(bound, target, username).await,
            "rdp" => self.probe_rdp(target, username, password).await,
            "http_basic" => self.probe_http_basic(target, username, password).await,
            _ => {
                return json!({ "target": target, "protocol": proto, "status": "unsupported" });
            }
        };
        metrics::AUTH_ATTEMPTS_TOTAL
            .with_label_values(&[proto, &auth_result])
            .inc();
        json!({
            "target": target,
            "protocol": proto,
            "auth_result": auth_result,
            "status": "complete",
        })
    }

    /// Failed SSH login via the `ssh` binary. BatchMode forbids the password
    /// prompt so the attempt always ends in `Permission denied`, which is
    /// exactly the log line the detection stack should see.
    async fn probe_ssh(&self, bound: &BoundSource, target: &str, username: &str) -> String {
        let bind = format!("BindAddress={}", bound.source_ip);
        let dest = format!("{username}@{target}");
        let argv: [&str; 11] = [
            "ssh",
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "ConnectTimeout=5",
            "-o",
            &bind,
            &dest,
            "exit",
        ];
        match self.exec.run(&argv, SSH_TIMEOUT, false).await {
            Ok(out) if out.success() => "success".to_string(),
            Ok(out) if out.stderr.contains("Permission denied") => "rejected".to_string(),
            Ok(out) => format!("error:exit_{}", out.exit_code),
            Err(ExecError::Timeout { .. }) => "error:timeout".to_string(),
            Err(err) => {
                error!(%err, "ssh probe failed to run");
                "error:spawn".to_string()
            }
        }
    }

    /// Failed RDP login via xfreerdp in auth-only mode
    async fn probe_rdp(&self, target: &str, username: &str, password: &str) -> String {
        let host = format!("/v:{target}");
        let user = format!("/u:{username}");
        let pass = format!("/p:{password}");
        let argv: [&str; 7] = [
            "xfreerdp",
            &host,
            &user,
            &pass,
            "/cert:ignore",
            "+auth-only",
            "/timeout:5000",
        ];
        match self.exec.run(&argv, RDP_TIMEOUT, false).await {
            Ok(out) if out.success() => "success".to_string(),
            Ok(_) => "rejected".to_string(),
            Err(ExecError::Timeout { .. }) => "error:timeout".to_string(),
            Err(err) => {
                error!(%err, "rdp probe failed to run");
                "error:spawn".to_string()
            }
        }
    }

    /// Failed HTTP basic auth
    async fn probe_http_basic(&self, target: &str, username: &str, password: &str) -> String {
        let resp = self
            .http
            .get(format!("http://{target}/"))
            .basic_auth(username, Some(password))
            .timeout(HTTP_TIMEOUT)
            .send()
            .await;
        match resp {
            Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => {
                "rejected".to_string()
            }
            Ok(resp) => format!("http_{}", resp.status().as_u16()),
            Err(err) if err.is_timeout() => "error:timeout".to_string(),
            Err(err) if err.is_connect() => "error:connect".to_string(),
            Err(_) => "error:request".to_string(),
        }
    }
}

#[async_trait]
impl Probe for AuthProber {
    fn name(&self) -> &'static str {
        "auth_prober"
    }

    async fn run(&self, targets: &[String]) -> Result<ModuleReport> {
        let cfg = config::snapshot(&self.cfg);
        let auth_cfg = cfg.modules.auth_prober.clone();
        let creds = cfg.credentials.clone();
        let dry_run = cfg.general.dry_run;
        let bound = self.binding.current();

        let mut shuffled = targets.to_vec();
        shuffled.shuffle(&mut thread_rng());

        let mut details = Vec::new();
        for target in &shuffled {
            for proto in &auth_cfg.protocols {
                for attempt in 1..=auth_cfg.max_attempts {
                    info!(
                        target_ip = %target,
                        source_ip = %bound.source_ip,
                        protocol = %proto,
                        attempt,
                        max = auth_cfg.max_attempts,
                        "auth probe"
                    );
                    if dry_run {
                        details.push(json!({
                            "target": target,
                            "protocol": proto,
                            "attempt": attempt,
                            "status": "dry-run",
                        }));
                        continue;
                    }

                    let mut detail = self
                        .probe(proto, &bound, target, &creds.username, &creds.password)
                        .await;
                    detail["attempt"] = json!(attempt);
                    details.push(detail);

                    let pause = thread_rng().gen_range(0.5..=2.0);
                    tokio::time::sleep(Duration::from_secs_f64(pause)).await;
                }
            }
        }

        let status = if dry_run {
            ProbeStatus::DryRun
        } else {
            ProbeStatus::Complete
        };
        Ok(ModuleReport::new(
            status,
            format!(
                "Auth probed {} targets, {} attempts",
                shuffled.len(),
                details.len()
            ),
            details,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmd_exec::CmdOutput;
    use std::net::Ipv4Addr;

    struct Untouchable;

    #[async_trait]
    impl CommandExecutor for Untouchable {
        async fn run(
            &self,
            argv: &[&str],
            _timeout: Duration,
            _must_succeed: bool,
        ) -> Result<CmdOutput, ExecError> {
            panic!("dry-run must not invoke the executor: {argv:?}");
        }
    }

    fn dry_cfg() -> SharedConfig {
        let doc = r#"
general:
  dry_run: true
vlans:
  - id: 10
    targets: ["10.0.0.1"]
schedule: {}
modules:
  auth_prober:
    max_attempts: 2
    protocols: ["ssh"]
"#;
        config::shared(config::Config::parse_str(doc, None).unwrap())
    }

    #[tokio::test]
    async fn dry_run_respects_the_attempt_ceiling() {
        let prober = AuthProber::new(
            Binding::new(Ipv4Addr::UNSPECIFIED, "eth0"),
            dry_cfg(),
            Arc::new(Untouchable),
        );
        let targets = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let report = prober.run(&targets).await.unwrap();

        assert_eq!(report.status, ProbeStatus::DryRun);
        // 2 targets x 1 protocol x 2 attempts
        assert_eq!(report.details.len(), 4);
        for detail in &report.details {
            assert_eq!(detail["status"], "dry-run");
            assert!(detail["attempt"].as_u64().unwrap() <= 2);
            assert!(targets.contains(&detail["target"].as_str().unwrap().to_string()));
        }
    }
}
