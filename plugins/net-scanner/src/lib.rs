//! Network scanner module: nmap scans bound to the hop's interface, with
//! randomized target order and intensity-driven scan selection.
use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chaos_core::{
    metrics,
    module::{Binding, BoundSource, ModuleReport, Probe, ProbeStatus},
};
use cmd_exec::CommandExecutor;
use config::{Intensity, SharedConfig};
use rand::{seq::SliceRandom, thread_rng, Rng};
use serde_json::{json, Value};
use tracing::{debug, error, info};

/// full service scans of slow hosts take a while
const SCAN_TIMEOUT: Duration = Duration::from_secs(120);

pub struct NetScanner {
    binding: Binding,
    cfg: SharedConfig,
    exec: Arc<dyn CommandExecutor>,
}

impl NetScanner {
    pub fn new(binding: Binding, cfg: SharedConfig, exec: Arc<dyn CommandExecutor>) -> Self {
        Self { binding, cfg, exec }
    }

    async fn scan(
        &self,
        bound: &BoundSource,
        target: &str,
        scan_type: &'static str,
        port_list: &str,
    ) -> Result<Value> {
        let mut args: Vec<String> = vec![
            "nmap".into(),
            "-S".into(),
            bound.source_ip.to_string(),
            "-e".into(),
            bound.interface.clone(),
        ];
        match scan_type {
            "syn" => args.extend(["-p", port_list, "-sS"].map(String::from)),
            "service" => args.extend(["-p", port_list, "-sS", "-sV"].map(String::from)),
            "os" => args.extend(["-p", port_list, "-sS", "-sV", "-O"].map(String::from)),
            "aggressive" => args.extend(["-p", port_list, "-A"].map(String::from)),
            // ARP sweep carries no port list
            _ => args.extend(["-sn", "-PR"].map(String::from)),
        }
        args.push(target.to_string());

        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!(cmd = %args.join(" "), "running scan");
        let out = self.exec.run(&argv, SCAN_TIMEOUT, false).await?;

        let mut hosts_up = 0u64;
        let mut open_ports = 0u64;
        for line in out.stdout.lines() {
            if line.contains("Host is up") {
                hosts_up += 1;
            }
            if line.contains("/open/") || line.split_whitespace().any(|tok| tok == "open") {
                open_ports += 1;
            }
        }
        metrics::SCAN_HOSTS_FOUND.inc_by(hosts_up);
        metrics::SCAN_PORTS_FOUND.inc_by(open_ports);

        Ok(json!({
            "target": target,
            "scan": scan_type,
            "status": "complete",
            "hosts_up": hosts_up,
            "open_ports": open_ports,
            "exit_code": out.exit_code,
        }))
    }
}

#[async_trait]
impl Probe for NetScanner {
    fn name(&self) -> &'static str {
        "net_scanner"
    }

    async fn run(&self, targets: &[String]) -> Result<ModuleReport> {
        let cfg = config::snapshot(&self.cfg);
        let scan_cfg = cfg.modules.net_scanner.clone();
        let dry_run = cfg.general.dry_run;
        let bound = self.binding.current();

        let mut shuffled = targets.to_vec();
        shuffled.shuffle(&mut thread_rng());
        let scan_type = pick_scan_type(scan_cfg.intensity);

        let mut details = Vec::with_capacity(shuffled.len());
        for target in &shuffled {
            info!(
                target_ip = %target,
                source_ip = %bound.source_ip,
                scan = scan_type,
                "scanning"
            );
            if dry_run {
                details.push(json!({ "target": target, "scan": scan_type, "status": "dry-run" }));
                continue;
            }

            match self.scan(&bound, target, scan_type, &scan_cfg.port_list).await {
                Ok(detail) => details.push(detail),
                Err(err) => {
                    error!(target_ip = %target, %err, "scan failed");
                    details.push(json!({
                        "target": target,
                        "status": "error",
                        "message": err.to_string(),
                    }));
                }
            }

            // jitter between targets
            let pause = thread_rng().gen_range(0.5..=3.0);
            tokio::time::sleep(Duration::from_secs_f64(pause)).await;
        }

        let status = if dry_run {
            ProbeStatus::DryRun
        } else {
            ProbeStatus::Complete
        };
        Ok(ModuleReport::new(
            status,
            format!("{scan_type} scan of {} targets", shuffled.len()),
            details,
        ))
    }
}

fn pick_scan_type(intensity: Intensity) -> &'static str {
    let mut rng = thread_rng();
    match intensity {
        Intensity::Low => "syn",
        Intensity::Medium => *["syn", "service", "os"].choose(&mut rng).unwrap(),
        Intensity::High => *["syn", "service", "aggressive", "arp"]
            .choose(&mut rng)
            .unwrap(),
    }
}
