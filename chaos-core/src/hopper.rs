//! 802.1Q VLAN rotation engine.
//!
//! The hopper owns the entire interface lifecycle: create the tagged
//! sub-interface, lease an address, install policy routes, discover targets,
//! dispatch modules, record the lease, and tear everything back down. Every
//! kernel mutation goes through the [`CommandExecutor`]; teardown runs on
//! every exit path so no sub-interface, rule, or lease outlives its hop.
use std::{
    fmt,
    net::Ipv4Addr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use cmd_exec::{CommandExecutor, ExecError};
use config::{Config, SharedConfig, VlanSpec};
use lease_journal::LeaseJournal;
use parking_lot::{Mutex, RwLock};
use rand::{seq::SliceRandom, thread_rng, Rng};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    metrics,
    module::{Binding, ModuleReport, ModuleSet},
    notify::Notifier,
    runner,
    shutdown::StopSignal,
};

/// address reported while dry-running the DHCP step
pub const DRY_RUN_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 100);
/// placeholder MAC reported in dry-run
pub const DRY_RUN_MAC: &str = "00:00:00:00:00:00";

const DHCP_ATTEMPTS: u32 = 3;
const CMD_TIMEOUT: Duration = Duration::from_secs(30);
const DHCP_TIMEOUT: Duration = Duration::from_secs(120);

/// policy routing table for hop traffic; registered on first use
const ATTACK_TABLE: &str = "attack";
const ATTACK_TABLE_ID: u32 = 200;
static RT_TABLES_PATH: &str = "/etc/iproute2/rt_tables";

/// The hopper's single authoritative state. External code only reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HopperState {
    Idle,
    Hopping,
    Attacking,
    Cooldown,
}

impl HopperState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HopperState::Idle => "idle",
            HopperState::Hopping => "hopping",
            HopperState::Attacking => "attacking",
            HopperState::Cooldown => "cooldown",
        }
    }

    /// a new hop or trigger may only begin from these states
    pub fn can_begin(&self) -> bool {
        matches!(self, HopperState::Idle | HopperState::Cooldown)
    }

    fn gauge(&self) -> i64 {
        match self {
            HopperState::Idle => 0,
            HopperState::Hopping => 1,
            HopperState::Attacking => 2,
            HopperState::Cooldown => 3,
        }
    }
}

impl fmt::Display for HopperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live hop context, held only while state is Hopping or Attacking
#[derive(Debug, Clone, Serialize)]
pub struct ActiveHop {
    pub vlan_id: u16,
    pub iface: String,
    pub leased_ip: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub hosts: Vec<String>,
    #[serde(skip)]
    pub started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HopStatus {
    Complete,
    Skipped,
    Error,
}

/// Outcome of one hop cycle, also the `last_cycle` shape served by `/status`
#[derive(Debug, Clone, Serialize)]
pub struct HopSummary {
    pub status: HopStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    pub duration_sec: f64,
    pub modules_run: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "results", skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<ModuleReport>,
}

impl HopSummary {
    fn complete(
        vlan_id: u16,
        ip: Ipv4Addr,
        duration_sec: f64,
        modules_run: Vec<String>,
        reports: Vec<ModuleReport>,
    ) -> Self {
        Self {
            status: HopStatus::Complete,
            vlan_id: Some(vlan_id),
            ip: Some(ip),
            duration_sec: (duration_sec * 10.0).round() / 10.0,
            modules_run,
            message: None,
            reports,
        }
    }

    fn skipped(vlan_id: u16, ip: Ipv4Addr) -> Self {
        Self {
            status: HopStatus::Skipped,
            vlan_id: Some(vlan_id),
            ip: Some(ip),
            duration_sec: 0.0,
            modules_run: Vec::new(),
            message: Some("No targets found".into()),
            reports: Vec::new(),
        }
    }

    fn dhcp_failed(vlan_id: u16) -> Self {
        Self {
            status: HopStatus::Error,
            vlan_id: Some(vlan_id),
            ip: None,
            duration_sec: 0.0,
            modules_run: Vec::new(),
            message: Some("DHCP failed".into()),
            reports: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HopperError {
    #[error("cannot {action}: currently {state}")]
    StateViolation {
        action: &'static str,
        state: HopperState,
    },
    #[error("no VLANs match filter")]
    NoMatchingVlans,
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error(transparent)]
    Command(#[from] ExecError),
}

/// The state machine coordinating kernel mutations, discovery, module
/// dispatch, journaling, and teardown for one attack NIC.
pub struct Hopper {
    exec: Arc<dyn CommandExecutor>,
    journal: LeaseJournal,
    cfg: SharedConfig,
    modules: Arc<ModuleSet>,
    binding: Binding,
    notifier: Arc<Notifier>,
    stop: StopSignal,
    state: RwLock<HopperState>,
    active: Mutex<Option<ActiveHop>>,
    /// serializes hops; a concurrent hop is rejected, never queued
    hop_lock: tokio::sync::Mutex<()>,
    rt_tables: PathBuf,
}

impl fmt::Debug for Hopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hopper")
            .field("state", &self.state())
            .field("modules", &self.modules)
            .finish()
    }
}

impl Hopper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exec: Arc<dyn CommandExecutor>,
        journal: LeaseJournal,
        cfg: SharedConfig,
        modules: Arc<ModuleSet>,
        binding: Binding,
        notifier: Arc<Notifier>,
        stop: StopSignal,
    ) -> Self {
        Self {
            exec,
            journal,
            cfg,
            modules,
            binding,
            notifier,
            stop,
            state: RwLock::new(HopperState::Idle),
            active: Mutex::new(None),
            hop_lock: tokio::sync::Mutex::new(()),
            rt_tables: PathBuf::from(RT_TABLES_PATH),
        }
    }

    /// Override the rt_tables location (tests)
    pub fn with_rt_tables_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rt_tables = path.into();
        self
    }

    pub fn state(&self) -> HopperState {
        *self.state.read()
    }

    pub fn current_vlan(&self) -> Option<u16> {
        self.active.lock().as_ref().map(|hop| hop.vlan_id)
    }

    pub fn current_ip(&self) -> Option<Ipv4Addr> {
        self.active.lock().as_ref().and_then(|hop| hop.leased_ip)
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    fn set_state(&self, state: HopperState) {
        debug!(%state, "state transition");
        *self.state.write() = state;
        metrics::STATE.set(state.gauge());
        if matches!(state, HopperState::Idle | HopperState::Cooldown) {
            metrics::CURRENT_VLAN.set(0);
        }
    }

    /// Forcibly set the state. Test scaffolding for control-plane guard
    /// checks; never called on the hop path.
    #[doc(hidden)]
    pub fn force_state(&self, state: HopperState) {
        self.set_state(state);
    }

    /// Execute a single VLAN hop cycle: pick a VLAN, lease an address, run
    /// the enabled modules against discovered (or static) targets, record
    /// the lease, and tear down.
    pub async fn hop_once(
        &self,
        vlan_filter: Option<&[u16]>,
    ) -> Result<HopSummary, HopperError> {
        let state = self.state();
        if !state.can_begin() {
            return Err(HopperError::StateViolation {
                action: "hop",
                state,
            });
        }
        let Ok(_guard) = self.hop_lock.try_lock() else {
            return Err(HopperError::StateViolation {
                action: "hop",
                state,
            });
        };

        let cfg = config::snapshot(&self.cfg);
        let vlan = pick_vlan(&cfg, vlan_filter)?;
        info!(vlan_id = vlan.id, name = %vlan.name, "hopping to VLAN");
        self.set_state(HopperState::Hopping);

        let iface = format!("{}.{}", cfg.general.interface, vlan.id);
        *self.active.lock() = Some(ActiveHop {
            vlan_id: vlan.id,
            iface: iface.clone(),
            leased_ip: None,
            gateway: vlan.gateway,
            hosts: Vec::new(),
            started_at: Instant::now(),
        });

        if let Err(err) = self.create_iface(&cfg.general.interface, &iface, vlan.id).await {
            error!(vlan_id = vlan.id, %err, "failed to bring up VLAN interface");
            self.teardown(vlan.id, None, &iface).await;
            return Err(err.into());
        }

        let Some(ip) = self.obtain_dhcp_with_retry(&cfg, &iface, vlan.id).await else {
            error!(vlan_id = vlan.id, "failed to obtain IP");
            self.teardown(vlan.id, None, &iface).await;
            return Ok(HopSummary::dhcp_failed(vlan.id));
        };
        if let Some(hop) = self.active.lock().as_mut() {
            hop.leased_ip = Some(ip);
        }
        info!(vlan_id = vlan.id, source_ip = %ip, "got IP");

        // teardown is unconditional from here on, whatever the attack
        // phase came back with
        let summary = self.attack_phase(&cfg, &vlan, ip, &iface).await;
        self.teardown(vlan.id, Some(ip), &iface).await;

        if summary.status == HopStatus::Complete {
            self.notifier.send_cycle_summary(&summary).await;
        }
        Ok(summary)
    }

    /// Steps 6-11 of the hop: policy routes, discovery, module dispatch,
    /// journal append. Infallible by construction; every failure inside is
    /// either survivable (logged) or expressed in the summary.
    async fn attack_phase(
        &self,
        cfg: &Config,
        vlan: &VlanSpec,
        ip: Ipv4Addr,
        iface: &str,
    ) -> HopSummary {
        if let Some(gw) = vlan.gateway {
            self.setup_policy_routing(cfg, ip, gw, iface).await;
        }

        let mut targets = match vlan.gateway {
            Some(gw) => {
                let subnet = discovery::gateway_to_subnet(gw);
                let mut excluded = vec![gw.to_string()];
                excluded.extend(cfg.excluded_hosts.iter().cloned());
                discovery::discover_hosts(
                    self.exec.as_ref(),
                    subnet,
                    iface,
                    ip,
                    &excluded,
                    cfg.general.dry_run,
                )
                .await
            }
            None => Vec::new(),
        };
        if targets.is_empty() && !vlan.targets.is_empty() {
            info!(
                vlan_id = vlan.id,
                count = vlan.targets.len(),
                "discovery found no hosts, falling back to static targets"
            );
            targets = vlan.targets.clone();
        }
        if targets.is_empty() {
            warn!(vlan_id = vlan.id, "no targets found, skipping attack");
            return HopSummary::skipped(vlan.id, ip);
        }
        if let Some(hop) = self.active.lock().as_mut() {
            hop.hosts = targets.clone();
        }

        // modules re-read the binding on every run
        self.binding.rebind(ip, iface);
        self.set_state(HopperState::Attacking);
        let started = Instant::now();

        let enabled = self.modules.enabled(cfg);
        let reports = runner::run_once(&enabled, &targets, &cfg.schedule, &self.stop).await;
        let duration = started.elapsed().as_secs_f64();
        let modules_run: Vec<String> = reports.iter().map(|r| r.module.clone()).collect();

        let mac = self.read_mac(cfg.general.dry_run, iface).await;
        if let Err(err) = self
            .journal
            .append(vlan.id, &ip.to_string(), &mac, &modules_run, duration)
            .await
        {
            // persistence must never block cleanup
            error!(vlan_id = vlan.id, %err, "failed to record lease");
        }
        metrics::record_hop(vlan.id, duration);

        HopSummary::complete(vlan.id, ip, duration, modules_run, reports)
    }

    async fn create_iface(
        &self,
        parent: &str,
        iface: &str,
        vlan_id: u16,
    ) -> Result<(), ExecError> {
        let vid = vlan_id.to_string();
        let add: [&str; 11] = [
            "ip", "link", "add", "link", parent, "name", iface, "type", "vlan", "id", &vid,
        ];
        self.exec.run(&add, CMD_TIMEOUT, true).await?;
        self.exec
            .run(&["ip", "link", "set", iface, "up"], CMD_TIMEOUT, true)
            .await?;
        Ok(())
    }

    /// One DHCP acquire: run dhclient, then read the address off the
    /// interface. Dry-run short-circuits to [`DRY_RUN_IP`].
    async fn obtain_dhcp(&self, dry_run: bool, iface: &str) -> Option<Ipv4Addr> {
        if let Err(err) = self
            .exec
            .run(&["dhclient", "-1", "-v", iface], DHCP_TIMEOUT, false)
            .await
        {
            warn!(%err, "dhclient failed");
        }
        if dry_run {
            return Some(DRY_RUN_IP);
        }
        let out = self
            .exec
            .run(&["ip", "-4", "-o", "addr", "show", iface], CMD_TIMEOUT, false)
            .await
            .ok()?;
        parse_inet_addr(&out.stdout)
    }

    /// DHCP with duplicate avoidance: up to [`DHCP_ATTEMPTS`] counted
    /// acquires, releasing on an immediate duplicate. If the pool keeps
    /// handing back the same address, accept it with one final re-acquire
    /// (the lease was released during retry) rather than livelock.
    async fn obtain_dhcp_with_retry(
        &self,
        cfg: &Config,
        iface: &str,
        vlan_id: u16,
    ) -> Option<Ipv4Addr> {
        let dry_run = cfg.general.dry_run;
        let mut last_duplicate = None;
        for attempt in 1..=DHCP_ATTEMPTS {
            let Some(ip) = self.obtain_dhcp(dry_run, iface).await else {
                warn!(vlan_id, attempt, "DHCP yielded no address");
                continue;
            };
            match self
                .journal
                .is_immediate_duplicate(vlan_id, &ip.to_string())
                .await
            {
                Ok(true) => {
                    warn!(vlan_id, source_ip = %ip, attempt, "duplicate IP, releasing and retrying");
                    metrics::DUPLICATE_IPS.inc();
                    self.release_dhcp(iface).await;
                    last_duplicate = Some(ip);
                }
                Ok(false) => return Some(ip),
                Err(err) => {
                    // journal trouble is no reason to drop the lease
                    error!(vlan_id, %err, "duplicate check failed");
                    return Some(ip);
                }
            }
        }
        if let Some(ip) = last_duplicate {
            warn!(vlan_id, source_ip = %ip, "accepting duplicate IP after {DHCP_ATTEMPTS} attempts");
            return Some(self.obtain_dhcp(dry_run, iface).await.unwrap_or(ip));
        }
        None
    }

    async fn release_dhcp(&self, iface: &str) {
        if let Err(err) = self
            .exec
            .run(&["dhclient", "-r", iface], CMD_TIMEOUT, false)
            .await
        {
            warn!(%err, "dhclient release failed");
        }
    }

    /// Route hop traffic sourced from `ip` out the VLAN interface. The rule
    /// may already exist from an earlier hop, so failures are logged only.
    async fn setup_policy_routing(&self, cfg: &Config, ip: Ipv4Addr, gw: Ipv4Addr, iface: &str) {
        if !cfg.general.dry_run {
            self.ensure_attack_table().await;
        }
        let ip = ip.to_string();
        let gw = gw.to_string();
        let rule: &[&str] = &["ip", "rule", "add", "from", &ip, "table", ATTACK_TABLE];
        let route: &[&str] = &[
            "ip", "route", "add", "default", "via", &gw, "dev", iface, "table", ATTACK_TABLE,
        ];
        for argv in [rule, route] {
            match self.exec.run(argv, CMD_TIMEOUT, false).await {
                Ok(out) if !out.success() => {
                    debug!(cmd = %argv.join(" "), code = out.exit_code, "policy routing step returned non-zero");
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "policy routing step failed"),
            }
        }
    }

    /// The `attack` table must exist in rt_tables before `ip rule add` can
    /// reference it by name; register it on first use.
    async fn ensure_attack_table(&self) {
        match tokio::fs::read_to_string(&self.rt_tables).await {
            Ok(body)
                if body.lines().any(|line| {
                    line.split_whitespace().nth(1) == Some(ATTACK_TABLE)
                }) => {}
            Ok(mut body) => {
                if !body.is_empty() && !body.ends_with('\n') {
                    body.push('\n');
                }
                body.push_str(&format!("{ATTACK_TABLE_ID}\t{ATTACK_TABLE}\n"));
                match tokio::fs::write(&self.rt_tables, body).await {
                    Ok(()) => info!(table = ATTACK_TABLE, "registered routing table"),
                    Err(err) => warn!(%err, "failed to register routing table"),
                }
            }
            Err(err) => {
                warn!(%err, path = %self.rt_tables.display(), "cannot read rt_tables, assuming table exists");
            }
        }
    }

    async fn read_mac(&self, dry_run: bool, iface: &str) -> String {
        if dry_run {
            return DRY_RUN_MAC.to_string();
        }
        match self
            .exec
            .run(&["ip", "link", "show", iface], CMD_TIMEOUT, false)
            .await
        {
            Ok(out) => out
                .stdout
                .lines()
                .find_map(|line| {
                    line.trim()
                        .strip_prefix("link/ether")
                        .and_then(|rest| rest.split_whitespace().next())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "unknown".to_string()),
            Err(_) => "unknown".to_string(),
        }
    }

    /// Undo everything a hop may have created: policy rule, attack table
    /// routes, lease, link. Best-effort and monotonic; each step runs even
    /// if the previous one failed.
    async fn teardown(&self, vlan_id: u16, ip: Option<Ipv4Addr>, iface: &str) {
        info!(vlan_id, "tearing down VLAN");
        if let Some(ip) = ip {
            let ip = ip.to_string();
            self.best_effort(&["ip", "rule", "del", "from", &ip, "table", ATTACK_TABLE])
                .await;
        }
        self.best_effort(&["ip", "route", "flush", "table", ATTACK_TABLE])
            .await;
        self.best_effort(&["dhclient", "-r", iface]).await;
        self.best_effort(&["ip", "link", "set", iface, "down"]).await;
        self.best_effort(&["ip", "link", "delete", iface]).await;
        *self.active.lock() = None;
        self.set_state(HopperState::Cooldown);
    }

    async fn best_effort(&self, argv: &[&str]) {
        if let Err(err) = self.exec.run(argv, CMD_TIMEOUT, false).await {
            warn!(cmd = %argv.join(" "), %err, "teardown step failed");
        }
    }

    /// Tear down the current hop, if any. Idempotent.
    pub async fn teardown_current(&self) {
        let hop = self.active.lock().clone();
        if let Some(hop) = hop {
            self.teardown(hop.vlan_id, hop.leased_ip, &hop.iface).await;
        }
    }

    /// Continuously hop VLANs until the stop signal is raised. Any error
    /// inside a cycle still tears down before the next one.
    pub async fn run_daemon(&self, vlan_filter: Option<Vec<u16>>) {
        info!("VLAN hopper daemon started");
        while !self.stop.is_set() {
            match self.hop_once(vlan_filter.as_deref()).await {
                Ok(summary) => debug!(status = ?summary.status, "hop cycle finished"),
                Err(err) => {
                    error!(%err, "hop cycle failed");
                    self.notifier.send_error(&err.to_string()).await;
                    self.teardown_current().await;
                }
            }
            if self.stop.is_set() {
                break;
            }
            let cooldown = {
                let (min, max) = config::snapshot(&self.cfg).schedule.cooldown();
                thread_rng().gen_range(min..=max)
            };
            info!(cooldown = %format!("{cooldown:.1}s"), "cooldown");
            self.set_state(HopperState::Cooldown);
            if self.stop.sleep(Duration::from_secs_f64(cooldown)).await {
                break;
            }
        }
        self.teardown_current().await;
        self.set_state(HopperState::Idle);
        info!("VLAN hopper stopped");
    }

    /// Request graceful stop and force immediate teardown of any active hop
    pub async fn stop(&self) {
        self.stop.set();
        self.teardown_current().await;
        self.set_state(HopperState::Idle);
    }

    /// Run selected modules against selected targets without hopping, bound
    /// to the management address on the parent interface.
    pub async fn trigger(
        &self,
        module_names: &[String],
        targets: &[String],
    ) -> Result<Vec<ModuleReport>, HopperError> {
        let state = self.state();
        if !state.can_begin() {
            return Err(HopperError::StateViolation {
                action: "trigger",
                state,
            });
        }
        let Ok(_guard) = self.hop_lock.try_lock() else {
            return Err(HopperError::StateViolation {
                action: "trigger",
                state,
            });
        };

        let selected = module_names
            .iter()
            .map(|name| {
                self.modules
                    .get(name)
                    .ok_or_else(|| HopperError::UnknownModule(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cfg = config::snapshot(&self.cfg);
        self.binding
            .rebind(cfg.general.management_ip, &cfg.general.interface);
        self.set_state(HopperState::Attacking);
        let reports = runner::run_once(&selected, targets, &cfg.schedule, &self.stop).await;
        self.set_state(HopperState::Idle);
        Ok(reports)
    }
}

/// Uniform random pick from the configured VLANs, optionally filtered
fn pick_vlan(cfg: &Config, filter: Option<&[u16]>) -> Result<VlanSpec, HopperError> {
    let pool: Vec<&VlanSpec> = match filter {
        Some(ids) => cfg.vlans.iter().filter(|v| ids.contains(&v.id)).collect(),
        None => cfg.vlans.iter().collect(),
    };
    pool.choose(&mut thread_rng())
        .map(|vlan| (*vlan).clone())
        .ok_or(HopperError::NoMatchingVlans)
}

/// First `inet a.b.c.d/prefix` address in `ip -4 -o addr show` output
fn parse_inet_addr(stdout: &str) -> Option<Ipv4Addr> {
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        while let Some(token) = parts.next() {
            if token == "inet" {
                return parts.next()?.split('/').next()?.parse().ok();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ModuleReport, Probe, ProbeStatus};
    use anyhow::Result;
    use async_trait::async_trait;
    use cmd_exec::CmdOutput;
    use serde_json::json;

    type Responder = dyn Fn(&str) -> CmdOutput + Send + Sync;

    /// Executor that records every invocation and answers from a script
    struct ScriptedExec {
        calls: Mutex<Vec<String>>,
        respond: Box<Responder>,
    }

    impl ScriptedExec {
        fn ok() -> Arc<Self> {
            Self::with(|_| CmdOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        fn with(respond: impl Fn(&str) -> CmdOutput + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls()
                .iter()
                .filter(|call| call.starts_with(prefix))
                .count()
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExec {
        async fn run(
            &self,
            argv: &[&str],
            _timeout: Duration,
            must_succeed: bool,
        ) -> Result<CmdOutput, ExecError> {
            let joined = argv.join(" ");
            self.calls.lock().push(joined.clone());
            let out = (self.respond)(&joined);
            if must_succeed && !out.success() {
                return Err(ExecError::CommandFailed {
                    argv: joined,
                    code: out.exit_code,
                    stderr: out.stderr,
                });
            }
            Ok(out)
        }
    }

    fn stdout(s: &str) -> CmdOutput {
        CmdOutput {
            exit_code: 0,
            stdout: s.to_string(),
            stderr: String::new(),
        }
    }

    struct StubScanner;

    #[async_trait]
    impl Probe for StubScanner {
        fn name(&self) -> &'static str {
            "net_scanner"
        }
        async fn run(&self, targets: &[String]) -> Result<ModuleReport> {
            Ok(ModuleReport::new(
                ProbeStatus::Complete,
                format!("scanned {} targets", targets.len()),
                targets.iter().map(|t| json!({ "target": t })).collect(),
            ))
        }
    }

    async fn build(doc: &str, exec: Arc<ScriptedExec>) -> (Hopper, LeaseJournal) {
        let cfg = config::shared(Config::parse_str(doc, None).unwrap());
        let journal = LeaseJournal::open("sqlite::memory:").await.unwrap();
        let mut modules = ModuleSet::new();
        modules.register(Arc::new(StubScanner));
        let notifier = Arc::new(Notifier::new(cfg.clone()));
        let hopper = Hopper::new(
            exec,
            journal.clone(),
            cfg,
            Arc::new(modules),
            Binding::new(Ipv4Addr::UNSPECIFIED, "eth1"),
            notifier,
            StopSignal::new(),
        );
        (hopper, journal)
    }

    fn zero_schedule() -> &'static str {
        "schedule:\n  module_delay_min: 0\n  module_delay_max: 0\n  cooldown_min: 0\n  cooldown_max: 0\n"
    }

    fn dry_run_doc() -> String {
        format!(
            "general:\n  interface: eth1\n  dry_run: true\n\
             vlans:\n  - id: 30\n    name: servers\n    gateway: 10.30.30.1\n    targets: [\"10.30.30.10\"]\n\
             {}modules: {{}}\n",
            zero_schedule()
        )
    }

    #[tokio::test]
    async fn happy_path_hop_in_dry_run() {
        let exec = ScriptedExec::ok();
        let (hopper, journal) = build(&dry_run_doc(), exec.clone()).await;

        let summary = hopper.hop_once(None).await.unwrap();
        assert_eq!(summary.status, HopStatus::Complete);
        assert_eq!(summary.vlan_id, Some(30));
        assert_eq!(summary.ip, Some(DRY_RUN_IP));
        assert_eq!(summary.modules_run, vec!["net_scanner".to_string()]);

        // exactly one appended lease record
        let history = journal.history(None, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].vlan_id, 30);
        assert_eq!(history[0].ip, DRY_RUN_IP.to_string());
        assert_eq!(history[0].mac, DRY_RUN_MAC);

        // no residual hop, state settled in cooldown
        assert_eq!(hopper.state(), HopperState::Cooldown);
        assert_eq!(hopper.current_vlan(), None);
        assert_eq!(hopper.current_ip(), None);

        let calls = exec.calls();
        assert!(calls
            .iter()
            .any(|c| c == "ip link add link eth1 name eth1.30 type vlan id 30"));
        assert!(calls.iter().any(|c| c == "ip link delete eth1.30"));
    }

    #[tokio::test]
    async fn every_created_link_is_deleted() {
        let exec = ScriptedExec::ok();
        let (hopper, _journal) = build(&dry_run_doc(), exec.clone()).await;
        for _ in 0..3 {
            hopper.hop_once(None).await.unwrap();
        }
        assert_eq!(exec.count("ip link add"), exec.count("ip link delete"));
        assert!(hopper.state().can_begin());
    }

    fn static_doc(dry_run: bool, targets: &str) -> String {
        format!(
            "general:\n  interface: eth1\n  dry_run: {dry_run}\n\
             vlans:\n  - id: 30\n    targets: {targets}\n\
             {}modules: {{}}\n",
            zero_schedule()
        )
    }

    #[tokio::test]
    async fn deterministic_pool_duplicate_is_accepted_after_three_attempts() {
        let exec = ScriptedExec::with(|cmd| {
            if cmd.starts_with("ip -4 -o addr show") {
                stdout("2: eth1.30    inet 10.30.30.55/24 brd 10.30.30.255 scope global eth1.30")
            } else {
                stdout("")
            }
        });
        let (hopper, journal) = build(&static_doc(false, "[\"10.30.30.10\"]"), exec.clone()).await;
        journal
            .append(30, "10.30.30.55", "aa:bb:cc:dd:ee:ff", &["net_scanner".into()], 1.0)
            .await
            .unwrap();

        let summary = hopper.hop_once(None).await.unwrap();
        assert_eq!(summary.status, HopStatus::Complete);
        assert_eq!(summary.ip.unwrap().to_string(), "10.30.30.55");

        // 3 counted attempts + the accept re-acquire
        assert_eq!(exec.count("dhclient -1 -v eth1.30"), 4);
        // 3 retry releases + the teardown release
        assert_eq!(exec.count("dhclient -r eth1.30"), 4);

        let history = journal.history(Some(30), 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].ip, "10.30.30.55");
    }

    #[tokio::test]
    async fn discovery_empty_falls_back_to_static_targets() {
        let rt_tables = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(rt_tables.path(), "255\tlocal\n254\tmain\n253\tdefault\n").unwrap();

        let exec = ScriptedExec::with(|cmd| {
            if cmd.starts_with("ip -4 -o addr show") {
                stdout("2: eth1.30    inet 10.30.30.77/24 scope global eth1.30")
            } else if cmd.starts_with("nmap") {
                stdout("Nmap done: 256 IP addresses (0 hosts up)")
            } else {
                stdout("")
            }
        });
        let doc = format!(
            "general:\n  interface: eth1\n\
             vlans:\n  - id: 30\n    gateway: 10.30.30.1\n    targets: [\"10.30.30.10\"]\n\
             {}modules: {{}}\n",
            zero_schedule()
        );
        let (hopper, _journal) = build(&doc, exec.clone()).await;
        let hopper = hopper.with_rt_tables_path(rt_tables.path());

        let summary = hopper.hop_once(None).await.unwrap();
        assert_eq!(summary.status, HopStatus::Complete);
        // modules saw the static target
        let report = &summary.reports[0];
        assert_eq!(report.details[0]["target"], "10.30.30.10");

        // the attack table got registered on first use
        let registered = std::fs::read_to_string(rt_tables.path()).unwrap();
        assert!(registered.contains("200\tattack"));
        assert!(exec
            .calls()
            .iter()
            .any(|c| c == "ip rule add from 10.30.30.77 table attack"));
    }

    #[tokio::test]
    async fn no_targets_at_all_skips_without_a_record() {
        let exec = ScriptedExec::ok();
        let (hopper, journal) = build(&static_doc(true, "[]"), exec.clone()).await;

        let summary = hopper.hop_once(None).await.unwrap();
        assert_eq!(summary.status, HopStatus::Skipped);
        assert!(journal.history(None, 10).await.unwrap().is_empty());
        assert!(exec.calls().iter().any(|c| c == "ip link delete eth1.30"));
        assert_eq!(hopper.state(), HopperState::Cooldown);
        assert_eq!(hopper.current_vlan(), None);
    }

    #[tokio::test]
    async fn dhcp_failure_tears_down_and_reports_error() {
        // interface never gets an address
        let exec = ScriptedExec::with(|_| stdout(""));
        let (hopper, journal) = build(&static_doc(false, "[\"10.30.30.10\"]"), exec.clone()).await;

        let summary = hopper.hop_once(None).await.unwrap();
        assert_eq!(summary.status, HopStatus::Error);
        assert_eq!(summary.message.as_deref(), Some("DHCP failed"));
        assert_eq!(exec.count("dhclient -1 -v eth1.30"), 3);
        assert!(journal.history(None, 10).await.unwrap().is_empty());
        assert!(exec.calls().iter().any(|c| c == "ip link delete eth1.30"));
        assert_eq!(hopper.state(), HopperState::Cooldown);
    }

    #[tokio::test]
    async fn link_create_failure_is_an_error_with_partial_teardown() {
        let exec = ScriptedExec::with(|cmd| {
            if cmd.starts_with("ip link add") {
                CmdOutput {
                    exit_code: 2,
                    stdout: String::new(),
                    stderr: "RTNETLINK answers: Operation not permitted".into(),
                }
            } else {
                stdout("")
            }
        });
        let (hopper, journal) = build(&static_doc(false, "[\"10.30.30.10\"]"), exec.clone()).await;

        let err = hopper.hop_once(None).await.unwrap_err();
        assert!(matches!(err, HopperError::Command(_)));
        assert!(journal.history(None, 10).await.unwrap().is_empty());
        // teardown still swept the partial state
        assert!(exec.calls().iter().any(|c| c == "ip link delete eth1.30"));
        assert_eq!(hopper.state(), HopperState::Cooldown);
    }

    #[tokio::test]
    async fn hop_is_rejected_outside_idle_and_cooldown() {
        let exec = ScriptedExec::ok();
        let (hopper, _journal) = build(&dry_run_doc(), exec).await;

        hopper.force_state(HopperState::Attacking);
        let err = hopper.hop_once(None).await.unwrap_err();
        assert!(err.to_string().contains("attacking"));

        hopper.force_state(HopperState::Hopping);
        let err = hopper.trigger(&["net_scanner".into()], &["10.30.30.10".into()]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn empty_vlan_filter_is_an_error() {
        let exec = ScriptedExec::ok();
        let (hopper, _journal) = build(&dry_run_doc(), exec).await;
        let err = hopper.hop_once(Some(&[99])).await.unwrap_err();
        assert!(matches!(err, HopperError::NoMatchingVlans));
    }

    #[tokio::test]
    async fn daemon_exits_promptly_when_stopped_during_cooldown() {
        let exec = ScriptedExec::ok();
        let doc = "general:\n  interface: eth1\n  dry_run: true\n\
                   vlans:\n  - id: 30\n    targets: [\"10.30.30.10\"]\n\
                   schedule:\n  module_delay_min: 0\n  module_delay_max: 0\n  cooldown_min: 30\n  cooldown_max: 30\n\
                   modules: {}\n";
        let (hopper, journal) = build(doc, exec.clone()).await;
        let hopper = Arc::new(hopper);
        let stop = hopper.stop_signal();

        let daemon = {
            let hopper = hopper.clone();
            tokio::spawn(async move { hopper.run_daemon(None).await })
        };

        // wait for the first hop to land in the journal, then we are in the
        // 30s cooldown window
        let deadline = Instant::now() + Duration::from_secs(5);
        while journal.history(None, 1).await.unwrap().is_empty() {
            assert!(Instant::now() < deadline, "first hop never completed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let created_before = exec.count("ip link add");

        stop.set();
        tokio::time::timeout(Duration::from_secs(5), daemon)
            .await
            .expect("daemon exited within the cooldown window")
            .unwrap();

        assert_eq!(hopper.state(), HopperState::Idle);
        // no new kernel objects after the signal
        assert_eq!(exec.count("ip link add"), created_before);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let exec = ScriptedExec::ok();
        let (hopper, _journal) = build(&dry_run_doc(), exec).await;
        hopper.stop().await;
        assert_eq!(hopper.state(), HopperState::Idle);
        hopper.stop().await;
        assert_eq!(hopper.state(), HopperState::Idle);
    }

    #[tokio::test]
    async fn trigger_binds_management_address_and_restores_idle() {
        let exec = ScriptedExec::ok();
        let (hopper, _journal) = build(&dry_run_doc(), exec).await;

        let reports = hopper
            .trigger(&["net_scanner".into()], &["10.30.30.10".into()])
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].module, "net_scanner");
        assert_eq!(hopper.state(), HopperState::Idle);

        let err = hopper
            .trigger(&["no_such_module".into()], &["10.30.30.10".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, HopperError::UnknownModule(_)));
    }

    #[test]
    fn inet_addr_parsing() {
        let out = "2: eth1.30    inet 10.30.30.55/24 brd 10.30.30.255 scope global eth1.30\\       valid_lft forever preferred_lft forever";
        assert_eq!(
            parse_inet_addr(out),
            Some("10.30.30.55".parse().unwrap())
        );
        assert_eq!(parse_inet_addr(""), None);
    }
}
