//! On-disk config format. Everything optional carries a serde default; the
//! conversion into [`crate::Config`] enforces the real invariants.
use std::{net::Ipv4Addr, path::PathBuf};

use serde::{Deserialize, Serialize};

pub static DEFAULT_INTERFACE: &str = "eth1";
pub static DEFAULT_LOG_LEVEL: &str = "info";
pub static DEFAULT_PORT_LIST: &str = "22,80,443,445,3389,8080,8443";
pub static DEFAULT_RESOLVER: &str = "10.10.10.2";
pub static DEFAULT_USERNAME: &str = "chaos-bot";
pub static DEFAULT_PASSWORD: &str = "NotARealPassword";
pub const DEFAULT_WEB_PORT: u16 = 8880;
pub const DEFAULT_METRICS_PORT: u16 = 9100;

/// Top-level config document. The four `Option` sections are required; the
/// check lives in [`crate::Config::from_value`] so the error can name the
/// missing section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BotCfg {
    pub general: Option<General>,
    pub vlans: Option<Vec<VlanEntry>>,
    pub schedule: Option<ScheduleCfg>,
    pub modules: Option<Modules>,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub excluded_hosts: Vec<String>,
    #[serde(default)]
    pub notifications: Notifications,
    #[serde(default)]
    pub metrics: MetricsCfg,
    #[serde(default)]
    pub web: WebCfg,
    #[serde(default)]
    pub evebox: Option<EveboxCfg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct General {
    /// parent attack NIC that VLAN sub-interfaces hang off
    #[serde(default = "default_interface")]
    pub interface: String,
    /// source address for module runs that do not ride a hop
    #[serde(default = "default_management_ip")]
    pub management_ip: Ipv4Addr,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for General {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            management_ip: default_management_ip(),
            log_level: default_log_level(),
            dry_run: false,
            log_file: None,
        }
    }
}

fn default_interface() -> String {
    DEFAULT_INTERFACE.to_owned()
}
fn default_management_ip() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VlanEntry {
    pub id: u16,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    /// ip or cidr literals; required but may be empty (discovery-only VLANs)
    pub targets: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ScheduleCfg {
    #[serde(default = "default_module_delay_min")]
    pub module_delay_min: f64,
    #[serde(default = "default_module_delay_max")]
    pub module_delay_max: f64,
    #[serde(default = "default_cooldown_min")]
    pub cooldown_min: f64,
    #[serde(default = "default_cooldown_max")]
    pub cooldown_max: f64,
    #[serde(default = "default_hop_dwell_min")]
    pub hop_dwell_min: u64,
    #[serde(default = "default_hop_dwell_max")]
    pub hop_dwell_max: u64,
}

impl Default for ScheduleCfg {
    fn default() -> Self {
        Self {
            module_delay_min: default_module_delay_min(),
            module_delay_max: default_module_delay_max(),
            cooldown_min: default_cooldown_min(),
            cooldown_max: default_cooldown_max(),
            hop_dwell_min: default_hop_dwell_min(),
            hop_dwell_max: default_hop_dwell_max(),
        }
    }
}

fn default_module_delay_min() -> f64 {
    5.0
}
fn default_module_delay_max() -> f64 {
    30.0
}
fn default_cooldown_min() -> f64 {
    30.0
}
fn default_cooldown_max() -> f64 {
    120.0
}
fn default_hop_dwell_min() -> u64 {
    60
}
fn default_hop_dwell_max() -> u64 {
    300
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Modules {
    #[serde(default)]
    pub net_scanner: ScannerCfg,
    #[serde(default)]
    pub auth_prober: AuthProberCfg,
    #[serde(default)]
    pub dns_noise: DnsNoiseCfg,
    #[serde(default)]
    pub http_probe: HttpProbeCfg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScannerCfg {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub intensity: Intensity,
    #[serde(default = "default_port_list")]
    pub port_list: String,
}

impl Default for ScannerCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            intensity: Intensity::default(),
            port_list: default_port_list(),
        }
    }
}

fn default_port_list() -> String {
    DEFAULT_PORT_LIST.to_owned()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AuthProberCfg {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// anti-abuse ceiling on failed logins per target per protocol
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
}

impl Default for AuthProberCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            protocols: default_protocols(),
        }
    }
}

fn default_max_attempts() -> u32 {
    2
}
fn default_protocols() -> Vec<String> {
    ["ssh", "rdp", "http_basic"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DnsNoiseCfg {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default = "default_resolver")]
    pub resolver: Ipv4Addr,
    #[serde(default = "default_query_count")]
    pub query_count: usize,
}

impl Default for DnsNoiseCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            resolver: default_resolver(),
            query_count: default_query_count(),
        }
    }
}

fn default_resolver() -> Ipv4Addr {
    DEFAULT_RESOLVER.parse().expect("default resolver")
}
fn default_query_count() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HttpProbeCfg {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// extra enumeration paths appended to the built-in catalog
    #[serde(default)]
    pub paths: Vec<String>,
}

impl Default for HttpProbeCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            paths: Vec::new(),
        }
    }
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Credentials {
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: default_password(),
        }
    }
}

fn default_username() -> String {
    DEFAULT_USERNAME.to_owned()
}
fn default_password() -> String {
    DEFAULT_PASSWORD.to_owned()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Notifications {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub apprise_url: Option<String>,
    #[serde(default = "enabled")]
    pub on_cycle_complete: bool,
    #[serde(default = "enabled")]
    pub on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MetricsCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for MetricsCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}
fn default_bind_address() -> String {
    "0.0.0.0".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WebCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_bind_address(),
            port: default_web_port(),
        }
    }
}

fn default_web_port() -> u16 {
    DEFAULT_WEB_PORT
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EveboxCfg {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}
