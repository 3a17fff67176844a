#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Config loading & validation.
//!
//! The on-disk format lives in [`wire`]; this module turns a parsed document
//! into a validated [`Config`] and keeps the raw JSON value around so the
//! control plane can serve and deep-merge it.
pub mod wire;

use std::{
    collections::HashSet,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use wire::{
    AuthProberCfg, Credentials, DnsNoiseCfg, EveboxCfg, General, HttpProbeCfg, Intensity,
    MetricsCfg, Modules, Notifications, ScannerCfg, WebCfg,
};

/// Required top-level sections, checked in order
static REQUIRED_SECTIONS: [&str; 4] = ["general", "vlans", "schedule", "modules"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("no config found, searched: {0:?}")]
    NoDefault(Vec<PathBuf>),
    #[error("empty config file: {0}")]
    Empty(PathBuf),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("missing required config section: {0}")]
    MissingSection(&'static str),
    #[error("config must define at least one VLAN")]
    NoVlans,
    #[error("invalid VLAN entry: {0}")]
    InvalidVlan(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Immutable per-VLAN record, validated at load. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VlanSpec {
    pub id: u16,
    pub name: String,
    pub gateway: Option<Ipv4Addr>,
    pub targets: Vec<String>,
}

/// Hop/module pacing. All intervals are half-open uniform draws with
/// `min <= max` enforced at load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Schedule {
    pub module_delay_min: f64,
    pub module_delay_max: f64,
    pub cooldown_min: f64,
    pub cooldown_max: f64,
    /// informational; dwell is whatever module execution plus jitter takes
    pub hop_dwell_min: u64,
    pub hop_dwell_max: u64,
}

impl Schedule {
    pub fn module_delay(&self) -> (f64, f64) {
        (self.module_delay_min, self.module_delay_max)
    }

    pub fn cooldown(&self) -> (f64, f64) {
        (self.cooldown_min, self.cooldown_max)
    }
}

/// Validated runtime configuration plus the raw document it came from.
#[derive(Debug, Clone)]
pub struct Config {
    pub general: General,
    pub vlans: Vec<VlanSpec>,
    pub schedule: Schedule,
    pub modules: Modules,
    pub credentials: Credentials,
    pub excluded_hosts: Vec<String>,
    pub notifications: Notifications,
    pub metrics: MetricsCfg,
    pub web: WebCfg,
    pub evebox: Option<EveboxCfg>,
    path: Option<PathBuf>,
    raw: Value,
}

impl Config {
    /// Parse and validate a YAML (or JSON, serde does not care) document.
    pub fn parse_str(s: &str, path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let raw = serde_json::to_value(&doc).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(raw, path)
    }

    /// Validate an already-parsed document. This is also the re-validation
    /// path after a `PUT /config` deep merge.
    pub fn from_value(raw: Value, path: Option<PathBuf>) -> Result<Self, ConfigError> {
        if raw.is_null() {
            return Err(ConfigError::Parse("document is null".into()));
        }
        for section in REQUIRED_SECTIONS {
            if raw.get(section).is_none() {
                return Err(ConfigError::MissingSection(section));
            }
        }
        let wire: wire::BotCfg =
            serde_json::from_value(raw.clone()).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let entries = wire.vlans.ok_or(ConfigError::MissingSection("vlans"))?;
        if entries.is_empty() {
            return Err(ConfigError::NoVlans);
        }
        let vlans = entries
            .into_iter()
            .map(|v| {
                if !(1..=4094).contains(&v.id) {
                    return Err(ConfigError::InvalidVlan(format!(
                        "VLAN id {} out of range 1-4094",
                        v.id
                    )));
                }
                let targets = v.targets.ok_or_else(|| {
                    ConfigError::InvalidVlan(format!("VLAN {} missing 'targets'", v.id))
                })?;
                Ok(VlanSpec {
                    id: v.id,
                    name: v.name,
                    gateway: v.gateway,
                    targets,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let s = wire.schedule.ok_or(ConfigError::MissingSection("schedule"))?;
        for (name, min, max) in [
            ("module_delay", s.module_delay_min, s.module_delay_max),
            ("cooldown", s.cooldown_min, s.cooldown_max),
            (
                "hop_dwell",
                s.hop_dwell_min as f64,
                s.hop_dwell_max as f64,
            ),
        ] {
            if min > max {
                return Err(ConfigError::InvalidSchedule(format!(
                    "{name}_min {min} > {name}_max {max}"
                )));
            }
        }
        let schedule = Schedule {
            module_delay_min: s.module_delay_min,
            module_delay_max: s.module_delay_max,
            cooldown_min: s.cooldown_min,
            cooldown_max: s.cooldown_max,
            hop_dwell_min: s.hop_dwell_min,
            hop_dwell_max: s.hop_dwell_max,
        };

        Ok(Self {
            general: wire.general.ok_or(ConfigError::MissingSection("general"))?,
            vlans,
            schedule,
            modules: wire.modules.ok_or(ConfigError::MissingSection("modules"))?,
            credentials: wire.credentials,
            excluded_hosts: wire.excluded_hosts,
            notifications: wire.notifications,
            metrics: wire.metrics,
            web: wire.web,
            evebox: wire.evebox,
            path,
            raw,
        })
    }

    /// Deep-merge `patch` over this config and re-validate. `self` is left
    /// untouched on failure.
    pub fn merged(&self, patch: &Value) -> Result<Self, ConfigError> {
        let mut raw = self.raw.clone();
        deep_merge(&mut raw, patch);
        Self::from_value(raw, self.path.clone())
    }

    /// The raw document as loaded/merged, for `GET /config`
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn module_enabled(&self, name: &str) -> bool {
        match name {
            "net_scanner" => self.modules.net_scanner.enabled,
            "auth_prober" => self.modules.auth_prober.enabled,
            "dns_noise" => self.modules.dns_noise.enabled,
            "http_probe" => self.modules.http_probe.enabled,
            _ => false,
        }
    }

    /// Union of every static target and gateway; the only addresses
    /// `/trigger` may aim at.
    pub fn known_targets(&self) -> HashSet<String> {
        let mut set = HashSet::new();
        for vlan in &self.vlans {
            set.extend(vlan.targets.iter().cloned());
            if let Some(gw) = vlan.gateway {
                set.insert(gw.to_string());
            }
        }
        set
    }
}

/// Shared read-mostly handle; `PUT /config` swaps the inner `Arc` under the
/// write lock, readers clone it out.
pub type SharedConfig = Arc<RwLock<Arc<Config>>>;

pub fn shared(cfg: Config) -> SharedConfig {
    Arc::new(RwLock::new(Arc::new(cfg)))
}

/// Snapshot the current config out of a [`SharedConfig`]
pub fn snapshot(cfg: &SharedConfig) -> Arc<Config> {
    Arc::clone(&cfg.read())
}

/// Locate the config file: explicit path, then `./config.yml`,
/// `/etc/chaos-bot/config.yml`, `$HOME/.chaos-bot/config.yml`.
pub fn find_config(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path.to_owned())
        } else {
            Err(ConfigError::NotFound(path.to_owned()))
        };
    }
    let candidates = default_paths();
    candidates
        .iter()
        .find(|p| p.exists())
        .cloned()
        .ok_or(ConfigError::NoDefault(candidates))
}

fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("config.yml"),
        PathBuf::from("/etc/chaos-bot/config.yml"),
    ];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(Path::new(&home).join(".chaos-bot").join("config.yml"));
    }
    paths
}

/// Load and validate the config from disk
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let path = find_config(explicit)?;
    debug!(path = %path.display(), "loading config");
    let text = std::fs::read_to_string(&path)?;
    if text.trim().is_empty() {
        return Err(ConfigError::Empty(path));
    }
    Config::parse_str(&text, Some(path))
}

/// Recursive merge: objects merge key-wise, everything else replaces.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, val) in patch {
                match base.get_mut(key) {
                    Some(slot) => deep_merge(slot, val),
                    None => {
                        base.insert(key.clone(), val.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    static MINIMAL: &str = r#"
general:
  interface: eth0
vlans:
  - id: 10
    targets: ["10.0.0.1"]
schedule:
  hop_dwell_min: 10
  hop_dwell_max: 30
modules:
  net_scanner:
    enabled: true
"#;

    #[test]
    fn loads_minimal_config() {
        let cfg = Config::parse_str(MINIMAL, None).unwrap();
        assert_eq!(cfg.general.interface, "eth0");
        assert_eq!(cfg.vlans.len(), 1);
        assert_eq!(cfg.vlans[0].id, 10);
        assert_eq!(cfg.vlans[0].targets, vec!["10.0.0.1".to_string()]);
        // defaults
        assert_eq!(cfg.credentials.username, "chaos-bot");
        assert!(cfg.excluded_hosts.is_empty());
        assert_eq!(cfg.schedule.module_delay_min, 5.0);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = load(Some(Path::new("/nonexistent/path/config.yml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.yml");
        std::fs::write(&path, "").unwrap();
        let err = load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Empty(_)));
    }

    #[test]
    fn missing_section_is_named() {
        let err = Config::parse_str("general:\n  interface: eth0\n", None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection("vlans")));
    }

    #[test]
    fn no_vlans_is_rejected() {
        let doc = "general: {}\nvlans: []\nschedule: {}\nmodules: {}\n";
        let err = Config::parse_str(doc, None).unwrap_err();
        assert!(matches!(err, ConfigError::NoVlans));
    }

    #[test]
    fn vlan_id_out_of_range_is_rejected() {
        let doc = r#"
general: {}
vlans:
  - id: 5000
    targets: []
schedule: {}
modules: {}
"#;
        let err = Config::parse_str(doc, None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVlan(_)));
    }

    #[test]
    fn vlan_missing_targets_is_rejected() {
        let doc = "general: {}\nvlans:\n  - id: 10\nschedule: {}\nmodules: {}\n";
        let err = Config::parse_str(doc, None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVlan(_)));
    }

    #[test]
    fn inverted_schedule_is_rejected() {
        let doc = r#"
general: {}
vlans:
  - id: 10
    targets: []
schedule:
  cooldown_min: 100
  cooldown_max: 10
modules: {}
"#;
        let err = Config::parse_str(doc, None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSchedule(_)));
    }

    #[test]
    fn deep_merge_overrides_and_preserves() {
        let cfg = Config::parse_str(MINIMAL, None).unwrap();
        let merged = cfg
            .merged(&json!({"general": {"dry_run": true}}))
            .unwrap();
        assert!(merged.general.dry_run);
        // untouched keys survive
        assert_eq!(merged.general.interface, "eth0");
        assert_eq!(merged.vlans.len(), 1);
    }

    #[test]
    fn deep_merge_is_idempotent() {
        let cfg = Config::parse_str(MINIMAL, None).unwrap();
        let patch = json!({"schedule": {"cooldown_min": 1, "cooldown_max": 2}});
        let once = cfg.merged(&patch).unwrap();
        let twice = once.merged(&patch).unwrap();
        assert_eq!(once.raw(), twice.raw());
    }

    #[test]
    fn merge_cannot_invalidate() {
        let cfg = Config::parse_str(MINIMAL, None).unwrap();
        let err = cfg.merged(&json!({"vlans": []})).unwrap_err();
        assert!(matches!(err, ConfigError::NoVlans));
    }

    #[test]
    fn known_targets_include_gateways() {
        let doc = r#"
general: {}
vlans:
  - id: 30
    gateway: 10.30.30.1
    targets: ["10.30.30.10"]
  - id: 40
    targets: []
schedule: {}
modules: {}
"#;
        let cfg = Config::parse_str(doc, None).unwrap();
        let known = cfg.known_targets();
        assert!(known.contains("10.30.30.10"));
        assert!(known.contains("10.30.30.1"));
        assert_eq!(known.len(), 2);
    }
}
