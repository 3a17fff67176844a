//! Probe modules implement a single `run` operation against a target set.
//! The hopper rebinds the shared [`Binding`] every hop, so modules must
//! re-read it on each invocation rather than capturing the values.
use std::{fmt, net::Ipv4Addr, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

/// Outcome classification for one module run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeStatus {
    Complete,
    Error,
    Skipped,
    DryRun,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Complete => "complete",
            ProbeStatus::Error => "error",
            ProbeStatus::Skipped => "skipped",
            ProbeStatus::DryRun => "dry-run",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one module run. `details` holds opaque per-target outcomes;
/// only the module name makes it into the lease record.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleReport {
    pub module: String,
    pub status: ProbeStatus,
    pub summary: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<serde_json::Value>,
}

impl ModuleReport {
    pub fn new(
        status: ProbeStatus,
        summary: impl Into<String>,
        details: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            // filled in by the runner, which knows the registered name
            module: String::new(),
            status,
            summary: summary.into(),
            details,
        }
    }

    /// Report for a module whose `run` returned `Err`
    pub fn error(module: &str, message: impl Into<String>) -> Self {
        Self {
            module: module.to_string(),
            status: ProbeStatus::Error,
            summary: message.into(),
            details: Vec::new(),
        }
    }
}

/// The capability record modules read their source address and interface
/// from. Swapped atomically by the hopper under its per-hop lock.
#[derive(Debug, Clone)]
pub struct Binding {
    inner: Arc<RwLock<BoundSource>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundSource {
    pub source_ip: Ipv4Addr,
    pub interface: String,
}

impl Binding {
    pub fn new(source_ip: Ipv4Addr, interface: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BoundSource {
                source_ip,
                interface: interface.into(),
            })),
        }
    }

    /// Atomically swap the bound source; subsequent `run` calls see the new
    /// values.
    pub fn rebind(&self, source_ip: Ipv4Addr, interface: impl Into<String>) {
        *self.inner.write() = BoundSource {
            source_ip,
            interface: interface.into(),
        };
    }

    /// Snapshot of the current binding
    pub fn current(&self) -> BoundSource {
        self.inner.read().clone()
    }
}

/// A pluggable generator of one family of suspicious traffic
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    /// registry name, e.g. `net_scanner`
    fn name(&self) -> &'static str;

    /// Execute against `targets`. Errors are captured by the runner and
    /// converted into a `status=error` report; they never abort the hop.
    async fn run(&self, targets: &[String]) -> Result<ModuleReport>;
}

/// Ordered module registry. Built once in `bin` from the plugin crates and
/// shared read-only with the hopper and the control plane.
#[derive(Default)]
pub struct ModuleSet {
    modules: Vec<Arc<dyn Probe>>,
}

impl fmt::Debug for ModuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSet")
            .field("modules", &self.names())
            .finish()
    }
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a probe module to the registry
    pub fn register(&mut self, probe: Arc<dyn Probe>) -> &mut Self {
        self.modules.push(probe);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Probe>> {
        self.modules.iter().find(|m| m.name() == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.iter().any(|m| m.name() == name)
    }

    /// Modules whose `modules.<name>.enabled` flag is set
    pub fn enabled(&self, cfg: &config::Config) -> Vec<Arc<dyn Probe>> {
        self.modules
            .iter()
            .filter(|m| cfg.module_enabled(m.name()))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_value(ProbeStatus::DryRun).unwrap(),
            serde_json::json!("dry-run")
        );
        assert_eq!(ProbeStatus::Complete.as_str(), "complete");
    }

    #[test]
    fn rebind_is_visible_to_holders() {
        let binding = Binding::new(Ipv4Addr::UNSPECIFIED, "eth1");
        let held = binding.clone();
        binding.rebind("10.30.30.55".parse().unwrap(), "eth1.30");
        let bound = held.current();
        assert_eq!(bound.source_ip.to_string(), "10.30.30.55");
        assert_eq!(bound.interface, "eth1.30");
    }
}
