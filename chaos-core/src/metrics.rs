#![allow(missing_docs)]

//! # metrics
//!
//! prometheus statistics for hop cycles and probe modules, exposed by the
//! control plane at `/metrics`.
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    /// When the bot started
    pub static ref START_TIME: Instant = Instant::now();

    /// hop cycles completed, per VLAN
    pub static ref HOPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "chaosbot_hops_total",
        "Total VLAN hop cycles completed",
        &["vlan_id"]
    )
    .unwrap();

    /// duration of each hop's attack window
    pub static ref HOP_DURATION: Histogram = register_histogram!(
        "chaosbot_hop_duration_seconds",
        "Duration of each hop cycle",
        vec![30.0, 60.0, 120.0, 300.0, 600.0, 1200.0]
    )
    .unwrap();

    /// currently active VLAN id (0 when idle)
    pub static ref CURRENT_VLAN: IntGauge =
        register_int_gauge!("chaosbot_current_vlan", "Currently active VLAN ID").unwrap();

    /// module executions by outcome
    pub static ref MODULE_RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "chaosbot_module_runs_total",
        "Total module executions",
        &["module", "status"]
    )
    .unwrap();

    /// hosts discovered by net_scanner
    pub static ref SCAN_HOSTS_FOUND: IntCounter = register_int_counter!(
        "chaosbot_scan_hosts_found_total",
        "Hosts discovered by net_scanner"
    )
    .unwrap();

    /// open ports discovered by net_scanner
    pub static ref SCAN_PORTS_FOUND: IntCounter = register_int_counter!(
        "chaosbot_scan_ports_found_total",
        "Open ports discovered by net_scanner"
    )
    .unwrap();

    /// failed-login attempts by protocol and outcome
    pub static ref AUTH_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "chaosbot_auth_attempts_total",
        "Authentication attempts made",
        &["protocol", "result"]
    )
    .unwrap();

    /// DNS queries generated, per category
    pub static ref DNS_QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "chaosbot_dns_queries_total",
        "DNS queries generated",
        &["query_type"]
    )
    .unwrap();

    /// HTTP probes sent, per probe type
    pub static ref HTTP_PROBES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "chaosbot_http_probes_total",
        "HTTP probe requests sent",
        &["probe_type"]
    )
    .unwrap();

    /// DHCP leases obtained
    pub static ref LEASES_TOTAL: IntCounter =
        register_int_counter!("chaosbot_leases_total", "Total DHCP leases obtained").unwrap();

    /// immediate duplicate IP assignments detected
    pub static ref DUPLICATE_IPS: IntCounter = register_int_counter!(
        "chaosbot_duplicate_ips_total",
        "Duplicate IP assignments detected"
    )
    .unwrap();

    /// bot state (0=idle, 1=hopping, 2=attacking, 3=cooldown)
    pub static ref STATE: IntGauge = register_int_gauge!(
        "chaosbot_state",
        "Current bot state (0=idle, 1=hopping, 2=attacking, 3=cooldown)"
    )
    .unwrap();

    /// bot uptime
    pub static ref UPTIME: IntGauge =
        register_int_gauge!("chaosbot_uptime_seconds", "Bot uptime (seconds)").unwrap();
}

/// Record hop-level metrics for a completed cycle
pub fn record_hop(vlan_id: u16, duration: f64) {
    HOPS_TOTAL.with_label_values(&[&vlan_id.to_string()]).inc();
    HOP_DURATION.observe(duration);
    CURRENT_VLAN.set(vlan_id as i64);
    LEASES_TOTAL.inc();
}
