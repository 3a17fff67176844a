#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # discovery
//!
//! Live-host discovery for one hop: derive the /24 from the leased gateway,
//! ARP-sweep it with nmap bound to the hop's source address, and parse the
//! report lines. Discovery is best-effort by contract: every failure mode
//! (timeout, missing binary, unparseable output) degrades to an empty list
//! and the hopper falls back to the VLAN's static targets.
use std::{collections::HashSet, net::Ipv4Addr, time::Duration};

use cmd_exec::CommandExecutor;
use ipnet::Ipv4Net;
use tracing::{info, warn};

/// nmap ARP sweeps of a /24 finish well inside this
const SWEEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Truncate the gateway address to its /24 network.
///
/// `172.16.40.1` -> `172.16.40.0/24`. Non-/24 topologies are out of scope.
pub fn gateway_to_subnet(gateway: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::new(gateway, 24).expect("/24 prefix is valid").trunc()
}

/// ARP-sweep `subnet` from `interface`/`source_ip` and return live host IPs,
/// minus `excluded` and the source itself.
pub async fn discover_hosts(
    exec: &dyn CommandExecutor,
    subnet: Ipv4Net,
    interface: &str,
    source_ip: Ipv4Addr,
    excluded: &[String],
    dry_run: bool,
) -> Vec<String> {
    let mut excluded: HashSet<String> = excluded.iter().cloned().collect();
    excluded.insert(source_ip.to_string());

    if dry_run {
        info!(%subnet, interface, "[dry-run] would discover hosts");
        return Vec::new();
    }

    let source = source_ip.to_string();
    let net = subnet.to_string();
    let argv: [&str; 8] = [
        "nmap", "-sn", "-PR", "-S", &source, "-e", interface, &net,
    ];
    info!(%subnet, interface, "discovering hosts");

    let out = match exec.run(&argv, SWEEP_TIMEOUT, false).await {
        Ok(out) => out,
        Err(err) => {
            warn!(%err, "host discovery unavailable");
            return Vec::new();
        }
    };

    let hosts = parse_scan_reports(&out.stdout, &excluded);
    info!(%subnet, count = hosts.len(), "discovered live hosts");
    hosts
}

/// Pull host addresses out of `Nmap scan report for ...` lines. nmap emits
/// either a bare address or `hostname (address)`; prefer the parenthesized
/// address when present.
fn parse_scan_reports(stdout: &str, excluded: &HashSet<String>) -> Vec<String> {
    let mut hosts = Vec::new();
    for line in stdout.lines() {
        let Some(rest) = line.trim().strip_prefix("Nmap scan report for ") else {
            continue;
        };
        let host = match (rest.find('('), rest.find(')')) {
            (Some(open), Some(close)) if open < close => &rest[open + 1..close],
            _ => rest.split_whitespace().next().unwrap_or(""),
        };
        if !host.is_empty() && !excluded.contains(host) {
            hosts.push(host.to_string());
        }
    }
    hosts
}
