//! DNS noise generator: a shuffled mix of known-bad lookups, DGA-patterned
//! names, and beacon-style TXT queries, sent from the hop's source address
//! straight to the configured resolver.
use std::{net::Ipv4Addr, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chaos_core::{
    metrics,
    module::{Binding, ModuleReport, Probe, ProbeStatus},
};
use config::SharedConfig;
use hickory_proto::{
    op::{Message, MessageType, OpCode, Query},
    rr::{Name, RecordType},
};
use rand::{seq::SliceRandom, thread_rng, Rng};
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tracing::{error, info};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Known-bad test domains (EICAR-style, commonly flagged by threat intel)
const BAD_DOMAINS: [&str; 10] = [
    "malware.testcategory.com",
    "botnet.testcategory.com",
    "phishing.testcategory.com",
    "coinminer.testcategory.com",
    "ransomware.testcategory.com",
    "exploit.testcategory.com",
    "bad-actor.example.com",
    "c2-callback.example.com",
    "exfil-data.example.com",
    "tor-exit-node.example.com",
];

/// TLDs commonly associated with DGA domains
const DGA_TLDS: [&str; 7] = [".com", ".net", ".org", ".info", ".xyz", ".top", ".biz"];

const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub struct DnsNoise {
    binding: Binding,
    cfg: SharedConfig,
}

impl DnsNoise {
    pub fn new(binding: Binding, cfg: SharedConfig) -> Self {
        Self { binding, cfg }
    }

    async fn send_query(
        &self,
        source_ip: Ipv4Addr,
        resolver: Ipv4Addr,
        qname: &str,
        rtype: RecordType,
    ) -> Result<Value> {
        let name = Name::from_ascii(format!("{qname}.")).context("invalid query name")?;
        let mut msg = Message::new();
        msg.set_id(rand::random());
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(name, rtype));
        let bytes = msg.to_vec().context("failed to encode query")?;

        let socket = UdpSocket::bind((source_ip, 0))
            .await
            .context("failed to bind source address")?;
        socket
            .send_to(&bytes, (resolver, 53))
            .await
            .context("failed to send query")?;

        let mut buf = [0u8; 512];
        let received = tokio::time::timeout(QUERY_TIMEOUT, socket.recv_from(&mut buf)).await;
        Ok(match received {
            Err(_) => json!({ "query": qname, "type": rtype.to_string(), "status": "timeout" }),
            Ok(Err(err)) => json!({
                "query": qname,
                "type": rtype.to_string(),
                "status": "error",
                "message": err.to_string(),
            }),
            Ok(Ok((len, _))) => {
                let resp = Message::from_vec(&buf[..len]).context("failed to decode response")?;
                json!({
                    "query": qname,
                    "type": rtype.to_string(),
                    "rcode": resp.response_code().to_string(),
                    "answers": resp.answer_count(),
                    "status": "complete",
                })
            }
        })
    }
}

#[async_trait]
impl Probe for DnsNoise {
    fn name(&self) -> &'static str {
        "dns_noise"
    }

    async fn run(&self, _targets: &[String]) -> Result<ModuleReport> {
        let cfg = config::snapshot(&self.cfg);
        let dns_cfg = cfg.modules.dns_noise.clone();
        let dry_run = cfg.general.dry_run;
        let source_ip = self.binding.current().source_ip;

        let queries = build_query_list(dns_cfg.query_count);
        let mut details = Vec::with_capacity(queries.len());
        for (qname, rtype, category) in &queries {
            let category = *category;
            info!(query = %qname, rtype = %rtype, category, source_ip = %source_ip, "DNS query");
            if dry_run {
                details.push(json!({
                    "query": qname,
                    "type": rtype.to_string(),
                    "category": category,
                    "status": "dry-run",
                }));
                continue;
            }

            match self.send_query(source_ip, dns_cfg.resolver, qname, *rtype).await {
                Ok(mut detail) => {
                    detail["category"] = json!(category);
                    metrics::DNS_QUERIES_TOTAL.with_label_values(&[category]).inc();
                    details.push(detail);
                }
                Err(err) => {
                    error!(query = %qname, %err, "DNS query failed");
                    details.push(json!({
                        "query": qname,
                        "type": rtype.to_string(),
                        "category": category,
                        "status": "error",
                        "message": err.to_string(),
                    }));
                }
            }

            let pause = thread_rng().gen_range(0.2..=1.5);
            tokio::time::sleep(Duration::from_secs_f64(pause)).await;
        }

        let status = if dry_run {
            ProbeStatus::DryRun
        } else {
            ProbeStatus::Complete
        };
        Ok(ModuleReport::new(
            status,
            format!("Sent {} DNS queries", queries.len()),
            details,
        ))
    }
}

fn random_label(len: usize) -> String {
    let mut rng = thread_rng();
    (0..len)
        .map(|_| *ALPHANUMERIC.choose(&mut rng).unwrap() as char)
        .collect()
}

/// A third known-bad A lookups, a third DGA-patterned A lookups, the rest
/// beacon-style TXT queries; shuffled.
fn build_query_list(count: usize) -> Vec<(String, RecordType, &'static str)> {
    let mut rng = thread_rng();
    let mut queries = Vec::with_capacity(count);

    let bad_count = (count / 3).min(BAD_DOMAINS.len());
    for domain in BAD_DOMAINS.choose_multiple(&mut rng, bad_count) {
        queries.push((domain.to_string(), RecordType::A, "known_bad"));
    }

    for _ in 0..count / 3 {
        let label = random_label(rng.gen_range(8..=24));
        let tld = DGA_TLDS.choose(&mut rng).unwrap();
        queries.push((format!("{label}{tld}"), RecordType::A, "dga"));
    }

    while queries.len() < count {
        let payload = random_label(16);
        queries.push((
            format!("{payload}.beacon.example.com"),
            RecordType::TXT,
            "c2_txt",
        ));
    }

    queries.shuffle(&mut rng);
    queries
}
