//! HTTP probe module: requests any WAF should hate. Per target one bad-UA
//! GET, one path traversal, one SQLi, one XSS, a handful of honeypot paths,
//! and a wrong-Host request, all source-bound with redirects disabled.
use std::{net::Ipv4Addr, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chaos_core::{
    metrics,
    module::{Binding, ModuleReport, Probe, ProbeStatus},
};
use config::SharedConfig;
use rand::{seq::SliceRandom, thread_rng, Rng};
use serde_json::{json, Value};
use tracing::info;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const BAD_USER_AGENTS: [&str; 10] = [
    "sqlmap/1.7#stable (https://sqlmap.org)",
    "nikto/2.5.0",
    "gobuster/3.6",
    "dirbuster/1.0",
    "Mozilla/5.0 (compatible; Nmap Scripting Engine; https://nmap.org/book/nse.html)",
    "masscan/1.3 (https://github.com/robertdavidgraham/masscan)",
    "Wget/1.21",
    "curl/7.88.0",
    "python-requests/2.31.0",
    "Java/11.0.2",
];

const PATH_TRAVERSALS: [&str; 5] = [
    "/../../etc/passwd",
    "/..%2f..%2fetc%2fpasswd",
    "/%2e%2e/%2e%2e/etc/passwd",
    "/....//....//etc/passwd",
    "/..\\..\\windows\\system32\\config\\sam",
];

const SQLI_PAYLOADS: [&str; 5] = [
    "' OR '1'='1",
    "' UNION SELECT NULL--",
    "1; DROP TABLE users--",
    "admin'--",
    "' OR 1=1#",
];

const XSS_PAYLOADS: [&str; 4] = [
    "<script>alert('XSS')</script>",
    "<img src=x onerror=alert(1)>",
    "javascript:alert(document.cookie)",
    "<svg onload=alert(1)>",
];

const HONEYPOT_PATHS: [&str; 18] = [
    "/admin",
    "/wp-login.php",
    "/wp-admin/",
    "/.env",
    "/.git/HEAD",
    "/.git/config",
    "/server-status",
    "/server-info",
    "/phpinfo.php",
    "/actuator/env",
    "/api/v1/admin",
    "/console",
    "/debug",
    "/.aws/credentials",
    "/config.json",
    "/robots.txt",
    "/sitemap.xml",
    "/.well-known/security.txt",
];

struct ProbeRequest {
    kind: &'static str,
    url: String,
    headers: Vec<(&'static str, String)>,
}

pub struct HttpProbe {
    binding: Binding,
    cfg: SharedConfig,
}

impl HttpProbe {
    pub fn new(binding: Binding, cfg: SharedConfig) -> Self {
        Self { binding, cfg }
    }

    fn client(&self, source_ip: Ipv4Addr) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true);
        if !source_ip.is_unspecified() {
            builder = builder.local_address(std::net::IpAddr::from(source_ip));
        }
        builder.build().context("failed to build HTTP client")
    }

    async fn send(&self, client: &reqwest::Client, probe: &ProbeRequest) -> Value {
        let mut req = client.get(&probe.url);
        for (name, value) in &probe.headers {
            req = req.header(*name, value);
        }
        match req.send().await {
            Ok(resp) => {
                let status_code = resp.status().as_u16();
                let content_length = resp.bytes().await.map(|b| b.len()).unwrap_or(0);
                json!({
                    "target": probe.url,
                    "probe_type": probe.kind,
                    "status_code": status_code,
                    "content_length": content_length,
                    "status": "complete",
                })
            }
            Err(err) => json!({
                "target": probe.url,
                "probe_type": probe.kind,
                "status": "error",
                "message": err.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn name(&self) -> &'static str {
        "http_probe"
    }

    async fn run(&self, targets: &[String]) -> Result<ModuleReport> {
        let cfg = config::snapshot(&self.cfg);
        let extra_paths = cfg.modules.http_probe.paths.clone();
        let dry_run = cfg.general.dry_run;
        let bound = self.binding.current();

        let mut shuffled = targets.to_vec();
        shuffled.shuffle(&mut thread_rng());

        // dry-run never needs a socket-bound client
        let client = if dry_run {
            None
        } else {
            Some(self.client(bound.source_ip)?)
        };

        let mut details = Vec::new();
        for target in &shuffled {
            let base_url = format!("http://{target}");
            let mut probes = build_probes(&base_url, &extra_paths);
            probes.shuffle(&mut thread_rng());

            for probe in &probes {
                info!(
                    target_ip = %target,
                    source_ip = %bound.source_ip,
                    probe_type = probe.kind,
                    "HTTP probe"
                );
                if dry_run {
                    details.push(json!({
                        "target": target,
                        "probe_type": probe.kind,
                        "url": probe.url,
                        "status": "dry-run",
                    }));
                    continue;
                }

                let client = client.as_ref().expect("client exists outside dry-run");
                details.push(self.send(client, probe).await);
                metrics::HTTP_PROBES_TOTAL
                    .with_label_values(&[probe.kind])
                    .inc();

                let pause = thread_rng().gen_range(0.3..=2.0);
                tokio::time::sleep(Duration::from_secs_f64(pause)).await;
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
                "Sent {} HTTP probes to {} targets",
                details.len(),
                shuffled.len()
            ),
            details,
        ))
    }
}

fn build_probes(base_url: &str, extra_paths: &[String]) -> Vec<ProbeRequest> {
    let mut rng = thread_rng();
    let mut probes = Vec::new();

    let ua = BAD_USER_AGENTS.choose(&mut rng).unwrap();
    probes.push(ProbeRequest {
        kind: "bad_useragent",
        url: format!("{base_url}/"),
        headers: vec![("User-Agent", ua.to_string())],
    });

    let path = PATH_TRAVERSALS.choose(&mut rng).unwrap();
    probes.push(ProbeRequest {
        kind: "path_traversal",
        url: format!("{base_url}{path}"),
        headers: Vec::new(),
    });

    let sqli = SQLI_PAYLOADS.choose(&mut rng).unwrap();
    probes.push(ProbeRequest {
        kind: "sqli",
        url: format!("{base_url}/search?q={sqli}&id=1"),
        headers: Vec::new(),
    });

    let xss = XSS_PAYLOADS.choose(&mut rng).unwrap();
    probes.push(ProbeRequest {
        kind: "xss",
        url: format!("{base_url}/search?q={xss}"),
        headers: Vec::new(),
    });

    let mut paths: Vec<&str> = HONEYPOT_PATHS.to_vec();
    paths.extend(extra_paths.iter().map(String::as_str));
    for path in paths.choose_multiple(&mut rng, 5.min(paths.len())) {
        probes.push(ProbeRequest {
            kind: "honeypot_path",
            url: format!("{base_url}{path}"),
            headers: Vec::new(),
        });
    }

    probes.push(ProbeRequest {
        kind: "reverse_proxy_probe",
        url: format!("{base_url}/"),
        headers: vec![("Host", "internal.admin.local".to_string())],
    });

    probes
}
