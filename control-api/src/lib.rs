//! # Control plane
//!
//! HTTP API for driving the hopper and observing it:
//!
//! /api/v1/status, /hop, /start, /stop, /trigger, /history, /config,
//! /modules, /targets, /logs (SSE), /alerts, plus /metrics
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::{collections::VecDeque, fmt, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{extract::Extension, routing, Router};
use chaos_core::{
    hopper::{Hopper, HopSummary},
    module::ModuleSet,
    shutdown::StopSignal,
    trace::LogBuffer,
};
use chrono::{DateTime, Utc};
use config::SharedConfig;
use lease_journal::LeaseJournal;
use parking_lot::Mutex;
use tokio::{net::TcpListener, sync::Mutex as AsyncMutex, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::info;

/// cycle summaries retained for `/status`
const SUMMARY_RING: usize = 50;

/// Shared state behind every handler
#[derive(Clone)]
pub struct ApiState {
    hopper: Arc<Hopper>,
    journal: LeaseJournal,
    cfg: SharedConfig,
    modules: Arc<ModuleSet>,
    /// hopper/runner cancellation, the same signal the hopper holds
    stop: StopSignal,
    logs: LogBuffer,
    started_at: DateTime<Utc>,
    summaries: Arc<Mutex<VecDeque<HopSummary>>>,
    daemon: Arc<AsyncMutex<Option<JoinHandle<()>>>>,
    http: reqwest::Client,
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl ApiState {
    pub fn new(
        hopper: Arc<Hopper>,
        journal: LeaseJournal,
        cfg: SharedConfig,
        modules: Arc<ModuleSet>,
        stop: StopSignal,
        logs: LogBuffer,
    ) -> Self {
        Self {
            hopper,
            journal,
            cfg,
            modules,
            stop,
            logs,
            started_at: Utc::now(),
            summaries: Arc::new(Mutex::new(VecDeque::new())),
            daemon: Arc::new(AsyncMutex::new(None)),
            // the lab's EveBox sits behind a self-signed cert
            http: reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .unwrap_or_default(),
        }
    }

    fn push_summary(&self, summary: HopSummary) {
        let mut ring = self.summaries.lock();
        ring.push_back(summary);
        if ring.len() > SUMMARY_RING {
            ring.pop_front();
        }
    }
}

/// Assemble the router; split from [`serve`] so tests can bind their own
/// listener.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/status", routing::get(handlers::status))
        .route("/api/v1/hop", routing::post(handlers::hop))
        .route("/api/v1/start", routing::post(handlers::start))
        .route("/api/v1/stop", routing::post(handlers::stop))
        .route("/api/v1/trigger", routing::post(handlers::trigger))
        .route("/api/v1/history", routing::get(handlers::history))
        .route(
            "/api/v1/config",
            routing::get(handlers::config_get).put(handlers::config_put),
        )
        .route("/api/v1/modules", routing::get(handlers::modules))
        .route("/api/v1/targets", routing::get(handlers::targets))
        .route("/api/v1/logs", routing::get(handlers::logs))
        .route("/api/v1/alerts", routing::get(handlers::alerts))
        .route("/metrics", routing::get(handlers::metrics_text))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

/// Serve the control API until `shutdown` is raised. `shutdown` is the
/// process-lifetime signal, distinct from the hopper's stop signal: `/stop`
/// must halt hopping without killing the API.
pub async fn serve(addr: SocketAddr, state: ApiState, shutdown: StopSignal) -> Result<()> {
    let tcp = TcpListener::bind(&addr).await?;
    info!(%addr, "control API listening");
    axum::serve(tcp, router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}

mod handlers {
    use std::{convert::Infallible, time::Duration};

    use axum::{
        extract::{Extension, Query},
        http::{header::HeaderValue, StatusCode},
        response::{
            sse::{Event, KeepAlive, Sse},
            IntoResponse, Response,
        },
        Json,
    };
    use chaos_core::metrics::{START_TIME, UPTIME};
    use futures::stream;
    use prometheus::{Encoder, TextEncoder};
    use serde::Deserialize;
    use serde_json::{json, Value};
    use tracing::{error, warn};

    use super::ApiState;

    fn conflict(message: String) -> Response {
        (StatusCode::CONFLICT, Json(json!({ "error": message }))).into_response()
    }

    fn bad_request(message: impl Into<String>) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": message.into() })),
        )
            .into_response()
    }

    pub(crate) async fn status(Extension(state): Extension<ApiState>) -> Json<Value> {
        let summaries = state.summaries.lock();
        Json(json!({
            "status": state.hopper.state().as_str(),
            "current_vlan": state.hopper.current_vlan(),
            "current_ip": state.hopper.current_ip(),
            "uptime_start": state.started_at.to_rfc3339(),
            "cycle_count": summaries.len(),
            "last_cycle": summaries.back(),
        }))
    }

    /// One-shot hop on a detached worker; the handler returns immediately
    pub(crate) async fn hop(Extension(state): Extension<ApiState>) -> Response {
        let hopper_state = state.hopper.state();
        if !hopper_state.can_begin() {
            return conflict(format!("Cannot hop: currently {hopper_state}"));
        }

        let worker = state.clone();
        tokio::spawn(async move {
            match worker.hopper.hop_once(None).await {
                Ok(summary) => worker.push_summary(summary),
                Err(err) => {
                    error!(%err, "one-shot hop failed");
                    worker.hopper.teardown_current().await;
                }
            }
        });
        Json(json!({ "status": "hop_triggered" })).into_response()
    }

    pub(crate) async fn start(
        Extension(state): Extension<ApiState>,
        body: Option<Json<Value>>,
    ) -> Response {
        let hopper_state = state.hopper.state();
        if !hopper_state.can_begin() {
            return conflict(format!("Cannot start: currently {hopper_state}"));
        }

        let vlan_filter = match body.as_ref().and_then(|Json(body)| body.get("vlans")) {
            None | Some(Value::Null) => None,
            Some(Value::Array(ids)) => {
                let mut filter = Vec::with_capacity(ids.len());
                for id in ids {
                    match id.as_u64().and_then(|v| u16::try_from(v).ok()) {
                        Some(vid) => filter.push(vid),
                        None => return bad_request(format!("invalid VLAN id: {id}")),
                    }
                }
                Some(filter)
            }
            Some(other) => return bad_request(format!("'vlans' must be a list, got {other}")),
        };

        let mut daemon = state.daemon.lock().await;
        if let Some(handle) = daemon.as_ref() {
            if !handle.is_finished() {
                return Json(json!({ "status": "already_running" })).into_response();
            }
        }
        state.stop.clear();
        let hopper = state.hopper.clone();
        *daemon = Some(tokio::spawn(async move {
            hopper.run_daemon(vlan_filter).await;
        }));
        Json(json!({ "status": "started" })).into_response()
    }

    /// Fire-and-forget: raise the stop signal and force teardown
    pub(crate) async fn stop(Extension(state): Extension<ApiState>) -> Json<Value> {
        state.stop.set();
        state.hopper.stop().await;
        Json(json!({ "status": "stop_requested" }))
    }

    /// Run selected modules against selected targets without hopping
    pub(crate) async fn trigger(
        Extension(state): Extension<ApiState>,
        body: Option<Json<Value>>,
    ) -> Response {
        let hopper_state = state.hopper.state();
        if !hopper_state.can_begin() {
            return conflict(format!("Cannot trigger: currently {hopper_state}"));
        }
        let Some(Json(body)) = body else {
            return bad_request("No JSON body");
        };

        let modules = string_list(body.get("modules"));
        let targets = string_list(body.get("targets"));
        if modules.is_empty() {
            return bad_request("No modules selected");
        }
        if targets.is_empty() {
            return bad_request("No targets selected");
        }
        for name in &modules {
            if !state.modules.contains(name) {
                return bad_request(format!("Unknown module: {name}"));
            }
        }
        let known = config::snapshot(&state.cfg).known_targets();
        for target in &targets {
            if !known.contains(target) {
                return bad_request(format!("Target not in config: {target}"));
            }
        }

        let worker = state.clone();
        let (spawn_modules, spawn_targets) = (modules.clone(), targets.clone());
        tokio::spawn(async move {
            if let Err(err) = worker.hopper.trigger(&spawn_modules, &spawn_targets).await {
                error!(%err, "trigger run failed");
            }
        });
        Json(json!({
            "status": "triggered",
            "modules": modules,
            "targets": targets,
        }))
        .into_response()
    }

    fn string_list(value: Option<&Value>) -> Vec<String> {
        value
            .and_then(Value::as_array)
            .map(|vals| {
                vals.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct HistoryParams {
        vlan: Option<u16>,
        last: Option<u32>,
    }

    pub(crate) async fn history(
        Extension(state): Extension<ApiState>,
        Query(params): Query<HistoryParams>,
    ) -> Response {
        match state
            .journal
            .history(params.vlan, params.last.unwrap_or(50))
            .await
        {
            Ok(records) => Json(records).into_response(),
            Err(err) => {
                error!(%err, "history query failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response()
            }
        }
    }

    pub(crate) async fn config_get(Extension(state): Extension<ApiState>) -> Json<Value> {
        Json(config::snapshot(&state.cfg).raw().clone())
    }

    /// Deep-merge a JSON patch over the running config. Rejected while
    /// attacking so modules never observe a half-merged view.
    pub(crate) async fn config_put(
        Extension(state): Extension<ApiState>,
        body: Option<Json<Value>>,
    ) -> Response {
        let hopper_state = state.hopper.state();
        if hopper_state == chaos_core::hopper::HopperState::Attacking {
            return conflict("Cannot update config while attacking".to_string());
        }
        let Some(Json(patch)) = body else {
            return bad_request("No JSON body");
        };

        let current = config::snapshot(&state.cfg);
        match current.merged(&patch) {
            Ok(updated) => {
                *state.cfg.write() = std::sync::Arc::new(updated);
                Json(json!({ "status": "updated" })).into_response()
            }
            Err(err) => bad_request(err.to_string()),
        }
    }

    pub(crate) async fn modules(Extension(state): Extension<ApiState>) -> Json<Value> {
        let cfg = config::snapshot(&state.cfg);
        let modules: Vec<Value> = state
            .modules
            .names()
            .into_iter()
            .map(|name| json!({ "name": name, "enabled": cfg.module_enabled(name) }))
            .collect();
        Json(json!({ "modules": modules }))
    }

    pub(crate) async fn targets(Extension(state): Extension<ApiState>) -> Json<Value> {
        let cfg = config::snapshot(&state.cfg);
        let vlans: Vec<Value> = cfg
            .vlans
            .iter()
            .map(|vlan| {
                json!({
                    "id": vlan.id,
                    "name": vlan.name,
                    "gateway": vlan.gateway,
                    "targets": vlan.targets,
                })
            })
            .collect();
        Json(json!({ "vlans": vlans }))
    }

    /// SSE log stream: flush the ring buffer, then poll once a second for
    /// new lines. Runs until the client disconnects.
    pub(crate) async fn logs(Extension(state): Extension<ApiState>) -> Response {
        let logs = state.logs.clone();
        let (cursor, backlog) = logs.snapshot();

        let stream = stream::unfold(
            (logs, cursor, std::collections::VecDeque::from(backlog)),
            |(logs, mut cursor, mut pending)| async move {
                loop {
                    if let Some(line) = pending.pop_front() {
                        let event = Ok::<_, Infallible>(Event::default().data(line));
                        return Some((event, (logs, cursor, pending)));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let (next, lines) = logs.since(cursor);
                    cursor = next;
                    pending.extend(lines);
                }
            },
        );

        let mut resp = Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response();
        resp.headers_mut()
            .insert("Cache-Control", HeaderValue::from_static("no-cache"));
        resp.headers_mut()
            .insert("X-Accel-Buffering", HeaderValue::from_static("no"));
        resp
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct AlertParams {
        time_range: Option<String>,
    }

    /// Proxy IDS alerts from the lab's EveBox: session login, then query
    pub(crate) async fn alerts(
        Extension(state): Extension<ApiState>,
        Query(params): Query<AlertParams>,
    ) -> Response {
        let cfg = config::snapshot(&state.cfg);
        let Some(evebox) = cfg.evebox.clone() else {
            return evebox_unreachable("EveBox not configured");
        };
        let time_range = params.time_range.unwrap_or_else(|| "86400s".to_string());

        let login = state
            .http
            .post(format!("{}/api/login", evebox.url))
            .form(&[("username", &evebox.username), ("password", &evebox.password)])
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        let session = match login {
            Ok(resp) if resp.status().is_success() => resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body["session_id"].as_str().map(str::to_string)),
            Ok(_) => return evebox_unreachable("EveBox auth failed"),
            Err(err) => {
                warn!(%err, "EveBox login failed");
                return evebox_unreachable(format!("EveBox unreachable: {err}"));
            }
        };

        let mut req = state
            .http
            .get(format!("{}/api/alerts", evebox.url))
            .query(&[("time_range", time_range.as_str()), ("tags", "-archived")])
            .timeout(Duration::from_secs(5));
        if let Some(session) = session {
            req = req.header("x-evebox-session-id", session);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(body) => Json(body).into_response(),
                Err(err) => evebox_unreachable(format!("EveBox returned bad JSON: {err}")),
            },
            Ok(resp) => evebox_unreachable(format!("EveBox returned {}", resp.status())),
            Err(err) => evebox_unreachable(format!("EveBox unreachable: {err}")),
        }
    }

    fn evebox_unreachable(message: impl Into<String>) -> Response {
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": message.into(), "alerts": [] })),
        )
            .into_response()
    }

    pub(crate) async fn metrics_text() -> Response {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        match encoder.encode_utf8(&prometheus::gather(), &mut buf) {
            Ok(()) => (
                StatusCode::OK,
                [(axum::http::header::CONTENT_TYPE, encoder.format_type())],
                buf,
            )
                .into_response(),
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{future::IntoFuture, net::Ipv4Addr, time::Duration};

    use async_trait::async_trait;
    use chaos_core::{
        hopper::HopperState,
        module::{Binding, ModuleReport, Probe, ProbeStatus},
        notify::Notifier,
    };
    use cmd_exec::SystemExecutor;
    use serde_json::{json, Value};

    use super::*;

    struct StubScanner;

    #[async_trait]
    impl Probe for StubScanner {
        fn name(&self) -> &'static str {
            "net_scanner"
        }
        async fn run(&self, targets: &[String]) -> anyhow::Result<ModuleReport> {
            Ok(ModuleReport::new(
                ProbeStatus::DryRun,
                format!("{} targets", targets.len()),
                Vec::new(),
            ))
        }
    }

    static DOC: &str = r#"
general:
  interface: eth1
  dry_run: true
  management_ip: 10.10.10.4
vlans:
  - id: 30
    name: servers
    gateway: 10.30.30.1
    targets: ["10.30.30.10", "10.30.30.11"]
  - id: 40
    name: honeypot
    targets: []
schedule:
  module_delay_min: 0
  module_delay_max: 0
  cooldown_min: 60
  cooldown_max: 60
modules: {}
"#;

    async fn spawn_api() -> (String, ApiState) {
        let cfg = config::shared(config::Config::parse_str(DOC, None).unwrap());
        let journal = LeaseJournal::open("sqlite::memory:").await.unwrap();
        let mut modules = ModuleSet::new();
        modules.register(std::sync::Arc::new(StubScanner));
        let modules = Arc::new(modules);
        let stop = StopSignal::new();
        let hopper = Arc::new(Hopper::new(
            Arc::new(SystemExecutor::new(true)),
            journal.clone(),
            cfg.clone(),
            modules.clone(),
            Binding::new(Ipv4Addr::UNSPECIFIED, "eth1"),
            Arc::new(Notifier::new(cfg.clone())),
            stop.clone(),
        ));
        let state = ApiState::new(
            hopper,
            journal,
            cfg,
            modules,
            stop,
            LogBuffer::new(),
        );

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        tokio::spawn(axum::serve(tcp, router(state.clone())).into_future());
        (format!("http://{addr}"), state)
    }

    #[tokio::test]
    async fn status_reflects_the_hopper() {
        let (base, _state) = spawn_api().await;
        let body: Value = reqwest::get(format!("{base}/api/v1/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "idle");
        assert_eq!(body["cycle_count"], 0);
        assert_eq!(body["last_cycle"], Value::Null);
    }

    #[tokio::test]
    async fn guards_reject_while_attacking() {
        let (base, state) = spawn_api().await;
        state.hopper.force_state(HopperState::Attacking);
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/v1/hop"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("attacking"));

        let resp = client
            .post(format!("{base}/api/v1/trigger"))
            .json(&json!({ "modules": ["net_scanner"], "targets": ["10.30.30.10"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);

        // status stays readable regardless of state
        let resp = reqwest::get(format!("{base}/api/v1/status")).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn trigger_validates_modules_and_targets() {
        let (base, _state) = spawn_api().await;
        let client = reqwest::Client::new();
        let url = format!("{base}/api/v1/trigger");

        let resp = client
            .post(&url)
            .json(&json!({ "modules": [], "targets": ["10.30.30.10"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("No modules"));

        let resp = client
            .post(&url)
            .json(&json!({ "modules": ["net_scanner"], "targets": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(&url)
            .json(&json!({ "modules": ["no_such"], "targets": ["10.30.30.10"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        // gateway addresses are valid targets, arbitrary ones are not
        let resp = client
            .post(&url)
            .json(&json!({ "modules": ["net_scanner"], "targets": ["8.8.8.8"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let resp = client
            .post(&url)
            .json(&json!({ "modules": ["net_scanner"], "targets": ["10.30.30.1"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let (base, _state) = spawn_api().await;
        let client = reqwest::Client::new();
        let url = format!("{base}/api/v1/start");

        let body: Value = client.post(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "started");

        // the dry-run hop finishes quickly, leaving the daemon in cooldown
        tokio::time::sleep(Duration::from_millis(500)).await;
        let body: Value = client.post(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "already_running");

        let body: Value = client
            .post(format!("{base}/api/v1/stop"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "stop_requested");
    }

    #[tokio::test]
    async fn config_merge_round_trip() {
        let (base, state) = spawn_api().await;
        let client = reqwest::Client::new();
        let url = format!("{base}/api/v1/config");

        let resp = client
            .put(&url)
            .json(&json!({ "schedule": { "cooldown_min": 1, "cooldown_max": 2 } }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["schedule"]["cooldown_min"], 1);
        // untouched keys survive the merge
        assert_eq!(body["general"]["interface"], "eth1");

        // invalid merges leave the config untouched
        let resp = client
            .put(&url)
            .json(&json!({ "vlans": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(config::snapshot(&state.cfg).vlans.len(), 2);

        state.hopper.force_state(HopperState::Attacking);
        let resp = client
            .put(&url)
            .json(&json!({ "general": { "dry_run": false } }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
    }

    #[tokio::test]
    async fn modules_and_targets_enumerate_config() {
        let (base, _state) = spawn_api().await;

        let body: Value = reqwest::get(format!("{base}/api/v1/modules"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let names: Vec<&str> = body["modules"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["net_scanner"]);

        let body: Value = reqwest::get(format!("{base}/api/v1/targets"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let vlans = body["vlans"].as_array().unwrap();
        assert_eq!(vlans.len(), 2);
        assert_eq!(vlans[0]["id"], 30);
        assert!(vlans[0]["targets"]
            .as_array()
            .unwrap()
            .contains(&json!("10.30.30.10")));
    }

    #[tokio::test]
    async fn history_reads_through_to_the_journal() {
        let (base, state) = spawn_api().await;
        state
            .journal
            .append(30, "10.30.30.55", "aa:bb:cc:dd:ee:ff", &["net_scanner".into()], 12.0)
            .await
            .unwrap();

        let body: Value = reqwest::get(format!("{base}/api/v1/history?vlan=30&last=5"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let records = body.as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["ip"], "10.30.30.55");
    }
}
