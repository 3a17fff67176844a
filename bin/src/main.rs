#![allow(clippy::cognitive_complexity)]
use std::{
    collections::HashSet,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use auth_prober::AuthProber;
use chaos_core::{
    hopper::Hopper,
    module::{Binding, ModuleSet, Probe},
    notify::Notifier,
    runner,
    shutdown::{spawn_signal_handler, StopSignal},
    tokio::{self, runtime::Builder},
    trace::LogBuffer,
    tracing::info,
};
use cmd_exec::{CommandExecutor, SystemExecutor};
use config::SharedConfig;
use control_api::ApiState;
use dns_noise::DnsNoise;
use http_probe::HttpProbe;
use lease_journal::LeaseJournal;
use net_scanner::NetScanner;

#[derive(Parser, Debug)]
#[clap(author, name = "chaos-bot", bin_name = "chaos-bot", about, long_about = None)]
/// Automated red-team traffic generator for lab security validation
struct Cli {
    /// path to the config file (default search: ./config.yml,
    /// /etc/chaos-bot/config.yml, ~/.chaos-bot/config.yml)
    #[clap(short, long, value_parser, env = "CHAOS_BOT_CONFIG", global = true)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run modules against configured targets (no VLAN hopping)
    Run {
        /// run all modules once and exit
        #[clap(long)]
        once: bool,
        /// run continuously with randomized intervals
        #[clap(long)]
        daemon: bool,
        /// log actions without executing
        #[clap(long)]
        dry_run: bool,
        /// comma-separated module list
        #[clap(long, value_delimiter = ',')]
        modules: Option<Vec<String>>,
    },
    /// VLAN hopper mode: rotate through VLANs running modules from each
    Hop {
        /// single hop cycle and exit
        #[clap(long)]
        once: bool,
        /// continuous VLAN hopping
        #[clap(long)]
        daemon: bool,
        /// log actions without executing
        #[clap(long)]
        dry_run: bool,
        /// comma-separated VLAN IDs to hop
        #[clap(long, value_delimiter = ',')]
        vlans: Option<Vec<u16>>,
        /// min dwell time (seconds)
        #[clap(long)]
        dwell_min: Option<u64>,
        /// max dwell time (seconds)
        #[clap(long)]
        dwell_max: Option<u64>,
    },
    /// View VLAN hop lease history
    History {
        /// filter by VLAN ID
        #[clap(long)]
        vlan: Option<u16>,
        /// number of entries to show
        #[clap(long, default_value_t = 20)]
        last: u32,
        #[clap(long, value_enum, default_value = "table")]
        format: Format,
        /// delete all lease history
        #[clap(long)]
        clear: bool,
    },
    /// Start the control API; the hopper stays idle until started over HTTP
    Serve,
    /// View or validate configuration
    Config {
        /// dump resolved config
        #[clap(long)]
        show: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Format {
    Table,
    Json,
}

fn main() {
    let cli = Cli::parse();

    let rt = match Builder::new_multi_thread()
        .thread_name("chaos-bot-worker")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("chaos-bot: failed to build runtime: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = rt.block_on(dispatch(cli)) {
        eprintln!("chaos-bot: {err:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            once,
            daemon,
            dry_run,
            modules,
        } => run_cmd(config_path, once, daemon, dry_run, modules).await,
        Command::Hop {
            once,
            daemon: _,
            dry_run,
            vlans,
            dwell_min,
            dwell_max,
        } => hop_cmd(config_path, once, dry_run, vlans, dwell_min, dwell_max).await,
        Command::History {
            vlan,
            last,
            format,
            clear,
        } => history_cmd(vlan, last, format, clear).await,
        Command::Serve => serve_cmd(config_path).await,
        Command::Config { show } => config_cmd(config_path, show),
    }
}

/// Load config with CLI overrides folded in through the same deep-merge the
/// control plane uses.
fn load_config(path: Option<&Path>, overrides: serde_json::Value) -> Result<SharedConfig> {
    let mut cfg = config::load(path)?;
    if !overrides.is_null() {
        cfg = cfg.merged(&overrides)?;
    }
    Ok(config::shared(cfg))
}

/// Instantiate the probe modules, optionally filtered by name
fn build_modules(
    cfg: &SharedConfig,
    binding: &Binding,
    exec: &Arc<dyn CommandExecutor>,
    filter: Option<&[String]>,
) -> ModuleSet {
    let all: Vec<Arc<dyn Probe>> = vec![
        Arc::new(NetScanner::new(binding.clone(), cfg.clone(), exec.clone())),
        Arc::new(AuthProber::new(binding.clone(), cfg.clone(), exec.clone())),
        Arc::new(DnsNoise::new(binding.clone(), cfg.clone())),
        Arc::new(HttpProbe::new(binding.clone(), cfg.clone())),
    ];
    let mut set = ModuleSet::new();
    for probe in all {
        if filter.map_or(true, |names| names.iter().any(|name| name == probe.name())) {
            set.register(probe);
        }
    }
    set
}

async fn run_cmd(
    config_path: Option<&Path>,
    once: bool,
    daemon: bool,
    dry_run: bool,
    module_filter: Option<Vec<String>>,
) -> Result<()> {
    let overrides = if dry_run {
        json!({ "general": { "dry_run": true } })
    } else {
        serde_json::Value::Null
    };
    let cfg = load_config(config_path, overrides)?;
    let snapshot = config::snapshot(&cfg);
    chaos_core::trace::init(
        &snapshot.general.log_level,
        snapshot.general.log_file.as_deref(),
        LogBuffer::new(),
    )?;
    info!("chaos-bot starting");

    let exec: Arc<dyn CommandExecutor> = Arc::new(SystemExecutor::new(snapshot.general.dry_run));
    let binding = Binding::new(snapshot.general.management_ip, &snapshot.general.interface);
    let modules = build_modules(&cfg, &binding, &exec, module_filter.as_deref());
    let enabled = modules.enabled(&snapshot);

    // every static target across all VLANs, minus the exclusions
    let excluded: HashSet<&String> = snapshot.excluded_hosts.iter().collect();
    let targets: Vec<String> = snapshot
        .vlans
        .iter()
        .flat_map(|vlan| vlan.targets.iter())
        .filter(|target| !excluded.contains(target))
        .cloned()
        .collect();

    let stop = StopSignal::new();
    let _supervisor = spawn_signal_handler(stop.clone());

    if once || !daemon {
        let reports = runner::run_once(&enabled, &targets, &snapshot.schedule, &stop).await;
        for report in reports {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    } else {
        runner::run_loop(&enabled, &targets, &snapshot.schedule, &stop).await;
    }
    Ok(())
}

async fn hop_cmd(
    config_path: Option<&Path>,
    once: bool,
    dry_run: bool,
    vlan_filter: Option<Vec<u16>>,
    dwell_min: Option<u64>,
    dwell_max: Option<u64>,
) -> Result<()> {
    let mut overrides = serde_json::Map::new();
    if dry_run {
        overrides.insert("general".into(), json!({ "dry_run": true }));
    }
    let mut schedule = serde_json::Map::new();
    if let Some(min) = dwell_min {
        schedule.insert("hop_dwell_min".into(), json!(min));
    }
    if let Some(max) = dwell_max {
        schedule.insert("hop_dwell_max".into(), json!(max));
    }
    if !schedule.is_empty() {
        overrides.insert("schedule".into(), serde_json::Value::Object(schedule));
    }
    let overrides = if overrides.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::Value::Object(overrides)
    };

    let cfg = load_config(config_path, overrides)?;
    let snapshot = config::snapshot(&cfg);
    if let Some(filter) = &vlan_filter {
        if !snapshot.vlans.iter().any(|vlan| filter.contains(&vlan.id)) {
            bail!(
                "no matching VLANs for: {}",
                filter
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            );
        }
    }
    chaos_core::trace::init(
        &snapshot.general.log_level,
        snapshot.general.log_file.as_deref(),
        LogBuffer::new(),
    )?;

    let exec: Arc<dyn CommandExecutor> = Arc::new(SystemExecutor::new(snapshot.general.dry_run));
    // rebound to the leased address on every hop
    let binding = Binding::new(snapshot.general.management_ip, &snapshot.general.interface);
    let modules = Arc::new(build_modules(&cfg, &binding, &exec, None));
    let journal = LeaseJournal::open_default()
        .await
        .context("failed to open lease journal")?;
    let stop = StopSignal::new();
    let notifier = Arc::new(Notifier::new(cfg.clone()));
    let hopper = Hopper::new(
        exec,
        journal,
        cfg,
        modules,
        binding,
        notifier,
        stop.clone(),
    );

    let _supervisor = spawn_signal_handler(stop.clone());

    if once {
        let summary = hopper.hop_once(vlan_filter.as_deref()).await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        hopper.run_daemon(vlan_filter).await;
    }
    Ok(())
}

async fn history_cmd(vlan: Option<u16>, last: u32, format: Format, clear: bool) -> Result<()> {
    let journal = LeaseJournal::open_default()
        .await
        .context("failed to open lease journal")?;

    if clear {
        let count = journal.clear().await?;
        println!("Cleared {count} lease records");
        return Ok(());
    }

    let rows = journal.history(vlan, last).await?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Format::Table => {
            if rows.is_empty() {
                println!("No lease history found");
                return Ok(());
            }
            println!(
                "{:>5} {:>5} {:<16} {:<18} {:<28} {:>8} Modules",
                "ID", "VLAN", "IP", "MAC", "Timestamp", "Duration"
            );
            println!("{}", "-".repeat(100));
            for row in rows {
                println!(
                    "{:>5} {:>5} {:<16} {:<18} {:<28} {:>7.1}s {}",
                    row.id,
                    row.vlan_id,
                    row.ip,
                    row.mac,
                    row.timestamp,
                    row.duration_sec,
                    row.modules_run.join(", ")
                );
            }
        }
    }
    Ok(())
}

async fn serve_cmd(config_path: Option<&Path>) -> Result<()> {
    let cfg = load_config(config_path, serde_json::Value::Null)?;
    let snapshot = config::snapshot(&cfg);
    let logs = LogBuffer::new();
    chaos_core::trace::init(
        &snapshot.general.log_level,
        snapshot.general.log_file.as_deref(),
        logs.clone(),
    )?;
    info!("chaos-bot control plane starting");

    let exec: Arc<dyn CommandExecutor> = Arc::new(SystemExecutor::new(snapshot.general.dry_run));
    let binding = Binding::new(snapshot.general.management_ip, &snapshot.general.interface);
    let modules = Arc::new(build_modules(&cfg, &binding, &exec, None));
    let journal = LeaseJournal::open_default()
        .await
        .context("failed to open lease journal")?;

    // `stop` cancels hopping; `shutdown` ends the process. OS signals raise
    // both, `/stop` only the former.
    let stop = StopSignal::new();
    let shutdown = StopSignal::new();
    let _supervisor = spawn_signal_handler(shutdown.clone());
    {
        let stop = stop.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.wait().await;
            stop.set();
        });
    }

    let notifier = Arc::new(Notifier::new(cfg.clone()));
    let hopper = Arc::new(Hopper::new(
        exec,
        journal.clone(),
        cfg.clone(),
        modules.clone(),
        binding,
        notifier,
        stop.clone(),
    ));
    info!("hopper initialized, idle until started from the API");

    let addr: SocketAddr = format!("{}:{}", snapshot.web.host, snapshot.web.port)
        .parse()
        .context("invalid web.host/web.port")?;
    let state = ApiState::new(hopper.clone(), journal, cfg, modules, stop, logs);
    let result = control_api::serve(addr, state, shutdown).await;

    // whatever ended the server, leave no interface behind
    hopper.teardown_current().await;
    result
}

fn config_cmd(config_path: Option<&Path>, show: bool) -> Result<()> {
    let cfg = config::load(config_path)?;
    if show {
        println!("{}", serde_json::to_string_pretty(cfg.raw())?);
    } else {
        println!(
            "Config loaded from: {}",
            cfg.path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "unknown".into())
        );
        println!(
            "VLANs: {:?}",
            cfg.vlans.iter().map(|vlan| vlan.id).collect::<Vec<_>>()
        );
        println!(
            "Modules: {:?}",
            ["net_scanner", "auth_prober", "dns_noise", "http_probe"]
                .iter()
                .filter(|name| cfg.module_enabled(name))
                .collect::<Vec<_>>()
        );
        println!(
            "Notifications: {}",
            if cfg.notifications.enabled {
                "enabled"
            } else {
                "disabled"
            }
        );
        println!(
            "Metrics: {}",
            if cfg.metrics.enabled {
                "enabled"
            } else {
                "disabled"
            }
        );
    }
    Ok(())
}
