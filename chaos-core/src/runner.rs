//! Serial module execution with jittered pacing.
//!
//! Modules run one at a time in a random order; parallelism is deliberately
//! disallowed so source-IP binding stays deterministic and the concurrent
//! external-process count stays capped.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use config::Schedule;
use rand::{seq::SliceRandom, thread_rng, Rng};
use tracing::{debug, error, info};

use crate::{
    metrics,
    module::{ModuleReport, Probe},
    shutdown::StopSignal,
};

/// Run every module once against `targets`, in a uniformly random order.
///
/// A module error becomes a `status=error` report and execution continues.
/// Between modules (never after the last) we sleep a uniform draw from
/// `[module_delay_min, module_delay_max]`, interruptible by `stop`; the loop
/// also breaks at the next module boundary once `stop` is set.
pub async fn run_once(
    modules: &[Arc<dyn Probe>],
    targets: &[String],
    schedule: &Schedule,
    stop: &StopSignal,
) -> Vec<ModuleReport> {
    let mut order: Vec<Arc<dyn Probe>> = modules.to_vec();
    order.shuffle(&mut thread_rng());

    let mut reports = Vec::with_capacity(order.len());
    let total = order.len();
    for (idx, module) in order.iter().enumerate() {
        if stop.is_set() {
            info!("stop requested, aborting module run");
            break;
        }

        let name = module.name();
        info!(module = name, "running module");
        let started = Instant::now();
        let report = match module.run(targets).await {
            Ok(mut report) => {
                report.module = name.to_string();
                report
            }
            Err(err) => {
                error!(module = name, %err, "module failed");
                ModuleReport::error(name, err.to_string())
            }
        };
        metrics::MODULE_RUNS_TOTAL
            .with_label_values(&[name, report.status.as_str()])
            .inc();
        info!(
            module = name,
            status = %report.status,
            elapsed = ?started.elapsed(),
            "module finished"
        );
        reports.push(report);

        if idx + 1 < total {
            let (min, max) = schedule.module_delay();
            let delay = thread_rng().gen_range(min..=max);
            debug!(delay, "inter-module jitter");
            if stop.sleep(Duration::from_secs_f64(delay)).await {
                break;
            }
        }
    }
    reports
}

/// Module-only daemon loop (`run --daemon`): cycle `run_once` with a
/// randomized cooldown until stopped.
pub async fn run_loop(
    modules: &[Arc<dyn Probe>],
    targets: &[String],
    schedule: &Schedule,
    stop: &StopSignal,
) {
    let mut cycle = 0u64;
    while !stop.is_set() {
        cycle += 1;
        info!(cycle, "starting cycle");
        run_once(modules, targets, schedule, stop).await;

        let (min, max) = schedule.cooldown();
        let cooldown = thread_rng().gen_range(min..=max);
        info!(cycle, cooldown = %format!("{cooldown:.1}s"), "cycle complete");
        if stop.sleep(Duration::from_secs_f64(cooldown)).await {
            break;
        }
    }
    info!("module runner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ProbeStatus;
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct Steady;

    #[async_trait]
    impl Probe for Steady {
        fn name(&self) -> &'static str {
            "dns_noise"
        }
        async fn run(&self, targets: &[String]) -> anyhow::Result<ModuleReport> {
            Ok(ModuleReport::new(
                ProbeStatus::Complete,
                format!("{} targets", targets.len()),
                Vec::new(),
            ))
        }
    }

    struct Boom;

    #[async_trait]
    impl Probe for Boom {
        fn name(&self) -> &'static str {
            "auth_prober"
        }
        async fn run(&self, _targets: &[String]) -> anyhow::Result<ModuleReport> {
            Err(anyhow!("connection pool exploded"))
        }
    }

    fn schedule() -> Schedule {
        Schedule {
            module_delay_min: 0.0,
            module_delay_max: 0.0,
            cooldown_min: 0.0,
            cooldown_max: 0.0,
            hop_dwell_min: 0,
            hop_dwell_max: 0,
        }
    }

    fn targets() -> Vec<String> {
        vec!["10.0.0.1".to_string()]
    }

    #[tokio::test]
    async fn module_error_is_isolated() {
        let modules: Vec<Arc<dyn Probe>> = vec![Arc::new(Boom), Arc::new(Steady)];
        let reports = run_once(&modules, &targets(), &schedule(), &StopSignal::new()).await;

        assert_eq!(reports.len(), 2);
        let failed = reports.iter().find(|r| r.module == "auth_prober").unwrap();
        assert_eq!(failed.status, ProbeStatus::Error);
        assert!(failed.summary.contains("exploded"));
        let ok = reports.iter().find(|r| r.module == "dns_noise").unwrap();
        assert_eq!(ok.status, ProbeStatus::Complete);
    }

    #[tokio::test]
    async fn stop_set_before_run_skips_everything() {
        let stop = StopSignal::new();
        stop.set();
        let modules: Vec<Arc<dyn Probe>> = vec![Arc::new(Steady), Arc::new(Steady)];
        let started = Instant::now();
        let reports = run_once(&modules, &targets(), &schedule(), &stop).await;
        assert!(reports.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stop_mid_sleep_breaks_the_loop() {
        let stop = StopSignal::new();
        let schedule = Schedule {
            module_delay_min: 30.0,
            module_delay_max: 30.0,
            ..self::schedule()
        };
        let modules: Vec<Arc<dyn Probe>> = vec![Arc::new(Steady), Arc::new(Steady)];
        let stopper = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                stop.set();
            })
        };
        let started = Instant::now();
        let reports = run_once(&modules, &targets(), &schedule, &stop).await;
        stopper.await.unwrap();
        // first module ran, the inter-module sleep was interrupted
        assert_eq!(reports.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
