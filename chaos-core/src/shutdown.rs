//! Cancellation plumbing.
//!
//! A single [`StopSignal`] is the canonical cancellation token: the runner
//! breaks at module boundaries and mid-sleep, the hopper daemon exits after
//! its current teardown, and OS signals feed it from a dedicated supervisor
//! task. Unlike a `CancellationToken` it can be cleared, which `/stop`
//! followed by `/start` requires.
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
    task::JoinHandle,
};
use tracing::info;

#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Request stop. Wakes every pending `wait`/`sleep`. Idempotent.
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    /// Re-arm after a stop, so a stopped daemon can be started again
    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is set
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // self holds a sender, the channel cannot close under us
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Interruptible sleep; returns true when cut short by the signal
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.wait() => true,
        }
    }
}

/// Supervisor task: map SIGINT/SIGTERM onto the stop signal. The handlers do
/// nothing but notify; everything else happens on this task.
pub fn spawn_signal_handler(stop: StopSignal) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, initiating clean shutdown"),
            _ = sigterm.recv() => info!("SIGTERM received, initiating clean shutdown"),
        }
        stop.set();
        Ok(())
    })
}
