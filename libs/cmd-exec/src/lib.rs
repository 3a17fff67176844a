#![warn(
    missing_debug_implementations,
    // missing_docs, // we shall remove thee, someday!
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # cmd-exec
//!
//! `cmd-exec` defines the `CommandExecutor` trait, the single seam through
//! which every external binary (`ip`, `dhclient`, `nmap`, `xfreerdp`, `ssh`)
//! is invoked. Commands are always argv form, never a shell. The production
//! implementation is `SystemExecutor`; tests substitute mocks that record a
//! call log.
use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// Captured result of one external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    /// the synthetic output returned for every dry-run invocation
    pub fn dry_run() -> Self {
        Self {
            exit_code: 0,
            stdout: "dry-run".into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command `{argv}` exited {code}: {stderr}")]
    CommandFailed {
        argv: String,
        code: i32,
        stderr: String,
    },
    #[error("command `{argv}` timed out after {timeout:?}")]
    Timeout { argv: String, timeout: Duration },
    #[error("failed to spawn `{argv}`: {source}")]
    Spawn {
        argv: String,
        #[source]
        source: std::io::Error,
    },
}

/// Every privileged kernel mutation and every probe binary goes through this
/// trait so it can be mocked in tests and suppressed in dry-run.
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    /// Run `argv` with a hard timeout.
    ///
    /// `must_succeed = true` turns a non-zero exit into [`ExecError::CommandFailed`].
    /// With `must_succeed = false` a non-zero exit is returned as `Ok` for the
    /// caller to policy-decide (teardown steps legitimately fail). Timeouts
    /// and spawn failures are errors either way.
    async fn run(
        &self,
        argv: &[&str],
        timeout: Duration,
        must_succeed: bool,
    ) -> Result<CmdOutput, ExecError>;
}

/// Executor backed by `tokio::process`. In dry-run mode no process is
/// spawned; the call is logged and a synthetic success returned.
#[derive(Debug, Clone, Copy)]
pub struct SystemExecutor {
    dry_run: bool,
}

impl SystemExecutor {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }
}

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn run(
        &self,
        argv: &[&str],
        timeout: Duration,
        must_succeed: bool,
    ) -> Result<CmdOutput, ExecError> {
        let rendered = argv.join(" ");
        debug!(cmd = %rendered, "exec");
        if self.dry_run {
            info!(cmd = %rendered, "[dry-run]");
            return Ok(CmdOutput::dry_run());
        }

        let (program, args) = argv.split_first().expect("argv must be non-empty");
        let fut = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let out = match tokio::time::timeout(timeout, fut).await {
            Err(_) => {
                return Err(ExecError::Timeout {
                    argv: rendered,
                    timeout,
                });
            }
            Ok(Err(err)) => {
                return Err(ExecError::Spawn {
                    argv: rendered,
                    source: err,
                });
            }
            Ok(Ok(out)) => out,
        };

        // a signal-terminated child has no exit code
        let exit_code = out.status.code().unwrap_or(-1);
        let output = CmdOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        };
        if must_succeed && !output.success() {
            return Err(ExecError::CommandFailed {
                argv: rendered,
                code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}
