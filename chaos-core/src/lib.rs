//! # chaos-core
//!
//! The hopper engine: probe module contract, serial module runner, the VLAN
//! hopper state machine, and the ambient stack (stop signal + supervisor,
//! tracing setup with the SSE log ring, prometheus metrics, webhook
//! notifier). Probe modules live in `plugins/*`; the HTTP control plane in
//! `control-api`.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use anyhow;
pub use async_trait::async_trait;
pub use cmd_exec;
pub use tokio;
pub use tracing;

pub use crate::hopper::Hopper;

pub mod hopper;
pub mod metrics;
pub mod module;
pub mod notify;
pub mod prelude;
pub mod runner;
pub mod shutdown;
pub mod trace;
