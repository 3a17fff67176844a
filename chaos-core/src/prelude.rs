//! chaos-bot prelude

pub use crate::{
    anyhow::{self, Context, Result},
    async_trait,
    module::{Binding, BoundSource, ModuleReport, Probe, ProbeStatus},
    shutdown::StopSignal,
    tracing::{self, debug, error, info, instrument, trace, warn},
};
pub use cmd_exec::{CmdOutput, CommandExecutor, ExecError};
pub use config::SharedConfig;

pub use std::{io, sync::Arc};
