use std::sync::Arc;

use anyhow::Context;

use codeb_control::executor::SshExecutor;
use codeb_control::{Core, CoreConfig};

pub mod check;
pub mod reconcile;
pub mod scan;
pub mod status;
pub mod team;
pub mod version;

/// Build the control plane from the environment; shared by every command.
pub(crate) fn init_core() -> anyhow::Result<Core> {
    let config = CoreConfig::from_env().context("Failed to load CODEB_* configuration")?;
    let executor = Arc::new(SshExecutor::new(&config));
    Core::new(config, executor).context("Failed to initialize the control plane")
}
