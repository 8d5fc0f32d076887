//! CLI command implementations.

pub mod apply;
pub mod disable;
pub mod status;
pub mod verify;

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

use crate::cmd_abstraction::RealCommandExecutor;
use crate::config::Config;
use crate::dns::SystemResolver;
use crate::enforcer::IptablesHandle;
use crate::fetcher::Fetcher;
use crate::hostnet::RouteTable;
use crate::pipeline::Pipeline;
use crate::policy::PolicySpec;
use crate::verify::HttpProber;

/// Load the config file, treating a missing file as "no configuration".
pub(crate) fn load_config(config_path: &Path) -> Result<Option<Config>> {
    Config::load(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))
}

/// Wire the production collaborators for one cycle.
pub(crate) fn build_pipeline(spec: &PolicySpec) -> Result<Pipeline<IptablesHandle>> {
    let prober = HttpProber::new(Duration::from_secs(spec.verify.timeout_secs))?;
    Ok(Pipeline::new(
        Box::new(SystemResolver::new()),
        Box::new(Fetcher::new(&spec.provider)?),
        Box::new(RouteTable::new(RealCommandExecutor::new())),
        Box::new(prober),
        IptablesHandle::new(),
    ))
}
