pub mod cli;
pub mod commands;
pub mod config;
pub mod engine;
pub mod entity;
pub mod gateway;
pub mod habit;
pub mod identity;
pub mod mutation;
pub mod signal;
pub mod store;
pub mod tags;
pub mod ticket;
pub mod undo;

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

pub use engine::{Engine, EngineSettings};
pub use entity::{Entity, EntityId, EntityKind, Fields};
pub use gateway::RemoteGateway;

#[tracing::instrument(skip_all)]
pub fn run(raw_args: Vec<OsString>) -> anyhow::Result<()> {
    let pre = cli::preprocess_args(&raw_args)?;
    let cli = cli::GlobalCli::parse_from(pre.cleaned_args);
    cli::init_tracing(cli.verbose, cli.quiet)?;

    info!(verbose = cli.verbose, quiet = cli.quiet, "starting tally");
    debug!(?pre.rc_overrides, "positional rc overrides");

    let mut cfg = config::Config::load(cli.tallyrc.as_deref())?;
    cfg.apply_overrides(
        pre.rc_overrides
            .into_iter()
            .chain(cli.rc_overrides.into_iter().map(|kv| (kv.key, kv.value))),
    );

    let data_dir = config::resolve_data_dir(&cfg, cli.data.as_deref())
        .context("failed to resolve data directory")?;
    let settings = EngineSettings::from_config(&cfg)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let command = cli.command;
    runtime.block_on(async move {
        let gateway = gateway::FileGateway::open(&data_dir)
            .with_context(|| format!("failed to open data files at {}", data_dir.display()))?;
        let engine = Engine::new(Arc::new(gateway), settings);
        commands::dispatch(&engine, command).await
    })
}
