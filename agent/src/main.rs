// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]

mod args;

use crate::args::{CmdArgs, Parser};

use config::{ConfigError, EngineConfig};
use flow_engine::{EngineContext, EngineError, EngineRuntime, FlowEngine};
use ksync::SimTransport;
use std::sync::Arc;
use tables::Tables;
use tracectl::{TraceCtlError, custom_target, get_trace_ctl, trace_target};
use tracing::{error, info, level_filters::LevelFilter};

trace_target!("vragent", LevelFilter::INFO, &[]);

#[derive(Debug, thiserror::Error)]
enum AgentError {
    #[error("Invalid tracing configuration: {0}")]
    Tracing(#[from] TraceCtlError),
    #[error("Bad configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Failed to build the runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("Failed to set the signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

fn init_logging() {
    let tctl = get_trace_ctl();
    tctl.set_default_level(LevelFilter::INFO);
    custom_target!("tokio", LevelFilter::ERROR, &[]);
}

/// Engine configuration: the configuration file if any, with the command line overrides.
fn load_config(args: &CmdArgs) -> Result<EngineConfig, ConfigError> {
    let mut config = match args.config() {
        Some(path) => EngineConfig::from_yaml_file(path)?,
        None => EngineConfig::builder().build()?,
    };
    if let Some(shards) = args.shards() {
        config.shards = shards;
    }
    if let Some(age) = args.flow_age_time() {
        config.flow_age_time = age;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &CmdArgs) -> Result<(), AgentError> {
    let config = load_config(args)?;
    info!("Starting flow engine...\n{config}");

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .thread_name("vragent")
        .build()?;

    runtime.block_on(async move {
        // loopback forwarding plane
        let (transport, completions) = SimTransport::new();
        let ctx = EngineContext::new(config, Arc::new(Tables::new()), transport);
        let engine = Arc::new(FlowEngine::new(&ctx)?);
        let engine_rt = EngineRuntime::start(engine, completions);

        let _ = tokio::task::spawn_blocking(move || stop_rx.recv()).await;
        info!("Shutting down flow engine");
        engine_rt.shutdown().await;
        Ok::<(), AgentError>(())
    })
}

fn main() {
    let args = CmdArgs::parse();
    init_logging();
    if let Some(tracing) = args.tracing()
        && let Err(e) = get_trace_ctl().setup_from_string(tracing)
    {
        error!("{}", AgentError::from(e));
        std::process::exit(2);
    }
    if args.show_tracing_targets() {
        get_trace_ctl().dump();
        std::process::exit(0);
    }

    if let Err(e) = run(&args) {
        error!("{e}");
        std::process::exit(1);
    }
    info!("Flow engine stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn command_line_overrides_the_defaults() {
        let args = CmdArgs::try_parse_from(["vragent", "--shards", "8", "--flow-age-secs", "60"])
            .unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.shards, 8);
        assert_eq!(config.flow_age_time, Duration::from_secs(60));
    }

    #[test]
    fn invalid_override_is_a_configuration_error() {
        let args = CmdArgs::try_parse_from(["vragent", "--shards", "3"]).unwrap();
        assert!(load_config(&args).is_err());
        let args = CmdArgs::try_parse_from(["vragent", "--flow-age-secs", "0"]).unwrap();
        assert!(load_config(&args).is_err());
    }
}
