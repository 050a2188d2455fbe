// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

pub(crate) use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "vragent")]
#[command(version = "0.1")]
#[command(about = "Flow processing engine of a virtual router agent", long_about = None)]
pub(crate) struct CmdArgs {
    #[arg(long, value_name = "yaml file", help = "Engine configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "count",
        help = "Number of flow table shards, overriding the configuration file"
    )]
    shards: Option<usize>,

    #[arg(
        long,
        value_name = "seconds",
        help = "Idle time after which a flow pair is evicted, overriding the configuration file"
    )]
    flow_age_secs: Option<u64>,

    #[arg(
        long,
        default_value_t = false,
        help = "Show configurable tracing targets and exit"
    )]
    show_tracing_targets: bool,

    #[arg(
        long,
        value_name = "tracing configuration",
        help = "Tracing config string as comma-separated sequence of tag=level, with level one in [off,error,warn,info,debug,trace].
Passing default=level sets the default log-level.
Passing all=level allows setting the log-level of all targets to level.
E.g. default=error,all=info,flow-table=debug"
    )]
    tracing: Option<String>,
}

impl CmdArgs {
    pub fn config(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }
    pub fn shards(&self) -> Option<usize> {
        self.shards
    }
    pub fn flow_age_time(&self) -> Option<Duration> {
        self.flow_age_secs.map(Duration::from_secs)
    }
    pub fn show_tracing_targets(&self) -> bool {
        self.show_tracing_targets
    }
    pub fn tracing(&self) -> Option<&String> {
        self.tracing.as_ref()
    }
}
