// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The reasons why a configuration may be rejected.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid number of shards: {0}. Must be a non-zero power of two.")]
    InvalidShardCount(usize),
    #[error("'{0}' must be non-zero")]
    ZeroValue(&'static str),
    #[error("Port range '{name}' is empty or inverted: {first}..={last}")]
    BadPortRange {
        name: &'static str,
        first: u16,
        last: u16,
    },
    #[error("Port ranges for link-local and fabric SNAT overlap")]
    OverlappingPortRanges,
    #[error("Failed to build configuration: {0}")]
    Builder(String),
    #[error("Failed to read configuration file: {0}")]
    Io(String),
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

pub type ConfigResult = Result<(), ConfigError>;
