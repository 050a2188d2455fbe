// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Configuration model for the flow engine. An [`EngineConfig`] is built either
//! programmatically through [`EngineConfigBuilder`] or loaded from a YAML file; both paths
//! go through the same validation.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]

pub mod engine;
pub mod errors;

pub use engine::{EngineConfig, EngineConfigBuilder, PortRange}; // re-export
pub use errors::{ConfigError, ConfigResult}; // re-export

use tracectl::trace_target;
trace_target!("config", LevelFilter::INFO, &["flow"]);
