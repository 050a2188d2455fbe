// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The flow processing engine.
//!
//! [`FlowEngine`] turns the first packet of a conversation into a pair of flow entries, keeps
//! them consistent with the tables they were computed from, ages them out and mirrors them into
//! the forwarding plane. Every operation is synchronous and driven by the caller;
//! [`EngineRuntime`] spawns the tasks that drive them on a tokio runtime.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod admin;
mod aging;
mod builder;
mod context;
mod errors;
mod metrics;
pub mod path_preference;
mod revaluation;
mod runtime;

#[cfg(test)]
mod fixture;

pub use admin::FlowSelector;
pub use aging::SweepReport;
pub use context::{EngineContext, FlowEngine};
pub use errors::EngineError;
pub use metrics::EngineMetrics;
pub use path_preference::{PathPreferenceModule, TrafficSeen};
pub use revaluation::{RevaluationOutcome, RevaluationQueue, RevaluationStats, Trigger};
pub use runtime::{EngineHandle, EngineRuntime};

use tracectl::trace_target;
trace_target!("flow-engine", LevelFilter::INFO, &["flow"]);
