// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of tracing for the flow engine.
//!
//! Every module that logs declares a target with [`trace_target!`] (or [`custom_target!`] for
//! a target not named after the module path). Targets are collected at link time and exposed
//! through [`TracingControl`], which allows changing log levels by tag while running.
//! Metrics are registered through [`register`], so that every crate describes them alike.

pub mod control;
pub mod register;
pub mod targets;

pub use control::{TraceCtlError, TracingControl, get_trace_ctl};
pub use register::{MetricSpec, Register, register_counter, register_gauge};
pub use tracing::level_filters::LevelFilter;
