// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Sharded store of flow entries.
//!
//! Entries live in per-shard arenas and are referred to by [`FlowId`](flow_info::FlowId).
//! Forward and reverse halves of a pair point to each other by id; operations touching both
//! halves lock the two shards in ascending order.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod counters;
mod display;
mod table;

pub use counters::VnFlowCounters;
pub use display::FlowRecord;
pub use table::{FlowTable, FlowTableError};

use tracectl::trace_target;
trace_target!("flow-table", LevelFilter::INFO, &["flow"]);
