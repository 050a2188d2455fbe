// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Synchronization of flow entries with the forwarding plane flow table.
//!
//! The [`KSyncAdapter`] turns flow lifecycle events into install, update and remove
//! operations on a [`KSyncTransport`], keeps at most one operation in flight per flow and
//! folds the asynchronous completions back into the flow table.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod adapter;
mod errors;
#[cfg(any(test, feature = "testing"))]
mod sim;
mod transport;

pub use adapter::{AdapterCounters, KSyncAdapter};
pub use errors::KSyncError;
#[cfg(any(test, feature = "testing"))]
pub use sim::SimTransport;
pub use transport::{FlowRemoveRequest, FlowSyncRequest, KSyncCompletion, KSyncOp, KSyncTransport};

use tracectl::trace_target;
trace_target!("ksync", LevelFilter::INFO, &["flow"]);
