// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Address and port translation for flows, and selection of a member of composite next hops.
//!
//! The [`Resolver`] decides, for the first packet of a flow, in this order of priority:
//!
//! - floating IP translation (egress SNAT or ingress DNAT),
//! - link-local service translation,
//! - gateway translation of VM traffic leaving to the underlay,
//! - plain forwarding without translation.
//!
//! The reverse half of a pair is never resolved on its own: [`reverse_key`] and [`mirror_nat`]
//! derive it from the forward decision.

mod ecmp;
mod errors;
mod ports;
mod resolver;
mod reverse;

pub use ecmp::select_member;
pub use errors::ResolveError;
pub use ports::PortPool;
pub use resolver::Resolver;
pub use reverse::{mirror_nat, reverse_data, reverse_key};

use tracectl::trace_target;
trace_target!("nat", LevelFilter::INFO, &["flow"]);
