// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Route, next-hop, interface and policy tables consumed by the flow engine.
//!
//! Classification only ever reads an immutable [`TableSnapshot`]. Mutations publish a new
//! snapshot and then notify subscribers with a [`DependencyChange`] so that the flows
//! depending on the changed object get revaluated.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_panics_doc, clippy::module_name_repetitions)]

pub mod objects;
pub mod policy;
pub mod route;
pub mod snapshot;
#[allow(clippy::module_inception)]
pub mod tables;

pub use objects::{
    Encap, FipDirection, FloatingIp, Interface, InterfaceBuilder, LinkLocalService, NextHop,
    Vn, Vrf,
};
pub use policy::{Acl, AclRule, AddrMatch, RuleAction, SecurityGroup, Verdict};
pub use route::{Route, RouteDirective};
pub use snapshot::TableSnapshot;
pub use tables::{DependencyChange, SubscriptionId, Tables};

use tracectl::trace_target;
trace_target!("tables", LevelFilter::INFO, &["flow"]);
