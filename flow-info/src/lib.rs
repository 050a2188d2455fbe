// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow model: the identity of a unidirectional flow, the verdict computed for it and the
//! mutable record kept by the flow table.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod data;
pub mod entry;
pub mod flags;
pub mod ids;
pub mod key;
pub mod policy;

pub use data::{DepKey, FlowData, NatInfo, NatKind, PacketInfo, PolicyInfo};
pub use entry::{FlowCounters, FlowEntry, FlowId, FlowStats, KSyncHandle};
pub use flags::{FlowAction, FlowFlags, ShortReason};
pub use ids::{AclId, InterfaceId, NhId, SgId, VnId, VrfId};
pub use key::FlowKey;
pub use policy::PolicyMatch;

use tracectl::trace_target;
trace_target!("flow-info", LevelFilter::INFO, &["flow"]);
