// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use flow_info::{
    FlowAction, FlowEntry, FlowFlags, FlowId, FlowKey, KSyncHandle, NatInfo, PolicyInfo,
    ShortReason, VnId, VrfId,
};
use std::fmt::Display;
use std::time::{Duration, Instant};

/// Read-only projection of a flow entry, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRecord {
    pub id: FlowId,
    pub key: FlowKey,
    pub reverse: Option<FlowId>,
    pub src_vn: Option<VnId>,
    pub dst_vn: Option<VnId>,
    pub src_vrf: VrfId,
    pub dst_vrf: VrfId,
    pub action: FlowAction,
    pub nat: Option<NatInfo>,
    pub flags: FlowFlags,
    pub short_reason: Option<ShortReason>,
    pub handle: Option<KSyncHandle>,
    pub policy: PolicyInfo,
    pub age: Duration,
}

impl FlowRecord {
    #[must_use]
    pub fn new(entry: &FlowEntry, now: Instant) -> Self {
        let data = entry.data();
        Self {
            id: entry.id(),
            key: *entry.key(),
            reverse: entry.reverse(),
            src_vn: data.src_vn,
            dst_vn: data.dst_vn,
            src_vrf: data.src_vrf,
            dst_vrf: data.dst_vrf,
            action: entry.action(),
            nat: data.nat,
            flags: entry.flags(),
            short_reason: entry.short_reason(),
            handle: entry.handle(),
            policy: data.policy,
            age: now.saturating_duration_since(entry.created_at()),
        }
    }
}

fn opt<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

impl Display for FlowRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} VNs({}->{}) VRFs({}->{}) action: {} flags: {}",
            self.id,
            self.key,
            opt(self.src_vn),
            opt(self.dst_vn),
            self.src_vrf,
            self.dst_vrf,
            self.action,
            self.flags,
        )?;
        if let Some(nat) = &self.nat {
            write!(f, " nat: ({}, {})", nat.src, nat.dst)?;
            if nat.src_port.is_some() || nat.dst_port.is_some() {
                write!(f, " ports: ({}, {})", opt(nat.src_port), opt(nat.dst_port))?;
            }
        }
        if let Some(reason) = self.short_reason {
            write!(f, " short: {reason}")?;
        }
        write!(
            f,
            " reverse: {} handle: {} acl: {} sg: {} age: {}s",
            opt(self.reverse),
            opt(self.handle),
            self.policy.acl,
            self.policy.sg,
            self.age.as_secs()
        )
    }
}
