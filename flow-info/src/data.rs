// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The verdict computed for a flow: VN and VRF pair, policy, translation and action.

use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::debug;

use crate::flags::{FlowAction, FlowFlags, ShortReason};
use crate::ids::{AclId, InterfaceId, NhId, SgId, VnId, VrfId};
use crate::key::FlowKey;
use crate::policy::PolicyMatch;

/// Packet metadata handed over by the packet front end for the first packet of a flow.
///
/// A flow keeps the [`PacketInfo`] it was created from so that a revaluation recomputes its
/// verdict from the same input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    pub key: FlowKey,
    pub vrf: VrfId,
    /// `None` for packets received from the fabric.
    pub interface: Option<InterfaceId>,
    pub vn: Option<VnId>,
    pub sg_list: Vec<SgId>,
}

impl PacketInfo {
    #[must_use]
    pub fn new(key: FlowKey, vrf: VrfId) -> Self {
        Self {
            key,
            vrf,
            interface: None,
            vn: None,
            sg_list: vec![],
        }
    }
    #[must_use]
    pub fn with_interface(mut self, interface: InterfaceId) -> Self {
        self.interface = Some(interface);
        self
    }
    #[must_use]
    pub fn with_vn(mut self, vn: VnId) -> Self {
        self.vn = Some(vn);
        self
    }
    #[must_use]
    pub fn with_sgs(mut self, sgs: &[SgId]) -> Self {
        self.sg_list = sgs.to_vec();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatKind {
    /// Translation to or from a floating IP owned by a local interface.
    FloatingIp { fip: IpAddr, vrf: VrfId },
    /// Access from a VM to a link-local service exposed on the fabric.
    LinkLocal,
    /// Source NAT of VM traffic leaving to the underlay.
    Fabric,
}

/// Post-translation tuple of a flow. A port of `None` is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatInfo {
    pub kind: NatKind,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl NatInfo {
    /// The tuple of `key` once translated.
    #[must_use]
    pub fn translated(&self, key: &FlowKey) -> (IpAddr, IpAddr, u16, u16) {
        (
            self.src,
            self.dst,
            self.src_port.unwrap_or(key.src_port),
            self.dst_port.unwrap_or(key.dst_port),
        )
    }

    #[must_use]
    pub fn is_snat(&self, key: &FlowKey) -> bool {
        self.src != key.src || self.src_port.is_some_and(|p| p != key.src_port)
    }

    #[must_use]
    pub fn is_dnat(&self, key: &FlowKey) -> bool {
        self.dst != key.dst || self.dst_port.is_some_and(|p| p != key.dst_port)
    }
}

/// Matched rules for a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyInfo {
    /// Network policy of the source VN.
    pub acl: PolicyMatch,
    /// Network policy of the destination VN, when it differs from the source VN.
    pub out_acl: PolicyMatch,
    pub sg: PolicyMatch,
}

/// An object whose changes must trigger the revaluation of the flows depending on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepKey {
    Route { vrf: VrfId, prefix: IpNet },
    NextHop(NhId),
    Acl(AclId),
    Sg(SgId),
    Interface(InterfaceId),
    Vrf(VrfId),
    Vn(VnId),
    /// Link-local service address a VM flow is sent to.
    LinkLocal(IpAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowData {
    pub origin: PacketInfo,
    pub src_vn: Option<VnId>,
    pub dst_vn: Option<VnId>,
    pub src_vrf: VrfId,
    pub dst_vrf: VrfId,
    pub in_interface: Option<InterfaceId>,
    pub out_interface: Option<InterfaceId>,
    /// Next hop the reverse direction is received on.
    pub reverse_nh: Option<NhId>,
    pub policy: PolicyInfo,
    pub nat: Option<NatInfo>,
    /// Member of the composite next hop the flow is pinned to.
    pub ecmp_index: Option<u16>,
    pub action: FlowAction,
    pub vrf_translate: Option<VrfId>,
    /// Computed flags. Lifecycle flags live in the entry.
    pub flags: FlowFlags,
    pub short_reason: Option<ShortReason>,
    pub deps: BTreeSet<DepKey>,
}

impl FlowData {
    #[must_use]
    pub fn new(origin: PacketInfo) -> Self {
        let vrf = origin.vrf;
        Self {
            src_vn: origin.vn,
            in_interface: origin.interface,
            origin,
            dst_vn: None,
            src_vrf: vrf,
            dst_vrf: vrf,
            out_interface: None,
            reverse_nh: None,
            policy: PolicyInfo::default(),
            nat: None,
            ecmp_index: None,
            action: FlowAction::PASS,
            vrf_translate: None,
            flags: FlowFlags::empty(),
            short_reason: None,
            deps: BTreeSet::new(),
        }
    }

    /// Force the flow to drop, for `reason`. The first reason set is kept.
    pub fn set_short(&mut self, reason: ShortReason) {
        if self.short_reason.is_none() {
            debug!("Short flow {}: {reason}", self.origin.key);
            self.short_reason = Some(reason);
        }
        self.flags |= FlowFlags::SHORT_FLOW;
        self.action = FlowAction::DROP;
    }

    #[must_use]
    pub fn is_short(&self) -> bool {
        self.flags.contains(FlowFlags::SHORT_FLOW)
    }

    #[must_use]
    pub fn is_drop(&self) -> bool {
        self.action.contains(FlowAction::DROP)
    }

    pub fn add_dep(&mut self, dep: DepKey) {
        self.deps.insert(dep);
    }
}
