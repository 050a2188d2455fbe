// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Interfaces, VRFs, VNs, next hops and link-local services.

use derive_builder::Builder;
use flow_info::{AclId, InterfaceId, NhId, SgId, VnId, VrfId};
use std::net::IpAddr;

/// Directions in which a floating IP translates traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FipDirection {
    #[default]
    Both,
    Ingress,
    Egress,
}

impl FipDirection {
    #[must_use]
    pub fn allows_egress(self) -> bool {
        matches!(self, FipDirection::Both | FipDirection::Egress)
    }
    #[must_use]
    pub fn allows_ingress(self) -> bool {
        matches!(self, FipDirection::Both | FipDirection::Ingress)
    }
}

/// A floating IP attached to an interface. The address lives in `vrf`, which belongs to `vn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingIp {
    pub addr: IpAddr,
    pub vrf: VrfId,
    pub vn: VnId,
    pub direction: FipDirection,
}

/// A VM interface.
#[derive(Builder, Debug, Clone, PartialEq, Eq)]
#[builder(setter(into))]
pub struct Interface {
    pub id: InterfaceId,
    pub vrf: VrfId,
    #[builder(default)]
    pub vn: Option<VnId>,
    pub ip: IpAddr,
    #[builder(default)]
    pub mac: [u8; 6],
    /// Next hop that packets from this interface are received on.
    pub nh: NhId,
    #[builder(default)]
    pub sgs: Vec<SgId>,
    #[builder(default)]
    pub floating_ips: Vec<FloatingIp>,
    #[builder(default = true)]
    pub policy_enabled: bool,
    #[builder(default)]
    pub delete_marked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vrf {
    pub id: VrfId,
    pub vn: Option<VnId>,
    pub delete_marked: bool,
}

impl Vrf {
    #[must_use]
    pub fn new(id: VrfId, vn: Option<VnId>) -> Self {
        Self {
            id,
            vn,
            delete_marked: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vn {
    pub id: VnId,
    pub acl: Option<AclId>,
    /// VM traffic towards the underlay is source-NATed to the host address.
    pub fabric_snat: bool,
    pub delete_marked: bool,
}

impl Vn {
    #[must_use]
    pub fn new(id: VnId) -> Self {
        Self {
            id,
            acl: None,
            fabric_snat: false,
            delete_marked: false,
        }
    }
    #[must_use]
    pub fn with_acl(mut self, acl: AclId) -> Self {
        self.acl = Some(acl);
        self
    }
    #[must_use]
    pub fn with_fabric_snat(mut self) -> Self {
        self.fabric_snat = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encap {
    MplsGre,
    MplsUdp,
    Vxlan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHop {
    Interface { interface: InterfaceId },
    Tunnel { dst: IpAddr, encap: Encap },
    /// Equal-cost members. Removed members leave a hole so that indexes stay stable.
    Composite { members: Vec<Option<NhId>> },
    Discard,
    Receive,
}

impl NextHop {
    #[must_use]
    pub fn is_composite(&self) -> bool {
        matches!(self, NextHop::Composite { .. })
    }
}

/// A service reachable from VMs at `service_ip[:service_port]`, provided on the fabric at
/// `fabric_ip:fabric_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLocalService {
    pub name: String,
    pub service_ip: IpAddr,
    pub service_port: Option<u16>,
    pub fabric_ip: IpAddr,
    pub fabric_port: u16,
}
