// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Compiled network policies (ACLs) and security groups, as stored in the tables.

use etherparse::IpNumber;
use flow_info::{AclId, SgId, VnId, VrfId};
use ipnet::IpNet;
use std::ops::RangeInclusive;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrMatch {
    Any,
    /// Any address whose route belongs to the VN.
    Vn(VnId),
    /// `subnet` is tried first, then `subnet_list` in order.
    Cidr {
        subnet: Option<IpNet>,
        subnet_list: Vec<IpNet>,
    },
}

impl AddrMatch {
    #[must_use]
    pub fn subnet(net: IpNet) -> Self {
        AddrMatch::Cidr {
            subnet: Some(net),
            subnet_list: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleAction {
    pub verdict: Verdict,
    pub log: bool,
    pub alert: bool,
    pub vrf_translate: Option<VrfId>,
}

impl RuleAction {
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            verdict: Verdict::Pass,
            log: false,
            alert: false,
            vrf_translate: None,
        }
    }
    #[must_use]
    pub const fn deny() -> Self {
        Self {
            verdict: Verdict::Deny,
            log: false,
            alert: false,
            vrf_translate: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRule {
    pub uuid: Uuid,
    pub proto: Option<IpNumber>,
    pub src: AddrMatch,
    pub dst: AddrMatch,
    pub src_ports: RangeInclusive<u16>,
    pub dst_ports: RangeInclusive<u16>,
    pub action: RuleAction,
}

impl AclRule {
    /// A rule matching any traffic.
    #[must_use]
    pub fn any(uuid: Uuid, action: RuleAction) -> Self {
        Self {
            uuid,
            proto: None,
            src: AddrMatch::Any,
            dst: AddrMatch::Any,
            src_ports: 0..=u16::MAX,
            dst_ports: 0..=u16::MAX,
            action,
        }
    }
    #[must_use]
    pub fn with_proto(mut self, proto: IpNumber) -> Self {
        self.proto = Some(proto);
        self
    }
    #[must_use]
    pub fn with_src(mut self, src: AddrMatch) -> Self {
        self.src = src;
        self
    }
    #[must_use]
    pub fn with_dst(mut self, dst: AddrMatch) -> Self {
        self.dst = dst;
        self
    }
    #[must_use]
    pub fn with_dst_ports(mut self, ports: RangeInclusive<u16>) -> Self {
        self.dst_ports = ports;
        self
    }
}

/// An ordered rule list. When no rule matches, `default_allow` decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    pub id: AclId,
    pub rules: Vec<AclRule>,
    pub default_allow: bool,
}

/// Directional rules attached to endpoints. Only passing rules are meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub id: SgId,
    pub egress: Vec<AclRule>,
    pub ingress: Vec<AclRule>,
}
