// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Routes and per-VRF longest-prefix-match tables.

use flow_info::{FlowData, FlowFlags, InterfaceId, NhId, ShortReason, VnId, VrfId};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use prefix_trie::PrefixMap;
use std::fmt::Debug;
use std::net::IpAddr;

/// What a matching route tells about the destination of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDirective {
    /// The destination is a local VM interface.
    Local { interface: InterfaceId },
    /// The destination is reached through a tunnel.
    Remote,
    /// The destination is behind a VLAN sub-interface of a local interface.
    Vlan { interface: InterfaceId, vlan: u16 },
    Multicast,
    Discard,
    /// The destination is the host itself.
    Receive,
}

impl RouteDirective {
    /// Fold the destination information of the route into `data`.
    pub fn apply(&self, data: &mut FlowData) {
        match *self {
            RouteDirective::Local { interface } | RouteDirective::Vlan { interface, .. } => {
                data.out_interface = Some(interface);
                if data.in_interface.is_some() {
                    data.flags |= FlowFlags::LOCAL_FLOW;
                }
            }
            RouteDirective::Remote | RouteDirective::Receive => {
                data.out_interface = None;
            }
            RouteDirective::Multicast => {
                data.out_interface = None;
                data.flags |= FlowFlags::MULTICAST;
            }
            RouteDirective::Discard => {
                data.out_interface = None;
                data.set_short(ShortReason::SubnetDiscard);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub vrf: VrfId,
    pub prefix: IpNet,
    pub vn: Option<VnId>,
    pub nh: NhId,
    pub directive: RouteDirective,
}

impl Route {
    #[must_use]
    pub fn new(
        vrf: VrfId,
        prefix: IpNet,
        vn: Option<VnId>,
        nh: NhId,
        directive: RouteDirective,
    ) -> Self {
        Self {
            vrf,
            prefix: prefix.trunc(),
            vn,
            nh,
            directive,
        }
    }
}

/// The routes of one VRF.
#[derive(Clone, Default)]
pub(crate) struct VrfRoutes {
    v4: PrefixMap<Ipv4Net, Route>,
    v6: PrefixMap<Ipv6Net, Route>,
}

impl Debug for VrfRoutes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VrfRoutes")
            .field("v4", &self.v4.len())
            .field("v6", &self.v6.len())
            .finish()
    }
}

impl VrfRoutes {
    pub(crate) fn insert(&mut self, route: Route) -> Option<Route> {
        match route.prefix {
            IpNet::V4(p) => self.v4.insert(p.trunc(), route),
            IpNet::V6(p) => self.v6.insert(p.trunc(), route),
        }
    }

    pub(crate) fn remove(&mut self, prefix: &IpNet) -> Option<Route> {
        match prefix {
            IpNet::V4(p) => self.v4.remove(&p.trunc()),
            IpNet::V6(p) => self.v6.remove(&p.trunc()),
        }
    }

    pub(crate) fn get(&self, prefix: &IpNet) -> Option<&Route> {
        match prefix {
            IpNet::V4(p) => self.v4.get(&p.trunc()),
            IpNet::V6(p) => self.v6.get(&p.trunc()),
        }
    }

    pub(crate) fn lookup(&self, addr: IpAddr) -> Option<&Route> {
        match addr {
            IpAddr::V4(a) => self.v4.get_lpm(&Ipv4Net::from(a)).map(|(_, r)| r),
            IpAddr::V6(a) => self.v6.get_lpm(&Ipv6Net::from(a)).map(|(_, r)| r),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }
}
