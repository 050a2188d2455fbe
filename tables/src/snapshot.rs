// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Immutable view of all the tables, as seen by flow classification.

use ahash::RandomState;
use flow_info::{AclId, InterfaceId, NhId, SgId, VnId, VrfId};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::objects::{FloatingIp, Interface, LinkLocalService, NextHop, Vn, Vrf};
use crate::policy::{Acl, SecurityGroup};
use crate::route::{Route, VrfRoutes};

pub(crate) type Map<K, V> = HashMap<K, V, RandomState>;

#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    pub(crate) interfaces: Map<InterfaceId, Interface>,
    pub(crate) vrfs: Map<VrfId, Vrf>,
    pub(crate) vns: Map<VnId, Vn>,
    pub(crate) nexthops: Map<NhId, NextHop>,
    pub(crate) acls: Map<AclId, Acl>,
    pub(crate) sgs: Map<SgId, SecurityGroup>,
    pub(crate) routes: Map<VrfId, VrfRoutes>,
    pub(crate) linklocal: Vec<LinkLocalService>,
}

impl TableSnapshot {
    #[must_use]
    pub fn interface(&self, id: InterfaceId) -> Option<&Interface> {
        self.interfaces.get(&id)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.values()
    }

    #[must_use]
    pub fn vrf(&self, id: VrfId) -> Option<&Vrf> {
        self.vrfs.get(&id)
    }

    #[must_use]
    pub fn vn(&self, id: VnId) -> Option<&Vn> {
        self.vns.get(&id)
    }

    #[must_use]
    pub fn nexthop(&self, id: NhId) -> Option<&NextHop> {
        self.nexthops.get(&id)
    }

    #[must_use]
    pub fn acl(&self, id: AclId) -> Option<&Acl> {
        self.acls.get(&id)
    }

    #[must_use]
    pub fn sg(&self, id: SgId) -> Option<&SecurityGroup> {
        self.sgs.get(&id)
    }

    /// Longest-prefix-match route lookup.
    #[must_use]
    pub fn route_lookup(&self, vrf: VrfId, addr: IpAddr) -> Option<&Route> {
        self.routes.get(&vrf)?.lookup(addr)
    }

    /// Exact route lookup.
    #[must_use]
    pub fn route(&self, vrf: VrfId, prefix: &IpNet) -> Option<&Route> {
        self.routes.get(&vrf)?.get(prefix)
    }

    #[must_use]
    pub fn route_count(&self, vrf: VrfId) -> usize {
        self.routes.get(&vrf).map_or(0, VrfRoutes::len)
    }

    /// The link-local service exposed at `ip:port`. A service declared with a port is
    /// preferred over a service declared without one.
    #[must_use]
    pub fn linklocal_service(&self, ip: IpAddr, port: u16) -> Option<&LinkLocalService> {
        self.linklocal
            .iter()
            .find(|s| s.service_ip == ip && s.service_port == Some(port))
            .or_else(|| {
                self.linklocal
                    .iter()
                    .find(|s| s.service_ip == ip && s.service_port.is_none())
            })
    }

    /// The interface owning floating IP `addr` in `vrf`, if any.
    #[must_use]
    pub fn fip_owner(&self, vrf: VrfId, addr: IpAddr) -> Option<(&Interface, &FloatingIp)> {
        let mut owners: Vec<_> = self
            .interfaces
            .values()
            .filter(|i| !i.delete_marked)
            .filter_map(|i| {
                i.floating_ips
                    .iter()
                    .find(|f| f.vrf == vrf && f.addr == addr)
                    .map(|f| (i, f))
            })
            .collect();
        // deterministic regardless of map order
        owners.sort_by_key(|(i, _)| i.id);
        owners.into_iter().next()
    }

    /// The VM interface whose address is `ip` in `vrf`.
    #[must_use]
    pub fn interface_by_ip(&self, vrf: VrfId, ip: IpAddr) -> Option<&Interface> {
        self.interfaces
            .values()
            .filter(|i| i.vrf == vrf && i.ip == ip)
            .min_by_key(|i| i.id)
    }

    /// True if `vrf` is unknown or being deleted.
    #[must_use]
    pub fn vrf_unavailable(&self, vrf: VrfId) -> bool {
        self.vrf(vrf).is_none_or(|v| v.delete_marked)
    }
}
