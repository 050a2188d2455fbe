// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Forwarding and translation decision for the forward half of a pair.

use config::EngineConfig;
use flow_info::{DepKey, FlowData, FlowFlags, FlowKey, NatInfo, NatKind, VrfId};
use parking_lot::Mutex;
use std::net::IpAddr;
use tables::{FloatingIp, Interface, NextHop, Route, TableSnapshot};
use tracing::debug;

use crate::ecmp::select_member;
use crate::errors::ResolveError;
use crate::ports::PortPool;

/// Resolves routes, translation and ECMP member of flows.
///
/// The resolver only holds the SNAT port pools, shared by all shards; everything else comes
/// from the table snapshot it is given.
#[derive(Debug)]
pub struct Resolver {
    vhost_ip: IpAddr,
    fabric_vrf: VrfId,
    linklocal_ports: Mutex<PortPool>,
    fabric_ports: Mutex<PortPool>,
}

impl Resolver {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            vhost_ip: config.vhost_ip,
            fabric_vrf: VrfId(config.fabric_vrf),
            linklocal_ports: Mutex::new(PortPool::new("link-local", config.linklocal_ports)),
            fabric_ports: Mutex::new(PortPool::new("fabric-snat", config.fabric_snat_ports)),
        }
    }

    #[must_use]
    pub fn fabric_vrf(&self) -> VrfId {
        self.fabric_vrf
    }

    fn pool(&self, kind: NatKind) -> Option<&Mutex<PortPool>> {
        match kind {
            NatKind::LinkLocal => Some(&self.linklocal_ports),
            NatKind::Fabric => Some(&self.fabric_ports),
            NatKind::FloatingIp { .. } => None,
        }
    }

    /// Source port for a translation of `kind`. The port of the previous verdict is kept when it
    /// was obtained for the same kind of translation.
    fn snat_port(
        &self,
        kind: NatKind,
        key: &FlowKey,
        previous: Option<&FlowData>,
    ) -> Result<Option<u16>, ResolveError> {
        let Some(pool) = self.pool(kind) else {
            return Ok(None);
        };
        let mut pool = pool.lock();
        if let Some(prev) = previous.and_then(|p| p.nat)
            && prev.kind == kind
            && let Some(port) = prev.src_port
            && pool.is_allocated(key.proto, port)
        {
            return Ok(Some(port));
        }
        pool.allocate(key.proto)
            .map(Some)
            .ok_or(ResolveError::PortsExhausted(pool.name()))
    }

    /// Give back the port held by a translation.
    pub fn release(&self, key: &FlowKey, nat: &NatInfo) {
        if let Some(pool) = self.pool(nat.kind)
            && let Some(port) = nat.src_port
        {
            pool.lock().release(key.proto, port);
        }
    }

    /// Give back the port of `old` if the new verdict no longer uses it.
    pub fn release_replaced(&self, key: &FlowKey, old: Option<&NatInfo>, new: Option<&NatInfo>) {
        let Some(old) = old else {
            return;
        };
        let kept = new.is_some_and(|new| new.kind == old.kind && new.src_port == old.src_port);
        if !kept {
            self.release(key, old);
        }
    }

    #[must_use]
    pub fn ports_in_use(&self, kind: NatKind, proto: etherparse::IpNumber) -> u64 {
        self.pool(kind).map_or(0, |p| p.lock().in_use(proto))
    }

    /// The egress floating IP of `interface` to use towards the destination of `key`, if any.
    ///
    /// The floating IP whose VRF has the most specific route wins, ties going to the first
    /// declared. It is only used if that route is more specific than the route of the
    /// interface VRF.
    fn egress_fip<'a>(
        snapshot: &'a TableSnapshot,
        interface: &'a Interface,
        key: &FlowKey,
    ) -> Option<(&'a FloatingIp, &'a Route)> {
        let mut best: Option<(&FloatingIp, &Route)> = None;
        for fip in interface
            .floating_ips
            .iter()
            .filter(|f| f.direction.allows_egress())
        {
            if let Some(route) = snapshot.route_lookup(fip.vrf, key.dst)
                && best.is_none_or(|(_, b)| route.prefix.prefix_len() > b.prefix.prefix_len())
            {
                best = Some((fip, route));
            }
        }
        let (fip, route) = best?;
        let own = snapshot.route_lookup(interface.vrf, key.dst);
        if own.is_some_and(|own| own.prefix.prefix_len() >= route.prefix.prefix_len()) {
            return None;
        }
        Some((fip, route))
    }

    /// Resolve the forward flow described by `data.origin` into `data`: VN and VRF pair,
    /// translation, destination and ECMP member. `previous` is the current verdict of the flow
    /// when revaluating it, so that SNAT ports and the ECMP member stay stable.
    ///
    /// # Errors
    ///
    /// Returns the reason why the flow cannot be forwarded; `data` then holds what could be
    /// resolved, including any translation whose port must be released with the flow.
    pub fn resolve(
        &self,
        snapshot: &TableSnapshot,
        data: &mut FlowData,
        previous: Option<&FlowData>,
    ) -> Result<(), ResolveError> {
        let key = data.origin.key;
        let vrf = data.origin.vrf;
        data.add_dep(DepKey::Vrf(vrf));
        if snapshot.vrf_unavailable(vrf) {
            return Err(ResolveError::UnavailableInterface);
        }
        let src_iface = match data.origin.interface {
            Some(id) => {
                data.add_dep(DepKey::Interface(id));
                let iface = snapshot
                    .interface(id)
                    .filter(|i| !i.delete_marked)
                    .ok_or(ResolveError::UnavailableInterface)?;
                data.flags |= FlowFlags::INGRESS_FLOW;
                Some(iface)
            }
            None => None,
        };
        let src_route = snapshot.route_lookup(vrf, key.src);
        if let Some(route) = src_route {
            data.add_dep(DepKey::Route {
                vrf: route.vrf,
                prefix: route.prefix,
            });
        }
        data.src_vn = src_iface
            .and_then(|i| i.vn)
            .or(data.origin.vn)
            .or_else(|| src_route.and_then(|r| r.vn));
        if src_iface.is_none() && src_route.is_none() {
            return Err(ResolveError::NoSrcRoute);
        }

        if key.is_multicast() {
            data.flags |= FlowFlags::MULTICAST;
            data.dst_vn = data.src_vn;
            return Ok(());
        }

        // floating IP, egress
        if let Some(iface) = src_iface
            && let Some((fip, route)) = Self::egress_fip(snapshot, iface, &key)
        {
            debug!("{key}: source NAT to floating IP {}", fip.addr);
            data.nat = Some(NatInfo {
                kind: NatKind::FloatingIp {
                    fip: fip.addr,
                    vrf: fip.vrf,
                },
                src: fip.addr,
                dst: key.dst,
                src_port: None,
                dst_port: None,
            });
            data.src_vn = Some(fip.vn);
            data.dst_vrf = fip.vrf;
            data.flags |= FlowFlags::NAT_FLOW;
            return self.finish(snapshot, data, &key, route, previous);
        }

        // floating IP, ingress
        if let Some((owner, fip)) = snapshot
            .fip_owner(vrf, key.dst)
            .filter(|(_, f)| f.direction.allows_ingress())
        {
            debug!("{key}: destination NAT from floating IP {} to {}", fip.addr, owner.ip);
            data.nat = Some(NatInfo {
                kind: NatKind::FloatingIp {
                    fip: fip.addr,
                    vrf: fip.vrf,
                },
                src: key.src,
                dst: owner.ip,
                src_port: None,
                dst_port: None,
            });
            data.dst_vrf = owner.vrf;
            data.flags |= FlowFlags::NAT_FLOW;
            let route = snapshot
                .route_lookup(owner.vrf, owner.ip)
                .ok_or(ResolveError::NoDstRoute)?;
            return self.finish(snapshot, data, &key, route, previous);
        }

        // link-local service
        let service = src_iface.and(snapshot.linklocal_service(key.dst, key.dst_port));
        if src_iface.is_some() && (service.is_some() || is_link_local(key.dst)) {
            data.add_dep(DepKey::LinkLocal(key.dst));
        }
        if let Some(service) = service {
            let route = snapshot
                .route_lookup(self.fabric_vrf, service.fabric_ip)
                .ok_or(ResolveError::NoDstRoute)?;
            let port = self.snat_port(NatKind::LinkLocal, &key, previous)?;
            debug!("{key}: link-local service {} via port {port:?}", service.name);
            data.nat = Some(NatInfo {
                kind: NatKind::LinkLocal,
                src: self.vhost_ip,
                dst: service.fabric_ip,
                src_port: port,
                dst_port: service.service_port.map(|_| service.fabric_port),
            });
            data.dst_vrf = self.fabric_vrf;
            data.flags |= FlowFlags::NAT_FLOW | FlowFlags::LINK_LOCAL | FlowFlags::FABRIC_FLOW;
            return self.finish(snapshot, data, &key, route, previous);
        }

        if let Some(route) = snapshot.route_lookup(vrf, key.dst) {
            return self.finish(snapshot, data, &key, route, previous);
        }

        // gateway to the underlay
        let fabric_snat = data
            .src_vn
            .and_then(|vn| snapshot.vn(vn))
            .is_some_and(|vn| vn.fabric_snat);
        if src_iface.is_some()
            && fabric_snat
            && let Some(route) = snapshot.route_lookup(self.fabric_vrf, key.dst)
        {
            let port = self.snat_port(NatKind::Fabric, &key, previous)?;
            debug!("{key}: fabric source NAT via port {port:?}");
            data.nat = Some(NatInfo {
                kind: NatKind::Fabric,
                src: self.vhost_ip,
                dst: key.dst,
                src_port: port,
                dst_port: None,
            });
            data.dst_vrf = self.fabric_vrf;
            data.flags |= FlowFlags::NAT_FLOW | FlowFlags::FABRIC_FLOW;
            return self.finish(snapshot, data, &key, route, previous);
        }
        Err(ResolveError::NoDstRoute)
    }

    fn finish(
        &self,
        snapshot: &TableSnapshot,
        data: &mut FlowData,
        key: &FlowKey,
        route: &Route,
        previous: Option<&FlowData>,
    ) -> Result<(), ResolveError> {
        data.add_dep(DepKey::Route {
            vrf: route.vrf,
            prefix: route.prefix,
        });
        data.add_dep(DepKey::NextHop(route.nh));
        if route.vrf == self.fabric_vrf && route.vrf != data.src_vrf {
            data.flags |= FlowFlags::FABRIC_FLOW;
        }
        data.dst_vn = route.vn;
        if let Some(NextHop::Composite { members }) = snapshot.nexthop(route.nh) {
            let prev = previous.and_then(|p| p.ecmp_index);
            let (index, member) =
                select_member(members, key, prev).ok_or(ResolveError::NoDstRoute)?;
            data.ecmp_index = Some(index);
            data.reverse_nh = Some(member);
            data.flags |= FlowFlags::ECMP_FLOW;
            data.add_dep(DepKey::NextHop(member));
        } else {
            data.reverse_nh = Some(route.nh);
        }
        route.directive.apply(data);
        if let Some(out) = data.out_interface {
            data.add_dep(DepKey::Interface(out));
            if snapshot.interface(out).is_none_or(|i| i.delete_marked) {
                return Err(ResolveError::UnavailableInterface);
            }
        }
        if snapshot.vrf_unavailable(data.dst_vrf) {
            return Err(ResolveError::UnavailableInterface);
        }
        Ok(())
    }
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::PortRange;
    use etherparse::IpNumber;
    use flow_info::{InterfaceId, NhId, PacketInfo, ShortReason, VnId};
    use ipnet::IpNet;
    use pretty_assertions::assert_eq;
    use tables::{
        FipDirection, InterfaceBuilder, LinkLocalService, RouteDirective, Tables, Vn, Vrf,
    };
    use tracing_test::traced_test;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }
    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    const VM_VRF: VrfId = VrfId(1);
    const FIP_VRF: VrfId = VrfId(2);
    const FABRIC: VrfId = VrfId(0);

    fn local_route(vrf: VrfId, prefix: &str, vn: u32, iface: u32) -> Route {
        Route::new(
            vrf,
            net(prefix),
            Some(VnId(vn)),
            NhId(100 + iface),
            RouteDirective::Local {
                interface: InterfaceId(iface),
            },
        )
    }

    /// vm1 1.1.1.1 (vn1, vrf1), vm2 1.1.1.2 (vn1, vrf1), vm5 2.2.2.5 (vn2, vrf2),
    /// a fabric VRF with a default route.
    fn setup() -> Tables {
        let tables = Tables::new();
        for vrf in [FABRIC, VM_VRF, FIP_VRF] {
            tables.upsert_vrf(Vrf::new(vrf, None));
        }
        tables.upsert_vn(Vn::new(VnId(1)));
        tables.upsert_vn(Vn::new(VnId(2)));
        for (id, addr, vrf, vn) in [
            (1, "1.1.1.1", VM_VRF, 1),
            (2, "1.1.1.2", VM_VRF, 1),
            (5, "2.2.2.5", FIP_VRF, 2),
        ] {
            tables.upsert_interface(
                InterfaceBuilder::default()
                    .id(InterfaceId(id))
                    .vrf(vrf)
                    .vn(VnId(vn))
                    .ip(ip(addr))
                    .nh(NhId(100 + id))
                    .build()
                    .unwrap(),
            );
            tables.add_route(local_route(vrf, &format!("{addr}/32"), vn, id));
        }
        tables.upsert_nexthop(
            NhId(50),
            NextHop::Tunnel {
                dst: ip("192.168.1.2"),
                encap: tables::Encap::MplsGre,
            },
        );
        tables.add_route(Route::new(
            FABRIC,
            net("0.0.0.0/0"),
            None,
            NhId(50),
            RouteDirective::Remote,
        ));
        tables
    }

    fn resolver() -> Resolver {
        let config = EngineConfig::builder()
            .fabric_vrf(0)
            .linklocal_ports(PortRange::new(40000, 40001))
            .build()
            .unwrap();
        Resolver::new(&config)
    }

    fn from_vm(key: FlowKey, iface: u32) -> FlowData {
        let vrf = if iface == 5 { FIP_VRF } else { VM_VRF };
        FlowData::new(PacketInfo::new(key, vrf).with_interface(InterfaceId(iface)))
    }

    #[test]
    fn plain_local_flow() {
        let tables = setup();
        let snap = tables.snapshot();
        let key = FlowKey::tcp(NhId(101), ip("1.1.1.1"), ip("1.1.1.2"), 1000, 80);
        let mut data = from_vm(key, 1);
        resolver().resolve(&snap, &mut data, None).unwrap();
        assert_eq!(data.src_vn, Some(VnId(1)));
        assert_eq!(data.dst_vn, Some(VnId(1)));
        assert_eq!(data.out_interface, Some(InterfaceId(2)));
        assert_eq!(data.reverse_nh, Some(NhId(102)));
        assert!(data.nat.is_none());
        assert!(data.flags.contains(FlowFlags::LOCAL_FLOW | FlowFlags::INGRESS_FLOW));
        assert!(data.deps.contains(&DepKey::Route {
            vrf: VM_VRF,
            prefix: net("1.1.1.2/32")
        }));
    }

    #[test]
    fn floating_ip_egress_and_ingress() {
        let tables = setup();
        let mut vm1 = tables.snapshot().interface(InterfaceId(1)).unwrap().clone();
        vm1.floating_ips = vec![FloatingIp {
            addr: ip("14.1.1.100"),
            vrf: FIP_VRF,
            vn: VnId(2),
            direction: FipDirection::Both,
        }];
        tables.upsert_interface(vm1);
        tables.add_route(local_route(FIP_VRF, "14.1.1.100/32", 2, 1));
        let snap = tables.snapshot();
        let resolver = resolver();

        let key = FlowKey::icmp(NhId(101), ip("1.1.1.1"), ip("2.2.2.5"), 1000);
        let mut data = from_vm(key, 1);
        resolver.resolve(&snap, &mut data, None).unwrap();
        let nat = data.nat.unwrap();
        assert_eq!(nat.src, ip("14.1.1.100"));
        assert_eq!(nat.dst, ip("2.2.2.5"));
        assert_eq!(data.src_vn, Some(VnId(2)));
        assert_eq!(data.dst_vrf, FIP_VRF);
        assert_eq!(data.out_interface, Some(InterfaceId(5)));

        // vm5 initiating towards the floating IP
        let key = FlowKey::icmp(NhId(105), ip("2.2.2.5"), ip("14.1.1.100"), 7);
        let mut data = from_vm(key, 5);
        resolver.resolve(&snap, &mut data, None).unwrap();
        let nat = data.nat.unwrap();
        assert_eq!(nat.dst, ip("1.1.1.1"));
        assert_eq!(data.dst_vrf, VM_VRF);
        assert_eq!(data.out_interface, Some(InterfaceId(1)));
    }

    #[test]
    fn egress_only_fip_does_not_dnat() {
        let tables = setup();
        let mut vm1 = tables.snapshot().interface(InterfaceId(1)).unwrap().clone();
        vm1.floating_ips = vec![FloatingIp {
            addr: ip("14.1.1.100"),
            vrf: FIP_VRF,
            vn: VnId(2),
            direction: FipDirection::Egress,
        }];
        tables.upsert_interface(vm1);
        let snap = tables.snapshot();
        let key = FlowKey::icmp(NhId(105), ip("2.2.2.5"), ip("14.1.1.100"), 7);
        let mut data = from_vm(key, 5);
        let err = resolver().resolve(&snap, &mut data, None).unwrap_err();
        assert_eq!(err, ResolveError::NoDstRoute);
    }

    #[test]
    #[traced_test]
    fn linklocal_port_reuse_and_exhaustion() {
        let tables = setup();
        tables.add_linklocal_service(LinkLocalService {
            name: "metadata".to_string(),
            service_ip: ip("169.254.169.254"),
            service_port: Some(80),
            fabric_ip: ip("192.168.0.10"),
            fabric_port: 8775,
        });
        tables.add_linklocal_service(LinkLocalService {
            name: "dns".to_string(),
            service_ip: ip("169.254.0.53"),
            service_port: None,
            fabric_ip: ip("192.168.0.53"),
            fabric_port: 0,
        });
        let snap = tables.snapshot();
        let resolver = resolver();

        let key = FlowKey::tcp(NhId(101), ip("1.1.1.1"), ip("169.254.169.254"), 1000, 80);
        let mut data = from_vm(key, 1);
        resolver.resolve(&snap, &mut data, None).unwrap();
        let nat = data.nat.unwrap();
        assert_eq!(nat.kind, NatKind::LinkLocal);
        assert_eq!((nat.src, nat.src_port), (ip("10.0.0.1"), Some(40000)));
        assert_eq!((nat.dst, nat.dst_port), (ip("192.168.0.10"), Some(8775)));
        assert!(data.flags.contains(FlowFlags::LINK_LOCAL | FlowFlags::FABRIC_FLOW));
        assert_eq!(data.dst_vrf, FABRIC);
        assert!(data.deps.contains(&DepKey::LinkLocal(ip("169.254.169.254"))));

        // revaluation keeps the port
        let mut again = from_vm(key, 1);
        resolver.resolve(&snap, &mut again, Some(&data)).unwrap();
        assert_eq!(again.nat, data.nat);
        assert_eq!(resolver.ports_in_use(NatKind::LinkLocal, IpNumber::TCP), 1);

        // no port entry: destination port unchanged
        let key = FlowKey::tcp(NhId(101), ip("1.1.1.2"), ip("169.254.0.53"), 1000, 53);
        let mut data = from_vm(key, 2);
        resolver.resolve(&snap, &mut data, None).unwrap();
        assert_eq!(data.nat.unwrap().dst_port, None);
        assert_eq!(data.nat.unwrap().src_port, Some(40001));

        let key = FlowKey::tcp(NhId(101), ip("1.1.1.1"), ip("169.254.0.53"), 1001, 53);
        let mut data = from_vm(key, 1);
        let err = resolver.resolve(&snap, &mut data, None).unwrap_err();
        assert_eq!(err.short_reason(), ShortReason::LinklocalSrcNat);
        assert!(logs_contain("exhausted"));
    }

    #[test]
    fn gateway_snat_needs_fabric_snat_vn() {
        let tables = setup();
        let snap = tables.snapshot();
        let resolver = resolver();
        let key = FlowKey::udp(NhId(101), ip("1.1.1.1"), ip("8.8.8.8"), 1000, 53);
        let mut data = from_vm(key, 1);
        assert_eq!(
            resolver.resolve(&snap, &mut data, None),
            Err(ResolveError::NoDstRoute)
        );

        tables.upsert_vn(Vn::new(VnId(1)).with_fabric_snat());
        let snap = tables.snapshot();
        let mut data = from_vm(key, 1);
        resolver.resolve(&snap, &mut data, None).unwrap();
        let nat = data.nat.unwrap();
        assert_eq!(nat.kind, NatKind::Fabric);
        assert_eq!(nat.src, ip("10.0.0.1"));
        assert_eq!(nat.src_port, Some(49152));
        assert_eq!(data.dst_vrf, FABRIC);
        assert_eq!(data.reverse_nh, Some(NhId(50)));

        resolver.release_replaced(&key, data.nat.as_ref(), None);
        assert_eq!(resolver.ports_in_use(NatKind::Fabric, IpNumber::UDP), 0);
    }

    #[test]
    fn unavailable_interface_and_vrf() {
        let tables = setup();
        let resolver = resolver();
        let key = FlowKey::tcp(NhId(101), ip("1.1.1.1"), ip("1.1.1.2"), 1000, 80);

        tables.delete_interface(InterfaceId(2));
        let mut data = from_vm(key, 1);
        assert_eq!(
            resolver.resolve(&tables.snapshot(), &mut data, None),
            Err(ResolveError::UnavailableInterface)
        );

        tables.delete_vrf(VM_VRF);
        let mut data = from_vm(key, 1);
        assert_eq!(
            resolver.resolve(&tables.snapshot(), &mut data, None),
            Err(ResolveError::UnavailableInterface)
        );
    }

    #[test]
    fn fabric_packet_without_route() {
        let tables = setup();
        let key = FlowKey::tcp(NhId(50), ip("7.7.7.7"), ip("1.1.1.1"), 1000, 80);
        let mut data = FlowData::new(PacketInfo::new(key, VM_VRF));
        assert_eq!(
            resolver().resolve(&tables.snapshot(), &mut data, None),
            Err(ResolveError::NoSrcRoute)
        );
    }

    #[test]
    fn ecmp_member_is_stable() {
        let tables = setup();
        tables.upsert_nexthop(
            NhId(60),
            NextHop::Composite {
                members: vec![Some(NhId(61)), Some(NhId(62)), Some(NhId(63))],
            },
        );
        tables.add_route(Route::new(
            VM_VRF,
            net("3.3.3.0/24"),
            Some(VnId(3)),
            NhId(60),
            RouteDirective::Remote,
        ));
        let resolver = resolver();
        let key = FlowKey::tcp(NhId(101), ip("1.1.1.1"), ip("3.3.3.3"), 1000, 80);
        let mut data = from_vm(key, 1);
        resolver.resolve(&tables.snapshot(), &mut data, None).unwrap();
        let index = data.ecmp_index.unwrap();
        assert!(data.flags.contains(FlowFlags::ECMP_FLOW));

        // another member leaves
        let mut members = vec![Some(NhId(61)), Some(NhId(62)), Some(NhId(63))];
        members[(usize::from(index) + 1) % 3] = None;
        tables.upsert_nexthop(NhId(60), NextHop::Composite { members });
        let mut again = from_vm(key, 1);
        resolver
            .resolve(&tables.snapshot(), &mut again, Some(&data))
            .unwrap();
        assert_eq!(again.ecmp_index, Some(index));
        assert_eq!(again.reverse_nh, data.reverse_nh);
    }

    #[test]
    fn multicast_has_no_reverse() {
        let tables = setup();
        let key = FlowKey::udp(NhId(101), ip("1.1.1.1"), ip("239.0.0.1"), 1000, 80);
        let mut data = from_vm(key, 1);
        resolver().resolve(&tables.snapshot(), &mut data, None).unwrap();
        assert!(data.flags.contains(FlowFlags::MULTICAST));
        assert_eq!(data.reverse_nh, None);
    }
}
