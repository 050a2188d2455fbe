// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Table writer: publishes snapshots and notifies subscribers of changes.

use arc_swap::ArcSwap;
use flow_info::{AclId, DepKey, InterfaceId, NhId, SgId, VnId, VrfId};
use ipnet::IpNet;
use ordermap::OrderMap;
use parking_lot::{Mutex, RwLock};
use std::fmt::Display;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::objects::{Interface, LinkLocalService, NextHop, Vn, Vrf};
use crate::policy::{Acl, SecurityGroup};
use crate::route::Route;
use crate::snapshot::TableSnapshot;

/// A change to an object flows may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyChange {
    RouteAdd { vrf: VrfId, prefix: IpNet },
    RouteChange { vrf: VrfId, prefix: IpNet },
    RouteDelete { vrf: VrfId, prefix: IpNet },
    Acl(AclId),
    Sg(SgId),
    NextHop(NhId),
    InterfaceChange(InterfaceId),
    InterfaceDelete(InterfaceId),
    VrfDelete(VrfId),
    Vn(VnId),
    /// A link-local service on this address was added, changed or removed.
    LinkLocal(IpAddr),
}

impl DependencyChange {
    /// The dependency registered by the flows affected by this change.
    #[must_use]
    pub fn dep_key(&self) -> DepKey {
        match *self {
            DependencyChange::RouteAdd { vrf, prefix }
            | DependencyChange::RouteChange { vrf, prefix }
            | DependencyChange::RouteDelete { vrf, prefix } => DepKey::Route { vrf, prefix },
            DependencyChange::Acl(id) => DepKey::Acl(id),
            DependencyChange::Sg(id) => DepKey::Sg(id),
            DependencyChange::NextHop(id) => DepKey::NextHop(id),
            DependencyChange::InterfaceChange(id) | DependencyChange::InterfaceDelete(id) => {
                DepKey::Interface(id)
            }
            DependencyChange::VrfDelete(id) => DepKey::Vrf(id),
            DependencyChange::Vn(id) => DepKey::Vn(id),
            DependencyChange::LinkLocal(ip) => DepKey::LinkLocal(ip),
        }
    }
}

impl Display for DependencyChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyChange::RouteAdd { vrf, prefix } => write!(f, "route add {vrf} {prefix}"),
            DependencyChange::RouteChange { vrf, prefix } => {
                write!(f, "route change {vrf} {prefix}")
            }
            DependencyChange::RouteDelete { vrf, prefix } => {
                write!(f, "route delete {vrf} {prefix}")
            }
            DependencyChange::Acl(id) => write!(f, "{id} change"),
            DependencyChange::Sg(id) => write!(f, "{id} change"),
            DependencyChange::NextHop(id) => write!(f, "{id} change"),
            DependencyChange::InterfaceChange(id) => write!(f, "{id} change"),
            DependencyChange::InterfaceDelete(id) => write!(f, "{id} delete"),
            DependencyChange::VrfDelete(id) => write!(f, "{id} delete"),
            DependencyChange::Vn(id) => write!(f, "{id} change"),
            DependencyChange::LinkLocal(ip) => write!(f, "link-local service {ip} change"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&DependencyChange) + Send + Sync>;

/// The tables consumed by the flow engine.
///
/// Readers take a [`TableSnapshot`] and never block. Writers are serialized, publish a new
/// snapshot and then notify every subscriber, in subscription order.
pub struct Tables {
    current: ArcSwap<TableSnapshot>,
    writer: Mutex<()>,
    subscribers: RwLock<OrderMap<SubscriptionId, Callback>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for Tables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tables").finish_non_exhaustive()
    }
}

impl Default for Tables {
    fn default() -> Self {
        Self::new()
    }
}

impl Tables {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(TableSnapshot::default()),
            writer: Mutex::new(()),
            subscribers: RwLock::new(OrderMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.current.load_full()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DependencyChange) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().insert(id, Arc::new(callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    fn notify(&self, change: &DependencyChange) {
        debug!("Table change: {change}");
        let callbacks: Vec<Callback> = self.subscribers.read().values().cloned().collect();
        for cb in callbacks {
            cb(change);
        }
    }

    /// Apply `f` to a copy of the current snapshot and publish it. The change returned by `f`,
    /// if any, is notified once the new snapshot is visible.
    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut TableSnapshot) -> Option<DependencyChange>,
    {
        let change = {
            let _guard = self.writer.lock();
            let mut next = TableSnapshot::clone(&self.current.load());
            let change = f(&mut next);
            self.current.store(Arc::new(next));
            change
        };
        if let Some(change) = change {
            self.notify(&change);
        }
    }

    pub fn upsert_interface(&self, interface: Interface) {
        self.update(|t| {
            let id = interface.id;
            t.interfaces.insert(id, interface);
            Some(DependencyChange::InterfaceChange(id))
        });
    }

    /// Mark an interface deleted. Flows using it become short flows.
    pub fn delete_interface(&self, id: InterfaceId) {
        self.update(|t| {
            let interface = t.interfaces.get_mut(&id)?;
            interface.delete_marked = true;
            Some(DependencyChange::InterfaceDelete(id))
        });
    }

    pub fn upsert_vrf(&self, vrf: Vrf) {
        self.update(|t| {
            t.vrfs.insert(vrf.id, vrf);
            None
        });
    }

    /// Mark a VRF deleted. Flows in it become short flows.
    pub fn delete_vrf(&self, id: VrfId) {
        self.update(|t| {
            let vrf = t.vrfs.get_mut(&id)?;
            vrf.delete_marked = true;
            Some(DependencyChange::VrfDelete(id))
        });
    }

    pub fn upsert_vn(&self, vn: Vn) {
        self.update(|t| {
            let id = vn.id;
            t.vns.insert(id, vn);
            Some(DependencyChange::Vn(id))
        });
    }

    pub fn upsert_nexthop(&self, id: NhId, nh: NextHop) {
        self.update(|t| {
            let changed = t.nexthops.insert(id, nh.clone()).is_some_and(|old| old != nh);
            changed.then_some(DependencyChange::NextHop(id))
        });
    }

    pub fn upsert_acl(&self, acl: Acl) {
        self.update(|t| {
            let id = acl.id;
            t.acls.insert(id, acl);
            Some(DependencyChange::Acl(id))
        });
    }

    pub fn upsert_sg(&self, sg: SecurityGroup) {
        self.update(|t| {
            let id = sg.id;
            t.sgs.insert(id, sg);
            Some(DependencyChange::Sg(id))
        });
    }

    pub fn add_route(&self, route: Route) {
        self.update(|t| {
            let vrf = route.vrf;
            let prefix = route.prefix;
            match t.routes.entry(vrf).or_default().insert(route) {
                None => Some(DependencyChange::RouteAdd { vrf, prefix }),
                Some(_) => Some(DependencyChange::RouteChange { vrf, prefix }),
            }
        });
    }

    pub fn delete_route(&self, vrf: VrfId, prefix: IpNet) {
        let prefix = prefix.trunc();
        self.update(|t| {
            t.routes.get_mut(&vrf)?.remove(&prefix)?;
            Some(DependencyChange::RouteDelete { vrf, prefix })
        });
    }

    /// Add a link-local service, replacing any service of the same name.
    pub fn add_linklocal_service(&self, service: LinkLocalService) {
        let ip = service.service_ip;
        self.update(|t| {
            let moved = t
                .linklocal
                .iter()
                .find(|s| s.name == service.name && s.service_ip != ip)
                .map(|s| s.service_ip);
            t.linklocal.retain(|s| s.name != service.name);
            moved.map(DependencyChange::LinkLocal)
        });
        self.update(|t| {
            t.linklocal.push(service);
            Some(DependencyChange::LinkLocal(ip))
        });
    }

    pub fn remove_linklocal_service(&self, name: &str) {
        self.update(|t| {
            let at = t.linklocal.iter().position(|s| s.name == name)?;
            let removed = t.linklocal.remove(at);
            Some(DependencyChange::LinkLocal(removed.service_ip))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::InterfaceBuilder;
    use crate::route::RouteDirective;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;
    use tracing_test::traced_test;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    #[traced_test]
    fn changes_are_notified_after_publication() {
        let tables = Arc::new(Tables::new());
        let seen = Arc::new(StdMutex::new(vec![]));
        let seen_cb = seen.clone();
        let reader = tables.clone();
        let id = tables.subscribe(move |change| {
            // the new snapshot is already visible to subscribers
            let visible = match change {
                DependencyChange::RouteAdd { vrf, prefix } => {
                    reader.snapshot().route(*vrf, prefix).is_some()
                }
                _ => true,
            };
            seen_cb.lock().unwrap().push((*change, visible));
        });

        let route = Route::new(
            VrfId(1),
            net("10.0.0.0/24"),
            Some(VnId(1)),
            NhId(3),
            RouteDirective::Remote,
        );
        tables.add_route(route.clone());
        tables.add_route(route);
        tables.delete_route(VrfId(1), net("10.0.0.0/24"));
        tables.delete_route(VrfId(1), net("10.0.0.0/24"));

        let prefix = net("10.0.0.0/24");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (DependencyChange::RouteAdd { vrf: VrfId(1), prefix }, true),
                (DependencyChange::RouteChange { vrf: VrfId(1), prefix }, true),
                (DependencyChange::RouteDelete { vrf: VrfId(1), prefix }, true),
            ]
        );
        assert!(logs_contain("route add vrf-1 10.0.0.0/24"));

        assert!(tables.unsubscribe(id));
        tables.upsert_acl(Acl {
            id: AclId(1),
            rules: vec![],
            default_allow: true,
        });
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn interface_delete_marks() {
        let tables = Tables::new();
        let iface = InterfaceBuilder::default()
            .id(InterfaceId(1))
            .vrf(VrfId(1))
            .ip("1.1.1.1".parse::<std::net::IpAddr>().unwrap())
            .nh(NhId(10))
            .build()
            .unwrap();
        tables.upsert_interface(iface);
        let before = tables.snapshot();
        tables.delete_interface(InterfaceId(1));
        assert!(!before.interface(InterfaceId(1)).unwrap().delete_marked);
        assert!(tables.snapshot().interface(InterfaceId(1)).unwrap().delete_marked);
        assert!(tables.snapshot().interface(InterfaceId(1)).unwrap().policy_enabled);
    }

    #[test]
    fn nexthop_notified_only_on_change() {
        let tables = Tables::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        tables.subscribe(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        tables.upsert_nexthop(NhId(1), NextHop::Discard);
        tables.upsert_nexthop(NhId(1), NextHop::Discard);
        tables.upsert_nexthop(NhId(1), NextHop::Receive);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn linklocal_lookup_prefers_port_match() {
        let tables = Tables::new();
        let ip: std::net::IpAddr = "169.254.169.254".parse().unwrap();
        tables.add_linklocal_service(LinkLocalService {
            name: "any".to_string(),
            service_ip: ip,
            service_port: None,
            fabric_ip: "192.168.0.1".parse().unwrap(),
            fabric_port: 0,
        });
        tables.add_linklocal_service(LinkLocalService {
            name: "metadata".to_string(),
            service_ip: ip,
            service_port: Some(80),
            fabric_ip: "192.168.0.2".parse().unwrap(),
            fabric_port: 8775,
        });
        let snap = tables.snapshot();
        assert_eq!(snap.linklocal_service(ip, 80).unwrap().name, "metadata");
        assert_eq!(snap.linklocal_service(ip, 22).unwrap().name, "any");
        tables.remove_linklocal_service("any");
        assert!(tables.snapshot().linklocal_service(ip, 22).is_none());
    }

    #[test]
    fn linklocal_changes_are_notified() {
        let tables = Tables::new();
        let seen = Arc::new(StdMutex::new(vec![]));
        let seen_cb = seen.clone();
        tables.subscribe(move |change| seen_cb.lock().unwrap().push(*change));
        let metadata = |ip: &str| LinkLocalService {
            name: "metadata".to_string(),
            service_ip: ip.parse().unwrap(),
            service_port: Some(80),
            fabric_ip: "192.168.0.2".parse().unwrap(),
            fabric_port: 8775,
        };
        let first: IpAddr = "169.254.169.254".parse().unwrap();
        let second: IpAddr = "169.254.0.1".parse().unwrap();

        tables.add_linklocal_service(metadata("169.254.169.254"));
        tables.add_linklocal_service(metadata("169.254.0.1"));
        tables.remove_linklocal_service("metadata");
        tables.remove_linklocal_service("metadata");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                DependencyChange::LinkLocal(first),
                DependencyChange::LinkLocal(first),
                DependencyChange::LinkLocal(second),
                DependencyChange::LinkLocal(second),
            ]
        );
        assert_eq!(
            DependencyChange::LinkLocal(first).dep_key(),
            DepKey::LinkLocal(first)
        );
    }
}
