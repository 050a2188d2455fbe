// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Recomputation of flows after a change to the tables they depend on.
//!
//! Changes are turned into triggers queued per pair, on the queue of the shard owning the
//! forward half. Triggers for a pair already queued are merged, so that a burst of changes
//! costs one recomputation. Deleting a pair cancels its queued recomputation.

use bitflags::bitflags;
use classifier::PolicyVerdict;
use flow_info::{FlowData, FlowEntry, FlowId, FlowKey, ShortReason};
use ordermap::OrderMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tables::{DependencyChange, TableSnapshot};
use tokio::sync::Notify;
use tracing::debug;

use crate::context::{FlowEngine, pair_head};

bitflags! {
    /// Why a pair must be recomputed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Trigger: u16 {
        const ROUTE       = 1 << 0;
        const ACL         = 1 << 1;
        const SG          = 1 << 2;
        const NEXTHOP     = 1 << 3;
        const INTERFACE   = 1 << 4;
        const VRF         = 1 << 5;
        const VN          = 1 << 6;
        /// An interface or VRF of the flow is being deleted.
        const UNAVAILABLE = 1 << 7;
        const LINKLOCAL   = 1 << 8;
    }
}

impl From<&DependencyChange> for Trigger {
    fn from(change: &DependencyChange) -> Self {
        match change {
            DependencyChange::RouteAdd { .. }
            | DependencyChange::RouteChange { .. }
            | DependencyChange::RouteDelete { .. } => Trigger::ROUTE,
            DependencyChange::Acl(_) => Trigger::ACL,
            DependencyChange::Sg(_) => Trigger::SG,
            DependencyChange::NextHop(_) => Trigger::NEXTHOP,
            DependencyChange::InterfaceChange(_) => Trigger::INTERFACE,
            DependencyChange::InterfaceDelete(_) => Trigger::INTERFACE | Trigger::UNAVAILABLE,
            DependencyChange::VrfDelete(_) => Trigger::VRF | Trigger::UNAVAILABLE,
            DependencyChange::Vn(_) => Trigger::VN,
            DependencyChange::LinkLocal(_) => Trigger::LINKLOCAL,
        }
    }
}

/// Result of the recomputation of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevaluationOutcome {
    Unchanged,
    Changed,
    /// The pair was deleted before being recomputed.
    Cancelled,
    /// The flow is no longer in the table.
    Gone,
}

#[derive(Debug, Default)]
pub struct RevaluationStats {
    /// Triggers that queued a pair.
    pub queued: AtomicU64,
    /// Triggers merged into a pair already queued.
    pub coalesced: AtomicU64,
    pub cancelled: AtomicU64,
    pub recomputed: AtomicU64,
    pub changed: AtomicU64,
}

/// Pending recomputations of the pairs of one shard, in submission order.
#[derive(Debug)]
pub struct RevaluationQueue {
    shard: u32,
    pending: Mutex<OrderMap<FlowId, Trigger>>,
    paused: AtomicBool,
    wakeup: Notify,
    stats: RevaluationStats,
}

impl RevaluationQueue {
    #[must_use]
    pub fn new(shard: u32) -> Self {
        Self {
            shard,
            pending: Mutex::new(OrderMap::new()),
            paused: AtomicBool::new(false),
            wakeup: Notify::new(),
            stats: RevaluationStats::default(),
        }
    }

    #[must_use]
    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// Queue `trigger` for pair `id`. Returns false if it was merged into a queued one.
    pub fn enqueue(&self, id: FlowId, trigger: Trigger) -> bool {
        let queued = {
            let mut pending = self.pending.lock();
            match pending.get_mut(&id) {
                Some(queued) => {
                    *queued |= trigger;
                    false
                }
                None => {
                    pending.insert(id, trigger);
                    true
                }
            }
        };
        if queued {
            self.stats.queued.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        self.wakeup.notify_one();
        queued
    }

    /// Drop the queued recomputation of `id`, if any.
    pub fn cancel(&self, id: FlowId) -> bool {
        let cancelled = self.pending.lock().remove(&id).is_some();
        if cancelled {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        cancelled
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Stop or resume consumption. Queued work is kept while paused.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
        if !paused {
            self.wakeup.notify_one();
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> &RevaluationStats {
        &self.stats
    }

    /// Take up to `max` pairs off the queue, oldest first. Nothing while paused.
    fn take(&self, max: usize) -> Vec<(FlowId, Trigger)> {
        if self.is_paused() {
            return vec![];
        }
        let mut pending = self.pending.lock();
        let count = max.min(pending.len());
        let batch = pending.drain(..count).collect();
        if !pending.is_empty() {
            // more than a batch: come back after other work of the shard
            self.wakeup.notify_one();
        }
        batch
    }

    /// Wait until work may be available.
    pub(crate) async fn wait(&self) {
        self.wakeup.notified().await;
    }
}

impl FlowEngine {
    #[must_use]
    pub fn revaluation_queue(&self, shard: u32) -> Option<&RevaluationQueue> {
        self.revaluation.get(shard as usize)
    }

    /// Queue the recomputation of the pair `id` belongs to.
    pub fn enqueue_revaluation(&self, id: FlowId, trigger: Trigger) -> bool {
        let Some(head) = self.table.with_entry(id, pair_head) else {
            return false;
        };
        self.revaluation_queue(head.shard)
            .is_some_and(|q| q.enqueue(head, trigger))
    }

    /// Queue the recomputation of every flow affected by `change`. Returns the number of pairs
    /// newly queued.
    pub fn on_change(&self, change: &DependencyChange) -> usize {
        let trigger = Trigger::from(change);
        let mut flows = self.table.dependents(&change.dep_key());
        if let DependencyChange::RouteAdd { vrf, prefix } = change {
            // a more specific route may now be the best match of flows of the VRF
            flows.extend(self.table.select(|e| {
                let data = e.data();
                (data.origin.vrf == *vrf || data.dst_vrf == *vrf) && prefix.contains(&e.key().dst)
            }));
        }
        let queued = flows
            .into_iter()
            .filter(|id| self.enqueue_revaluation(*id, trigger))
            .count();
        if queued > 0 {
            debug!("{change}: {queued} flow pairs to revaluate");
        }
        queued
    }

    /// Recompute up to one batch of the pairs queued on `shard`. Returns the number of pairs
    /// taken off the queue.
    pub fn revaluate(&self, shard: u32, now: Instant) -> usize {
        let Some(queue) = self.revaluation_queue(shard) else {
            return 0;
        };
        let batch = queue.take(self.config.revaluation_batch);
        for (id, trigger) in &batch {
            let outcome = self.recompute(*id, *trigger, now);
            match outcome {
                RevaluationOutcome::Changed | RevaluationOutcome::Unchanged => {
                    queue.stats.recomputed.fetch_add(1, Ordering::Relaxed);
                    self.metrics.revaluated.increment(1);
                    if outcome == RevaluationOutcome::Changed {
                        queue.stats.changed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                RevaluationOutcome::Cancelled => {
                    queue.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                }
                RevaluationOutcome::Gone => {}
            }
        }
        batch.len()
    }

    /// Recompute the pair `id` belongs to from the current tables, as a fresh classification
    /// of its first packet would, and push what changed to the forwarding plane.
    pub fn recompute(&self, id: FlowId, trigger: Trigger, now: Instant) -> RevaluationOutcome {
        let Some((deleted, short, reverse_flow, partner)) = self.table.with_entry(id, |e| {
            (e.is_deleted(), e.is_short_flow(), e.is_reverse_flow(), e.reverse())
        }) else {
            return RevaluationOutcome::Gone;
        };
        if deleted {
            return RevaluationOutcome::Cancelled;
        }
        if reverse_flow {
            return match partner {
                Some(forward) if self.table.with_entry(forward, FlowEntry::is_reverse_flow)
                    == Some(false) =>
                {
                    self.recompute(forward, trigger, now)
                }
                _ => {
                    debug!("Deleting reverse flow {id} left without its forward flow");
                    match self.delete_pair(id, now) {
                        Ok(_) => RevaluationOutcome::Changed,
                        Err(e) => {
                            debug!("Reverse flow {id} already gone: {e}");
                            RevaluationOutcome::Gone
                        }
                    }
                }
            };
        }
        if short {
            // evicted by the next aging sweep
            return RevaluationOutcome::Unchanged;
        }
        let Some((key, previous)) = self.table.with_entry(id, |e| (*e.key(), e.data().clone()))
        else {
            return RevaluationOutcome::Gone;
        };

        let snapshot = self.tables.snapshot();
        let (mut data, verdict) =
            self.compute_forward(&snapshot, previous.origin.clone(), Some(&previous));
        if trigger.contains(Trigger::UNAVAILABLE) {
            data.set_short(ShortReason::UnavailableInterface);
        }
        let changed = match self.table.with_entry_mut(id, |e| e.update_data(data.clone())) {
            Ok(changed) => changed,
            Err(e) => {
                debug!("Flow {id} went away while being revaluated: {e}");
                // the purge of the flow gives back the previous ports, not the new ones
                self.resolver
                    .release_replaced(&key, data.nat.as_ref(), previous.nat.as_ref());
                return RevaluationOutcome::Gone;
            }
        };
        self.resolver
            .release_replaced(&key, previous.nat.as_ref(), data.nat.as_ref());
        if changed && data.is_short() {
            self.metrics.short.increment(1);
        }
        let reverse_changed =
            self.revaluate_reverse(&snapshot, (id, &key, &data, &verdict), partner, now);
        if changed {
            self.sync(id, now);
        }
        debug!("Revaluated flow {id} on {trigger:?}: changed {changed}, reverse {reverse_changed}");
        if changed || reverse_changed {
            RevaluationOutcome::Changed
        } else {
            RevaluationOutcome::Unchanged
        }
    }

    /// Bring the reverse half of forward flow `id` in line with its new verdict. A reverse half
    /// whose key changed is replaced.
    fn revaluate_reverse(
        &self,
        snapshot: &TableSnapshot,
        (id, key, data, verdict): (FlowId, &FlowKey, &FlowData, &PolicyVerdict),
        partner: Option<FlowId>,
        now: Instant,
    ) -> bool {
        let current =
            partner.and_then(|r| self.table.with_entry(r, |e| *e.key()).map(|k| (r, k)));
        if let Some(reason) = data.short_reason {
            // the pair goes away together
            let Some((reverse, _)) = current else {
                return false;
            };
            let converted = self.make_short(reverse, reason);
            if converted {
                self.sync(reverse, now);
            }
            return converted;
        }
        match (current, Self::compute_reverse(snapshot, key, data, verdict)) {
            (None, None) => false,
            (Some((reverse, current_key)), Some((reverse_key, reverse_data)))
                if current_key == reverse_key =>
            {
                match self
                    .table
                    .with_entry_mut(reverse, |e| e.update_data(reverse_data))
                {
                    Ok(true) => {
                        self.sync(reverse, now);
                        true
                    }
                    Ok(false) => false,
                    Err(e) => {
                        debug!("Reverse flow {reverse} of {id} went away: {e}");
                        false
                    }
                }
            }
            (current, computed) => {
                if let Some((reverse, _)) = current {
                    debug!("Flow {id} no longer has {reverse} as reverse");
                    if let Err(e) = self.table.unlink(id) {
                        debug!("Cannot unlink flow {id}: {e}");
                    }
                    if let Err(e) = self.delete_pair(reverse, now) {
                        debug!("Former reverse flow {reverse} already gone: {e}");
                    }
                }
                if let Some((reverse_key, reverse_data)) = computed
                    && let Some(reverse) = self.attach_reverse(id, reverse_key, reverse_data, now)
                {
                    self.sync(reverse, now);
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{Fixture, ip, net, vm_packet};
    use flow_info::{
        AclId, FlowAction, FlowFlags, InterfaceId, NatKind, NhId, PolicyMatch, VnId, VrfId,
    };
    use pretty_assertions::assert_eq;
    use tables::{
        Acl, AclRule, LinkLocalService, NextHop, Route, RouteDirective, RuleAction, Vn,
    };
    use uuid::Uuid;

    fn vm1_to_vm2(fx: &mut Fixture) -> FlowId {
        let key = FlowKey::tcp(NhId(101), ip("1.1.1.1"), ip("1.1.1.2"), 1000, 80);
        let id = fx.engine.process_packet(vm_packet(key, 1), fx.now);
        fx.pump();
        id
    }

    fn deny_all(fx: &Fixture, uuid: u128) {
        fx.tables.upsert_acl(Acl {
            id: AclId(1),
            rules: vec![AclRule::any(Uuid::from_u128(uuid), RuleAction::deny())],
            default_allow: true,
        });
    }

    #[test]
    fn queued_triggers_coalesce() {
        let queue = RevaluationQueue::new(0);
        let id = FlowId::new(0, 1);
        assert!(queue.enqueue(id, Trigger::ACL));
        assert!(!queue.enqueue(id, Trigger::ROUTE));
        assert!(queue.enqueue(FlowId::new(0, 2), Trigger::SG));
        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue.take(8),
            vec![
                (id, Trigger::ACL | Trigger::ROUTE),
                (FlowId::new(0, 2), Trigger::SG)
            ]
        );
        assert_eq!(queue.stats().coalesced.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn paused_queue_keeps_its_work() {
        let queue = RevaluationQueue::new(0);
        queue.enqueue(FlowId::new(0, 1), Trigger::ACL);
        queue.set_paused(true);
        assert!(queue.take(8).is_empty());
        assert_eq!(queue.len(), 1);
        queue.set_paused(false);
        assert_eq!(queue.take(8).len(), 1);
    }

    #[test]
    fn acl_change_is_one_recompute_per_pair() {
        let mut fx = Fixture::new();
        fx.tables.upsert_vn(Vn::new(VnId(1)).with_acl(AclId(1)));
        let id = vm1_to_vm2(&mut fx);
        let shard = id.shard;
        let engine = fx.engine.clone();
        let queue = engine.revaluation_queue(shard).unwrap();
        // creating the flow queued nothing
        assert!(queue.is_empty());

        queue.set_paused(true);
        deny_all(&fx, 0xd1);
        deny_all(&fx, 0xd2);
        deny_all(&fx, 0xd3);
        assert_eq!(engine.revaluate(shard, fx.now), 0);
        assert_eq!(queue.len(), 1);
        // both halves of the pair depend on the ACL
        assert_eq!(queue.stats().coalesced.load(Ordering::Relaxed), 5);

        queue.set_paused(false);
        assert_eq!(engine.revaluate(shard, fx.now), 1);
        fx.pump();
        assert_eq!(queue.stats().recomputed.load(Ordering::Relaxed), 1);
        let (action, acl) = engine
            .table()
            .with_entry(id, |e| (e.action(), e.data().policy.acl))
            .unwrap();
        assert!(action.contains(FlowAction::DROP));
        assert_eq!(acl, PolicyMatch::Rule(Uuid::from_u128(0xd3)));
    }

    #[test]
    fn recompute_matches_a_fresh_classification() {
        let mut fx = Fixture::new();
        fx.tables.upsert_vn(Vn::new(VnId(1)).with_acl(AclId(1)));
        let id = vm1_to_vm2(&mut fx);
        deny_all(&fx, 0xd1);
        fx.engine.revaluate(id.shard, fx.now);
        let revaluated = fx.engine.table().with_entry(id, |e| e.data().clone()).unwrap();

        let snapshot = fx.tables.snapshot();
        let (fresh, _) = fx
            .engine
            .compute_forward(&snapshot, revaluated.origin.clone(), None);
        assert_eq!(revaluated, fresh);
    }

    #[test]
    fn delete_wins_over_queued_recompute() {
        let mut fx = Fixture::new();
        let id = vm1_to_vm2(&mut fx);
        let queue = fx.engine.revaluation_queue(id.shard).unwrap();
        queue.set_paused(true);
        fx.tables.upsert_nexthop(
            NhId(102),
            NextHop::Tunnel {
                dst: ip("192.168.1.9"),
                encap: tables::Encap::Vxlan,
            },
        );
        assert_eq!(queue.len(), 1);
        fx.engine.flush_all(fx.now);
        assert!(queue.is_empty());
        assert_eq!(
            fx.engine.recompute(id, Trigger::NEXTHOP, fx.now),
            RevaluationOutcome::Cancelled
        );
    }

    #[test]
    fn route_delete_makes_the_pair_short() {
        let mut fx = Fixture::new();
        let id = vm1_to_vm2(&mut fx);
        fx.tables.delete_route(VrfId(1), net("1.1.1.2/32"));
        fx.engine.revaluate(id.shard, fx.now);
        fx.pump();
        let table = fx.engine.table();
        let reverse = table.with_entry(id, FlowEntry::reverse).flatten().unwrap();
        assert_eq!(
            table.with_entry(id, FlowEntry::short_reason),
            Some(Some(ShortReason::NoDstRoute))
        );
        assert_eq!(
            table.with_entry(reverse, FlowEntry::short_reason),
            Some(Some(ShortReason::NoDstRoute))
        );
    }

    #[test]
    fn interface_delete_forces_unavailable_interface() {
        let mut fx = Fixture::new();
        let id = vm1_to_vm2(&mut fx);
        fx.tables.delete_interface(InterfaceId(2));
        for shard in 0..4 {
            fx.engine.revaluate(shard, fx.now);
        }
        let reason = fx.engine.table().with_entry(id, FlowEntry::short_reason);
        assert_eq!(reason, Some(Some(ShortReason::UnavailableInterface)));
    }

    #[test]
    fn more_specific_route_moves_the_reverse() {
        let mut fx = Fixture::new();
        // vm1 towards a remote address, through the fabric default route
        fx.tables.add_route(Route::new(
            VrfId(1),
            net("10.1.0.0/16"),
            Some(VnId(1)),
            NhId(50),
            RouteDirective::Remote,
        ));
        let key = FlowKey::udp(NhId(101), ip("1.1.1.1"), ip("10.1.2.3"), 5000, 53);
        let id = fx.engine.process_packet(vm_packet(key, 1), fx.now);
        fx.pump();
        let old_reverse = fx
            .engine
            .table()
            .with_entry(id, FlowEntry::reverse)
            .flatten()
            .unwrap();

        fx.tables.upsert_nexthop(
            NhId(51),
            NextHop::Tunnel {
                dst: ip("192.168.1.3"),
                encap: tables::Encap::MplsUdp,
            },
        );
        fx.tables.add_route(Route::new(
            VrfId(1),
            net("10.1.2.0/24"),
            Some(VnId(1)),
            NhId(51),
            RouteDirective::Remote,
        ));
        fx.engine.revaluate(id.shard, fx.now);
        fx.pump();

        let table = fx.engine.table();
        let new_reverse = table.with_entry(id, FlowEntry::reverse).flatten().unwrap();
        assert_ne!(new_reverse, old_reverse);
        assert_eq!(table.with_entry(new_reverse, |e| e.key().nh_id), Some(NhId(51)));
        assert!(table.with_entry(old_reverse, |e| e.is_deleted()).is_none_or(|d| d));
        assert_eq!(fx.engine.flow_count(), 2);
    }

    #[test]
    fn vrf_delete_forces_unavailable_interface() {
        let mut fx = Fixture::new();
        let id = vm1_to_vm2(&mut fx);
        fx.tables.delete_vrf(VrfId(1));
        for shard in 0..4 {
            fx.engine.revaluate(shard, fx.now);
        }
        fx.pump();
        let table = fx.engine.table();
        let reverse = table.with_entry(id, FlowEntry::reverse).flatten().unwrap();
        for half in [id, reverse] {
            assert_eq!(
                table.with_entry(half, FlowEntry::short_reason),
                Some(Some(ShortReason::UnavailableInterface))
            );
        }
        assert_eq!(fx.engine.sweep(fx.now).evicted, 2);
    }

    #[test]
    fn ecmp_member_survives_revaluation() {
        let mut fx = Fixture::new();
        let members = vec![Some(NhId(61)), Some(NhId(62)), Some(NhId(63))];
        fx.tables.upsert_nexthop(
            NhId(60),
            NextHop::Composite {
                members: members.clone(),
            },
        );
        fx.tables.add_route(Route::new(
            VrfId(1),
            net("3.3.3.0/24"),
            Some(VnId(1)),
            NhId(60),
            RouteDirective::Remote,
        ));
        let key = FlowKey::tcp(NhId(101), ip("1.1.1.1"), ip("3.3.3.3"), 1000, 80);
        let id = fx.engine.process_packet(vm_packet(key, 1), fx.now);
        fx.pump();
        let engine = fx.engine.clone();
        let table = engine.table();
        let (index, reverse) = table
            .with_entry(id, |e| (e.data().ecmp_index, e.reverse()))
            .unwrap();
        let index = index.unwrap();
        let reverse = reverse.unwrap();
        let reverse_nh = table.with_entry(reverse, |e| e.key().nh_id).unwrap();

        // another member leaves
        let mut members = members;
        members[(usize::from(index) + 1) % 3] = None;
        fx.tables
            .upsert_nexthop(NhId(60), NextHop::Composite { members });
        assert_eq!(engine.revaluation_queue(id.shard).unwrap().len(), 1);
        engine.revaluate(id.shard, fx.now);
        fx.pump();

        let (after, short) = table
            .with_entry(id, |e| (e.data().ecmp_index, e.is_short_flow()))
            .unwrap();
        assert_eq!(after, Some(index));
        assert!(!short);
        assert_eq!(table.with_entry(id, FlowEntry::reverse), Some(Some(reverse)));
        assert_eq!(table.with_entry(reverse, |e| e.key().nh_id), Some(reverse_nh));
        assert_eq!(engine.flow_count(), 2);
    }

    #[test]
    fn linklocal_service_removal_revaluates_its_flows() {
        let mut fx = Fixture::new();
        fx.tables.add_linklocal_service(LinkLocalService {
            name: "metadata".to_string(),
            service_ip: ip("169.254.169.254"),
            service_port: Some(80),
            fabric_ip: ip("192.168.0.10"),
            fabric_port: 8775,
        });
        let key = FlowKey::tcp(NhId(101), ip("1.1.1.1"), ip("169.254.169.254"), 1000, 80);
        let id = fx.engine.process_packet(vm_packet(key, 1), fx.now);
        fx.pump();
        let engine = fx.engine.clone();
        let table = engine.table();
        let nat = table.with_entry(id, |e| e.data().nat).flatten().unwrap();
        assert_eq!(nat.kind, NatKind::LinkLocal);

        fx.tables.remove_linklocal_service("metadata");
        assert_eq!(engine.revaluation_queue(id.shard).unwrap().len(), 1);
        engine.revaluate(id.shard, fx.now);
        fx.pump();

        let (nat, flags) = table
            .with_entry(id, |e| (e.data().nat, e.data().flags))
            .unwrap();
        assert_eq!(nat, None);
        assert!(!flags.contains(FlowFlags::LINK_LOCAL));
    }
}
