// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use ahash::RandomState;
use flow_info::{DepKey, FlowData, FlowEntry, FlowId, FlowKey, VnId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::BuildHasher;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

use crate::counters::{VnCounterMap, VnFlowCounters};
use crate::display::FlowRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowTableError {
    #[error("Invalid number of shards: {0}. Must be a power of two.")]
    InvalidShardCount(usize),
    #[error("No such flow: {0}")]
    NoSuchFlow(FlowId),
    #[error("Flow {flow} is already linked to {partner}, cannot link it to {requested}")]
    AlreadyLinked {
        flow: FlowId,
        partner: FlowId,
        requested: FlowId,
    },
    #[error("Flow {0} is deleted")]
    FlowDeleted(FlowId),
}

fn hasher_state() -> &'static RandomState {
    static HASHER_STATE: OnceLock<RandomState> = OnceLock::new();
    HASHER_STATE.get_or_init(|| RandomState::with_seeds(0, 0, 0, 0))
}

#[derive(Debug)]
struct Shard {
    index: u32,
    next_serial: u64,
    entries: HashMap<u64, FlowEntry, RandomState>,
    keys: HashMap<FlowKey, u64, RandomState>,
    deps: BTreeMap<DepKey, BTreeSet<u64>>,
}

impl Shard {
    fn new(index: u32) -> Self {
        Self {
            index,
            next_serial: 0,
            entries: HashMap::with_hasher(hasher_state().clone()),
            keys: HashMap::with_hasher(hasher_state().clone()),
            deps: BTreeMap::new(),
        }
    }

    fn index_deps(&mut self, serial: u64, before: &BTreeSet<DepKey>, after: &BTreeSet<DepKey>) {
        for gone in before.difference(after) {
            if let Some(flows) = self.deps.get_mut(gone) {
                flows.remove(&serial);
                if flows.is_empty() {
                    self.deps.remove(gone);
                }
            }
        }
        for added in after.difference(before) {
            self.deps.entry(added.clone()).or_default().insert(serial);
        }
    }
}

/// What the table derives from an entry: key mapping, VN counters and dependency index.
struct Tracked {
    live: bool,
    key: FlowKey,
    src_vn: Option<VnId>,
    dst_vn: Option<VnId>,
    deps: BTreeSet<DepKey>,
}

impl Tracked {
    fn of(entry: &FlowEntry) -> Self {
        let live = !entry.is_deleted();
        Self {
            live,
            key: *entry.key(),
            src_vn: entry.data().src_vn,
            dst_vn: entry.data().dst_vn,
            deps: if live {
                entry.data().deps.clone()
            } else {
                BTreeSet::new()
            },
        }
    }

    fn gone(key: FlowKey) -> Self {
        Self {
            live: false,
            key,
            src_vn: None,
            dst_vn: None,
            deps: BTreeSet::new(),
        }
    }
}

/// Both shards of a pair, locked in ascending order.
struct ShardPair<'a> {
    low: MutexGuard<'a, Shard>,
    high: Option<MutexGuard<'a, Shard>>,
}

impl ShardPair<'_> {
    fn get(&mut self, shard: u32) -> &mut Shard {
        if let Some(high) = self.high.as_mut()
            && high.index == shard
        {
            return high;
        }
        &mut self.low
    }
}

/// The flow table: a fixed number of shards, each holding an arena of entries, the key to
/// entry mapping of live entries, and the dependency index of those entries.
///
/// Deleted entries lose their key mapping, dependencies and VN accounting immediately but stay
/// in the arena, reachable by id, until [`FlowTable::purge`].
#[derive(Debug)]
pub struct FlowTable {
    shards: Vec<Mutex<Shard>>,
    vn_counters: VnCounterMap,
    active: AtomicU64,
}

impl FlowTable {
    /// Create a flow table with the given number of shards.
    ///
    /// # Errors
    ///
    /// Returns an error if the number of shards is not a power of two.
    pub fn new(num_shards: usize) -> Result<Self, FlowTableError> {
        if !num_shards.is_power_of_two() || u32::try_from(num_shards).is_err() {
            return Err(FlowTableError::InvalidShardCount(num_shards));
        }
        let shards = (0..num_shards)
            .filter_map(|i| u32::try_from(i).ok())
            .map(|i| Mutex::new(Shard::new(i)))
            .collect();
        debug!("Created flow table with {num_shards} shards");
        Ok(Self {
            shards,
            vn_counters: VnCounterMap::default(),
            active: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The shard owning `key`. Stable for the lifetime of the table.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn shard_of(&self, key: &FlowKey) -> u32 {
        let hash = hasher_state().hash_one(key);
        (hash & (self.shards.len() as u64 - 1)) as u32
    }

    fn lock(&self, shard: u32) -> Option<MutexGuard<'_, Shard>> {
        self.shards.get(shard as usize).map(|s| s.lock())
    }

    fn lock_pair(&self, a: u32, b: u32) -> Option<ShardPair<'_>> {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let low = self.lock(low)?;
        let high = if high == low.index {
            None
        } else {
            Some(self.lock(high)?)
        };
        Some(ShardPair { low, high })
    }

    fn reconcile(&self, shard: &mut Shard, serial: u64, before: &Tracked, after: &Tracked) {
        shard.index_deps(serial, &before.deps, &after.deps);
        if before.live
            && !after.live
            && shard.keys.get(&before.key).is_some_and(|s| *s == serial)
        {
            shard.keys.remove(&before.key);
        }
        let vns_changed = before.src_vn != after.src_vn || before.dst_vn != after.dst_vn;
        if before.live && (!after.live || vns_changed) {
            self.vn_counters.account(before.src_vn, before.dst_vn, false);
        }
        if after.live && (!before.live || vns_changed) {
            self.vn_counters.account(after.src_vn, after.dst_vn, true);
        }
        match (before.live, after.live) {
            (false, true) => {
                self.active.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                self.active.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Look up the live entry for `key`.
    #[must_use]
    pub fn find(&self, key: &FlowKey) -> Option<FlowId> {
        let shard_index = self.shard_of(key);
        let shard = self.lock(shard_index)?;
        shard
            .keys
            .get(key)
            .map(|serial| FlowId::new(shard_index, *serial))
    }

    /// Return the live entry for `key`, creating it with the verdict produced by `data` if there
    /// is none. An existing entry is returned untouched and `data` is not called.
    pub fn find_or_create(
        &self,
        key: FlowKey,
        now: Instant,
        data: impl FnOnce() -> FlowData,
    ) -> (FlowId, bool) {
        let index = self.shard_of(&key);
        let mut shard = self.shards[index as usize].lock();
        if let Some(serial) = shard.keys.get(&key) {
            return (FlowId::new(index, *serial), false);
        }
        let serial = shard.next_serial;
        shard.next_serial += 1;
        let id = FlowId::new(index, serial);
        let entry = FlowEntry::new(id, key, data(), now);
        let after = Tracked::of(&entry);
        shard.keys.insert(key, serial);
        shard.entries.insert(serial, entry);
        self.reconcile(&mut shard, serial, &Tracked::gone(key), &after);
        debug!("Created flow {id}: {key}");
        (id, true)
    }

    /// Run `f` on entry `id` and, if present, on `partner`, holding both shards.
    fn with_locked<R>(
        &self,
        id: FlowId,
        partner: Option<FlowId>,
        f: impl FnOnce(&mut FlowEntry, Option<&mut FlowEntry>) -> R,
    ) -> Result<R, FlowTableError> {
        let partner = partner.filter(|p| *p != id);
        let mut shards = self
            .lock_pair(id.shard, partner.map_or(id.shard, |p| p.shard))
            .ok_or(FlowTableError::NoSuchFlow(id))?;
        let mut other = partner.and_then(|p| shards.get(p.shard).entries.remove(&p.serial));
        let other_before = other.as_ref().map(Tracked::of);

        let Some(entry) = shards.get(id.shard).entries.get_mut(&id.serial) else {
            if let (Some(p), Some(o)) = (partner, other) {
                shards.get(p.shard).entries.insert(p.serial, o);
            }
            return Err(FlowTableError::NoSuchFlow(id));
        };
        let before = Tracked::of(entry);
        let result = f(entry, other.as_mut());
        let after = Tracked::of(entry);
        self.reconcile(shards.get(id.shard), id.serial, &before, &after);

        if let (Some(p), Some(o), Some(o_before)) = (partner, other, other_before) {
            let o_after = Tracked::of(&o);
            let shard = shards.get(p.shard);
            shard.entries.insert(p.serial, o);
            self.reconcile(shard, p.serial, &o_before, &o_after);
        }
        Ok(result)
    }

    /// Read entry `id`. Returns `None` if it is not in the table.
    pub fn with_entry<R>(&self, id: FlowId, f: impl FnOnce(&FlowEntry) -> R) -> Option<R> {
        let shard = self.lock(id.shard)?;
        shard.entries.get(&id.serial).map(f)
    }

    /// Mutate entry `id`. Key mapping, VN counters and dependency index follow the change.
    ///
    /// # Errors
    ///
    /// Returns [`FlowTableError::NoSuchFlow`] if the entry is not in the table.
    pub fn with_entry_mut<R>(
        &self,
        id: FlowId,
        f: impl FnOnce(&mut FlowEntry) -> R,
    ) -> Result<R, FlowTableError> {
        self.with_locked(id, None, |entry, _| f(entry))
    }

    /// Mutate entry `id` together with its reverse, if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`FlowTableError::NoSuchFlow`] if the entry is not in the table.
    pub fn with_pair_mut<R>(
        &self,
        id: FlowId,
        f: impl FnOnce(&mut FlowEntry, Option<&mut FlowEntry>) -> R,
    ) -> Result<R, FlowTableError> {
        let partner = self
            .with_entry(id, FlowEntry::reverse)
            .ok_or(FlowTableError::NoSuchFlow(id))?;
        self.with_locked(id, partner, |entry, reverse| {
            let reverse = reverse.filter(|r| entry.reverse() == Some(r.id()));
            f(entry, reverse)
        })
    }

    /// Make `a` and `b` the reverse of each other.
    ///
    /// # Errors
    ///
    /// Fails without changing anything if either entry is missing or deleted, or already linked
    /// to another partner.
    pub fn link_reverse(&self, a: FlowId, b: FlowId) -> Result<(), FlowTableError> {
        self.link(a, b, false)
    }

    /// Make `reverse` the reverse half of `forward`: link them and flag `reverse` as the
    /// reverse flow of the pair, under the locks of both entries.
    ///
    /// # Errors
    ///
    /// Fails without changing anything, as [`FlowTable::link_reverse`] does.
    pub fn link_forward(&self, forward: FlowId, reverse: FlowId) -> Result<(), FlowTableError> {
        self.link(forward, reverse, true)
    }

    fn link(&self, a: FlowId, b: FlowId, mark_reverse: bool) -> Result<(), FlowTableError> {
        if a == b {
            return Err(FlowTableError::AlreadyLinked {
                flow: a,
                partner: a,
                requested: b,
            });
        }
        let result = self
            .with_locked(a, Some(b), |ea, eb| {
                let Some(eb) = eb else {
                    return Err(FlowTableError::NoSuchFlow(b));
                };
                for entry in [&*ea, &*eb] {
                    if entry.is_deleted() {
                        return Err(FlowTableError::FlowDeleted(entry.id()));
                    }
                }
                if let Some(partner) = ea.reverse()
                    && partner != b
                {
                    return Err(FlowTableError::AlreadyLinked {
                        flow: a,
                        partner,
                        requested: b,
                    });
                }
                if let Some(partner) = eb.reverse()
                    && partner != a
                {
                    return Err(FlowTableError::AlreadyLinked {
                        flow: b,
                        partner,
                        requested: a,
                    });
                }
                ea.set_reverse(Some(b));
                eb.set_reverse(Some(a));
                if mark_reverse {
                    eb.set_reverse_flow(true);
                }
                Ok(())
            })
            .and_then(|r| r);
        if let Err(e) = &result {
            warn!("Cannot link flows {a} and {b}: {e}");
        }
        result
    }

    /// Break the pair `id` is part of. Returns the former partner.
    ///
    /// # Errors
    ///
    /// Returns [`FlowTableError::NoSuchFlow`] if the entry is not in the table.
    pub fn unlink(&self, id: FlowId) -> Result<Option<FlowId>, FlowTableError> {
        self.with_pair_mut(id, |entry, reverse| {
            if let Some(reverse) = reverse {
                reverse.set_reverse(None);
            }
            let partner = entry.reverse();
            entry.set_reverse(None);
            partner
        })
    }

    /// Delete entry `id` and its reverse. Deleted entries leave the key mapping at once and
    /// are kept in the arena until purged. Deleting an already deleted entry does nothing.
    ///
    /// Returns the entries that this call marked deleted.
    ///
    /// # Errors
    ///
    /// Returns [`FlowTableError::NoSuchFlow`] if the entry is not in the table.
    pub fn delete(&self, id: FlowId) -> Result<Vec<FlowId>, FlowTableError> {
        let deleted = self.with_pair_mut(id, |entry, reverse| {
            let mut deleted = vec![];
            if entry.mark_deleted() {
                deleted.push(entry.id());
            }
            if let Some(reverse) = reverse
                && reverse.mark_deleted()
            {
                deleted.push(reverse.id());
            }
            deleted
        })?;
        if !deleted.is_empty() {
            debug!("Deleted flows {deleted:?}");
        }
        Ok(deleted)
    }

    /// Remove entry `id` from the arena for good. A partner still pointing to it is unlinked.
    ///
    /// # Errors
    ///
    /// Returns [`FlowTableError::NoSuchFlow`] if the entry is not in the table.
    pub fn purge(&self, id: FlowId) -> Result<FlowEntry, FlowTableError> {
        self.with_pair_mut(id, |_, reverse| {
            if let Some(reverse) = reverse {
                reverse.set_reverse(None);
            }
        })?;
        let mut shard = self.lock(id.shard).ok_or(FlowTableError::NoSuchFlow(id))?;
        let entry = shard
            .entries
            .remove(&id.serial)
            .ok_or(FlowTableError::NoSuchFlow(id))?;
        let before = Tracked::of(&entry);
        self.reconcile(&mut shard, id.serial, &before, &Tracked::gone(*entry.key()));
        debug!("Purged flow {id}");
        Ok(entry)
    }

    /// Number of live entries.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Number of entries in the arenas, deleted ones not yet purged included.
    #[must_use]
    pub fn slots(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    #[must_use]
    pub fn flows_for_vn(&self, vn: VnId) -> VnFlowCounters {
        self.vn_counters.get(vn)
    }

    /// Live entries that registered a dependency on `dep`.
    #[must_use]
    pub fn dependents(&self, dep: &DepKey) -> Vec<FlowId> {
        let mut ids = vec![];
        for shard in &self.shards {
            let shard = shard.lock();
            if let Some(serials) = shard.deps.get(dep) {
                ids.extend(serials.iter().map(|s| FlowId::new(shard.index, *s)));
            }
        }
        ids
    }

    /// Live entries matching `pred`. Shards are visited one at a time.
    pub fn select(&self, pred: impl Fn(&FlowEntry) -> bool) -> Vec<FlowId> {
        let mut ids = vec![];
        for shard in &self.shards {
            let shard = shard.lock();
            ids.extend(
                shard
                    .entries
                    .values()
                    .filter(|e| !e.is_deleted() && pred(e))
                    .map(FlowEntry::id),
            );
        }
        ids.sort_unstable();
        ids
    }

    /// All entries in the arenas, deleted ones included.
    #[must_use]
    pub fn ids(&self) -> Vec<FlowId> {
        let mut ids = vec![];
        for shard in &self.shards {
            let shard = shard.lock();
            ids.extend(shard.entries.keys().map(|s| FlowId::new(shard.index, *s)));
        }
        ids.sort_unstable();
        ids
    }

    /// Introspection records of the live entries, ordered by key.
    #[must_use]
    pub fn dump(&self, now: Instant) -> Vec<FlowRecord> {
        let mut records = vec![];
        for shard in &self.shards {
            let shard = shard.lock();
            records.extend(
                shard
                    .entries
                    .values()
                    .filter(|e| !e.is_deleted())
                    .map(|e| FlowRecord::new(e, now)),
            );
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::IpNumber;
    use flow_info::{FlowFlags, NhId, PacketInfo, ShortReason, VrfId};
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr};
    use tracing_test::traced_test;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn data(key: FlowKey, src_vn: u32, dst_vn: u32) -> FlowData {
        let mut data = FlowData::new(PacketInfo::new(key, VrfId(1)).with_vn(VnId(src_vn)));
        data.dst_vn = Some(VnId(dst_vn));
        data.add_dep(DepKey::Vrf(VrfId(1)));
        data
    }

    fn pair(table: &FlowTable) -> (FlowId, FlowId) {
        let now = Instant::now();
        let fkey = FlowKey::icmp(NhId(1), ip("1.1.1.1"), ip("1.1.1.2"), 7);
        let rkey = fkey.mirror(NhId(2));
        let (f, _) = table.find_or_create(fkey, now, || data(fkey, 1, 2));
        let (r, _) = table.find_or_create(rkey, now, || data(rkey, 2, 1));
        table.link_reverse(f, r).unwrap();
        (f, r)
    }

    #[test]
    fn shard_count_must_be_power_of_two() {
        assert_eq!(
            FlowTable::new(3).unwrap_err(),
            FlowTableError::InvalidShardCount(3)
        );
        assert!(FlowTable::new(0).is_err());
        assert_eq!(FlowTable::new(8).unwrap().shard_count(), 8);
    }

    #[test]
    fn duplicate_creation_returns_the_existing_entry() {
        let table = FlowTable::new(4).unwrap();
        let key = FlowKey::tcp(NhId(1), ip("1.1.1.1"), ip("1.1.1.2"), 1000, 80);
        let (id, created) = table.find_or_create(key, Instant::now(), || data(key, 1, 2));
        assert!(created);
        let (again, created) = table.find_or_create(key, Instant::now(), || {
            panic!("verdict recomputed for a duplicate")
        });
        assert!(!created);
        assert_eq!(again, id);
        assert_eq!(table.count(), 1);
        assert_eq!(table.find(&key), Some(id));
        assert_eq!(
            table.with_entry(id, |e| e.data().dst_vn),
            Some(Some(VnId(2)))
        );
    }

    #[test]
    #[traced_test]
    fn link_refuses_a_second_partner() {
        let table = FlowTable::new(4).unwrap();
        let (f, r) = pair(&table);
        assert_eq!(table.with_entry(f, FlowEntry::reverse), Some(Some(r)));
        assert_eq!(table.with_entry(r, FlowEntry::reverse), Some(Some(f)));
        // relinking the same pair is fine
        table.link_reverse(r, f).unwrap();

        let other = FlowKey::udp(NhId(3), ip("2.2.2.2"), ip("1.1.1.1"), 53, 53);
        let (o, _) = table.find_or_create(other, Instant::now(), || data(other, 2, 1));
        assert_eq!(
            table.link_reverse(o, f),
            Err(FlowTableError::AlreadyLinked {
                flow: f,
                partner: r,
                requested: o
            })
        );
        assert_eq!(table.with_entry(f, FlowEntry::reverse), Some(Some(r)));
        assert_eq!(table.with_entry(o, FlowEntry::reverse), Some(None));
        assert!(logs_contain("Cannot link flows"));
    }

    #[test]
    fn link_forward_flags_the_reverse_half() {
        let table = FlowTable::new(4).unwrap();
        let now = Instant::now();
        let fkey = FlowKey::tcp(NhId(1), ip("1.1.1.1"), ip("1.1.1.2"), 1000, 80);
        let rkey = fkey.mirror(NhId(2));
        let (f, _) = table.find_or_create(fkey, now, || data(fkey, 1, 2));
        let (r, _) = table.find_or_create(rkey, now, || data(rkey, 2, 1));
        table.link_forward(f, r).unwrap();
        assert_eq!(table.with_entry(r, FlowEntry::is_reverse_flow), Some(true));
        assert_eq!(table.with_entry(f, FlowEntry::is_reverse_flow), Some(false));

        // a failed link leaves the would-be reverse untouched
        let other = FlowKey::udp(NhId(3), ip("2.2.2.2"), ip("1.1.1.1"), 53, 53);
        let (o, _) = table.find_or_create(other, now, || data(other, 2, 1));
        table.delete(f).unwrap();
        assert_eq!(table.link_forward(f, o), Err(FlowTableError::FlowDeleted(f)));
        assert_eq!(table.with_entry(o, FlowEntry::is_reverse_flow), Some(false));
        assert_eq!(table.with_entry(o, FlowEntry::reverse), Some(None));
    }

    #[test]
    fn delete_takes_the_pair_and_is_idempotent() {
        let table = FlowTable::new(4).unwrap();
        let (f, r) = pair(&table);
        assert_eq!(table.count(), 2);
        assert_eq!(
            table.flows_for_vn(VnId(1)),
            VnFlowCounters {
                ingress: 1,
                egress: 1
            }
        );
        assert_eq!(table.dependents(&DepKey::Vrf(VrfId(1))).len(), 2);

        let deleted = table.delete(r).unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(deleted.contains(&f));
        assert_eq!(table.count(), 0);
        assert!(table.delete(f).unwrap().is_empty());
        assert_eq!(table.flows_for_vn(VnId(1)), VnFlowCounters::default());
        assert!(table.dependents(&DepKey::Vrf(VrfId(1))).is_empty());
        assert!(table.dump(Instant::now()).is_empty());

        // slots stay until purged, and deleted entries cannot be linked
        assert_eq!(table.slots(), 2);
        assert_eq!(
            table.link_reverse(f, r),
            Err(FlowTableError::FlowDeleted(f))
        );
        table.purge(f).unwrap();
        assert_eq!(table.with_entry(r, FlowEntry::reverse), Some(None));
        table.purge(r).unwrap();
        assert_eq!(table.slots(), 0);
        assert_eq!(table.purge(r).unwrap_err(), FlowTableError::NoSuchFlow(r));
    }

    #[test]
    fn key_is_reusable_after_delete() {
        let table = FlowTable::new(2).unwrap();
        let (f, _) = pair(&table);
        let key = table.with_entry(f, |e| *e.key()).unwrap();
        table.delete(f).unwrap();
        assert_eq!(table.find(&key), None);
        let (again, created) = table.find_or_create(key, Instant::now(), || data(key, 1, 2));
        assert!(created);
        assert_ne!(again, f);
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn mutations_update_index_and_counters() {
        let table = FlowTable::new(4).unwrap();
        let (f, r) = pair(&table);
        let dep = DepKey::Acl(flow_info::AclId(9));
        table
            .with_entry_mut(f, |e| {
                let mut data = e.data().clone();
                data.dst_vn = Some(VnId(3));
                data.add_dep(dep.clone());
                assert!(e.update_data(data));
            })
            .unwrap();
        assert_eq!(table.dependents(&dep), vec![f]);
        assert_eq!(table.flows_for_vn(VnId(3)).ingress, 1);
        assert_eq!(table.flows_for_vn(VnId(2)).ingress, 0);
        assert_eq!(table.flows_for_vn(VnId(2)).egress, 1);

        table
            .with_pair_mut(f, |e, rev| {
                e.make_short(ShortReason::NoDstRoute);
                rev.unwrap().make_short(ShortReason::NoDstRoute);
            })
            .unwrap();
        assert!(table.with_entry(r, |e| e.flags().contains(FlowFlags::SHORT_FLOW)).unwrap());
        assert_eq!(table.with_entry(r, FlowEntry::generation), Some(2));
    }

    #[test]
    fn unlink_clears_both_sides() {
        let table = FlowTable::new(4).unwrap();
        let (f, r) = pair(&table);
        assert_eq!(table.unlink(r).unwrap(), Some(f));
        assert_eq!(table.with_entry(f, FlowEntry::reverse), Some(None));
        assert_eq!(table.delete(f).unwrap(), vec![f]);
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn select_and_dump_are_ordered() {
        let table = FlowTable::new(4).unwrap();
        let now = Instant::now();
        for port in (1000..1010).rev() {
            let key = FlowKey::tcp(NhId(1), ip("1.1.1.1"), ip("1.1.1.2"), port, 80);
            table.find_or_create(key, now, || data(key, 1, 2));
        }
        let records = table.dump(now);
        assert_eq!(records.len(), 10);
        assert!(records.windows(2).all(|w| w[0].key < w[1].key));
        assert_eq!(records[0].key.src_port, 1000);
        let selected = table.select(|e| e.key().src_port % 2 == 0);
        assert_eq!(selected.len(), 5);
        assert!(records[0].to_string().contains("VNs(vn-1->vn-2)"));
    }

    #[test]
    fn shard_selection_is_stable() {
        let table = std::panic::AssertUnwindSafe(FlowTable::new(8).unwrap());
        bolero::check!()
            .with_type::<([u8; 4], [u8; 4], u16, u16, bool)>()
            .for_each(|(src, dst, sport, dport, udp)| {
                let proto = if *udp { IpNumber::UDP } else { IpNumber::TCP };
                let key = FlowKey::new(
                    NhId(1),
                    IpAddr::V4(Ipv4Addr::from(*src)),
                    IpAddr::V4(Ipv4Addr::from(*dst)),
                    *sport,
                    *dport,
                    proto,
                );
                let shard = table.shard_of(&key);
                assert!(shard < 8);
                assert_eq!(table.shard_of(&key), shard);
            });
    }
}
