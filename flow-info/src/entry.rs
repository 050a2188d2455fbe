// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The mutable flow record.

use std::fmt::Display;
use std::time::Instant;

use crate::data::FlowData;
use crate::flags::{FlowAction, FlowFlags, ShortReason};
use crate::key::FlowKey;

/// Stable identifier of a flow entry: the shard that owns it and a serial number that is
/// never reused within that shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId {
    pub shard: u32,
    pub serial: u64,
}

impl FlowId {
    #[must_use]
    pub const fn new(shard: u32, serial: u64) -> Self {
        Self { shard, serial }
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.shard, self.serial)
    }
}

/// Index of a flow in the forwarding plane flow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KSyncHandle(pub u32);

impl Display for KSyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw counters of a flow as reported by the forwarding plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowCounters {
    pub packets: u64,
    pub bytes: u64,
}

/// Counters of a flow as last seen by the aging sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowStats {
    pub counters: FlowCounters,
    pub last_traffic: Instant,
}

impl FlowStats {
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            counters: FlowCounters::default(),
            last_traffic: now,
        }
    }

    /// Record a counter reading. Returns true if the flow saw traffic since the previous one.
    pub fn observe(&mut self, counters: FlowCounters, now: Instant) -> bool {
        if counters == self.counters {
            return false;
        }
        self.counters = counters;
        self.last_traffic = now;
        true
    }
}

#[derive(Debug, Clone)]
pub struct FlowEntry {
    id: FlowId,
    key: FlowKey,
    reverse: Option<FlowId>,
    data: FlowData,
    lifecycle: FlowFlags,
    generation: u64,
    handle: Option<KSyncHandle>,
    pub stats: FlowStats,
    created_at: Instant,
}

impl FlowEntry {
    #[must_use]
    pub fn new(id: FlowId, key: FlowKey, data: FlowData, now: Instant) -> Self {
        Self {
            id,
            key,
            reverse: None,
            data,
            lifecycle: FlowFlags::empty(),
            generation: 1,
            handle: None,
            stats: FlowStats::new(now),
            created_at: now,
        }
    }

    #[must_use]
    pub fn id(&self) -> FlowId {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    #[must_use]
    pub fn reverse(&self) -> Option<FlowId> {
        self.reverse
    }

    /// Set the reverse reference. The flow table is in charge of keeping pairs mutual.
    pub fn set_reverse(&mut self, reverse: Option<FlowId>) {
        self.reverse = reverse;
    }

    #[must_use]
    pub fn data(&self) -> &FlowData {
        &self.data
    }

    /// Replace the verdict of the flow. Returns true, and bumps the generation, if it changed.
    pub fn update_data(&mut self, data: FlowData) -> bool {
        if self.data == data {
            return false;
        }
        self.data = data;
        self.generation += 1;
        true
    }

    /// Convert the flow to a short flow. Returns false if it already was one.
    pub fn make_short(&mut self, reason: ShortReason) -> bool {
        if self.data.is_short() {
            return false;
        }
        self.data.set_short(reason);
        self.generation += 1;
        true
    }

    #[must_use]
    pub fn flags(&self) -> FlowFlags {
        self.data.flags | self.lifecycle
    }

    #[must_use]
    pub fn action(&self) -> FlowAction {
        self.data.action
    }

    #[must_use]
    pub fn short_reason(&self) -> Option<ShortReason> {
        self.data.short_reason
    }

    #[must_use]
    pub fn is_short_flow(&self) -> bool {
        self.data.is_short()
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.lifecycle.contains(FlowFlags::DELETED)
    }

    #[must_use]
    pub fn is_reverse_flow(&self) -> bool {
        self.lifecycle.contains(FlowFlags::REVERSE_FLOW)
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.lifecycle.contains(FlowFlags::PENDING_KSYNC_OP)
    }

    /// Mark the entry deleted. Returns false if it already was.
    pub fn mark_deleted(&mut self) -> bool {
        if self.is_deleted() {
            return false;
        }
        self.lifecycle |= FlowFlags::DELETED;
        true
    }

    pub fn set_reverse_flow(&mut self, reverse: bool) {
        self.lifecycle.set(FlowFlags::REVERSE_FLOW, reverse);
    }

    pub fn set_pending(&mut self, pending: bool) {
        self.lifecycle.set(FlowFlags::PENDING_KSYNC_OP, pending);
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn handle(&self) -> Option<KSyncHandle> {
        self.handle
    }

    /// Adopt a forwarding-plane handle. Counters restart from zero on a new handle.
    pub fn set_handle(&mut self, handle: Option<KSyncHandle>) {
        if self.handle != handle {
            self.stats.counters = FlowCounters::default();
        }
        self.handle = handle;
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}
