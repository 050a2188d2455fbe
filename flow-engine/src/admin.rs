// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Administrative deletions and read-only queries.

use flow_info::{FlowEntry, FlowId, InterfaceId, VnId, VrfId};
use flow_table::{FlowRecord, VnFlowCounters};
use std::net::IpAddr;
use std::time::Instant;
use tracing::{debug, info};

use crate::context::{FlowEngine, pair_head};
use crate::errors::EngineError;
use crate::path_preference::TrafficSeen;

/// The pairs an administrative deletion applies to. A pair matches if either half does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSelector {
    All,
    /// Pairs entering or leaving through an interface.
    Interface(InterfaceId),
    /// Pairs with a half in a VRF.
    Vrf(VrfId),
}

impl FlowSelector {
    fn matches(self, entry: &FlowEntry) -> bool {
        let data = entry.data();
        match self {
            FlowSelector::All => true,
            FlowSelector::Interface(interface) => {
                data.in_interface == Some(interface) || data.out_interface == Some(interface)
            }
            FlowSelector::Vrf(vrf) => {
                data.origin.vrf == vrf || data.src_vrf == vrf || data.dst_vrf == vrf
            }
        }
    }
}

impl FlowEngine {
    /// Delete the pair flow `id` belongs to.
    ///
    /// # Errors
    ///
    /// Fails if the flow is not in the table.
    pub fn delete_flow(&self, id: FlowId, now: Instant) -> Result<usize, EngineError> {
        self.delete_pair(id, now)
    }

    /// Delete the pairs matching `selector`, among those handled by `shard` or in all shards.
    /// Returns the number of entries deleted.
    pub fn delete_selected(
        &self,
        selector: FlowSelector,
        shard: Option<u32>,
        now: Instant,
    ) -> usize {
        self.table
            .select(|e| selector.matches(e) && shard.is_none_or(|s| pair_head(e).shard == s))
            .into_iter()
            .map(|id| match self.delete_pair(id, now) {
                Ok(deleted) => deleted,
                Err(e) => {
                    debug!("Flow {id} already gone: {e}");
                    0
                }
            })
            .sum()
    }

    /// Delete every flow. Returns the number of entries deleted.
    pub fn flush_all(&self, now: Instant) -> usize {
        let deleted = self.delete_selected(FlowSelector::All, None, now);
        info!("Flushed {deleted} flows");
        deleted
    }

    /// Delete the pairs with a half entering or leaving through `interface`.
    pub fn delete_by_interface(&self, interface: InterfaceId, now: Instant) -> usize {
        let deleted = self.delete_selected(FlowSelector::Interface(interface), None, now);
        debug!("Deleted {deleted} flows of {interface}");
        deleted
    }

    /// Delete the pairs with a half in `vrf`.
    pub fn delete_by_vrf(&self, vrf: VrfId, now: Instant) -> usize {
        let deleted = self.delete_selected(FlowSelector::Vrf(vrf), None, now);
        debug!("Deleted {deleted} flows of {vrf}");
        deleted
    }

    #[must_use]
    pub fn flow_count(&self) -> u64 {
        self.table.count()
    }

    #[must_use]
    pub fn vn_flow_counters(&self, vn: VnId) -> VnFlowCounters {
        self.table.flows_for_vn(vn)
    }

    #[must_use]
    pub fn dump(&self, now: Instant) -> Vec<FlowRecord> {
        self.table.dump(now)
    }

    /// Hand a traffic seen observation over to path preference. Never blocks: the observation
    /// is dropped if the queue is full. Returns false if it was dropped.
    pub fn enqueue_traffic_seen(
        &self,
        ip: IpAddr,
        plen: u8,
        interface: InterfaceId,
        vrf: VrfId,
        mac: [u8; 6],
    ) -> bool {
        let queued = self.path_preference.enqueue(TrafficSeen {
            ip,
            plen,
            interface,
            vrf,
            mac,
        });
        if !queued {
            self.metrics.traffic_seen_dropped.increment(1);
        }
        queued
    }
}
