// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow creation: computation of the verdict of both halves of a pair, insertion and linkage.

use classifier::{ClassifyInput, Classifier, PolicyVerdict};
use flow_info::{
    FlowAction, FlowData, FlowEntry, FlowFlags, FlowId, FlowKey, PacketInfo, ShortReason,
};
use std::time::Instant;
use tables::TableSnapshot;
use tracing::{debug, warn};

use crate::context::FlowEngine;

/// Settle the action once translation and policy are known.
fn finish_action(data: &mut FlowData) {
    if let Some(reason) = data.short_reason {
        // policy never overrides a short flow
        data.set_short(reason);
    } else if data.nat.is_some() && data.action.contains(FlowAction::PASS) {
        data.action |= FlowAction::NAT;
    }
}

impl FlowEngine {
    /// Verdict of the forward flow described by `origin`. `previous` is the current verdict
    /// when revaluating.
    pub(crate) fn compute_forward(
        &self,
        snapshot: &TableSnapshot,
        origin: PacketInfo,
        previous: Option<&FlowData>,
    ) -> (FlowData, PolicyVerdict) {
        let mut data = FlowData::new(origin);
        if let Err(error) = self.resolver.resolve(snapshot, &mut data, previous) {
            data.set_short(error.short_reason());
        }
        let verdict = Classifier::new(snapshot).classify(&ClassifyInput {
            key: &data.origin.key,
            src_vn: data.src_vn,
            dst_vn: data.dst_vn,
            src_interface: data.in_interface,
            dst_interface: data.out_interface,
            src_sgs: &data.origin.sg_list,
            link_local: data.flags.contains(FlowFlags::LINK_LOCAL),
        });
        verdict.apply(&mut data);
        finish_action(&mut data);
        (data, verdict)
    }

    /// Key and verdict of the reverse half of the forward flow `key`. The reverse ACL is
    /// evaluated on the mirror of the forward tuple as seen before translation.
    pub(crate) fn compute_reverse(
        snapshot: &TableSnapshot,
        key: &FlowKey,
        forward: &FlowData,
        verdict: &PolicyVerdict,
    ) -> Option<(FlowKey, FlowData)> {
        let (reverse_key, mut data) = nat::reverse_data(snapshot, key, forward)?;
        let mirrored = key.mirror(reverse_key.nh_id);
        let reverse_verdict = Classifier::new(snapshot).classify_reverse(
            &ClassifyInput {
                key: &mirrored,
                src_vn: data.src_vn,
                dst_vn: data.dst_vn,
                src_interface: data.in_interface,
                dst_interface: data.out_interface,
                src_sgs: &[],
                link_local: data.flags.contains(FlowFlags::LINK_LOCAL),
            },
            verdict,
        );
        reverse_verdict.apply(&mut data);
        finish_action(&mut data);
        Some((reverse_key, data))
    }

    /// Make `key` the reverse half of flow `forward`, creating it if needed.
    ///
    /// A live flow already holding the key is adopted if it has no partner. If it is paired with
    /// another flow, the forward flow becomes a short flow.
    pub(crate) fn attach_reverse(
        &self,
        forward: FlowId,
        key: FlowKey,
        data: FlowData,
        now: Instant,
    ) -> Option<FlowId> {
        let (reverse, created) = self.table.find_or_create(key, now, || data.clone());
        if created {
            self.metrics.created.increment(1);
        } else {
            match self.table.with_entry(reverse, FlowEntry::reverse).flatten() {
                Some(partner) if partner == forward => {}
                Some(partner) => {
                    warn!(
                        "Reverse {key} of flow {forward} is flow {reverse}, already paired with {partner}"
                    );
                    self.make_short(forward, ShortReason::NoReverseFlow);
                    return None;
                }
                None => {
                    debug!("Flow {reverse} becomes the reverse of flow {forward}");
                    let released = self.table.with_entry_mut(reverse, |e| {
                        let owned = if e.is_reverse_flow() {
                            None
                        } else {
                            e.data().nat
                        };
                        e.update_data(data);
                        owned
                    });
                    if let Ok(Some(nat)) = released {
                        self.resolver.release(&key, &nat);
                    }
                }
            }
        }
        if let Err(e) = self.table.link_forward(forward, reverse) {
            debug!("Flow {forward} left without reverse {reverse}: {e}");
            self.abandon_reverse(reverse, created, now);
            self.make_short(forward, ShortReason::NoReverseFlow);
            return None;
        }
        Some(reverse)
    }

    /// Dispose of `reverse` once it could not be linked to its forward flow. It carries a
    /// mirrored translation, so it is flagged as a reverse flow: its ports belong to no one. A
    /// flow created for the pair goes away; an adopted one is left to revaluation and aging.
    fn abandon_reverse(&self, reverse: FlowId, created: bool, now: Instant) {
        if let Err(e) = self
            .table
            .with_entry_mut(reverse, |e| e.set_reverse_flow(true))
        {
            debug!("Reverse flow {reverse} already gone: {e}");
            return;
        }
        if created && let Err(e) = self.delete_pair(reverse, now) {
            warn!("Cannot delete unlinked reverse flow {reverse}: {e}");
        }
    }

    pub(crate) fn make_short(&self, id: FlowId, reason: ShortReason) -> bool {
        let converted = self
            .table
            .with_entry_mut(id, |e| e.make_short(reason))
            .unwrap_or(false);
        if converted {
            self.metrics.short.increment(1);
        }
        converted
    }

    /// Handle the first packet of a flow: compute the verdict of the pair, insert and link both
    /// halves and install them. A packet for a flow that already exists leaves it untouched.
    ///
    /// Returns the forward flow.
    pub fn process_packet(&self, packet: PacketInfo, now: Instant) -> FlowId {
        let key = packet.key;
        if let Some(id) = self.table.find(&key) {
            debug!("Flow {key} already exists as {id}");
            return id;
        }
        let snapshot = self.tables.snapshot();
        let max_flows = u64::try_from(self.config.max_flows).unwrap_or(u64::MAX);
        let (data, verdict) = if self.table.count() >= max_flows {
            let mut data = FlowData::new(packet);
            data.set_short(ShortReason::FlowLimit);
            (data, None)
        } else {
            let (data, verdict) = self.compute_forward(&snapshot, packet, None);
            (data, Some(verdict))
        };

        let (id, created) = self.table.find_or_create(key, now, || data.clone());
        if !created {
            if let Some(nat) = &data.nat {
                self.resolver.release(&key, nat);
            }
            return id;
        }
        self.metrics.created.increment(1);
        if data.is_short() {
            self.metrics.short.increment(1);
        }

        let reverse = verdict
            .and_then(|verdict| Self::compute_reverse(&snapshot, &key, &data, &verdict))
            .and_then(|(reverse_key, reverse_data)| {
                self.attach_reverse(id, reverse_key, reverse_data, now)
            });
        self.sync(id, now);
        if let Some(reverse) = reverse {
            self.sync(reverse, now);
        }
        self.update_active();
        debug!(
            "New flow {id} {key}: {} reverse {reverse:?}",
            data.action
        );
        id
    }
}
