// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use ahash::RandomState;
use dashmap::DashMap;
use flow_info::VnId;

/// Live flows of a virtual network. `egress` counts flows sourced in the VN, `ingress` flows
/// destined to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VnFlowCounters {
    pub ingress: u64,
    pub egress: u64,
}

#[derive(Debug, Default)]
pub(crate) struct VnCounterMap(DashMap<VnId, VnFlowCounters, RandomState>);

impl VnCounterMap {
    pub(crate) fn get(&self, vn: VnId) -> VnFlowCounters {
        self.0.get(&vn).map(|c| *c).unwrap_or_default()
    }

    fn adjust(&self, vn: VnId, f: impl FnOnce(&mut VnFlowCounters)) {
        let mut counters = self.0.entry(vn).or_default();
        f(&mut *counters);
        if *counters == VnFlowCounters::default() {
            drop(counters);
            self.0.remove_if(&vn, |_, c| *c == VnFlowCounters::default());
        }
    }

    /// Account for a live flow, `add` false to withdraw it.
    pub(crate) fn account(&self, src_vn: Option<VnId>, dst_vn: Option<VnId>, add: bool) {
        let step = |value: &mut u64| {
            *value = if add {
                value.saturating_add(1)
            } else {
                value.saturating_sub(1)
            };
        };
        if let Some(vn) = src_vn {
            self.adjust(vn, |c| step(&mut c.egress));
        }
        if let Some(vn) = dst_vn {
            self.adjust(vn, |c| step(&mut c.ingress));
        }
    }

    pub(crate) fn clear(&self) {
        self.0.clear();
    }
}
