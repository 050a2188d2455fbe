// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Security group evaluation for one direction of one endpoint.

use flow_info::{FlowKey, SgId, VnId};
use tables::{TableSnapshot, Verdict};
use uuid::Uuid;

use crate::acl::rule_matches;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgOutcome {
    /// No security group applies to this direction.
    NotAttached,
    Pass(Uuid),
    /// Security groups are attached but none of their rules lets the flow through.
    NoMatch,
}

/// Evaluate the egress (or ingress) rules of the security groups `sgs` over `key`.
///
/// Groups are tried in list order and rules in declaration order; the first passing rule is
/// reported. Groups unknown to the tables are ignored.
#[must_use]
pub fn evaluate_sg(
    snapshot: &TableSnapshot,
    sgs: &[SgId],
    egress: bool,
    key: &FlowKey,
    src_vn: Option<VnId>,
    dst_vn: Option<VnId>,
) -> SgOutcome {
    let mut attached = false;
    for sg in sgs.iter().filter_map(|id| snapshot.sg(*id)) {
        attached = true;
        let rules = if egress { &sg.egress } else { &sg.ingress };
        if let Some(rule) = rules.iter().find(|r| {
            r.action.verdict == Verdict::Pass && rule_matches(r, key, src_vn, dst_vn)
        }) {
            return SgOutcome::Pass(rule.uuid);
        }
    }
    if attached {
        SgOutcome::NoMatch
    } else {
        SgOutcome::NotAttached
    }
}
