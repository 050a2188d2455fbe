// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! First-match ACL evaluation.

use flow_info::{FlowKey, PolicyMatch, VnId};
use std::net::IpAddr;
use tables::{Acl, AclRule, AddrMatch, RuleAction, Verdict};
use tracing::trace;

fn addr_matches(m: &AddrMatch, addr: IpAddr, vn: Option<VnId>) -> bool {
    match m {
        AddrMatch::Any => true,
        AddrMatch::Vn(id) => vn == Some(*id),
        AddrMatch::Cidr {
            subnet,
            subnet_list,
        } => {
            subnet.is_some_and(|net| net.contains(&addr))
                || subnet_list.iter().any(|net| net.contains(&addr))
        }
    }
}

/// True if `rule` matches the tuple of `key`, the source being in `src_vn` and the
/// destination in `dst_vn`.
#[must_use]
pub fn rule_matches(
    rule: &AclRule,
    key: &FlowKey,
    src_vn: Option<VnId>,
    dst_vn: Option<VnId>,
) -> bool {
    if rule.proto.is_some_and(|p| p != key.proto) {
        return false;
    }
    // ICMP flows carry no ports
    if !key.is_icmp()
        && (!rule.src_ports.contains(&key.src_port) || !rule.dst_ports.contains(&key.dst_port))
    {
        return false;
    }
    addr_matches(&rule.src, key.src, src_vn) && addr_matches(&rule.dst, key.dst, dst_vn)
}

/// Result of evaluating one ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclOutcome {
    pub matched: PolicyMatch,
    /// Action of the matched rule, `None` for implicit verdicts.
    pub action: Option<RuleAction>,
    pub pass: bool,
}

impl AclOutcome {
    pub(crate) const IMPLICIT_ALLOW: AclOutcome = AclOutcome {
        matched: PolicyMatch::ImplicitAllow,
        action: None,
        pass: true,
    };
}

/// Evaluate `acl` over `key`. The first matching rule wins; with no match the default policy
/// of the ACL applies. A missing ACL allows everything.
#[must_use]
pub fn evaluate_acl(
    acl: Option<&Acl>,
    key: &FlowKey,
    src_vn: Option<VnId>,
    dst_vn: Option<VnId>,
) -> AclOutcome {
    let Some(acl) = acl else {
        return AclOutcome::IMPLICIT_ALLOW;
    };
    if let Some(rule) = acl
        .rules
        .iter()
        .find(|r| rule_matches(r, key, src_vn, dst_vn))
    {
        trace!("{key} matches rule {} of {}", rule.uuid, acl.id);
        return AclOutcome {
            matched: PolicyMatch::Rule(rule.uuid),
            action: Some(rule.action),
            pass: rule.action.verdict == Verdict::Pass,
        };
    }
    if acl.default_allow {
        AclOutcome::IMPLICIT_ALLOW
    } else {
        AclOutcome {
            matched: PolicyMatch::ImplicitDeny,
            action: None,
            pass: false,
        }
    }
}
