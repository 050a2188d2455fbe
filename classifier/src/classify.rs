// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Policy verdict of a flow: network policies of both VNs and security groups of both ends.

use flow_info::{
    DepKey, FlowAction, FlowData, FlowKey, InterfaceId, PolicyInfo, PolicyMatch, SgId, VnId,
    VrfId,
};
use tables::{RuleAction, TableSnapshot};
use tracing::debug;

use crate::acl::{AclOutcome, evaluate_acl};
use crate::sg::{SgOutcome, evaluate_sg};

/// What the classifier needs to know about a flow.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    /// Untranslated tuple.
    pub key: &'a FlowKey,
    pub src_vn: Option<VnId>,
    pub dst_vn: Option<VnId>,
    /// Local interface the flow originates from.
    pub src_interface: Option<InterfaceId>,
    /// Local interface the flow is delivered to.
    pub dst_interface: Option<InterfaceId>,
    /// Security groups of the source, used when the source interface is unknown to the tables.
    pub src_sgs: &'a [SgId],
    pub link_local: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVerdict {
    pub policy: PolicyInfo,
    pub action: FlowAction,
    pub vrf_translate: Option<VrfId>,
    pub deps: Vec<DepKey>,
}

impl PolicyVerdict {
    fn sentinel(matched: PolicyMatch) -> Self {
        Self {
            policy: PolicyInfo {
                acl: matched,
                out_acl: matched,
                sg: matched,
            },
            action: FlowAction::PASS,
            vrf_translate: None,
            deps: vec![],
        }
    }

    #[must_use]
    pub fn is_drop(&self) -> bool {
        self.action.contains(FlowAction::DROP)
    }

    /// Record the verdict in `data`.
    pub fn apply(&self, data: &mut FlowData) {
        data.policy = self.policy;
        data.action = self.action;
        data.vrf_translate = self.vrf_translate;
        data.deps.extend(self.deps.iter().copied());
    }
}

fn rule_action_bits(action: Option<RuleAction>) -> FlowAction {
    let mut bits = FlowAction::empty();
    if let Some(action) = action {
        bits.set(FlowAction::LOG, action.log);
        bits.set(FlowAction::ALERT, action.alert);
    }
    bits
}

/// Stateless policy resolution over one snapshot of the tables.
///
/// Classifying the same input twice over the same snapshot yields the same verdict: a
/// revaluation is a fresh classification.
pub struct Classifier<'a> {
    snapshot: &'a TableSnapshot,
}

impl<'a> Classifier<'a> {
    #[must_use]
    pub fn new(snapshot: &'a TableSnapshot) -> Self {
        Self { snapshot }
    }

    fn policy_enabled(&self, interface: Option<InterfaceId>) -> bool {
        interface
            .and_then(|id| self.snapshot.interface(id))
            .is_none_or(|i| i.policy_enabled)
    }

    fn vn_acl(&self, vn: Option<VnId>, deps: &mut Vec<DepKey>) -> Option<&'a tables::Acl> {
        let vn = self.snapshot.vn(vn?)?;
        let id = vn.acl?;
        deps.push(DepKey::Acl(id));
        self.snapshot.acl(id)
    }

    /// Network policies of the source VN and, when different, of the destination VN.
    fn evaluate_acls(
        &self,
        input: &ClassifyInput<'_>,
        deps: &mut Vec<DepKey>,
    ) -> (AclOutcome, AclOutcome) {
        let acl = self.vn_acl(input.src_vn, deps);
        let outcome = evaluate_acl(acl, input.key, input.src_vn, input.dst_vn);
        if input.dst_vn == input.src_vn {
            return (outcome, outcome);
        }
        let out_acl = self.vn_acl(input.dst_vn, deps);
        let out = evaluate_acl(out_acl, input.key, input.src_vn, input.dst_vn);
        (outcome, out)
    }

    fn evaluate_sgs(
        &self,
        input: &ClassifyInput<'_>,
        deps: &mut Vec<DepKey>,
    ) -> (PolicyMatch, bool) {
        let src_iface = input.src_interface.and_then(|id| self.snapshot.interface(id));
        let egress_sgs: &[SgId] = match src_iface {
            Some(i) if !i.policy_enabled => &[],
            Some(i) => &i.sgs,
            None => input.src_sgs,
        };
        let dst_iface = input.dst_interface.and_then(|id| self.snapshot.interface(id));
        let ingress_sgs: &[SgId] = match dst_iface {
            Some(i) if i.policy_enabled => &i.sgs,
            _ => &[],
        };
        deps.extend(egress_sgs.iter().chain(ingress_sgs).map(|id| DepKey::Sg(*id)));

        let egress = evaluate_sg(
            self.snapshot,
            egress_sgs,
            true,
            input.key,
            input.src_vn,
            input.dst_vn,
        );
        let ingress = evaluate_sg(
            self.snapshot,
            ingress_sgs,
            false,
            input.key,
            input.src_vn,
            input.dst_vn,
        );
        match (egress, ingress) {
            (SgOutcome::NotAttached, SgOutcome::NotAttached) => (PolicyMatch::NotEvaluated, true),
            (SgOutcome::NoMatch, _) | (_, SgOutcome::NoMatch) => {
                (PolicyMatch::ImplicitDeny, false)
            }
            (SgOutcome::Pass(rule), _) | (SgOutcome::NotAttached, SgOutcome::Pass(rule)) => {
                (PolicyMatch::Rule(rule), true)
            }
        }
    }

    fn special_category(input: &ClassifyInput<'_>) -> Option<PolicyMatch> {
        if input.key.is_multicast() {
            Some(PolicyMatch::Multicast)
        } else if input.link_local {
            Some(PolicyMatch::LinkLocal)
        } else {
            None
        }
    }

    fn common_deps(input: &ClassifyInput<'_>) -> Vec<DepKey> {
        let mut deps = vec![];
        deps.extend(input.src_vn.map(DepKey::Vn));
        deps.extend(input.dst_vn.map(DepKey::Vn));
        deps.extend(input.src_interface.map(DepKey::Interface));
        deps.extend(input.dst_interface.map(DepKey::Interface));
        deps
    }

    fn assemble(
        acl: AclOutcome,
        out_acl: AclOutcome,
        sg: PolicyMatch,
        sg_pass: bool,
        deps: Vec<DepKey>,
    ) -> PolicyVerdict {
        let pass = acl.pass && out_acl.pass && sg_pass;
        let mut action = rule_action_bits(acl.action) | rule_action_bits(out_acl.action);
        let vrf_translate = acl
            .action
            .and_then(|a| a.vrf_translate)
            .or_else(|| out_acl.action.and_then(|a| a.vrf_translate))
            .filter(|_| pass);
        if pass {
            action |= FlowAction::PASS;
            if vrf_translate.is_some() {
                action |= FlowAction::VRF_TRANSLATE;
            }
        } else {
            action |= FlowAction::DROP;
        }
        PolicyVerdict {
            policy: PolicyInfo {
                acl: acl.matched,
                out_acl: out_acl.matched,
                sg,
            },
            action,
            vrf_translate,
            deps,
        }
    }

    /// Classify a forward flow.
    #[must_use]
    pub fn classify(&self, input: &ClassifyInput<'_>) -> PolicyVerdict {
        let mut deps = Self::common_deps(input);
        if let Some(sentinel) = Self::special_category(input) {
            let mut verdict = PolicyVerdict::sentinel(sentinel);
            verdict.deps = deps;
            return verdict;
        }
        if !self.policy_enabled(input.src_interface) {
            let mut verdict = PolicyVerdict::sentinel(PolicyMatch::ImplicitAllow);
            verdict.policy.sg = PolicyMatch::NotEvaluated;
            verdict.deps = deps;
            return verdict;
        }
        let (acl, out_acl) = self.evaluate_acls(input, &mut deps);
        let (sg, sg_pass) = self.evaluate_sgs(input, &mut deps);
        let verdict = Self::assemble(acl, out_acl, sg, sg_pass, deps);
        debug!(
            "{}: acl {} out-acl {} sg {} -> {}",
            input.key,
            verdict.policy.acl,
            verdict.policy.out_acl,
            verdict.policy.sg,
            verdict.action
        );
        verdict
    }

    /// Classify the reverse half of a pair. `input` describes the reverse direction with the
    /// untranslated tuple; security groups are stateful and the verdict of the forward flow
    /// applies. A dropped forward flow drops the reverse one too.
    #[must_use]
    pub fn classify_reverse(
        &self,
        input: &ClassifyInput<'_>,
        forward: &PolicyVerdict,
    ) -> PolicyVerdict {
        let mut deps = Self::common_deps(input);
        if let Some(sentinel) = Self::special_category(input) {
            let mut verdict = PolicyVerdict::sentinel(sentinel);
            verdict.deps = deps;
            return verdict;
        }
        let (acl, out_acl) = if self.policy_enabled(input.src_interface) {
            self.evaluate_acls(input, &mut deps)
        } else {
            (AclOutcome::IMPLICIT_ALLOW, AclOutcome::IMPLICIT_ALLOW)
        };
        Self::assemble(acl, out_acl, forward.policy.sg, !forward.is_drop(), deps)
    }
}
