// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Derivation of the reverse half of a pair from the forward decision.

use flow_info::{DepKey, FlowData, FlowFlags, FlowKey, NatInfo, NhId, PacketInfo};
use tables::TableSnapshot;

/// Key of the reverse direction of `forward`, received on `reverse_nh`: the mirror image of the
/// translated forward tuple.
#[must_use]
pub fn reverse_key(forward: &FlowKey, nat: Option<&NatInfo>, reverse_nh: NhId) -> FlowKey {
    let Some(nat) = nat else {
        return forward.mirror(reverse_nh);
    };
    let (src, dst, src_port, dst_port) = nat.translated(forward);
    let translated = FlowKey::new(forward.nh_id, src, dst, src_port, dst_port, forward.proto);
    translated.mirror(reverse_nh)
}

/// Translation of the reverse direction: it undoes the forward translation, so that replies
/// are delivered to the original endpoints. Ports that the forward direction leaves unchanged
/// stay unchanged.
#[must_use]
pub fn mirror_nat(forward: &FlowKey, nat: &NatInfo) -> NatInfo {
    let (_, _, src_port, dst_port) = nat.translated(forward);
    // ports of the reverse key, and the ports they must be translated back to
    let (rev_sport, rev_dport) = if forward.is_icmp() {
        ((src_port, forward.src_port), (dst_port, forward.dst_port))
    } else {
        ((dst_port, forward.dst_port), (src_port, forward.src_port))
    };
    let restore = |(seen, original): (u16, u16)| (seen != original).then_some(original);
    NatInfo {
        kind: nat.kind,
        src: forward.dst,
        dst: forward.src,
        src_port: restore(rev_sport),
        dst_port: restore(rev_dport),
    }
}

const MIRRORED_FLAGS: FlowFlags = FlowFlags::NAT_FLOW
    .union(FlowFlags::LINK_LOCAL)
    .union(FlowFlags::FABRIC_FLOW)
    .union(FlowFlags::LOCAL_FLOW);

/// Build the key and verdict skeleton of the reverse half of a pair from the forward one.
///
/// VN pair, VRF pair and interfaces are the mirror of the forward flow, and so is the
/// translation. Returns `None` for flows without a reverse direction (multicast, or flows that
/// could not be resolved). Policy fields are left to the classifier.
#[must_use]
pub fn reverse_data(
    snapshot: &TableSnapshot,
    forward_key: &FlowKey,
    forward: &FlowData,
) -> Option<(FlowKey, FlowData)> {
    if forward.is_short() || forward.flags.contains(FlowFlags::MULTICAST) {
        return None;
    }
    let reverse_nh = forward.reverse_nh?;
    let key = reverse_key(forward_key, forward.nat.as_ref(), reverse_nh);
    let origin = PacketInfo {
        key,
        vrf: forward.dst_vrf,
        interface: forward.out_interface,
        vn: forward.dst_vn,
        sg_list: vec![],
    };
    let mut data = FlowData::new(origin);
    data.src_vn = forward.dst_vn;
    data.dst_vn = forward.src_vn;
    data.src_vrf = forward.dst_vrf;
    data.dst_vrf = forward.src_vrf;
    data.in_interface = forward.out_interface;
    data.out_interface = forward.in_interface;
    data.reverse_nh = Some(forward_key.nh_id);
    data.nat = forward.nat.map(|nat| mirror_nat(forward_key, &nat));
    data.flags = forward.flags & MIRRORED_FLAGS;
    if data.in_interface.is_some() {
        data.flags |= FlowFlags::INGRESS_FLOW;
    }

    data.add_dep(DepKey::Vrf(data.src_vrf));
    data.add_dep(DepKey::Vrf(data.dst_vrf));
    if let Some(route) = snapshot.route_lookup(data.dst_vrf, forward_key.src) {
        data.add_dep(DepKey::Route {
            vrf: route.vrf,
            prefix: route.prefix,
        });
    }
    for interface in [data.in_interface, data.out_interface].into_iter().flatten() {
        data.add_dep(DepKey::Interface(interface));
    }
    Some((key, data))
}
