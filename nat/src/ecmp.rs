// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Member selection for composite next hops.

use ahash::RandomState;
use flow_info::{FlowKey, NhId};
use std::hash::BuildHasher;
use std::sync::OnceLock;

fn hasher_state() -> &'static RandomState {
    static HASHER_STATE: OnceLock<RandomState> = OnceLock::new();
    HASHER_STATE.get_or_init(|| RandomState::with_seeds(0, 0, 0, 0))
}

/// Pick the member of a composite next hop a flow is pinned to.
///
/// A previously selected index is kept as long as the member at that index is present, so that
/// a flow does not move when other members come and go. Otherwise the 5-tuple is hashed over
/// the present members. Returns the index in `members`, or `None` if no member is present.
#[must_use]
pub fn select_member(
    members: &[Option<NhId>],
    key: &FlowKey,
    previous: Option<u16>,
) -> Option<(u16, NhId)> {
    if let Some(index) = previous
        && let Some(Some(nh)) = members.get(usize::from(index))
    {
        return Some((index, *nh));
    }
    let present: Vec<(usize, NhId)> = members
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.map(|nh| (i, nh)))
        .collect();
    if present.is_empty() {
        return None;
    }
    let hash = hasher_state().hash_one((key.src, key.dst, key.src_port, key.dst_port, key.proto));
    #[allow(clippy::cast_possible_truncation)]
    let pick = (hash % present.len() as u64) as usize;
    let (index, nh) = present[pick];
    Some((u16::try_from(index).ok()?, nh))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn key(sport: u16) -> FlowKey {
        FlowKey::tcp(
            NhId(1),
            "1.1.1.1".parse().unwrap(),
            "2.2.2.2".parse().unwrap(),
            sport,
            80,
        )
    }

    #[test]
    fn previous_member_is_kept_while_present() {
        let members = vec![Some(NhId(10)), Some(NhId(11)), Some(NhId(12))];
        let (index, _) = select_member(&members, &key(1000), None).unwrap();
        // another member goes away: no move
        let mut shrunk = members.clone();
        let other = (usize::from(index) + 1) % 3;
        shrunk[other] = None;
        assert_eq!(
            select_member(&shrunk, &key(1000), Some(index)).unwrap().0,
            index
        );
        // our member goes away: re-hash over the rest
        let mut gone = members.clone();
        gone[usize::from(index)] = None;
        let (moved, nh) = select_member(&gone, &key(1000), Some(index)).unwrap();
        assert_ne!(moved, index);
        assert_eq!(Some(nh), gone[usize::from(moved)]);
        assert_eq!(select_member(&[None, None], &key(1), Some(0)), None);
    }

    #[test]
    fn selection_is_deterministic_and_lands_on_a_member() {
        let members = vec![Some(NhId(10)), None, Some(NhId(12)), Some(NhId(13))];
        bolero::check!()
            .with_type::<([u8; 4], [u8; 4], u16, u16)>()
            .for_each(|(src, dst, sport, dport)| {
                let key = FlowKey::tcp(
                    NhId(1),
                    IpAddr::V4(Ipv4Addr::from(*src)),
                    IpAddr::V4(Ipv4Addr::from(*dst)),
                    *sport,
                    *dport,
                );
                let first = select_member(&members, &key, None).unwrap();
                assert_eq!(select_member(&members, &key, None).unwrap(), first);
                assert_eq!(Some(first.1), members[usize::from(first.0)]);
            });
    }
}
