// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The identity of a unidirectional flow, as used by the forwarding plane for its own lookups.

use etherparse::IpNumber;
use std::fmt::Display;
use std::net::IpAddr;

use crate::ids::NhId;

/// Key of a unidirectional flow.
///
/// The key is scoped by the next hop the packet was received on. For ICMP query messages the
/// identifier is carried in `src_port` and `dst_port` is 0, in both directions.
///
/// Ordering is field by field, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub nh_id: NhId,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: IpNumber,
}

impl FlowKey {
    #[must_use]
    pub fn new(
        nh_id: NhId,
        src: IpAddr,
        dst: IpAddr,
        src_port: u16,
        dst_port: u16,
        proto: IpNumber,
    ) -> Self {
        Self {
            nh_id,
            src,
            dst,
            src_port,
            dst_port,
            proto,
        }
    }

    #[must_use]
    pub fn tcp(nh_id: NhId, src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16) -> Self {
        Self::new(nh_id, src, dst, src_port, dst_port, IpNumber::TCP)
    }

    #[must_use]
    pub fn udp(nh_id: NhId, src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16) -> Self {
        Self::new(nh_id, src, dst, src_port, dst_port, IpNumber::UDP)
    }

    /// An ICMP (or ICMPv6) echo flow with the given identifier.
    #[must_use]
    pub fn icmp(nh_id: NhId, src: IpAddr, dst: IpAddr, ident: u16) -> Self {
        let proto = if src.is_ipv6() {
            IpNumber::IPV6_ICMP
        } else {
            IpNumber::ICMP
        };
        Self::new(nh_id, src, dst, ident, 0, proto)
    }

    #[must_use]
    pub fn is_icmp(&self) -> bool {
        self.proto == IpNumber::ICMP || self.proto == IpNumber::IPV6_ICMP
    }

    #[must_use]
    pub fn is_ipv4(&self) -> bool {
        self.src.is_ipv4()
    }

    /// Ports as they appear in the opposite direction.
    #[must_use]
    pub fn mirrored_ports(&self) -> (u16, u16) {
        if self.is_icmp() {
            (self.src_port, self.dst_port)
        } else {
            (self.dst_port, self.src_port)
        }
    }

    /// The key of the opposite direction with no translation involved, received on `nh_id`.
    #[must_use]
    pub fn mirror(&self, nh_id: NhId) -> Self {
        let (src_port, dst_port) = self.mirrored_ports();
        Self {
            nh_id,
            src: self.dst,
            dst: self.src,
            src_port,
            dst_port,
            proto: self.proto,
        }
    }

    /// True if the destination is a multicast or limited broadcast address.
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        match self.dst {
            IpAddr::V4(a) => a.is_multicast() || a.is_broadcast(),
            IpAddr::V6(a) => a.is_multicast(),
        }
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{} proto {}",
            self.nh_id,
            self.src,
            self.src_port,
            self.dst,
            self.dst_port,
            self.proto.0
        )
    }
}
