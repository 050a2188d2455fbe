// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use bitflags::bitflags;
use std::fmt::Display;

bitflags! {
    /// Properties of a flow entry. Some are computed with the verdict, others track the
    /// lifecycle of the entry in the table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FlowFlags: u32 {
        /// The flow is forced to drop and will be evicted by the next aging sweep.
        const SHORT_FLOW       = 1 << 0;
        const NAT_FLOW         = 1 << 1;
        const ECMP_FLOW        = 1 << 2;
        const MULTICAST        = 1 << 3;
        /// One end of the flow lives in the underlay.
        const FABRIC_FLOW      = 1 << 4;
        const DELETED          = 1 << 5;
        /// A forwarding-plane operation is in flight for this entry.
        const PENDING_KSYNC_OP = 1 << 6;
        /// The entry is the reverse half of its pair.
        const REVERSE_FLOW     = 1 << 7;
        const LINK_LOCAL       = 1 << 8;
        /// The flow was originated by a local VM interface.
        const INGRESS_FLOW     = 1 << 9;
        /// Both ends of the flow are local VM interfaces.
        const LOCAL_FLOW       = 1 << 10;
    }
}

impl FlowFlags {
    /// Flags that describe the table lifecycle of an entry rather than its verdict.
    pub const LIFECYCLE: FlowFlags = FlowFlags::DELETED
        .union(FlowFlags::PENDING_KSYNC_OP)
        .union(FlowFlags::REVERSE_FLOW);
}

bitflags! {
    /// What the forwarding plane does with the packets of a flow.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FlowAction: u8 {
        const PASS          = 1 << 0;
        const DROP          = 1 << 1;
        const NAT           = 1 << 2;
        const VRF_TRANSLATE = 1 << 3;
        const LOG           = 1 << 4;
        const ALERT         = 1 << 5;
    }
}

fn write_names<'a>(
    f: &mut std::fmt::Formatter<'_>,
    names: impl Iterator<Item = &'a str>,
) -> std::fmt::Result {
    let mut first = true;
    for name in names {
        if !first {
            write!(f, "|")?;
        }
        write!(f, "{name}")?;
        first = false;
    }
    if first {
        write!(f, "-")?;
    }
    Ok(())
}

impl Display for FlowFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_names(f, self.iter_names().map(|(name, _)| name))
    }
}

impl Display for FlowAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_names(f, self.iter_names().map(|(name, _)| name))
    }
}

/// Why a flow was made a short flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShortReason {
    NoSrcRoute,
    NoDstRoute,
    /// The ingress interface or the VRF of the flow is being deleted.
    UnavailableInterface,
    SubnetDiscard,
    FailedVrouterInstall,
    FlowLimit,
    /// The reverse key already belongs to a flow paired with someone else.
    NoReverseFlow,
    /// No port left in the SNAT pool.
    LinklocalSrcNat,
}

impl ShortReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ShortReason::NoSrcRoute => "NO_SRC_ROUTE",
            ShortReason::NoDstRoute => "NO_DST_ROUTE",
            ShortReason::UnavailableInterface => "UNAVAILABLE_INTERFACE",
            ShortReason::SubnetDiscard => "SUBNET_DISCARD",
            ShortReason::FailedVrouterInstall => "FAILED_VROUTER_INSTALL",
            ShortReason::FlowLimit => "FLOW_LIMIT",
            ShortReason::NoReverseFlow => "NO_REVERSE_FLOW",
            ShortReason::LinklocalSrcNat => "LINKLOCAL_SRC_NAT",
        }
    }
}

impl Display for ShortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
