// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use flow_info::ShortReason;

/// Reasons why a flow cannot be forwarded. Each maps to the short-flow reason it is reported
/// with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no route to source")]
    NoSrcRoute,
    #[error("no route to destination")]
    NoDstRoute,
    #[error("interface or VRF unavailable")]
    UnavailableInterface,
    #[error("no port left in pool {0}")]
    PortsExhausted(&'static str),
}

impl ResolveError {
    #[must_use]
    pub fn short_reason(self) -> ShortReason {
        match self {
            ResolveError::NoSrcRoute => ShortReason::NoSrcRoute,
            ResolveError::NoDstRoute => ShortReason::NoDstRoute,
            ResolveError::UnavailableInterface => ShortReason::UnavailableInterface,
            ResolveError::PortsExhausted(_) => ShortReason::LinklocalSrcNat,
        }
    }
}
