// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

/// Failures reported by the forwarding plane, or by the adapter on its behalf.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KSyncError {
    #[error("no flow index available")]
    ResourceExhausted,
    #[error("write rejected: {0}")]
    WriteRejected(String),
    #[error("transport down")]
    TransportDown,
    #[error("operation timed out")]
    Timeout,
}

impl KSyncError {
    /// The flow cannot be installed as computed and must become a short flow.
    #[must_use]
    pub fn converts_to_short_flow(&self) -> bool {
        matches!(self, KSyncError::ResourceExhausted | KSyncError::WriteRejected(_))
    }

    /// The operation may succeed if submitted again later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, KSyncError::TransportDown | KSyncError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy() {
        for e in [KSyncError::ResourceExhausted, KSyncError::WriteRejected("x".into())] {
            assert!(e.converts_to_short_flow());
            assert!(!e.is_retryable());
        }
        for e in [KSyncError::TransportDown, KSyncError::Timeout] {
            assert!(!e.converts_to_short_flow());
            assert!(e.is_retryable());
        }
    }
}
