// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use flow_info::{
    FlowAction, FlowCounters, FlowEntry, FlowFlags, FlowId, FlowKey, KSyncHandle, NatInfo,
};
use std::fmt::Display;

use crate::errors::KSyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KSyncOp {
    Install,
    Update,
    Remove,
}

impl Display for KSyncOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KSyncOp::Install => write!(f, "install"),
            KSyncOp::Update => write!(f, "update"),
            KSyncOp::Remove => write!(f, "remove"),
        }
    }
}

/// Content of a flow pushed to the forwarding plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSyncRequest {
    pub flow: FlowId,
    pub generation: u64,
    /// Current handle of the flow; `None` for an install.
    pub handle: Option<KSyncHandle>,
    pub reverse_handle: Option<KSyncHandle>,
    pub key: FlowKey,
    pub action: FlowAction,
    pub flags: FlowFlags,
    pub nat: Option<NatInfo>,
    pub ecmp_index: Option<u16>,
}

impl FlowSyncRequest {
    #[must_use]
    pub fn new(entry: &FlowEntry, reverse_handle: Option<KSyncHandle>) -> Self {
        Self {
            flow: entry.id(),
            generation: entry.generation(),
            handle: entry.handle(),
            reverse_handle,
            key: *entry.key(),
            action: entry.action(),
            flags: entry.flags(),
            nat: entry.data().nat,
            ecmp_index: entry.data().ecmp_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRemoveRequest {
    pub flow: FlowId,
    pub generation: u64,
    pub handle: KSyncHandle,
}

/// Outcome of an operation, delivered asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KSyncCompletion {
    pub flow: FlowId,
    /// Generation of the flow when the operation was submitted.
    pub generation: u64,
    pub op: KSyncOp,
    /// Handle the operation targeted: the current handle for updates and removals.
    pub target: Option<KSyncHandle>,
    /// On success, the handle the flow is installed at (the removed one for removals).
    pub result: Result<KSyncHandle, KSyncError>,
}

/// The forwarding plane, as seen by the adapter.
///
/// Submission errors are returned immediately; everything else is reported through the
/// completion channel the transport was created with.
pub trait KSyncTransport: Send + Sync {
    /// Submit a new flow. The completion carries the handle allocated for it.
    ///
    /// # Errors
    ///
    /// Fails if the request could not be submitted.
    fn install(&self, request: FlowSyncRequest) -> Result<(), KSyncError>;

    /// Submit new content for an installed flow. The forwarding plane may move the flow to a
    /// new handle, reported in the completion.
    ///
    /// # Errors
    ///
    /// Fails if the request could not be submitted.
    fn update(&self, request: FlowSyncRequest) -> Result<(), KSyncError>;

    /// Remove the flow at `request.handle`.
    ///
    /// # Errors
    ///
    /// Fails if the request could not be submitted.
    fn remove(&self, request: FlowRemoveRequest) -> Result<(), KSyncError>;

    /// Counters of the flow installed at `handle`.
    fn stats(&self, handle: KSyncHandle) -> Option<FlowCounters>;
}
