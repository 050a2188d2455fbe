// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use flow_table::FlowTableError;
use ksync::KSyncError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Work queue of shard {shard} is full")]
    QueueFull { shard: u32 },
    #[error("Flow engine is stopped")]
    Stopped,
    #[error(transparent)]
    FlowTable(#[from] FlowTableError),
    #[error(transparent)]
    KSync(#[from] KSyncError),
}
