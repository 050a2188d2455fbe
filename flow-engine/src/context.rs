// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use config::EngineConfig;
use flow_info::{FlowEntry, FlowId};
use flow_table::FlowTable;
use ksync::{KSyncAdapter, KSyncCompletion, KSyncTransport};
use nat::Resolver;
use std::sync::Arc;
use std::time::Instant;
use tables::Tables;
use tracing::{debug, info};

use crate::errors::EngineError;
use crate::metrics::EngineMetrics;
use crate::path_preference::PathPreferenceModule;
use crate::revaluation::RevaluationQueue;

/// The flow a pair is handled under: its forward half, or the flow itself when it has no
/// forward half. Work on a pair is queued on the shard of its head.
pub(crate) fn pair_head(entry: &FlowEntry) -> FlowId {
    entry
        .reverse()
        .filter(|_| entry.is_reverse_flow())
        .unwrap_or_else(|| entry.id())
}

/// The collaborators of the engine: its configuration, the tables flows are computed from and
/// the forwarding plane they are mirrored into.
#[derive(Clone)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub tables: Arc<Tables>,
    pub transport: Arc<dyn KSyncTransport>,
}

impl EngineContext {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        tables: Arc<Tables>,
        transport: Arc<dyn KSyncTransport>,
    ) -> Self {
        Self {
            config,
            tables,
            transport,
        }
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The flow processing engine.
#[derive(Debug)]
pub struct FlowEngine {
    pub(crate) config: EngineConfig,
    pub(crate) tables: Arc<Tables>,
    pub(crate) table: FlowTable,
    pub(crate) ksync: KSyncAdapter,
    pub(crate) resolver: Resolver,
    pub(crate) revaluation: Vec<RevaluationQueue>,
    pub(crate) path_preference: PathPreferenceModule,
    pub(crate) metrics: EngineMetrics,
}

impl FlowEngine {
    /// Build an engine from its collaborators.
    ///
    /// # Errors
    ///
    /// Fails if the flow table cannot be created with the configured number of shards.
    pub fn new(ctx: &EngineContext) -> Result<Self, EngineError> {
        let config = ctx.config.clone();
        let table = FlowTable::new(config.shards)?;
        let revaluation = (0..table.shard_count())
            .filter_map(|shard| u32::try_from(shard).ok())
            .map(RevaluationQueue::new)
            .collect();
        info!(
            "Flow engine with {} shards, flow age time {:?}",
            config.shards, config.flow_age_time
        );
        Ok(Self {
            ksync: KSyncAdapter::new(ctx.transport.clone(), &config),
            resolver: Resolver::new(&config),
            path_preference: PathPreferenceModule::new(config.traffic_seen_queue),
            tables: ctx.tables.clone(),
            metrics: EngineMetrics::new(),
            revaluation,
            table,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn tables(&self) -> &Arc<Tables> {
        &self.tables
    }

    #[must_use]
    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    #[must_use]
    pub fn ksync(&self) -> &KSyncAdapter {
        &self.ksync
    }

    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    #[must_use]
    pub fn path_preference(&self) -> &PathPreferenceModule {
        &self.path_preference
    }

    #[must_use]
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// The shard handling the pair of flow `id`. A flow no longer in the table is its own
    /// head.
    #[must_use]
    pub fn head_shard(&self, id: FlowId) -> u32 {
        self.table.with_entry(id, pair_head).unwrap_or(id).shard
    }

    /// Push the current content of flow `id` to the forwarding plane.
    pub(crate) fn sync(&self, id: FlowId, now: Instant) {
        let purged = self.ksync.sync(&self.table, id, now);
        self.release_purged(purged);
    }

    /// Delete the pair `id` belongs to and withdraw it from the forwarding plane.
    ///
    /// Returns the number of entries deleted by this call.
    pub(crate) fn delete_pair(&self, id: FlowId, now: Instant) -> Result<usize, EngineError> {
        let deleted = self.table.delete(id)?;
        for flow in &deleted {
            if let Some(queue) = self.revaluation_queue(flow.shard) {
                queue.cancel(*flow);
            }
            let purged = self.ksync.remove(&self.table, *flow, now);
            self.release_purged(purged);
        }
        self.metrics.deleted.increment(deleted.len() as u64);
        self.update_active();
        Ok(deleted.len())
    }

    /// Give back the SNAT ports held by purged entries. Ports belong to the forward half.
    pub(crate) fn release_purged(&self, purged: Vec<FlowEntry>) {
        for entry in purged {
            if !entry.is_reverse_flow()
                && let Some(nat) = &entry.data().nat
            {
                debug!("Releasing translation of purged flow {}", entry.id());
                self.resolver.release(entry.key(), nat);
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn update_active(&self) {
        self.metrics.active.set(self.table.count() as f64);
    }

    /// Fold a forwarding plane completion back into the flow table.
    pub fn complete(&self, completion: KSyncCompletion, now: Instant) {
        let purged = self.ksync.complete(&self.table, completion, now);
        self.release_purged(purged);
    }

    /// Time out and retry forwarding plane operations.
    pub fn ksync_tick(&self, now: Instant) {
        let purged = self.ksync.tick(&self.table, now);
        self.release_purged(purged);
    }

    /// Time out and retry the forwarding plane operations of the pairs handled by `shard`.
    pub fn ksync_tick_shard(&self, shard: u32, now: Instant) {
        let purged = self
            .ksync
            .tick_matching(&self.table, now, |id| self.head_shard(id) == shard);
        self.release_purged(purged);
    }
}
