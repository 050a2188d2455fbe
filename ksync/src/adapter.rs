// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use config::EngineConfig;
use flow_info::{FlowCounters, FlowEntry, FlowId, KSyncHandle, ShortReason};
use flow_table::FlowTable;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::errors::KSyncError;
use crate::transport::{
    FlowRemoveRequest, FlowSyncRequest, KSyncCompletion, KSyncOp, KSyncTransport,
};

/// Next operation to issue for a flow once nothing is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Sync,
    Remove,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    op: KSyncOp,
    generation: u64,
    target: Option<KSyncHandle>,
    submitted_at: Instant,
}

#[derive(Debug, Default)]
struct OpState {
    in_flight: Option<InFlight>,
    queued: Option<Pending>,
    retry_at: Option<Instant>,
    attempts: u32,
}

impl OpState {
    /// Queue `next`. A removal supersedes a sync, including one waiting for a retry.
    fn queue(&mut self, next: Pending) {
        if next == Pending::Remove && self.queued == Some(Pending::Sync) {
            self.retry_at = None;
            self.attempts = 0;
        }
        if self.queued != Some(Pending::Remove) {
            self.queued = Some(next);
        }
    }

    fn idle(&self) -> bool {
        self.in_flight.is_none() && self.queued.is_none()
    }
}

/// Operation counters of the adapter.
#[derive(Debug, Default)]
pub struct AdapterCounters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub stale: AtomicU64,
    pub retries: AtomicU64,
    pub errors: AtomicU64,
    pub index_changes: AtomicU64,
}

/// Mirrors flow entries into the forwarding plane.
///
/// Each flow has at most one operation in flight; what is requested meanwhile is queued and
/// coalesced, a removal superseding a pending sync. Completions are matched to the operation
/// in flight and checked against the generation of the entry.
pub struct KSyncAdapter {
    transport: Arc<dyn KSyncTransport>,
    config: EngineConfig,
    ops: Mutex<BTreeMap<FlowId, OpState>>,
    counters: AdapterCounters,
    errors_metric: metrics::Counter,
    retries_metric: metrics::Counter,
}

impl std::fmt::Debug for KSyncAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KSyncAdapter")
            .field("ops", &self.ops)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl KSyncAdapter {
    #[must_use]
    pub fn new(transport: Arc<dyn KSyncTransport>, config: &EngineConfig) -> Self {
        Self {
            transport,
            config: config.clone(),
            ops: Mutex::new(BTreeMap::new()),
            counters: AdapterCounters::default(),
            errors_metric: tracectl::register_counter(
                module_path!(),
                "ksync_errors",
                "Forwarding plane operations that failed for good",
            ),
            retries_metric: tracectl::register_counter(
                module_path!(),
                "ksync_retries",
                "Forwarding plane operations submitted again after a transient failure",
            ),
        }
    }

    #[must_use]
    pub fn counters(&self) -> &AdapterCounters {
        &self.counters
    }

    /// Flows with an operation in flight or queued.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.ops.lock().len()
    }

    /// Forwarding plane counters of the flow installed at `handle`.
    #[must_use]
    pub fn stats(&self, handle: KSyncHandle) -> Option<FlowCounters> {
        self.transport.stats(handle)
    }

    /// Push the current content of flow `id`: install it, or update it if installed.
    pub fn sync(&self, table: &FlowTable, id: FlowId, now: Instant) -> Vec<FlowEntry> {
        self.request(table, id, Pending::Sync, now)
    }

    /// Remove deleted flow `id` from the forwarding plane, then purge it from the table.
    ///
    /// Returns the entries purged by this call.
    pub fn remove(&self, table: &FlowTable, id: FlowId, now: Instant) -> Vec<FlowEntry> {
        self.request(table, id, Pending::Remove, now)
    }

    fn request(
        &self,
        table: &FlowTable,
        id: FlowId,
        next: Pending,
        now: Instant,
    ) -> Vec<FlowEntry> {
        let mut purged = vec![];
        let mut ops = self.ops.lock();
        let state = ops.entry(id).or_default();
        state.queue(next);
        self.drive(table, id, state, now, &mut purged);
        Self::settle(&mut ops, table, id);
        purged
    }

    /// Fold a completion back into the flow table.
    ///
    /// Returns the entries purged as a result.
    pub fn complete(
        &self,
        table: &FlowTable,
        completion: KSyncCompletion,
        now: Instant,
    ) -> Vec<FlowEntry> {
        let mut purged = vec![];
        let mut ops = self.ops.lock();
        let id = completion.flow;
        let matched = ops
            .get(&id)
            .and_then(|s| s.in_flight)
            .is_some_and(|f| {
                f.op == completion.op
                    && f.generation == completion.generation
                    && f.target == completion.target
            });
        if !matched {
            self.unmatched(table, &completion);
            return purged;
        }
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        let state = ops.entry(id).or_default();
        state.in_flight = None;

        let Some((generation, current)) = table.with_entry(id, |e| (e.generation(), e.handle()))
        else {
            // purged while in flight: nothing may point to the slot any longer
            if completion.op != KSyncOp::Remove
                && let Ok(handle) = completion.result
            {
                self.release(id, handle);
            }
            ops.remove(&id);
            return purged;
        };
        let stale = completion.op != KSyncOp::Remove && completion.generation < generation;
        if stale {
            self.counters.stale.fetch_add(1, Ordering::Relaxed);
        }

        match (completion.op, completion.result) {
            (KSyncOp::Install | KSyncOp::Update, Ok(handle)) => {
                if let Some(old) = current
                    && old != handle
                {
                    debug!("Flow {id} moved from {old} to {handle}");
                    self.counters.index_changes.fetch_add(1, Ordering::Relaxed);
                    self.release(id, old);
                }
                if let Err(e) = table.with_entry_mut(id, |e| e.set_handle(Some(handle))) {
                    debug!("Flow {id} went away before its {} completed: {e}", completion.op);
                    self.release(id, handle);
                    ops.remove(&id);
                    return purged;
                }
                state.attempts = 0;
                if stale {
                    state.queue(Pending::Sync);
                }
            }
            (KSyncOp::Remove, Ok(_)) => {
                if let Err(e) = table.with_entry_mut(id, |e| e.set_handle(None)) {
                    debug!("Flow {id} went away before its removal completed: {e}");
                }
                state.attempts = 0;
            }
            (op, Err(error)) => {
                if stale {
                    debug!("Ignoring {op} error of flow {id} for an older generation: {error}");
                    state.queue(Pending::Sync);
                } else {
                    self.fail(table, id, state, op, &error, now);
                }
            }
        }
        self.drive(table, id, state, now, &mut purged);
        Self::settle(&mut ops, table, id);
        purged
    }

    /// Time out operations in flight for too long and resubmit those whose backoff elapsed.
    ///
    /// Returns the entries purged as a result.
    pub fn tick(&self, table: &FlowTable, now: Instant) -> Vec<FlowEntry> {
        self.tick_matching(table, now, |_| true)
    }

    /// Same as [`KSyncAdapter::tick`], for the flows selected by `pred` only.
    pub fn tick_matching(
        &self,
        table: &FlowTable,
        now: Instant,
        pred: impl Fn(FlowId) -> bool,
    ) -> Vec<FlowEntry> {
        let mut purged = vec![];
        let mut ops = self.ops.lock();
        let ids: Vec<FlowId> = ops.keys().copied().filter(|id| pred(*id)).collect();
        for id in ids {
            let Some(state) = ops.get_mut(&id) else {
                continue;
            };
            if let Some(in_flight) = state.in_flight
                && now.saturating_duration_since(in_flight.submitted_at)
                    >= self.config.ksync_op_timeout
            {
                state.in_flight = None;
                self.fail(table, id, state, in_flight.op, &KSyncError::Timeout, now);
            }
            self.drive(table, id, state, now, &mut purged);
            Self::settle(&mut ops, table, id);
        }
        purged
    }

    /// Forget the state of `id` if nothing is left to do, and reflect it on the entry.
    fn settle(ops: &mut BTreeMap<FlowId, OpState>, table: &FlowTable, id: FlowId) {
        let idle = ops.get(&id).is_none_or(OpState::idle);
        if idle {
            ops.remove(&id);
        }
        if let Err(e) = table.with_entry_mut(id, |e| e.set_pending(!idle)) {
            // purged along the way
            trace!("No pending state to record on flow {id}: {e}");
        }
    }

    /// Issue queued work for `id`, unless an operation is in flight or a retry is not due.
    fn drive(
        &self,
        table: &FlowTable,
        id: FlowId,
        state: &mut OpState,
        now: Instant,
        purged: &mut Vec<FlowEntry>,
    ) {
        loop {
            if state.in_flight.is_some() || state.retry_at.is_some_and(|at| at > now) {
                return;
            }
            state.retry_at = None;
            let Some((deleted, handle, reverse)) =
                table.with_entry(id, |e| (e.is_deleted(), e.handle(), e.reverse()))
            else {
                state.queued = None;
                return;
            };
            let next = match state.queued.take() {
                Some(Pending::Sync) if deleted => Some(Pending::Remove),
                other => other,
            };
            match (next, handle) {
                (None, None) | (Some(Pending::Remove), None) => {
                    if deleted && let Ok(entry) = table.purge(id) {
                        purged.push(entry);
                    }
                    return;
                }
                (None, Some(_)) => return,
                (Some(Pending::Remove), Some(handle)) => {
                    let request = FlowRemoveRequest {
                        flow: id,
                        generation: 0,
                        handle,
                    };
                    let target = (KSyncOp::Remove, 0, Some(handle));
                    self.submit(table, id, state, target, now, |t| t.remove(request));
                }
                (Some(Pending::Sync), _) => {
                    let reverse_handle = reverse
                        .and_then(|r| table.with_entry(r, FlowEntry::handle))
                        .flatten();
                    let Some(request) =
                        table.with_entry(id, |e| FlowSyncRequest::new(e, reverse_handle))
                    else {
                        return;
                    };
                    let op = match handle {
                        Some(_) => KSyncOp::Update,
                        None => KSyncOp::Install,
                    };
                    let target = (op, request.generation, handle);
                    self.submit(table, id, state, target, now, |t| match op {
                        KSyncOp::Update => t.update(request),
                        _ => t.install(request),
                    });
                }
            }
        }
    }

    /// Submit `op` for the flow at `generation`, targeting `target`, through `send`.
    fn submit(
        &self,
        table: &FlowTable,
        id: FlowId,
        state: &mut OpState,
        (op, generation, target): (KSyncOp, u64, Option<KSyncHandle>),
        now: Instant,
        send: impl FnOnce(&dyn KSyncTransport) -> Result<(), KSyncError>,
    ) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        state.in_flight = Some(InFlight {
            op,
            generation,
            target,
            submitted_at: now,
        });
        if let Err(error) = send(self.transport.as_ref()) {
            state.in_flight = None;
            self.fail(table, id, state, op, &error, now);
        }
    }

    fn fail(
        &self,
        table: &FlowTable,
        id: FlowId,
        state: &mut OpState,
        op: KSyncOp,
        error: &KSyncError,
        now: Instant,
    ) {
        let next = match op {
            KSyncOp::Remove => Pending::Remove,
            KSyncOp::Install | KSyncOp::Update => Pending::Sync,
        };
        if error.is_retryable() {
            state.attempts += 1;
            if state.attempts <= self.config.ksync_max_retries {
                let backoff = self.config.ksync_backoff(state.attempts);
                debug!(
                    "{op} of flow {id} failed: {error}, attempt {} again in {backoff:?}",
                    state.attempts
                );
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                self.retries_metric.increment(1);
                state.retry_at = Some(now + backoff);
                state.queue(next);
                return;
            }
            warn!("{op} of flow {id} failed after {} attempts: {error}", state.attempts);
        } else {
            warn!("{op} of flow {id} failed: {error}");
        }
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.errors_metric.increment(1);
        state.attempts = 0;
        let failed = table.with_entry_mut(id, |e| match op {
            // the forwarding plane has no usable slot for the flow any longer
            KSyncOp::Remove => e.set_handle(None),
            KSyncOp::Install | KSyncOp::Update => {
                e.make_short(ShortReason::FailedVrouterInstall);
            }
        });
        if let Err(e) = failed {
            debug!("Flow {id} went away after its {op} failed: {e}");
        }
    }

    /// Handle a completion that does not match the operation in flight for its flow.
    fn unmatched(&self, table: &FlowTable, completion: &KSyncCompletion) {
        let id = completion.flow;
        match (completion.op, &completion.result) {
            (KSyncOp::Install | KSyncOp::Update, Ok(handle)) => {
                let current = table.with_entry(id, FlowEntry::handle).flatten();
                if current != Some(*handle) {
                    debug!("Releasing orphan slot {handle} of flow {id}");
                    self.release(id, *handle);
                }
            }
            _ => debug!(
                "Ignoring {} completion of flow {id}: {:?}",
                completion.op, completion.result
            ),
        }
    }

    /// Remove a slot no entry refers to. Its completion is not tracked.
    fn release(&self, id: FlowId, handle: KSyncHandle) {
        let request = FlowRemoveRequest {
            flow: id,
            generation: 0,
            handle,
        };
        if let Err(e) = self.transport.remove(request) {
            warn!("Could not release slot {handle} of flow {id}: {e}");
        }
    }
}
