// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-memory forwarding plane.

use flow_info::{FlowAction, FlowCounters, FlowId, FlowKey, KSyncHandle};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::debug;

use crate::errors::KSyncError;
use crate::transport::{
    FlowRemoveRequest, FlowSyncRequest, KSyncCompletion, KSyncOp, KSyncTransport,
};

/// A flow as installed in the simulated forwarding plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimFlow {
    pub flow: FlowId,
    pub key: FlowKey,
    pub action: FlowAction,
    pub counters: FlowCounters,
}

#[derive(Debug)]
struct SimState {
    next_handle: u32,
    capacity: Option<usize>,
    flows: BTreeMap<KSyncHandle, SimFlow>,
    failures: VecDeque<KSyncError>,
    renumber: VecDeque<KSyncHandle>,
    down: bool,
    hold: bool,
    held: Vec<KSyncCompletion>,
    submitted: usize,
}

impl SimState {
    fn allocate(&mut self) -> KSyncHandle {
        loop {
            let handle = KSyncHandle(self.next_handle);
            self.next_handle = self.next_handle.wrapping_add(1).max(1);
            if !self.flows.contains_key(&handle) {
                return handle;
            }
        }
    }
}

/// Forwarding plane kept in memory, completing every operation right away unless told to hold
/// completions. Failures, handle renumbering and traffic can be injected.
#[derive(Debug)]
pub struct SimTransport {
    state: Mutex<SimState>,
    completions: UnboundedSender<KSyncCompletion>,
}

impl SimTransport {
    #[must_use]
    pub fn new() -> (Arc<Self>, UnboundedReceiver<KSyncCompletion>) {
        let (tx, rx) = unbounded_channel();
        (Arc::new(Self::with_sender(tx)), rx)
    }

    #[must_use]
    pub fn with_sender(completions: UnboundedSender<KSyncCompletion>) -> Self {
        Self {
            state: Mutex::new(SimState {
                next_handle: 1,
                capacity: None,
                flows: BTreeMap::new(),
                failures: VecDeque::new(),
                renumber: VecDeque::new(),
                down: false,
                hold: false,
                held: vec![],
                submitted: 0,
            }),
            completions,
        }
    }

    /// Complete the next submitted operation with `error`.
    pub fn fail_next(&self, error: KSyncError) {
        self.state.lock().failures.push_back(error);
    }

    /// Install or move the next flow at `handle`.
    pub fn renumber_next(&self, handle: KSyncHandle) {
        self.state.lock().renumber.push_back(handle);
    }

    /// Limit the number of installed flows; installs beyond it fail with resource exhaustion.
    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.state.lock().capacity = capacity;
    }

    /// While down, submissions fail with [`KSyncError::TransportDown`].
    pub fn set_down(&self, down: bool) {
        self.state.lock().down = down;
    }

    /// While holding, completions are kept until released or dropped.
    pub fn set_hold(&self, hold: bool) {
        self.state.lock().hold = hold;
    }

    /// Deliver the held completions, in submission order.
    pub fn release_held(&self) -> usize {
        let held = std::mem::take(&mut self.state.lock().held);
        let count = held.len();
        for completion in held {
            if let Err(e) = self.completions.send(completion) {
                debug!("Completion of flow {} dropped: receiver gone", e.0.flow);
            }
        }
        count
    }

    /// Lose the held completions.
    pub fn drop_held(&self) -> usize {
        std::mem::take(&mut self.state.lock().held).len()
    }

    /// Account traffic to the flow at `handle`. Returns false if there is none.
    pub fn add_traffic(&self, handle: KSyncHandle, packets: u64, bytes: u64) -> bool {
        let mut state = self.state.lock();
        let Some(flow) = state.flows.get_mut(&handle) else {
            return false;
        };
        flow.counters.packets += packets;
        flow.counters.bytes += bytes;
        true
    }

    #[must_use]
    pub fn is_active(&self, handle: KSyncHandle) -> bool {
        self.state.lock().flows.contains_key(&handle)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().flows.len()
    }

    #[must_use]
    pub fn flow_at(&self, handle: KSyncHandle) -> Option<SimFlow> {
        self.state.lock().flows.get(&handle).cloned()
    }

    /// Number of operations submitted so far, rejected ones included.
    #[must_use]
    pub fn submitted(&self) -> usize {
        self.state.lock().submitted
    }

    fn complete(&self, state: &mut SimState, completion: KSyncCompletion) {
        debug!(
            "sim: {} of flow {} -> {:?}",
            completion.op, completion.flow, completion.result
        );
        if state.hold {
            state.held.push(completion);
        } else if let Err(e) = self.completions.send(completion) {
            debug!("Completion of flow {} dropped: receiver gone", e.0.flow);
        }
    }

    fn admit(state: &mut SimState) -> Result<Option<KSyncError>, KSyncError> {
        state.submitted += 1;
        if state.down {
            return Err(KSyncError::TransportDown);
        }
        Ok(state.failures.pop_front())
    }
}

impl KSyncTransport for SimTransport {
    fn install(&self, request: FlowSyncRequest) -> Result<(), KSyncError> {
        let mut state = self.state.lock();
        let injected = Self::admit(&mut state)?;
        let full = state.capacity.is_some_and(|c| state.flows.len() >= c);
        let result = match injected {
            Some(error) => Err(error),
            None if full => Err(KSyncError::ResourceExhausted),
            None => {
                let handle = match state.renumber.pop_front() {
                    Some(handle) => handle,
                    None => state.allocate(),
                };
                state.flows.insert(
                    handle,
                    SimFlow {
                        flow: request.flow,
                        key: request.key,
                        action: request.action,
                        counters: FlowCounters::default(),
                    },
                );
                Ok(handle)
            }
        };
        let completion = KSyncCompletion {
            flow: request.flow,
            generation: request.generation,
            op: KSyncOp::Install,
            target: None,
            result,
        };
        self.complete(&mut state, completion);
        Ok(())
    }

    fn update(&self, request: FlowSyncRequest) -> Result<(), KSyncError> {
        let mut state = self.state.lock();
        let injected = Self::admit(&mut state)?;
        let current = request.handle.filter(|h| state.flows.contains_key(h));
        let result = match (injected, current) {
            (Some(error), _) => Err(error),
            (None, None) => Err(KSyncError::WriteRejected(format!(
                "no flow at {:?}",
                request.handle
            ))),
            (None, Some(handle)) => {
                // a renumbered flow leaves its previous slot behind
                let handle = state.renumber.pop_front().unwrap_or(handle);
                let counters = state
                    .flows
                    .get(&handle)
                    .map(|f| f.counters)
                    .unwrap_or_default();
                state.flows.insert(
                    handle,
                    SimFlow {
                        flow: request.flow,
                        key: request.key,
                        action: request.action,
                        counters,
                    },
                );
                Ok(handle)
            }
        };
        let completion = KSyncCompletion {
            flow: request.flow,
            generation: request.generation,
            op: KSyncOp::Update,
            target: request.handle,
            result,
        };
        self.complete(&mut state, completion);
        Ok(())
    }

    fn remove(&self, request: FlowRemoveRequest) -> Result<(), KSyncError> {
        let mut state = self.state.lock();
        let injected = Self::admit(&mut state)?;
        let result = match injected {
            Some(error) => Err(error),
            None if state.flows.remove(&request.handle).is_some() => Ok(request.handle),
            None => Err(KSyncError::WriteRejected(format!(
                "no flow at {}",
                request.handle
            ))),
        };
        let completion = KSyncCompletion {
            flow: request.flow,
            generation: request.generation,
            op: KSyncOp::Remove,
            target: Some(request.handle),
            result,
        };
        self.complete(&mut state, completion);
        Ok(())
    }

    fn stats(&self, handle: KSyncHandle) -> Option<FlowCounters> {
        self.state.lock().flows.get(&handle).map(|f| f.counters)
    }
}
