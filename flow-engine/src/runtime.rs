// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tasks driving a [`FlowEngine`] on a tokio runtime.
//!
//! Every shard gets one worker, which runs everything done to the pairs it handles: first
//! packets, revaluation, aging, forwarding plane completions and retries, and administrative
//! deletions. Work on one pair is thus never concurrent. Path preference notifications and
//! table changes have a task each; table changes are only queued from there.

use flow_info::{FlowId, PacketInfo};
use ksync::{KSyncCompletion, KSyncError};
use std::sync::Arc;
use std::time::Instant;
use tables::{DependencyChange, SubscriptionId};
use tokio::sync::mpsc::{self, Sender, UnboundedReceiver, UnboundedSender, error::TrySendError};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::admin::FlowSelector;
use crate::context::FlowEngine;
use crate::errors::EngineError;
use crate::path_preference::TrafficSeen;

/// Current time, as seen by the tokio clock.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stop| *stop).await.is_err() {
        debug!("Stop sender dropped, stopping");
    }
}

fn ticker(period: std::time::Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Work for a shard worker, other than first packets.
#[derive(Debug)]
enum ShardCommand {
    Complete(KSyncCompletion),
    DeleteFlow {
        flow: FlowId,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Delete {
        selector: FlowSelector,
        reply: oneshot::Sender<usize>,
    },
}

/// Submits work to the shard workers of a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    engine: Arc<FlowEngine>,
    packets: Arc<Vec<Sender<PacketInfo>>>,
    commands: Arc<Vec<UnboundedSender<ShardCommand>>>,
}

impl EngineHandle {
    /// Queue the first packet of a flow on the worker of the shard owning its key.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::QueueFull`] if the worker queue is full, and
    /// [`EngineError::Stopped`] once the runtime was shut down.
    pub fn submit_packet(&self, packet: PacketInfo) -> Result<(), EngineError> {
        let shard = self.engine.table().shard_of(&packet.key);
        let Some(worker) = self.packets.get(shard as usize) else {
            return Err(EngineError::Stopped);
        };
        worker.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => EngineError::QueueFull { shard },
            TrySendError::Closed(_) => EngineError::Stopped,
        })
    }

    fn command(&self, shard: u32, command: ShardCommand) -> Result<(), EngineError> {
        self.commands
            .get(shard as usize)
            .ok_or(EngineError::Stopped)?
            .send(command)
            .map_err(|_| EngineError::Stopped)
    }

    /// Delete the pair of flow `flow`, on the worker handling it.
    ///
    /// # Errors
    ///
    /// Fails if the flow is not in the table, or once the runtime was shut down.
    pub async fn delete_flow(&self, flow: FlowId) -> Result<usize, EngineError> {
        let (reply, deleted) = oneshot::channel();
        self.command(
            self.engine.head_shard(flow),
            ShardCommand::DeleteFlow { flow, reply },
        )?;
        deleted.await.map_err(|_| EngineError::Stopped)?
    }

    /// Delete the pairs matching `selector`, each shard worker taking the pairs it handles.
    /// Returns the number of entries deleted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] once the runtime was shut down.
    pub async fn delete_selected(&self, selector: FlowSelector) -> Result<usize, EngineError> {
        let mut replies = Vec::with_capacity(self.commands.len());
        for shard in 0..self.commands.len() {
            let (reply, deleted) = oneshot::channel();
            let shard = u32::try_from(shard).map_err(|_| EngineError::Stopped)?;
            self.command(shard, ShardCommand::Delete { selector, reply })?;
            replies.push(deleted);
        }
        let mut deleted = 0;
        for reply in replies {
            deleted += reply.await.map_err(|_| EngineError::Stopped)?;
        }
        Ok(deleted)
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }
}

/// The tasks of a running engine.
#[derive(Debug)]
pub struct EngineRuntime {
    engine: Arc<FlowEngine>,
    handle: EngineHandle,
    stop: watch::Sender<bool>,
    subscription: SubscriptionId,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineRuntime {
    /// Spawn the tasks of `engine` on the current tokio runtime. `completions` is the channel
    /// the forwarding plane transport of the engine reports to.
    #[must_use]
    pub fn start(
        engine: Arc<FlowEngine>,
        completions: UnboundedReceiver<KSyncCompletion>,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let mut tasks = vec![];
        let shards = engine.table().shard_count();

        let mut packets = Vec::with_capacity(shards);
        let mut commands = Vec::with_capacity(shards);
        for shard in (0..shards).filter_map(|s| u32::try_from(s).ok()) {
            let (packet_tx, packet_rx) = mpsc::channel(engine.config().queue_depth.max(1));
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            packets.push(packet_tx);
            commands.push(command_tx);
            tasks.push(tokio::spawn(shard_worker(
                engine.clone(),
                shard,
                packet_rx,
                command_rx,
                stop_rx.clone(),
            )));
        }
        let commands = Arc::new(commands);
        tasks.push(tokio::spawn(ksync_consumer(
            engine.clone(),
            completions,
            commands.clone(),
            stop_rx.clone(),
        )));
        if let Some(rx) = engine.path_preference().take_receiver() {
            tasks.push(tokio::spawn(traffic_seen_consumer(
                engine.clone(),
                rx,
                stop_rx.clone(),
            )));
        } else {
            warn!("Path preference notifications are consumed elsewhere");
        }

        let (change_tx, mut change_rx) = mpsc::unbounded_channel();
        let subscription = engine.tables().subscribe(move |change| {
            if change_tx.send(*change).is_err() {
                trace!("{change}: flow engine stopped");
            }
        });
        let dispatcher = engine.clone();
        let mut stop_dispatch = stop_rx;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stopped(&mut stop_dispatch) => break,
                    change = change_rx.recv() => {
                        let Some(change) = change else { break };
                        if let DependencyChange::InterfaceDelete(interface) = change {
                            dispatcher.path_preference().remove_interface(interface);
                        }
                        let queued = dispatcher.on_change(&change);
                        trace!("{change}: {queued} flows queued for revaluation");
                    }
                }
            }
        }));

        info!("Flow engine started with {shards} workers");
        Self {
            handle: EngineHandle {
                engine: engine.clone(),
                packets: Arc::new(packets),
                commands,
            },
            engine,
            stop,
            subscription,
            tasks,
        }
    }

    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    /// Stop the tasks and wait for them to finish. Flows are left in place.
    pub async fn shutdown(self) {
        self.engine.tables().unsubscribe(self.subscription);
        if self.stop.send(true).is_err() {
            debug!("Flow engine tasks already gone");
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Flow engine task failed: {e}");
            }
        }
        info!("Flow engine stopped");
    }
}

fn run_command(engine: &FlowEngine, shard: u32, command: ShardCommand) {
    match command {
        ShardCommand::Complete(completion) => engine.complete(completion, now()),
        ShardCommand::DeleteFlow { flow, reply } => {
            if reply.send(engine.delete_flow(flow, now())).is_err() {
                debug!("Deletion of flow {flow} no longer awaited");
            }
        }
        ShardCommand::Delete { selector, reply } => {
            let deleted = engine.delete_selected(selector, Some(shard), now());
            if reply.send(deleted).is_err() {
                debug!("Deletion of {selector:?} on shard {shard} no longer awaited");
            }
        }
    }
}

async fn shard_worker(
    engine: Arc<FlowEngine>,
    shard: u32,
    mut packets: mpsc::Receiver<PacketInfo>,
    mut commands: UnboundedReceiver<ShardCommand>,
    mut stop: watch::Receiver<bool>,
) {
    let Some(queue) = engine.revaluation_queue(shard) else {
        return;
    };
    let mut aging = ticker(engine.config().aging_interval);
    let mut retries = ticker(engine.config().ksync_retry_base);
    debug!("Worker of shard {shard} started");
    loop {
        tokio::select! {
            () = stopped(&mut stop) => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                run_command(&engine, shard, command);
            }
            packet = packets.recv() => {
                let Some(packet) = packet else { break };
                engine.process_packet(packet, now());
            }
            () = queue.wait() => {
                let revaluated = engine.revaluate(shard, now());
                trace!("Shard {shard}: {revaluated} pairs revaluated");
            }
            _ = aging.tick() => {
                let report = engine.sweep_shard(shard, now());
                trace!("Shard {shard} aging: {report:?}");
            }
            _ = retries.tick() => engine.ksync_tick_shard(shard, now()),
        }
    }
    debug!("Worker of shard {shard} stopped");
}

/// Hand forwarding plane completions over to the worker handling their pair.
async fn ksync_consumer(
    engine: Arc<FlowEngine>,
    mut completions: UnboundedReceiver<KSyncCompletion>,
    workers: Arc<Vec<UnboundedSender<ShardCommand>>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            () = stopped(&mut stop) => break,
            completion = completions.recv() => {
                let Some(completion) = completion else {
                    error!("{}", EngineError::KSync(KSyncError::TransportDown));
                    break;
                };
                let shard = engine.head_shard(completion.flow);
                let sent = workers
                    .get(shard as usize)
                    .is_some_and(|w| w.send(ShardCommand::Complete(completion)).is_ok());
                if !sent {
                    debug!("Worker of shard {shard} gone, completions no longer delivered");
                    break;
                }
            }
        }
    }
}

async fn traffic_seen_consumer(
    engine: Arc<FlowEngine>,
    mut notifications: mpsc::Receiver<TrafficSeen>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            () = stopped(&mut stop) => break,
            seen = notifications.recv() => {
                let Some(seen) = seen else { break };
                engine.path_preference().traffic_seen(&seen);
            }
        }
    }
}
