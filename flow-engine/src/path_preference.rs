// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Path preference of local routes.
//!
//! Every local path (a prefix of a VRF reachable through a local interface) runs a small state
//! machine deciding whether it is advertised with a high preference: a path is preferred once
//! traffic from the endpoint was seen locally, and gives up its preference when a remote path
//! claims a newer sequence number. Traffic seen notifications arrive from the packet front end
//! through a bounded queue that never blocks the producer.

use flow_info::{InterfaceId, VrfId};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathState {
    #[default]
    Init,
    /// Not preferred until traffic from the endpoint is seen.
    WaitForTraffic,
    /// Preferred.
    TrafficSeen,
    /// All paths of the prefix are equally preferred.
    ActiveActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEvent {
    WaitForTraffic,
    TrafficSeen,
    /// A path of the same prefix elsewhere claims a newer sequence number.
    SeqChange { remote_seq: u32 },
    ActiveActive,
    ActiveBackup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    SetPreference { high: bool },
    /// Move the sequence number of the path past any sequence number seen.
    BumpSequence,
    /// Advertise the path again.
    NotifyRoute,
}

const DEMOTE: [SideEffect; 2] = [
    SideEffect::SetPreference { high: false },
    SideEffect::NotifyRoute,
];

/// The path preference state machine.
#[must_use]
pub fn transition(state: PathState, event: PathEvent) -> (PathState, Vec<SideEffect>) {
    use PathEvent as E;
    use PathState as S;
    match (state, event) {
        (S::Init, E::WaitForTraffic) | (S::TrafficSeen, E::WaitForTraffic | E::SeqChange { .. }) => {
            (S::WaitForTraffic, DEMOTE.to_vec())
        }
        (S::Init | S::WaitForTraffic, E::TrafficSeen) => (
            S::TrafficSeen,
            vec![
                SideEffect::BumpSequence,
                SideEffect::SetPreference { high: true },
                SideEffect::NotifyRoute,
            ],
        ),
        (S::Init | S::WaitForTraffic | S::TrafficSeen, E::ActiveActive) => (
            S::ActiveActive,
            vec![
                SideEffect::SetPreference { high: true },
                SideEffect::NotifyRoute,
            ],
        ),
        (S::ActiveActive, E::ActiveBackup) => (S::WaitForTraffic, DEMOTE.to_vec()),
        (state, _) => (state, vec![]),
    }
}

/// A local path: `prefix` of `vrf` reached through `interface`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathKey {
    pub vrf: VrfId,
    pub prefix: IpNet,
    pub interface: InterfaceId,
}

/// Current preference of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathPreference {
    pub state: PathState,
    pub seq: u32,
    pub high: bool,
    /// Highest sequence number claimed by remote paths.
    pub remote_seq: u32,
    /// Times the path was advertised again.
    pub notifications: u64,
}

/// Traffic from `ip/plen` was seen on `interface` of `vrf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSeen {
    pub ip: IpAddr,
    pub plen: u8,
    pub interface: InterfaceId,
    pub vrf: VrfId,
    pub mac: [u8; 6],
}

#[derive(Debug)]
pub struct PathPreferenceModule {
    tx: Sender<TrafficSeen>,
    rx: Mutex<Option<Receiver<TrafficSeen>>>,
    paths: Mutex<BTreeMap<PathKey, PathPreference>>,
    dropped: AtomicU64,
}

impl PathPreferenceModule {
    #[must_use]
    pub fn new(queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            paths: Mutex::new(BTreeMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a notification. Returns false if it was dropped.
    pub fn enqueue(&self, seen: TrafficSeen) -> bool {
        match self.tx.try_send(seen) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// The receiving end of the notification queue, for the task consuming it. It can be taken
    /// once.
    pub fn take_receiver(&self) -> Option<Receiver<TrafficSeen>> {
        self.rx.lock().take()
    }

    /// Process the notifications queued so far, when no task consumes them.
    pub fn drain(&self) -> usize {
        let mut rx = self.rx.lock();
        let Some(rx) = rx.as_mut() else {
            return 0;
        };
        let mut count = 0;
        while let Ok(seen) = rx.try_recv() {
            self.traffic_seen(&seen);
            count += 1;
        }
        count
    }

    /// Feed a traffic seen notification to the state machine of its path.
    pub fn traffic_seen(&self, seen: &TrafficSeen) -> Vec<SideEffect> {
        let Ok(prefix) = IpNet::new(seen.ip, seen.plen) else {
            warn!("Ignoring traffic seen for {}/{}", seen.ip, seen.plen);
            return vec![];
        };
        let key = PathKey {
            vrf: seen.vrf,
            prefix: prefix.trunc(),
            interface: seen.interface,
        };
        self.handle_event(key, PathEvent::TrafficSeen)
    }

    /// Feed `event` to the state machine of path `key`, creating it if needed, and apply the
    /// resulting side effects.
    pub fn handle_event(&self, key: PathKey, event: PathEvent) -> Vec<SideEffect> {
        let mut paths = self.paths.lock();
        let path = paths.entry(key).or_default();
        if let PathEvent::SeqChange { remote_seq } = event {
            path.remote_seq = path.remote_seq.max(remote_seq);
            if remote_seq <= path.seq {
                return vec![];
            }
        }
        let (state, effects) = transition(path.state, event);
        for effect in &effects {
            match effect {
                SideEffect::SetPreference { high } => path.high = *high,
                SideEffect::BumpSequence => {
                    path.seq = path.seq.max(path.remote_seq).wrapping_add(1);
                }
                SideEffect::NotifyRoute => path.notifications += 1,
            }
        }
        if state != path.state {
            debug!(
                "Path {} {} via {}: {:?} -> {state:?}, seq {}",
                key.vrf, key.prefix, key.interface, path.state, path.seq
            );
        }
        path.state = state;
        effects
    }

    #[must_use]
    pub fn path(&self, key: &PathKey) -> Option<PathPreference> {
        self.paths.lock().get(key).copied()
    }

    /// Forget the paths through `interface`.
    pub fn remove_interface(&self, interface: InterfaceId) -> usize {
        let mut paths = self.paths.lock();
        let before = paths.len();
        paths.retain(|k, _| k.interface != interface);
        before - paths.len()
    }
}
