// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![allow(dead_code)]

use config::EngineConfig;
use flow_info::{FlowEntry, FlowId, FlowKey, InterfaceId, KSyncHandle, NhId, PacketInfo, VnId, VrfId};
use ipnet::IpNet;
use ksync::{KSyncCompletion, SimTransport};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tables::{Encap, InterfaceBuilder, NextHop, Route, RouteDirective, Tables, Vn, Vrf};
use tokio::sync::mpsc::UnboundedReceiver;
use vragent_flow_engine::{EngineContext, FlowEngine};

pub const VM1: &str = "1.1.1.1";
pub const VM2: &str = "1.1.1.2";
pub const VM5: &str = "2.2.2.5";

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

pub fn local_route(vrf: u32, prefix: &str, vn: u32, iface: u32) -> Route {
    Route::new(
        VrfId(vrf),
        net(prefix),
        Some(VnId(vn)),
        NhId(100 + iface),
        RouteDirective::Local {
            interface: InterfaceId(iface),
        },
    )
}

/// vm1 and vm2 in vn1 (vrf1), vm5 in vn2 (vrf2), a fabric vrf0 with a default route.
pub fn topology() -> Tables {
    let tables = Tables::new();
    for vrf in [0, 1, 2] {
        tables.upsert_vrf(Vrf::new(VrfId(vrf), None));
    }
    tables.upsert_vn(Vn::new(VnId(1)));
    tables.upsert_vn(Vn::new(VnId(2)));
    for (id, addr, vrf, vn) in [(1, VM1, 1, 1), (2, VM2, 1, 1), (5, VM5, 2, 2)] {
        tables.upsert_interface(
            InterfaceBuilder::default()
                .id(InterfaceId(id))
                .vrf(VrfId(vrf))
                .vn(VnId(vn))
                .ip(ip(addr))
                .nh(NhId(100 + id))
                .build()
                .unwrap(),
        );
        tables.upsert_nexthop(
            NhId(100 + id),
            NextHop::Interface {
                interface: InterfaceId(id),
            },
        );
        tables.add_route(local_route(vrf, &format!("{addr}/32"), vn, id));
    }
    tables.upsert_nexthop(
        NhId(50),
        NextHop::Tunnel {
            dst: ip("192.168.1.2"),
            encap: Encap::MplsGre,
        },
    );
    tables.add_route(Route::new(
        VrfId(0),
        net("0.0.0.0/0"),
        None,
        NhId(50),
        RouteDirective::Remote,
    ));
    tables
}

/// An engine on top of [`topology`] and a simulated forwarding plane, driven by hand.
pub struct Harness {
    pub tables: Arc<Tables>,
    pub sim: Arc<SimTransport>,
    pub completions: UnboundedReceiver<KSyncCompletion>,
    pub engine: Arc<FlowEngine>,
    pub now: Instant,
}

impl Harness {
    pub fn new() -> Self {
        let mut builder = EngineConfig::builder();
        builder.flow_age_time(Duration::from_secs(10));
        let tables = Arc::new(topology());
        let (sim, completions) = SimTransport::new();
        let ctx = EngineContext::new(builder.build().unwrap(), tables.clone(), sim.clone());
        let engine = Arc::new(FlowEngine::new(&ctx).unwrap());
        let weak = Arc::downgrade(&engine);
        tables.subscribe(move |change| {
            if let Some(engine) = weak.upgrade() {
                engine.on_change(change);
            }
        });
        Self {
            tables,
            sim,
            completions,
            engine,
            now: Instant::now(),
        }
    }

    /// First packet of `key`, sent by local interface `iface`.
    pub fn packet(&self, key: FlowKey, iface: u32) -> FlowId {
        let vrf = if iface == 5 { VrfId(2) } else { VrfId(1) };
        let packet = PacketInfo::new(key, vrf).with_interface(InterfaceId(iface));
        self.engine.process_packet(packet, self.now)
    }

    pub fn pump(&mut self) {
        while let Ok(completion) = self.completions.try_recv() {
            self.engine.complete(completion, self.now);
        }
    }

    pub fn advance(&mut self, secs: u64) {
        self.now += Duration::from_secs(secs);
    }

    /// Run the queued revaluations of every shard.
    pub fn revaluate(&mut self) {
        let shards = u32::try_from(self.engine.table().shard_count()).unwrap();
        for shard in 0..shards {
            while self.engine.revaluate(shard, self.now) > 0 {}
        }
        self.pump();
    }

    pub fn reverse(&self, id: FlowId) -> FlowId {
        self.engine
            .table()
            .with_entry(id, FlowEntry::reverse)
            .flatten()
            .unwrap()
    }

    pub fn handle(&self, id: FlowId) -> KSyncHandle {
        self.engine
            .table()
            .with_entry(id, FlowEntry::handle)
            .flatten()
            .unwrap()
    }
}
