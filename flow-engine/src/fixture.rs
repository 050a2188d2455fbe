// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tables, simulated forwarding plane and engine shared by the unit tests.

use config::{EngineConfig, EngineConfigBuilder};
use flow_info::{FlowId, FlowKey, InterfaceId, KSyncHandle, NhId, PacketInfo, VnId, VrfId};
use ipnet::IpNet;
use ksync::{KSyncCompletion, SimTransport};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tables::{InterfaceBuilder, NextHop, Route, RouteDirective, Tables, Vn, Vrf};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::context::{EngineContext, FlowEngine};

pub(crate) fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub(crate) fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

/// First packet of `key` sent by local interface `iface`.
pub(crate) fn vm_packet(key: FlowKey, iface: u32) -> PacketInfo {
    let vrf = if iface == 5 { VrfId(2) } else { VrfId(1) };
    PacketInfo::new(key, vrf).with_interface(InterfaceId(iface))
}

/// vm1 1.1.1.1 and vm2 1.1.1.2 in vn1 (vrf1), vm5 2.2.2.5 in vn2 (vrf2), interface next hops
/// 100 + id, and a fabric vrf0 with a default route through tunnel next hop 50.
pub(crate) fn topology() -> Tables {
    let tables = Tables::new();
    for vrf in [0, 1, 2] {
        tables.upsert_vrf(Vrf::new(VrfId(vrf), None));
    }
    tables.upsert_vn(Vn::new(VnId(1)));
    tables.upsert_vn(Vn::new(VnId(2)));
    for (id, addr, vrf, vn) in [(1, "1.1.1.1", 1, 1), (2, "1.1.1.2", 1, 1), (5, "2.2.2.5", 2, 2)] {
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
        tables.add_route(Route::new(
            VrfId(vrf),
            net(&format!("{addr}/32")),
            Some(VnId(vn)),
            NhId(100 + id),
            RouteDirective::Local {
                interface: InterfaceId(id),
            },
        ));
    }
    tables.upsert_nexthop(
        NhId(50),
        NextHop::Tunnel {
            dst: ip("192.168.1.2"),
            encap: tables::Encap::MplsGre,
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

pub(crate) struct Fixture {
    pub tables: Arc<Tables>,
    pub sim: Arc<SimTransport>,
    pub rx: UnboundedReceiver<KSyncCompletion>,
    pub engine: Arc<FlowEngine>,
    pub now: Instant,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(f: impl FnOnce(&mut EngineConfigBuilder)) -> Self {
        let mut builder = EngineConfig::builder();
        builder.flow_age_time(Duration::from_secs(10));
        f(&mut builder);
        let config = builder.build().unwrap();
        let tables = Arc::new(topology());
        let (sim, rx) = SimTransport::new();
        let ctx = EngineContext::new(config, tables.clone(), sim.clone());
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
            rx,
            engine,
            now: Instant::now(),
        }
    }

    /// Deliver the completions of the forwarding plane.
    pub fn pump(&mut self) -> usize {
        let mut count = 0;
        while let Ok(completion) = self.rx.try_recv() {
            self.engine.complete(completion, self.now);
            count += 1;
        }
        count
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn handle(&self, id: FlowId) -> Option<KSyncHandle> {
        self.engine.table().with_entry(id, |e| e.handle()).flatten()
    }
}
