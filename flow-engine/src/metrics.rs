// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use metrics::{Counter, Gauge, Unit};

fn register_counter(name: &'static str, description: &'static str) -> Counter {
    tracectl::register_counter(module_path!(), name, description)
}

fn register_gauge(name: &'static str, unit: Unit, description: &'static str) -> Gauge {
    tracectl::register_gauge(module_path!(), name, unit, description)
}

/// Metrics reported by the engine. Forwarding plane errors and retries are reported by the
/// KSync adapter itself.
#[derive(Debug)]
pub struct EngineMetrics {
    pub created: Counter,
    pub deleted: Counter,
    pub evicted: Counter,
    pub short: Counter,
    pub revaluated: Counter,
    pub traffic_seen_dropped: Counter,
    pub active: Gauge,
    pub sweep_seconds: Gauge,
}

impl EngineMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            created: register_counter("flow_created", "Flow entries created"),
            deleted: register_counter("flow_deleted", "Flow entries deleted"),
            evicted: register_counter("flow_evicted", "Flow entries evicted by aging"),
            short: register_counter("flow_short", "Flows created or revaluated as short flows"),
            revaluated: register_counter(
                "flow_revaluated",
                "Flow pairs recomputed after a table change",
            ),
            traffic_seen_dropped: register_counter(
                "traffic_seen_dropped",
                "Traffic seen notifications dropped on a full queue",
            ),
            active: register_gauge("flow_active", Unit::Count, "Live flow entries"),
            sweep_seconds: register_gauge(
                "aging_sweep_seconds",
                Unit::Seconds,
                "Duration of the last aging sweep",
            ),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
