// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Registration of the metrics reported by the agent crates.

use metrics::{Counter, Gauge, Key, Level, Metadata, Unit};

/// Name, unit and description of a metric, and the module reporting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricSpec {
    pub target: &'static str,
    pub name: &'static str,
    pub unit: Unit,
    pub description: &'static str,
}

impl MetricSpec {
    #[must_use]
    pub const fn new(
        target: &'static str,
        name: &'static str,
        unit: Unit,
        description: &'static str,
    ) -> Self {
        Self {
            target,
            name,
            unit,
            description,
        }
    }

    fn key(&self) -> Key {
        Key::from_static_name(self.name)
    }

    fn metadata(&self) -> Metadata<'static> {
        Metadata::new(self.target, Level::INFO, None)
    }
}

/// Describe a metric to the installed recorder and get a handle to it.
pub trait Register<T> {
    fn register(self) -> T;
}

impl Register<Counter> for MetricSpec {
    fn register(self) -> Counter {
        let (key, metadata) = (self.key(), self.metadata());
        metrics::with_recorder(|r| {
            r.describe_counter(self.name.into(), Some(self.unit), self.description.into());
            r.register_counter(&key, &metadata)
        })
    }
}

impl Register<Gauge> for MetricSpec {
    fn register(self) -> Gauge {
        let (key, metadata) = (self.key(), self.metadata());
        metrics::with_recorder(|r| {
            r.describe_gauge(self.name.into(), Some(self.unit), self.description.into());
            r.register_gauge(&key, &metadata)
        })
    }
}

/// A counter of events reported by `target`.
#[must_use]
pub fn register_counter(
    target: &'static str,
    name: &'static str,
    description: &'static str,
) -> Counter {
    MetricSpec::new(target, name, Unit::Count, description).register()
}

#[must_use]
pub fn register_gauge(
    target: &'static str,
    name: &'static str,
    unit: Unit,
    description: &'static str,
) -> Gauge {
    MetricSpec::new(target, name, unit, description).register()
}
