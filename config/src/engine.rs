// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow engine parameters.

use derive_builder::Builder;
use serde::Deserialize;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::{ConfigError, ConfigResult};

/// An inclusive range of L4 ports used as a NAT port pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    #[must_use]
    pub const fn new(first: u16, last: u16) -> Self {
        Self { first, last }
    }
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        (self.first..=self.last).contains(&port)
    }
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.last.saturating_sub(self.first)) + 1
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first > self.last || self.first == 0
    }
    #[must_use]
    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.first <= other.last && other.first <= self.last
    }
    fn check(&self, name: &'static str) -> ConfigResult {
        if self.is_empty() {
            return Err(ConfigError::BadPortRange {
                name,
                first: self.first,
                last: self.last,
            });
        }
        Ok(())
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.first, self.last)
    }
}

/// Parameters of the flow engine. N.B. we derive a builder type [`EngineConfigBuilder`]
/// providing defaults for every field.
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(private, name = "build_unchecked"))]
pub struct EngineConfig {
    /// Number of flow table shards, which is also the number of packet workers.
    #[builder(default = 4)]
    pub shards: usize,

    /// Idle time after which a flow pair is evicted.
    #[builder(default = Duration::from_secs(180))]
    pub flow_age_time: Duration,

    /// Period of the aging sweep.
    #[builder(default = Duration::from_secs(1))]
    pub aging_interval: Duration,

    /// Above this many live flows, new flows are created as short flows.
    #[builder(default = 512 * 1024)]
    pub max_flows: usize,

    /// Depth of every bounded per-shard work queue.
    #[builder(default = 1024)]
    pub queue_depth: usize,

    /// Maximum number of recomputations a revaluation consumer runs per wake-up.
    #[builder(default = 256)]
    pub revaluation_batch: usize,

    #[builder(default = Duration::from_secs(2))]
    pub ksync_op_timeout: Duration,

    #[builder(default = Duration::from_millis(50))]
    pub ksync_retry_base: Duration,

    #[builder(default = Duration::from_secs(5))]
    pub ksync_retry_max_backoff: Duration,

    #[builder(default = 5)]
    pub ksync_max_retries: u32,

    /// Host address used as source for link-local and gateway SNAT.
    #[builder(setter(into), default = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))]
    pub vhost_ip: IpAddr,

    /// Underlay VRF.
    #[builder(default = 0)]
    pub fabric_vrf: u32,

    #[builder(default = PortRange::new(32768, 49151))]
    pub linklocal_ports: PortRange,

    #[builder(default = PortRange::new(49152, 65535))]
    pub fabric_snat_ports: PortRange,

    #[builder(default = 512)]
    pub traffic_seen_queue: usize,
}

impl EngineConfigBuilder {
    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any parameter is out of range.
    pub fn build(&self) -> Result<EngineConfig, ConfigError> {
        let config = self
            .build_unchecked()
            .map_err(|e| ConfigError::Builder(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for EngineConfig {
    // all fields have builder defaults, so this cannot fail
    #[allow(clippy::expect_used)]
    fn default() -> Self {
        EngineConfigBuilder::default()
            .build_unchecked()
            .expect("builder defaults are complete")
    }
}

impl EngineConfig {
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    pub fn validate(&self) -> ConfigResult {
        if self.shards == 0 || !self.shards.is_power_of_two() {
            return Err(ConfigError::InvalidShardCount(self.shards));
        }
        if self.flow_age_time.is_zero() {
            return Err(ConfigError::ZeroValue("flow_age_time"));
        }
        if self.aging_interval.is_zero() {
            return Err(ConfigError::ZeroValue("aging_interval"));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::ZeroValue("queue_depth"));
        }
        if self.revaluation_batch == 0 {
            return Err(ConfigError::ZeroValue("revaluation_batch"));
        }
        if self.traffic_seen_queue == 0 {
            return Err(ConfigError::ZeroValue("traffic_seen_queue"));
        }
        self.linklocal_ports.check("linklocal_ports")?;
        self.fabric_snat_ports.check("fabric_snat_ports")?;
        if self.linklocal_ports.overlaps(&self.fabric_snat_ports) {
            return Err(ConfigError::OverlappingPortRanges);
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (starting at 1) of a failed forwarding-plane op.
    #[must_use]
    pub fn ksync_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.ksync_retry_base
            .saturating_mul(factor)
            .min(self.ksync_retry_max_backoff)
    }

    /// Parse a YAML document. Missing keys take their default values.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: EngineConfigFile =
            serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        file.into_builder().build()
    }

    /// Load and validate a YAML configuration file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading configuration from {}", path.display());
        let yaml = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config = Self::from_yaml_str(&yaml)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}

impl Display for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Engine config")?;
        writeln!(f, "  shards         : {}", self.shards)?;
        writeln!(f, "  flow age time  : {:?}", self.flow_age_time)?;
        writeln!(f, "  aging interval : {:?}", self.aging_interval)?;
        writeln!(f, "  max flows      : {}", self.max_flows)?;
        writeln!(f, "  vhost ip       : {}", self.vhost_ip)?;
        writeln!(f, "  fabric vrf     : {}", self.fabric_vrf)?;
        writeln!(f, "  link-local pool: {}", self.linklocal_ports)?;
        write!(f, "  fabric snat    : {}", self.fabric_snat_ports)
    }
}

/// On-disk shape of the configuration. Durations are in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct EngineConfigFile {
    shards: Option<usize>,
    flow_age_time_ms: Option<u64>,
    aging_interval_ms: Option<u64>,
    max_flows: Option<usize>,
    queue_depth: Option<usize>,
    revaluation_batch: Option<usize>,
    ksync_op_timeout_ms: Option<u64>,
    ksync_retry_base_ms: Option<u64>,
    ksync_retry_max_backoff_ms: Option<u64>,
    ksync_max_retries: Option<u32>,
    vhost_ip: Option<IpAddr>,
    fabric_vrf: Option<u32>,
    linklocal_ports: Option<PortRange>,
    fabric_snat_ports: Option<PortRange>,
    traffic_seen_queue: Option<usize>,
}

impl EngineConfigFile {
    fn into_builder(self) -> EngineConfigBuilder {
        let mut b = EngineConfigBuilder::default();
        if let Some(v) = self.shards {
            b.shards(v);
        }
        if let Some(v) = self.flow_age_time_ms {
            b.flow_age_time(Duration::from_millis(v));
        }
        if let Some(v) = self.aging_interval_ms {
            b.aging_interval(Duration::from_millis(v));
        }
        if let Some(v) = self.max_flows {
            b.max_flows(v);
        }
        if let Some(v) = self.queue_depth {
            b.queue_depth(v);
        }
        if let Some(v) = self.revaluation_batch {
            b.revaluation_batch(v);
        }
        if let Some(v) = self.ksync_op_timeout_ms {
            b.ksync_op_timeout(Duration::from_millis(v));
        }
        if let Some(v) = self.ksync_retry_base_ms {
            b.ksync_retry_base(Duration::from_millis(v));
        }
        if let Some(v) = self.ksync_retry_max_backoff_ms {
            b.ksync_retry_max_backoff(Duration::from_millis(v));
        }
        if let Some(v) = self.ksync_max_retries {
            b.ksync_max_retries(v);
        }
        if let Some(v) = self.vhost_ip {
            b.vhost_ip(v);
        }
        if let Some(v) = self.fabric_vrf {
            b.fabric_vrf(v);
        }
        if let Some(v) = self.linklocal_ports {
            b.linklocal_ports(v);
        }
        if let Some(v) = self.fabric_snat_ports {
            b.fabric_snat_ports(v);
        }
        if let Some(v) = self.traffic_seen_queue {
            b.traffic_seen_queue(v);
        }
        b
    }
}
