// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Pools of L4 ports used for source NAT to the host address.

use ahash::RandomState;
use config::PortRange;
use etherparse::IpNumber;
use roaring::RoaringBitmap;
use std::collections::HashMap;
use tracing::{debug, warn};

/// A range of ports, allocated independently for each L4 protocol.
///
/// Free ports are kept in a bitmap per protocol, created full on first use.
#[derive(Debug)]
pub struct PortPool {
    name: &'static str,
    range: PortRange,
    free: HashMap<u8, RoaringBitmap, RandomState>,
}

impl PortPool {
    #[must_use]
    pub fn new(name: &'static str, range: PortRange) -> Self {
        Self {
            name,
            range,
            free: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn range(&self) -> PortRange {
        self.range
    }

    fn bitmap(&mut self, proto: IpNumber) -> &mut RoaringBitmap {
        let range = self.range;
        self.free.entry(proto.0).or_insert_with(|| {
            let mut bitmap = RoaringBitmap::new();
            bitmap.insert_range(u32::from(range.first)..=u32::from(range.last));
            bitmap
        })
    }

    /// Take the lowest free port for `proto`.
    pub fn allocate(&mut self, proto: IpNumber) -> Option<u16> {
        let name = self.name;
        let bitmap = self.bitmap(proto);
        let Some(port) = bitmap.min() else {
            warn!("Port pool {name} exhausted for protocol {}", proto.0);
            return None;
        };
        bitmap.remove(port);
        u16::try_from(port).ok()
    }

    /// Give back a port. Returns false if the port does not belong to the pool or was free.
    pub fn release(&mut self, proto: IpNumber, port: u16) -> bool {
        if !self.range.contains(port) {
            return false;
        }
        let released = self.bitmap(proto).insert(u32::from(port));
        if !released {
            debug!("Port {port} of pool {} released twice", self.name);
        }
        released
    }

    /// True if `port` is currently allocated for `proto`.
    #[must_use]
    pub fn is_allocated(&self, proto: IpNumber, port: u16) -> bool {
        self.range.contains(port)
            && self
                .free
                .get(&proto.0)
                .is_some_and(|b| !b.contains(u32::from(port)))
    }

    #[must_use]
    pub fn in_use(&self, proto: IpNumber) -> u64 {
        let total = self.range.len() as u64;
        self.free.get(&proto.0).map_or(0, |b| total - b.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release() {
        let mut pool = PortPool::new("test", PortRange::new(1000, 1002));
        assert_eq!(pool.allocate(IpNumber::TCP), Some(1000));
        assert_eq!(pool.allocate(IpNumber::TCP), Some(1001));
        // protocols do not share ports
        assert_eq!(pool.allocate(IpNumber::UDP), Some(1000));
        assert_eq!(pool.allocate(IpNumber::TCP), Some(1002));
        assert_eq!(pool.allocate(IpNumber::TCP), None);
        assert_eq!(pool.in_use(IpNumber::TCP), 3);

        assert!(pool.is_allocated(IpNumber::TCP, 1001));
        assert!(pool.release(IpNumber::TCP, 1001));
        assert!(!pool.release(IpNumber::TCP, 1001));
        assert!(!pool.release(IpNumber::TCP, 5));
        assert!(!pool.is_allocated(IpNumber::TCP, 1001));
        assert_eq!(pool.allocate(IpNumber::TCP), Some(1001));
    }
}
