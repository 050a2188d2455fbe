// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use flow_info::{FlowEntry, FlowId};
use std::time::Instant;
use tracing::debug;

use crate::context::{FlowEngine, pair_head};

/// Outcome of an aging sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Pairs examined, half-open ones included.
    pub pairs: usize,
    /// Entries evicted.
    pub evicted: usize,
    /// Live entries after the sweep.
    pub active: u64,
}

impl FlowEngine {
    /// Read the forwarding plane counters of both halves of the pair headed by `id` and tell
    /// whether the pair must be evicted: it is a short flow, or neither half saw traffic since
    /// the previous sweep and the last traffic is older than the flow age time. A pair with a
    /// forwarding plane operation still pending has no counters to tell and is kept.
    fn expired(&self, id: FlowId, now: Instant) -> bool {
        let Some(reverse) = self.table.with_entry(id, FlowEntry::reverse) else {
            return false;
        };
        let mut short = false;
        let mut pending = false;
        let mut active = false;
        let mut last_traffic: Option<Instant> = None;
        for half in std::iter::once(id).chain(reverse) {
            let Some((handle, is_short, is_pending)) = self
                .table
                .with_entry(half, |e| (e.handle(), e.is_short_flow(), e.is_pending()))
            else {
                continue;
            };
            short |= is_short;
            pending |= is_pending;
            let counters = handle.and_then(|h| self.ksync.stats(h));
            let observed = self.table.with_entry_mut(half, |e| {
                let seen = counters.is_some_and(|c| e.stats.observe(c, now));
                (seen, e.stats.last_traffic)
            });
            match observed {
                Ok((seen, last)) => {
                    active |= seen;
                    last_traffic = Some(last_traffic.map_or(last, |l| l.max(last)));
                }
                Err(e) => debug!("Flow {half} went away during the sweep: {e}"),
            }
        }
        if short {
            return true;
        }
        if pending {
            return false;
        }
        !active
            && last_traffic
                .is_some_and(|l| now.saturating_duration_since(l) >= self.config.flow_age_time)
    }

    /// Evict idle pairs and short flows. Both halves of a pair are always evicted together.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        self.sweep_heads(None, now)
    }

    /// Evict the idle pairs and short flows handled by `shard`.
    pub fn sweep_shard(&self, shard: u32, now: Instant) -> SweepReport {
        self.sweep_heads(Some(shard), now)
    }

    fn sweep_heads(&self, shard: Option<u32>, now: Instant) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();
        let heads = self.table.select(|e| {
            let id = e.id();
            pair_head(e) == id && shard.is_none_or(|s| id.shard == s)
        });
        for id in heads {
            report.pairs += 1;
            if !self.expired(id, now) {
                continue;
            }
            match self.delete_pair(id, now) {
                Ok(evicted) => report.evicted += evicted,
                Err(e) => debug!("Cannot evict flow {id}: {e}"),
            }
        }
        report.active = self.table.count();
        self.metrics.evicted.increment(report.evicted as u64);
        self.metrics
            .sweep_seconds
            .set(started.elapsed().as_secs_f64());
        if report.evicted > 0 {
            debug!(
                "Aging evicted {} of {} flow pairs, {} flows left",
                report.evicted, report.pairs, report.active
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{Fixture, ip, vm_packet};
    use flow_info::{FlowKey, NhId, ShortReason};
    use ksync::KSyncError;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn icmp_pair(fx: &mut Fixture) -> (FlowId, FlowId) {
        let key = FlowKey::icmp(NhId(101), ip("1.1.1.1"), ip("1.1.1.2"), 7);
        let id = fx.engine.process_packet(vm_packet(key, 1), fx.now);
        fx.pump();
        let reverse = fx
            .engine
            .table()
            .with_entry(id, FlowEntry::reverse)
            .flatten()
            .unwrap();
        (id, reverse)
    }

    #[test]
    fn idle_pair_is_evicted_after_the_age_time() {
        let mut fx = Fixture::new();
        icmp_pair(&mut fx);
        fx.advance(Duration::from_secs(5));
        assert_eq!(fx.engine.sweep(fx.now).evicted, 0);
        fx.advance(Duration::from_secs(5));
        let report = fx.engine.sweep(fx.now);
        assert_eq!(report.evicted, 2);
        assert_eq!(report.active, 0);
        fx.pump();
        assert_eq!(fx.sim.active_count(), 0);
        assert_eq!(fx.engine.table().slots(), 0);
    }

    #[test]
    fn traffic_on_either_half_keeps_the_pair() {
        let mut fx = Fixture::new();
        let (id, reverse) = icmp_pair(&mut fx);
        fx.advance(Duration::from_secs(8));
        fx.sim.add_traffic(fx.handle(reverse).unwrap(), 1, 64);
        assert_eq!(fx.engine.sweep(fx.now).evicted, 0);

        // the forward half has been idle for 12s, the reverse one for 4s
        fx.advance(Duration::from_secs(4));
        assert_eq!(fx.engine.sweep(fx.now).evicted, 0);
        assert!(fx.engine.table().with_entry(id, |e| e.is_deleted()) == Some(false));

        fx.advance(Duration::from_secs(6));
        assert_eq!(fx.engine.sweep(fx.now).evicted, 2);
    }

    #[test]
    fn pair_waiting_for_its_install_is_kept() {
        let mut fx = Fixture::new();
        fx.sim.set_down(true);
        let (id, reverse) = icmp_pair(&mut fx);
        assert_eq!(fx.handle(id), None);
        assert_eq!(fx.engine.table().with_entry(id, FlowEntry::is_pending), Some(true));

        fx.advance(Duration::from_secs(11));
        assert_eq!(fx.engine.sweep(fx.now).evicted, 0);

        fx.sim.set_down(false);
        fx.engine.ksync_tick(fx.now);
        fx.pump();
        assert!(fx.handle(id).is_some());
        assert!(fx.handle(reverse).is_some());
        assert_eq!(fx.engine.sweep(fx.now).evicted, 2);
    }

    #[test]
    fn shard_sweep_only_takes_its_own_pairs() {
        let mut fx = Fixture::with_config(|c| {
            c.shards(2);
        });
        let (id, _) = icmp_pair(&mut fx);
        fx.advance(Duration::from_secs(10));
        let other = 1 - id.shard;
        assert_eq!(fx.engine.sweep_shard(other, fx.now).evicted, 0);
        assert_eq!(fx.engine.sweep_shard(id.shard, fx.now).evicted, 2);
    }

    #[test]
    fn short_flow_is_evicted_on_the_next_sweep() {
        let mut fx = Fixture::new();
        fx.sim.fail_next(KSyncError::ResourceExhausted);
        let (id, _) = icmp_pair(&mut fx);
        assert_eq!(
            fx.engine.table().with_entry(id, FlowEntry::short_reason),
            Some(Some(ShortReason::FailedVrouterInstall))
        );
        assert_eq!(fx.engine.sweep(fx.now).evicted, 2);
        fx.pump();
        assert_eq!(fx.engine.flow_count(), 0);
        assert_eq!(fx.sim.active_count(), 0);
    }
}
