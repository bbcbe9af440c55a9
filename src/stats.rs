// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::select::PlacementReason;
use metrics::counter;
use metrics::histogram;
use metrics::Counter;
use metrics::Histogram;
use std::fmt;

pub struct Metrics {
    exec: Counter,
    sync_wakeup: Counter,
    prev_idle: Counter,
    energy_efficient: Counter,
    pub sync_boost: Counter,
    pub affinity_moves: Counter,
    pub newidle_pulls: Counter,
    pub newidle_misfit_pulls: Counter,
    pub newidle_skipped: Counter,
    pub forks: Counter,
    pub feec_energy_calcs: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            exec: counter!("placed_tasks_total", "reason" => "exec"),
            sync_wakeup: counter!("placed_tasks_total", "reason" => "sync_wakeup"),
            prev_idle: counter!("placed_tasks_total", "reason" => "prev_idle"),
            energy_efficient: counter!("placed_tasks_total", "reason" => "energy_efficient"),
            sync_boost: counter!("sync_boost_total"),
            affinity_moves: counter!("affinity_moves_total"),
            newidle_pulls: counter!("newidle_pulls_total"),
            newidle_misfit_pulls: counter!("newidle_misfit_pulls_total"),
            newidle_skipped: counter!("newidle_skipped_total"),
            forks: counter!("forks_total"),
            feec_energy_calcs: histogram!("feec_energy_calcs"),
        }
    }

    pub fn placement(&self, reason: PlacementReason) -> &Counter {
        match reason {
            PlacementReason::Exec => &self.exec,
            PlacementReason::SyncWakeup => &self.sync_wakeup,
            PlacementReason::PrevIdle => &self.prev_idle,
            PlacementReason::EnergyEfficient => &self.energy_efficient,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Totals of one scenario replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub events: u64,
    pub wakeups: u64,
    pub migrations: u64,
    pub prev_idle: u64,
    pub sync_wakeups: u64,
    pub energy_placements: u64,
    pub newidle_runs: u64,
    pub newidle_pulls: u64,
    pub energy_calcs: u64,
}

impl ReplayStats {
    pub fn record_placement(&mut self, reason: PlacementReason, migrated: bool) {
        self.wakeups += 1;
        if migrated {
            self.migrations += 1;
        }
        match reason {
            PlacementReason::PrevIdle => self.prev_idle += 1,
            PlacementReason::SyncWakeup => self.sync_wakeups += 1,
            PlacementReason::EnergyEfficient => self.energy_placements += 1,
            PlacementReason::Exec => {}
        }
    }
}

impl fmt::Display for ReplayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "events={} wakeups={} migrated={:.1}% prev_idle={} sync={} feec={} energy_calcs={} newidle={}/{}",
            self.events,
            self.wakeups,
            pct(self.migrations, self.wakeups),
            self.prev_idle,
            self.sync_wakeups,
            self.energy_placements,
            self.energy_calcs,
            self.newidle_pulls,
            self.newidle_runs,
        )
    }
}

fn pct(n: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        n as f64 * 100.0 / total as f64
    }
}
