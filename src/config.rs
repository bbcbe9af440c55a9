// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Policy tunables.
//!
//! Everything has a default so a scenario or an embedding scheduler only
//! spells out what it changes.

use crate::types::UclampId;
use crate::types::SCHED_CAPACITY_SCALE;
use crate::types::UCLAMP_CNT;
use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

/// 1280 / 1024: a task fits a CPU while it uses less than 80% of it.
pub const DEF_UTIL_THRESHOLD: u64 = 1280;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Capacity margin applied by every fitness check, on the capacity scale.
    pub capacity_margin: u64,
    /// Per-CPU overrides of `capacity_margin`.
    pub cpu_margin: BTreeMap<usize, u64>,
    /// Use estimated utilization on top of PELT.
    pub util_est: bool,
    /// Let the estimate follow utilization increases immediately.
    pub util_est_fastup: bool,
    /// Whether clamp accounting is enabled at all.
    pub uclamp_used: bool,
    /// System-wide clamp ceilings, both at full capacity unless restricted.
    pub uclamp_default: [u32; UCLAMP_CNT],
    /// An idle previous CPU is kept when its exit latency is at most this.
    pub c1_exit_latency_us: u64,
    /// Minimum run-queue min+max clamp importance worth pulling from.
    pub importance_threshold: u32,
    /// Initial utilization of a new task on an empty CPU, per 1024 of capacity.
    pub util_post_init_scale: u64,
    /// First CPU on which a sync wakeup counts as boosted.
    pub high_capacity_cpu: Option<usize>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            capacity_margin: DEF_UTIL_THRESHOLD,
            cpu_margin: BTreeMap::new(),
            util_est: true,
            util_est_fastup: true,
            uclamp_used: true,
            uclamp_default: [UclampId::Max.none(), UclampId::Max.none()],
            c1_exit_latency_us: 1,
            importance_threshold: 1148,
            util_post_init_scale: 36,
            high_capacity_cpu: None,
        }
    }
}

impl Tunables {
    pub fn margin_of(&self, cpu: usize) -> u64 {
        self.cpu_margin
            .get(&cpu)
            .copied()
            .unwrap_or(self.capacity_margin)
    }

    pub fn validate(&self, nr_cpus: usize) -> Result<()> {
        if self.capacity_margin < SCHED_CAPACITY_SCALE {
            bail!(
                "capacity_margin {} below {}",
                self.capacity_margin,
                SCHED_CAPACITY_SCALE
            );
        }
        for (cpu, margin) in self.cpu_margin.iter() {
            if *cpu >= nr_cpus || *margin < SCHED_CAPACITY_SCALE {
                bail!("Invalid capacity margin {} for CPU {}", margin, cpu);
            }
        }
        if let Some(cpu) = self.high_capacity_cpu {
            if cpu >= nr_cpus {
                bail!("High capacity CPU {} out of range ({} CPUs)", cpu, nr_cpus);
            }
        }
        let [min, max] = self.uclamp_default;
        if min > max || max > SCHED_CAPACITY_SCALE as u32 {
            bail!("Invalid default clamps {}-{}", min, max);
        }
        Ok(())
    }
}
