// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU utilization model.
//!
//! The fair-class utilization of a CPU is rebuilt from its cfs_rq tree: the
//! per task group leaves are capped by their group throttle, the root keeps
//! whatever is not accounted in a leaf. Estimated utilization, when enabled,
//! acts as a floor.

use crate::policy::Policy;
use crate::rq::RqSnapshot;
use crate::types::cap_scale;
use crate::types::TaskGroupId;
use crate::types::UclampId;
use crate::types::Util;
use crate::types::SCHED_CAPACITY_SHIFT;
use crate::uclamp::uclamp_rq_util_with;
use crate::Task;

/// What an effective utilization is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilKind {
    /// Busy time, for energy estimation. Clamps do not apply.
    Energy,
    /// Frequency selection. Clamps apply.
    Frequency,
}

const UTIL_EST_WEIGHT_SHIFT: u32 = 2;
const UTIL_EST_MARGIN: i64 = (crate::types::SCHED_CAPACITY_SCALE / 100) as i64;

impl<'a> Policy<'a> {
    /// root - sum(leaves) + sum(min(leaf, throttle))
    pub fn cpu_util_cfs_group_mod_no_est(&self, rq: &RqSnapshot) -> Util {
        let scale_cpu = self.capacity_orig_of(rq.cpu);
        let mut util = 0;
        let mut unclamped_util = 0;

        for (tg, leaf) in rq.cfs.leaves.iter() {
            unclamped_util += *leaf;
            util += (*leaf).min(cap_scale(self.group_throttle(*tg), scale_cpu));
        }

        // Subgroups are updated independently from the root and may briefly
        // add up to more than it.
        util + rq.cfs.util_avg.saturating_sub(unclamped_util)
    }

    pub fn cpu_util_cfs_group_mod(&self, rq: &RqSnapshot) -> Util {
        let util = self.cpu_util_cfs_group_mod_no_est(rq);
        if self.tunables.util_est {
            return util.max(rq.cfs.util_est_enqueued);
        }
        util
    }

    pub fn cpu_util(&self, rq: &RqSnapshot) -> Util {
        self.cpu_util_cfs_group_mod(rq)
            .min(self.capacity_of(rq.cpu))
    }

    /// Utilization of `rq`'s CPU without `p`'s contribution. Unchanged if
    /// `p` is not accounted there.
    pub fn cpu_util_without(&self, rq: &RqSnapshot, p: &Task) -> Util {
        if rq.cpu != p.cpu || p.last_update_time == 0 {
            return self.cpu_util_cfs_group_mod(rq);
        }

        let mut util = self
            .cpu_util_cfs_group_mod_no_est(rq)
            .saturating_sub(p.task_util());

        if self.tunables.util_est {
            let mut estimated = rq.cfs.util_est_enqueued;
            if p.on_rq || rq.curr == Some(p.pid) {
                estimated = estimated.saturating_sub(p.util_est_raw());
            }
            util = util.max(estimated);
        }

        util
    }

    /// Utilization of `cpu` if `p` ran on `dst_cpu`.
    ///
    /// Only the leaf of `p`'s task group (or the root, for ungrouped tasks)
    /// sees the task's utilization move; the other leaves keep their value
    /// and their throttle.
    pub fn cpu_util_next(&self, rq: &RqSnapshot, p: &Task, dst_cpu: usize) -> Util {
        let cpu = rq.cpu;
        let scale_cpu = self.capacity_orig_of(cpu);
        let task_util = p.task_util() as i64;
        let delta = if p.cpu == cpu && dst_cpu != cpu {
            -task_util
        } else if p.cpu != cpu && dst_cpu == cpu {
            task_util
        } else {
            0
        };

        let mut util: i64 = 0;
        let mut unclamped_util: i64 = 0;
        let mut seen_task_group = false;
        for (tg, leaf) in rq.cfs.leaves.iter() {
            let leaf = *leaf as i64;
            let group_util = if *tg == p.task_group {
                seen_task_group = true;
                (leaf + delta).max(0)
            } else {
                leaf
            };
            unclamped_util += leaf;
            util += group_util.min(cap_scale(self.group_throttle(*tg), scale_cpu) as i64);
        }
        // The task's group has no cfs_rq here yet.
        if !seen_task_group && p.task_group != TaskGroupId::ROOT {
            util += delta
                .max(0)
                .min(cap_scale(self.group_throttle(p.task_group), scale_cpu) as i64);
        }

        let root_delta = if p.task_group == TaskGroupId::ROOT {
            delta
        } else {
            0
        };
        let mut util = (rq.cfs.util_avg as i64 - unclamped_util + util + root_delta).max(0) as Util;

        if self.tunables.util_est {
            let mut util_est = rq.cfs.util_est_enqueued;
            // A task already enqueued here is part of the sum.
            if dst_cpu == cpu && !(p.on_rq && p.cpu == cpu) {
                util_est += p.util_est_raw();
            }
            util = util.max(util_est);
        }

        util.min(self.capacity_of(cpu))
    }

    /// Utilization the CPU runs at once RT pressure and, for frequency
    /// selection, the run-queue clamps (merged with `p`'s) are applied.
    pub fn effective_cpu_util(
        &self,
        rq: &RqSnapshot,
        util_cfs: Util,
        max: Util,
        kind: UtilKind,
        p: Option<&Task>,
    ) -> Util {
        let rt_runnable = rq.nr_running > rq.h_nr_running;
        if !self.uclamp_used && kind == UtilKind::Frequency && rt_runnable {
            return max;
        }

        let mut util = util_cfs + rq.rt_util;
        if kind == UtilKind::Frequency {
            util = uclamp_rq_util_with(self, rq, util, p);
        }

        util.min(max)
    }

    /// Frequency needed to serve `util` on a CPU of capacity `cap` whose
    /// highest frequency is `freq`. The capacity margin is added unless the
    /// run-queue is already boosted by its min clamp, and never pushes past
    /// its max clamp.
    pub fn map_util_freq(&self, rq: &RqSnapshot, util: Util, freq: u64, cap: Util) -> u64 {
        if cap == 0 {
            return freq;
        }

        let rq_util = self.cpu_util(rq) + rq.rt_util;
        let uclamp_min = rq.uclamp_value(UclampId::Min) as Util;
        let uclamp_max = rq.uclamp_value(UclampId::Max) as Util;

        if rq_util < uclamp_min {
            return freq * util / cap;
        }

        let util = ((util * self.margin(rq.cpu)) >> SCHED_CAPACITY_SHIFT).min(uclamp_max);
        freq * util / cap
    }

    /// Refresh `p`'s estimated utilization at the end of an activation on
    /// `cpu`.
    pub fn util_est_update(&self, p: &mut Task, cpu: usize, task_sleep: bool) {
        if !self.tunables.util_est || !task_sleep {
            return;
        }
        if p.util_est.unchanged {
            return;
        }

        let scale_cpu = self.capacity_orig_of(cpu);
        let uclamp_max = self.uclamp_eff_value(p, UclampId::Max) as Util;
        let throttle = cap_scale(self.group_throttle(p.task_group), scale_cpu);

        let mut ue = p.util_est;
        ue.enqueued = p.task_util().min(uclamp_max).min(throttle);

        if !(self.tunables.util_est_fastup && ue.ewma < ue.enqueued) {
            let last_ewma_diff = ue.enqueued as i64 - ue.ewma as i64;
            if last_ewma_diff.abs() < UTIL_EST_MARGIN {
                return;
            }
            // No idle time on this CPU to tell the real size.
            if p.task_util() > scale_cpu {
                return;
            }

            let ewma = ((ue.ewma as i64) << UTIL_EST_WEIGHT_SHIFT) + last_ewma_diff;
            ue.ewma = ((ewma >> UTIL_EST_WEIGHT_SHIFT).max(0) as Util)
                .min(uclamp_max)
                .min(throttle);
        } else {
            ue.ewma = ue.enqueued;
        }

        ue.unchanged = true;
        p.util_est = ue;
    }

    /// Initial utilization for a task starting on `cpu`.
    pub fn post_init_util(&self, rq: &RqSnapshot) -> Option<Util> {
        if rq.cfs.util_avg != 0 {
            return None;
        }
        Some((self.tunables.util_post_init_scale * self.capacity_orig_of(rq.cpu)) >> SCHED_CAPACITY_SHIFT)
    }
}
