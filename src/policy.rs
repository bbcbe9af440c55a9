// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Read-only view the placement and balancing decisions are made against.
//!
//! A `Policy` is assembled for one decision: it pins the current vendor group
//! and task group snapshots and copies the per-CPU capacities, frequencies
//! and activity masks, so a decision never observes a half-applied update.
//! The task classification and fitness rules live here as well.

use crate::config::Tunables;
use crate::energy_model::EnergyModel;
use crate::task::TaskGroupSnapshot;
use crate::topology::Topology;
use crate::types::TaskGroupId;
use crate::types::UclampId;
use crate::types::Util;
use crate::types::cap_scale;
use crate::types::SCHED_CAPACITY_SCALE;
use crate::vendor_group::VendorGroupProperty;
use crate::vendor_group::VendorGroupSnapshot;
use crate::Cpumask;
use crate::Task;
use std::sync::Arc;

pub struct Policy<'a> {
    pub topo: &'a Topology,
    pub em: Option<&'a EnergyModel>,
    pub tunables: &'a Tunables,
    pub vendor_groups: Arc<VendorGroupSnapshot>,
    pub task_groups: Arc<TaskGroupSnapshot>,
    /// Current capacity of each CPU, after RT/IRQ/thermal pressure.
    pub capacity: Vec<Util>,
    /// Last frequency requested for each CPU's domain, in kHz.
    pub cur_freq: Vec<u64>,
    pub active: Cpumask,
    pub online: Cpumask,
    pub uclamp_used: bool,
}

impl<'a> Policy<'a> {
    pub fn nr_cpus(&self) -> usize {
        self.topo.nr_cpus()
    }

    pub fn capacity_of(&self, cpu: usize) -> Util {
        self.capacity.get(cpu).copied().unwrap_or(0)
    }

    pub fn capacity_orig_of(&self, cpu: usize) -> Util {
        self.topo.capacity_orig(cpu)
    }

    /// First CPU on which a sync wakeup counts as boosted.
    pub fn high_capacity_cpu(&self) -> usize {
        self.tunables
            .high_capacity_cpu
            .unwrap_or(self.topo.mid_capacity_cpu())
    }

    pub fn margin(&self, cpu: usize) -> u64 {
        self.tunables.margin_of(cpu)
    }

    pub fn vendor_prop(&self, p: &Task) -> &VendorGroupProperty {
        self.vendor_groups.get(p.vendor_group)
    }

    pub fn prefer_idle(&self, p: &Task) -> bool {
        self.vendor_prop(p).prefer_idle || p.prefer_idle
    }

    pub fn prefer_high_cap(&self, p: &Task) -> bool {
        self.vendor_prop(p).prefer_high_cap
    }

    pub fn task_spreading(&self, p: &Task) -> bool {
        self.vendor_prop(p).task_spreading
    }

    pub fn latency_sensitive(&self, p: &Task) -> bool {
        self.task_groups.get(p.task_group).latency_sensitive
    }

    pub fn boosted(&self, p: &Task) -> bool {
        self.uclamp_eff_importance(p, UclampId::Min) > 0
    }

    /// Latency-sensitive and boosted: placement favours bigger CPUs for it.
    pub fn is_important(&self, p: &Task) -> bool {
        (self.prefer_idle(p) || self.latency_sensitive(p))
            && (self.boosted(p) || self.prefer_high_cap(p))
    }

    /// An important task that also carries an inherited boost or an explicit
    /// minimum clamp.
    pub fn is_critical(&self, p: &Task) -> bool {
        self.is_important(p)
            && (p.uclamp_fork_reset || self.uclamp_eff_value(p, UclampId::Min) > 0)
    }

    /// Throttle of the task's own vendor group.
    pub fn task_group_throttle(&self, p: &Task) -> u64 {
        self.vendor_prop(p).group_throttle as u64
    }

    /// Throttle of the vendor group a task group was classified into.
    pub fn group_throttle(&self, tg: TaskGroupId) -> u64 {
        let vg = self.task_groups.get(tg).vendor_group;
        self.vendor_groups.get(vg).group_throttle as u64
    }

    pub fn fits_capacity(&self, util: Util, capacity: Util, cpu: usize) -> bool {
        util * self.margin(cpu) < capacity * SCHED_CAPACITY_SCALE
    }

    pub fn cpu_overutilized(&self, util: Util, capacity: Util, cpu: usize) -> bool {
        capacity * SCHED_CAPACITY_SCALE < util * self.margin(cpu)
    }

    /// Whether `util`, clamped to `[uclamp_min, uclamp_max]`, fits `cpu`.
    ///
    /// A max clamp below the CPU's original capacity makes any task fit,
    /// except on a full-capacity CPU with an unclamped task. A fitting task
    /// whose min clamp cannot be honoured by the CPU does not fit.
    pub fn util_fits_cpu(&self, util: Util, uclamp_min: Util, uclamp_max: Util, cpu: usize) -> bool {
        let capacity = self.capacity_of(cpu);
        let mut fits = self.fits_capacity(util, capacity, cpu);
        if !self.uclamp_used {
            return fits;
        }

        let capacity_orig = self.capacity_orig_of(cpu);
        let unclamped_on_max =
            capacity_orig == SCHED_CAPACITY_SCALE && uclamp_max == SCHED_CAPACITY_SCALE;
        let uclamp_max_fits = !unclamped_on_max && uclamp_max <= capacity_orig;
        fits = fits || uclamp_max_fits;

        let uclamp_min = uclamp_min.min(uclamp_max);
        if fits && util < uclamp_min && uclamp_min > capacity {
            return false;
        }
        fits
    }

    /// Placement fitness: the biggest cluster always fits, the smallest fits
    /// anything but critical tasks, the clusters in between apply the clamp
    /// aware capacity check.
    pub fn task_fits_capacity(&self, p: &Task, cpu: usize, sync_boost: bool) -> bool {
        let mut uclamp_min = self.uclamp_eff_importance(p, UclampId::Min) as Util;
        let mut uclamp_max = self.uclamp_eff_importance(p, UclampId::Max) as Util;
        let is_critical = self.is_important(p) || sync_boost;

        if cpu >= self.topo.max_capacity_cpu() {
            return true;
        }
        if cpu < self.topo.mid_capacity_cpu() {
            return !is_critical;
        }

        // Spreading groups are placed on utilization alone.
        if self.task_spreading(p) {
            uclamp_min = UclampId::Min.none() as Util;
            uclamp_max = UclampId::Max.none() as Util;
        }

        let task_util = p.task_util_est().min(cap_scale(
            self.task_group_throttle(p),
            self.capacity_orig_of(cpu),
        ));

        self.util_fits_cpu(task_util, uclamp_min, uclamp_max, cpu)
    }

    /// Important tasks target the mid cluster and above, counted from the
    /// first CPU they are allowed on.
    pub fn cpu_is_in_target_set(&self, p: &Task, cpu: usize) -> bool {
        let first_cpu = if self.is_important(p) {
            self.topo.mid_capacity_cpu()
        } else {
            self.topo.min_capacity_cpu()
        };

        match p.cpus_allowed.iter().find(|c| *c >= first_cpu) {
            Some(next_usable) => cpu >= next_usable,
            None => true,
        }
    }

    /// Estimated task utilization within its effective clamps.
    pub fn uclamp_task_util(&self, p: &Task) -> Util {
        let min = self.uclamp_eff_importance(p, UclampId::Min) as Util;
        let max = self.uclamp_eff_importance(p, UclampId::Max) as Util;
        p.task_util_est().max(min).min(max)
    }

    /// Only important tasks get their iowait wakeups boosted.
    pub fn should_iowait_boost(&self, p: &Task) -> bool {
        p.in_iowait && self.is_important(p)
    }
}
