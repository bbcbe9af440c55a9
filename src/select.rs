// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Energy-aware CPU selection
//!
//! Placement searches the task's allowed CPUs from the lowest to the highest
//! capacity cluster, so that ties pack work onto the smaller clusters:
//!
//! 1. Every active CPU the task fits on gets a raw utilization ratio
//!    (utilization per unit of current capacity). The least loaded one, the
//!    lowest idle exit latency breaking ties, is the best candidate.
//! 2. Candidates quadratically more loaded than the best one (by comparing
//!    integer square roots) are dropped.
//! 3. The survivors and the best candidate get an energy estimate; a
//!    survivor replaces the best candidate if its energy (again compared by
//!    integer square root) is lower, or equal with a better ratio.
//! 4. The previous CPU wins a complete tie, unless it sits in a bigger
//!    cluster.

use crate::energy::compute_energy_change;
use crate::energy::EnergyCache;
use crate::policy::Policy;
use crate::rq::RqSnapshot;
use crate::types::int_sqrt;
use crate::types::Util;
use crate::types::SCHED_CAPACITY_SCALE;
use crate::Cpumask;
use crate::Task;
use log::trace;

/// How the wakeup was issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WakeFlags {
    /// Balancing at exec time.
    pub exec: bool,
    /// The waker is about to sleep.
    pub sync: bool,
    /// The waker is exiting, which voids `sync`.
    pub waker_exiting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementReason {
    Exec,
    SyncWakeup,
    PrevIdle,
    EnergyEfficient,
}

impl PlacementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlacementReason::Exec => "exec",
            PlacementReason::SyncWakeup => "sync_wakeup",
            PlacementReason::PrevIdle => "prev_idle",
            PlacementReason::EnergyEfficient => "energy_efficient",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub cpu: usize,
    pub reason: PlacementReason,
    /// The waker runs on a high capacity CPU.
    pub sync_boost: bool,
}

/// Exit latency of the idle state `rq`'s CPU sits in. A CPU only running
/// SCHED_IDLE work, or not idle at all, is immediately available.
pub fn idle_exit_latency(policy: &Policy, rq: &RqSnapshot) -> u64 {
    if rq.sched_idle_rq() {
        return 0;
    }
    rq.idle_state
        .and_then(|idx| policy.topo.idle_exit_latency(rq.cpu, idx))
        .unwrap_or(0)
}

/// Lowest raw utilization ratio wins, lower exit latency breaks ties.
fn cpu_is_better(cpu: usize, best_cpu: usize, exit_lat: &[u64], util: Util, l_util: Util) -> bool {
    util < l_util || (util == l_util && exit_lat[cpu] < exit_lat[best_cpu])
}

/// Whether candidate `i` beats `best` once both energies are known: less
/// energy, then the idle comparison, then the smaller CPU on a full tie.
fn energy_candidate_is_better(
    policy: &Policy,
    i: usize,
    best: usize,
    energy: &[u64],
    cpu_util: &[Util],
    exit_lat: &[u64],
) -> bool {
    if energy[i] > energy[best] {
        return false;
    }
    let full_tie = energy[i] == energy[best]
        && cpu_util[i] == cpu_util[best]
        && exit_lat[i] == exit_lat[best]
        && policy.capacity_orig_of(i) < policy.capacity_orig_of(best);

    energy[i] < energy[best]
        || cpu_is_better(i, best, exit_lat, cpu_util[i], cpu_util[best])
        || full_tie
}

/// Pick the most energy efficient CPU of `valid_mask` for `p`, which last
/// ran on `prev_cpu`. `cache` is reset and reused as scratch space.
pub fn find_energy_efficient_cpu(
    policy: &Policy,
    rqs: &[RqSnapshot],
    p: &Task,
    prev_cpu: usize,
    valid_mask: &Cpumask,
    cache: &mut EnergyCache,
) -> usize {
    cache.reset();

    // Some tasks may run on inactive CPUs; do not fail them.
    let allowed = valid_mask.and(&policy.active);
    if allowed.is_empty() {
        return valid_mask.first().unwrap_or(prev_cpu);
    }

    let nr_cpus = policy.nr_cpus();
    let mut cap = vec![0; nr_cpus];
    let mut exit_lat = vec![0; nr_cpus];
    let mut cpu_util = vec![0; nr_cpus];
    let mut energy = vec![0; nr_cpus];
    let mut candidates = Cpumask::new(nr_cpus);
    let mut best_cpu = None;
    let mut l_util = Util::MAX;

    let p_util = if policy.task_spreading(p) {
        p.task_util_est()
    } else {
        policy.uclamp_task_util(p)
    };

    for i in allowed.iter() {
        let rq = match rqs.get(i) {
            Some(rq) => rq,
            None => continue,
        };

        cap[i] = policy.capacity_of(i);
        exit_lat[i] = idle_exit_latency(policy, rq);

        if policy.cpu_overutilized(p_util, cap[i], i) {
            continue;
        }

        // The previous CPU is rated without the task.
        let util = if i == prev_cpu {
            policy.cpu_util_without(rq, p)
        } else {
            policy.cpu_util_cfs_group_mod(rq)
        };
        cpu_util[i] = util * SCHED_CAPACITY_SCALE / cap[i].max(1);

        let better = match best_cpu {
            Some(best) => cpu_is_better(i, best, &exit_lat, cpu_util[i], l_util),
            None => true,
        };
        if better {
            l_util = cpu_util[i];
            best_cpu = Some(i);
        }
        candidates.assign_cpu(i, true);
    }

    let mut best_cpu = match best_cpu {
        Some(cpu) => cpu,
        None => {
            // Nothing fits: the smallest allowed CPU.
            let cpu = allowed.first().unwrap_or(prev_cpu);
            trace!("feec pid={} no fit, fallback cpu={}", p.pid, cpu);
            return cpu;
        }
    };

    if candidates.weight() == 1 {
        return best_cpu;
    }

    let l_util = int_sqrt(l_util);
    candidates.assign_cpu(best_cpu, false);
    let pruned: Vec<usize> = candidates
        .iter()
        .filter(|i| int_sqrt(cpu_util[*i]) > l_util)
        .collect();
    for i in pruned {
        candidates.assign_cpu(i, false);
    }

    // Every other CPU is obviously worse.
    if candidates.is_empty() {
        return best_cpu;
    }

    if policy.em.is_some() {
        candidates.assign_cpu(best_cpu, true);
        compute_energy_change(policy, rqs, p, prev_cpu, &candidates, cache, &mut energy);
        candidates.assign_cpu(best_cpu, false);

        energy[best_cpu] = int_sqrt(energy[best_cpu]);
        for i in candidates.iter() {
            energy[i] = int_sqrt(energy[i]);
            if energy_candidate_is_better(policy, i, best_cpu, &energy, &cpu_util, &exit_lat) {
                best_cpu = i;
            }
        }
    }

    // Stay on the previous CPU on a complete tie, unless it is bigger.
    if candidates.test_cpu(prev_cpu)
        && cpu_util[prev_cpu] == cpu_util[best_cpu]
        && exit_lat[prev_cpu] == exit_lat[best_cpu]
        && energy[prev_cpu] == energy[best_cpu]
        && policy.capacity_orig_of(prev_cpu) <= policy.capacity_orig_of(best_cpu)
    {
        best_cpu = prev_cpu;
    }

    trace!(
        "feec pid={} prev={} best={} util={} exit_lat={} energy={}",
        p.pid,
        prev_cpu,
        best_cpu,
        cpu_util[best_cpu],
        exit_lat[best_cpu],
        energy[best_cpu]
    );
    best_cpu
}

/// Wakeup placement of `p`, woken from `this_cpu` after last running on
/// `prev_cpu`.
pub fn select_task_rq_fair(
    policy: &Policy,
    rqs: &[RqSnapshot],
    p: &Task,
    prev_cpu: usize,
    this_cpu: usize,
    flags: WakeFlags,
    cache: &mut EnergyCache,
) -> Placement {
    let sync = flags.sync && !flags.waker_exiting;
    let mut placement = Placement {
        cpu: prev_cpu,
        reason: PlacementReason::Exec,
        sync_boost: false,
    };

    if !flags.exec {
        placement = select_wakeup_cpu(policy, rqs, p, prev_cpu, this_cpu, sync, cache);
    }

    trace!(
        "select_task_rq_fair pid={} util_est={} vendor_group={} uclamp=[{}, {}] prev={} target={} reason={} sync_boost={}",
        p.pid,
        p.task_util_est(),
        p.vendor_group,
        policy.uclamp_eff_value(p, crate::types::UclampId::Min),
        policy.uclamp_eff_value(p, crate::types::UclampId::Max),
        prev_cpu,
        placement.cpu,
        placement.reason.as_str(),
        placement.sync_boost
    );
    placement
}

fn select_wakeup_cpu(
    policy: &Policy,
    rqs: &[RqSnapshot],
    p: &Task,
    prev_cpu: usize,
    this_cpu: usize,
    sync: bool,
    cache: &mut EnergyCache,
) -> Placement {
    if let Some(this_rq) = rqs.get(this_cpu) {
        if sync
            && this_rq.nr_running == 1
            && p.cpus_allowed.test_cpu(this_cpu)
            && policy.cpu_is_in_target_set(p, this_cpu)
            && policy.task_fits_capacity(p, this_cpu, false)
        {
            return Placement {
                cpu: this_cpu,
                reason: PlacementReason::SyncWakeup,
                sync_boost: false,
            };
        }
    }

    let sync_boost = sync && this_cpu >= policy.high_capacity_cpu();

    if let Some(prev_rq) = rqs.get(prev_cpu) {
        if p.cpus_allowed.test_cpu(prev_cpu)
            && policy.active.test_cpu(prev_cpu)
            && prev_rq.cpu_is_idle()
            && policy.task_fits_capacity(p, prev_cpu, sync_boost)
        {
            let exit_lat = if prev_rq.sched_idle_rq() {
                0
            } else {
                prev_rq
                    .idle_state
                    .and_then(|idx| policy.topo.idle_exit_latency(prev_cpu, idx))
                    .unwrap_or(u64::MAX)
            };

            if exit_lat <= policy.tunables.c1_exit_latency_us {
                return Placement {
                    cpu: prev_cpu,
                    reason: PlacementReason::PrevIdle,
                    sync_boost,
                };
            }
        }
    }

    Placement {
        cpu: find_energy_efficient_cpu(policy, rqs, p, prev_cpu, &p.cpus_allowed, cache),
        reason: PlacementReason::EnergyEfficient,
        sync_boost,
    }
}

/// Destination for `p` after its affinity changed to `new_mask`. A task
/// that is running, waking or queued on a CPU it may no longer use is
/// placed again among `valid_mask & new_mask`; otherwise `dest_cpu` stands.
pub fn cpumask_any_and_distribute(
    policy: &Policy,
    rqs: &[RqSnapshot],
    p: &Task,
    valid_mask: &Cpumask,
    new_mask: &Cpumask,
    dest_cpu: usize,
    cache: &mut EnergyCache,
) -> usize {
    let valid = valid_mask.and(new_mask);
    let mut dest_cpu = dest_cpu;

    let on_cpu = rqs.get(p.cpu).map_or(false, |rq| rq.curr == Some(p.pid));
    if !valid.is_empty() && (on_cpu || p.waking || p.on_rq) && !new_mask.test_cpu(p.cpu) {
        dest_cpu = find_energy_efficient_cpu(policy, rqs, p, p.cpu, &valid, cache);
    }

    trace!(
        "cpumask_any_and_distribute pid={} valid={} dest={}",
        p.pid,
        valid,
        dest_cpu
    );
    dest_cpu
}
