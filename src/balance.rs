// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Importance-driven idle pulling
//!
//! When a little CPU is about to go idle, it looks for run-queues holding
//! important work (by the sum of their min and max clamp importance) and
//! pulls one important task that would be better served there. Unlike a
//! load balancer this never weighs load: a pull only happens for tasks
//! flagged as latency sensitive and boosted.
//!
//! The idle CPU's lock is dropped while remote run-queues are scanned, so
//! that at most one run-queue lock is held at any time.

use crate::policy::Policy;
use crate::rq::RunQueue;
use crate::sched::VendorSched;
use crate::types::Pid;
use crate::Task;
use log::debug;
use log::trace;
use std::sync::MutexGuard;

/// A task detached from its run-queue, on its way to the idle CPU.
#[derive(Debug)]
pub struct Detached {
    pub task: Task,
    /// Misfit load hint for the destination run-queue.
    pub misfit_load: u64,
}

/// What the destination got after a new-idle pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PulledTask {
    #[default]
    None,
    /// Fair-class work, pulled or enqueued meanwhile.
    Fair,
    /// A higher class task became runnable.
    HigherClass,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NewIdleOutcome {
    pub pulled: PulledTask,
    /// The generic balancer need not run.
    pub done: bool,
}

/// Detach the most suitable important task of `src_rq` for `dst_cpu`.
///
/// Tasks are scanned from the most recently enqueued. In order of
/// preference:
///
/// 1. a critical task fitting `dst_cpu` but not its current CPU, which ends
///    the scan;
/// 2. the last critical task fitting both;
/// 3. the last non-critical task fitting `dst_cpu` but not its current CPU,
///    or else the first one fitting both;
/// 4. the last non-critical task fitting neither, flagged as misfit.
///
/// Tasks not allowed on `dst_cpu` and the running task are never taken.
pub fn detach_important_task(
    policy: &Policy,
    src_rq: &mut RunQueue,
    dst_cpu: usize,
) -> Option<Detached> {
    let mut best_task: Option<Pid> = None;
    let mut backup: Option<Pid> = None;
    let mut backup_ui: Option<Pid> = None;
    let mut backup_unfit: Option<Pid> = None;
    let src_cpu = src_rq.cpu;

    for p in src_rq.tasks().iter().rev() {
        if !p.cpus_allowed.test_cpu(dst_cpu) {
            continue;
        }
        if src_rq.task_running(p.pid) {
            continue;
        }
        if !policy.is_important(p) {
            continue;
        }

        let is_critical = policy.is_critical(p);
        if policy.task_fits_capacity(p, dst_cpu, false) {
            if !policy.task_fits_capacity(p, src_cpu, false) {
                if is_critical {
                    best_task = Some(p.pid);
                    break;
                }
                backup = Some(p.pid);
            } else {
                if is_critical {
                    backup_ui = Some(p.pid);
                    continue;
                }
                if backup.is_none() {
                    backup = Some(p.pid);
                }
            }
        } else if !is_critical {
            // Not worth it for a critical task.
            backup_unfit = Some(p.pid);
        }
    }

    let (pid, misfit) = match (best_task, backup_ui, backup, backup_unfit) {
        (Some(pid), _, _, _) => (pid, false),
        (None, Some(pid), _, _) => (pid, false),
        (None, None, Some(pid), _) => (pid, false),
        (None, None, None, Some(pid)) => (pid, true),
        (None, None, None, None) => return None,
    };

    let mut task = src_rq.deactivate_task(policy, pid, true)?;
    task.cpu = dst_cpu;
    let misfit_load = if misfit { task.load_avg } else { 0 };

    trace!(
        "detach_important_task pid={} src={} dst={} misfit={}",
        pid,
        src_cpu,
        dst_cpu,
        misfit
    );
    Some(Detached { task, misfit_load })
}

impl VendorSched {
    /// `this_rq`'s CPU is about to go idle: try to pull one important task.
    ///
    /// The lock is released during the scan and taken again before
    /// returning, on every path.
    pub fn newidle_balance<'s>(
        &'s self,
        mut this_rq: MutexGuard<'s, RunQueue>,
    ) -> (MutexGuard<'s, RunQueue>, NewIdleOutcome) {
        let this_cpu = this_rq.cpu;
        let policy = self.policy();
        let mut outcome = NewIdleOutcome::default();

        // Idle time starts now, balancing included.
        this_rq.idle_stamp = this_rq.clock;

        // Only near-idle little CPUs pull; never towards inactive CPUs.
        if !policy.active.test_cpu(this_cpu)
            || this_cpu >= policy.topo.mid_capacity_cpu()
            || this_rq.snapshot().cpu_is_idle()
        {
            return (this_rq, outcome);
        }

        drop(this_rq);

        let mut pulled = None;
        for cpu in policy.active.iter() {
            if cpu == this_cpu {
                continue;
            }

            let mut src_rq = self.lock_rq(cpu);
            let importance = src_rq.uclamp.iter().map(|uc| uc.importance).sum::<u32>();

            if src_rq.active_balance || src_rq.nr_running() <= 1 {
                continue;
            }
            if importance <= self.tunables.importance_threshold || src_rq.h_nr_running() == 0 {
                self.metrics.newidle_skipped.increment(1);
                continue;
            }

            let detached = detach_important_task(&policy, &mut src_rq, this_cpu);
            drop(src_rq);

            if let Some(detached) = detached {
                pulled = Some((cpu, detached));
                break;
            }
        }

        let mut this_rq = self.lock_rq(this_cpu);
        if let Some((src_cpu, detached)) = pulled {
            let pid = detached.task.pid;
            this_rq.misfit_task_load = detached.misfit_load;
            this_rq.activate_task(&policy, detached.task, true);

            self.metrics.newidle_pulls.increment(1);
            if detached.misfit_load != 0 {
                self.metrics.newidle_misfit_pulls.increment(1);
            }
            debug!(
                "newidle cpu={} pulled pid={} from cpu={} misfit_load={}",
                this_cpu, pid, src_cpu, detached.misfit_load
            );
        }

        // Work may also have been enqueued while the lock was dropped.
        if this_rq.h_nr_running() > 0 {
            outcome.pulled = PulledTask::Fair;
        }
        if this_rq.nr_running() != this_rq.h_nr_running() {
            outcome.pulled = PulledTask::HigherClass;
        }
        if outcome.pulled != PulledTask::None {
            this_rq.idle_stamp = 0;
            outcome.done = true;
        }

        (this_rq, outcome)
    }
}
