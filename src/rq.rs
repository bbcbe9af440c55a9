// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU run-queue model.
//!
//! A run-queue is only touched under its lock. The fair-class tasks it holds
//! are kept in enqueue order; the PELT signals (root and per task group) are
//! maintained by whoever drives the scheduler and only read here, except for
//! the attach/detach of a migrating task's contribution.

use crate::policy::Policy;
use crate::types::Pid;
use crate::types::TaskGroupId;
use crate::types::TimeNs;
use crate::types::UclampId;
use crate::types::Util;
use crate::uclamp::uclamp_rq_dec;
use crate::uclamp::uclamp_rq_inc;
use crate::uclamp::UclampRq;
use crate::Task;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CfsRq {
    /// Utilization of the root cfs_rq, subgroups included.
    pub util_avg: Util,
    /// Sum of the estimated utilization of the enqueued tasks.
    pub util_est_enqueued: Util,
    /// Utilization of each non-root task group's cfs_rq on this CPU.
    pub leaves: BTreeMap<TaskGroupId, Util>,
}

#[derive(Debug)]
pub struct RunQueue {
    pub cpu: usize,
    pub cfs: CfsRq,
    tasks: Vec<Task>,
    /// Runnable tasks of higher classes (RT, deadline, stop).
    pub nr_other_running: u32,
    pub rt_util: Util,
    /// Task currently on the CPU, which may already have been dequeued.
    pub curr: Option<Pid>,
    pub uclamp: [UclampRq; 2],
    /// Max clamp retention after the last clamped task left.
    pub uclamp_idle: bool,
    pub clock: TimeNs,
    pub idle_stamp: TimeNs,
    pub active_balance: bool,
    pub misfit_task_load: u64,
    /// Index of the idle state the CPU sits in, if any.
    pub idle_state: Option<usize>,
}

/// Copy of what remote readers need from a run-queue, taken under its lock.
#[derive(Debug, Clone)]
pub struct RqSnapshot {
    pub cpu: usize,
    pub cfs: CfsRq,
    pub rt_util: Util,
    pub nr_running: u32,
    pub h_nr_running: u32,
    pub idle_h_nr_running: u32,
    pub curr: Option<Pid>,
    pub uclamp_value: [u32; 2],
    pub uclamp_importance: [u32; 2],
    pub uclamp_idle: bool,
    pub idle_state: Option<usize>,
}

impl RqSnapshot {
    /// Only SCHED_IDLE tasks are runnable.
    pub fn sched_idle_rq(&self) -> bool {
        self.nr_running != 0 && self.nr_running == self.idle_h_nr_running
    }

    pub fn available_idle(&self) -> bool {
        self.curr.is_none() && self.nr_running == 0
    }

    pub fn cpu_is_idle(&self) -> bool {
        self.available_idle() || self.sched_idle_rq()
    }

    pub fn uclamp_value(&self, clamp_id: UclampId) -> u32 {
        self.uclamp_value[clamp_id.index()]
    }

    pub fn uclamp_importance(&self, clamp_id: UclampId) -> u32 {
        self.uclamp_importance[clamp_id.index()]
    }
}

impl RunQueue {
    pub fn new(cpu: usize) -> RunQueue {
        RunQueue {
            cpu,
            cfs: CfsRq::default(),
            tasks: vec![],
            nr_other_running: 0,
            rt_util: 0,
            curr: None,
            uclamp: [UclampRq::new(UclampId::Min), UclampRq::new(UclampId::Max)],
            uclamp_idle: true,
            clock: 0,
            idle_stamp: 0,
            active_balance: false,
            misfit_task_load: 0,
            idle_state: None,
        }
    }

    /// Fair-class tasks in enqueue order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.tasks.iter().find(|p| p.pid == pid)
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|p| p.pid == pid)
    }

    pub(crate) fn push_task(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub(crate) fn take_task(&mut self, pid: Pid) -> Option<Task> {
        let pos = self.tasks.iter().position(|p| p.pid == pid)?;
        Some(self.tasks.remove(pos))
    }

    pub fn h_nr_running(&self) -> u32 {
        self.tasks.len() as u32
    }

    pub fn idle_h_nr_running(&self) -> u32 {
        self.tasks.iter().filter(|p| p.sched_idle).count() as u32
    }

    pub fn nr_running(&self) -> u32 {
        self.h_nr_running() + self.nr_other_running
    }

    pub fn task_running(&self, pid: Pid) -> bool {
        self.curr == Some(pid)
    }

    pub fn uclamp_value(&self, clamp_id: UclampId) -> u32 {
        self.uclamp[clamp_id.index()].value
    }

    /// Add a task's PELT contribution, as when it migrates in.
    pub fn attach_util(&mut self, task: &Task) {
        self.cfs.util_avg += task.util_avg;
        if task.task_group != TaskGroupId::ROOT {
            *self.cfs.leaves.entry(task.task_group).or_insert(0) += task.util_avg;
        }
    }

    /// Remove a task's PELT contribution, as when it migrates out.
    pub fn detach_util(&mut self, task: &Task) {
        self.cfs.util_avg = self.cfs.util_avg.saturating_sub(task.util_avg);
        if let Some(leaf) = self.cfs.leaves.get_mut(&task.task_group) {
            *leaf = leaf.saturating_sub(task.util_avg);
        }
    }

    /// Enqueue `task`, accounting its estimated utilization and clamps. A
    /// migrating task brings its PELT contribution along.
    pub fn activate_task(&mut self, policy: &Policy, mut task: Task, migrated: bool) {
        if migrated {
            self.attach_util(&task);
        }
        task.cpu = self.cpu;
        if policy.tunables.util_est {
            self.cfs.util_est_enqueued += task.util_est_raw();
        }
        uclamp_rq_inc(policy, self, &mut task);
        task.on_rq = true;
        task.waking = false;
        self.push_task(task);
    }

    /// Dequeue task `pid`, releasing what `activate_task` accounted.
    pub fn deactivate_task(&mut self, policy: &Policy, pid: Pid, migrating: bool) -> Option<Task> {
        let mut task = self.take_task(pid)?;
        if policy.tunables.util_est {
            self.cfs.util_est_enqueued = self
                .cfs
                .util_est_enqueued
                .saturating_sub(task.util_est_raw());
        }
        uclamp_rq_dec(policy, self, &mut task);
        if migrating {
            self.detach_util(&task);
        }
        task.on_rq = false;
        Some(task)
    }

    pub fn snapshot(&self) -> RqSnapshot {
        RqSnapshot {
            cpu: self.cpu,
            cfs: self.cfs.clone(),
            rt_util: self.rt_util,
            nr_running: self.nr_running(),
            h_nr_running: self.h_nr_running(),
            idle_h_nr_running: self.idle_h_nr_running(),
            curr: self.curr,
            uclamp_value: [self.uclamp[0].value, self.uclamp[1].value],
            uclamp_importance: [self.uclamp[0].importance, self.uclamp[1].importance],
            uclamp_idle: self.uclamp_idle,
            idle_state: self.idle_state,
        }
    }
}
