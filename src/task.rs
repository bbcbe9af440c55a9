// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task and task group state consumed by the policy.
//!
//! Tasks are owned by their run-queue while enqueued and by the caller while
//! sleeping; the policy only borrows them. Task groups live in a registry
//! published copy-on-write, like the vendor group table, and tasks refer to
//! them by id.

use crate::types::Pid;
use crate::types::TaskGroupId;
use crate::types::TimeNs;
use crate::types::UclampId;
use crate::types::Util;
use crate::types::DEFAULT_PRIO;
use crate::types::UCLAMP_CNT;
use crate::vendor_group::UclampRequest;
use crate::vendor_group::VendorGroup;
use crate::Cpumask;
use anyhow::bail;
use anyhow::Result;
use log::debug;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::RwLock;

/// Effective clamp of a task for one clamp kind.
///
/// Two channels are kept apart: `value` drives frequency selection and
/// utilization capping, `importance` drives placement and idle pulling. They
/// only differ by the placement-only adjustments applied when the effective
/// clamp is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UclampSe {
    pub value: u32,
    pub importance: u32,
    pub bucket_id: usize,
    /// Set while the task is refcounted in a run-queue bucket.
    pub active: bool,
    pub user_defined: bool,
}

impl UclampSe {
    pub fn none(clamp_id: UclampId) -> UclampSe {
        let value = clamp_id.none();
        UclampSe {
            value,
            importance: value,
            bucket_id: crate::uclamp::bucket_id(value),
            active: false,
            user_defined: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UtilEst {
    pub enqueued: Util,
    pub ewma: Util,
    /// PELT has not moved since the last estimate update.
    pub unchanged: bool,
}

/// Clamp inherited through a binder transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InheritedClamp {
    pub active: bool,
    pub uclamp: [u32; UCLAMP_CNT],
}

impl Default for InheritedClamp {
    fn default() -> Self {
        Self {
            active: false,
            uclamp: [UclampId::Min.none(), UclampId::Max.none()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub pid: Pid,
    pub cpu: usize,
    pub cpus_allowed: Cpumask,
    pub prio: i32,
    pub task_group: TaskGroupId,
    pub vendor_group: VendorGroup,

    pub util_avg: Util,
    pub load_avg: u64,
    pub util_est: UtilEst,
    /// Zero until PELT has accounted the task once.
    pub last_update_time: TimeNs,

    pub uclamp_req: [UclampRequest; UCLAMP_CNT],
    pub uclamp: [UclampSe; UCLAMP_CNT],
    /// rt-mutex priority inheritance clamp.
    pub uclamp_pi: [u32; UCLAMP_CNT],
    pub binder: InheritedClamp,

    pub prefer_idle: bool,
    pub uclamp_fork_reset: bool,
    pub in_iowait: bool,
    /// SCHED_IDLE policy.
    pub sched_idle: bool,

    pub on_rq: bool,
    pub waking: bool,
}

impl Task {
    pub fn new(pid: Pid, cpu: usize, nr_cpus: usize) -> Task {
        Task {
            pid,
            cpu,
            cpus_allowed: Cpumask::full(nr_cpus),
            prio: DEFAULT_PRIO,
            task_group: TaskGroupId::ROOT,
            vendor_group: VendorGroup::System,
            util_avg: 0,
            load_avg: 0,
            util_est: UtilEst::default(),
            last_update_time: 0,
            uclamp_req: [
                UclampRequest::none(UclampId::Min),
                UclampRequest::none(UclampId::Max),
            ],
            uclamp: [UclampSe::none(UclampId::Min), UclampSe::none(UclampId::Max)],
            uclamp_pi: [UclampId::Min.none(), UclampId::Max.none()],
            binder: InheritedClamp::default(),
            prefer_idle: false,
            uclamp_fork_reset: false,
            in_iowait: false,
            sched_idle: false,
            on_rq: false,
            waking: false,
        }
    }

    /// New PELT utilization; the estimate may be refreshed at the next sleep.
    pub fn set_util_avg(&mut self, util: Util) {
        self.util_avg = util;
        self.util_est.unchanged = false;
    }

    pub fn task_util(&self) -> Util {
        self.util_avg
    }

    /// Estimated utilization from the last activations alone.
    pub fn util_est_raw(&self) -> Util {
        self.util_est.ewma.max(self.util_est.enqueued)
    }

    pub fn task_util_est(&self) -> Util {
        self.task_util().max(self.util_est_raw())
    }

    /// Duplicate for fork: scheduling attributes are inherited, vendor state
    /// is reset except for the vendor group.
    pub fn fork(&self, pid: Pid) -> Task {
        let mut child = Task::new(pid, self.cpu, self.cpus_allowed.len());
        child.cpus_allowed = self.cpus_allowed.clone();
        child.prio = self.prio;
        child.task_group = self.task_group;
        child.uclamp_req = self.uclamp_req;
        child.sched_idle = self.sched_idle;
        child.vendor_group = self.vendor_group;
        child
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGroup {
    pub id: TaskGroupId,
    pub name: String,
    pub vendor_group: VendorGroup,
    /// Effective group clamps.
    pub uclamp: [u32; UCLAMP_CNT],
    pub latency_sensitive: bool,
}

impl TaskGroup {
    pub fn root() -> TaskGroup {
        TaskGroup {
            id: TaskGroupId::ROOT,
            name: "/".to_string(),
            vendor_group: VendorGroup::System,
            uclamp: [UclampId::Min.none(), UclampId::Max.none()],
            latency_sensitive: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskGroupSnapshot {
    pub version: u64,
    groups: BTreeMap<TaskGroupId, TaskGroup>,
}

impl TaskGroupSnapshot {
    /// The group `id`, falling back to the root group for unknown ids.
    pub fn get(&self, id: TaskGroupId) -> &TaskGroup {
        match self.groups.get(&id) {
            Some(tg) => tg,
            None => &self.groups[&TaskGroupId::ROOT],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskGroup> {
        self.groups.values()
    }
}

impl Default for TaskGroupSnapshot {
    fn default() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(TaskGroupId::ROOT, TaskGroup::root());
        Self { version: 0, groups }
    }
}

#[derive(Debug, Default)]
pub struct TaskGroupTable {
    current: RwLock<Arc<TaskGroupSnapshot>>,
}

impl TaskGroupTable {
    pub fn snapshot(&self) -> Arc<TaskGroupSnapshot> {
        let guard = match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    /// A cgroup came online: classify it by name and publish it.
    pub fn cgroup_online(
        &self,
        id: TaskGroupId,
        name: &str,
        uclamp: [u32; UCLAMP_CNT],
        latency_sensitive: bool,
    ) -> Result<VendorGroup> {
        if id == TaskGroupId::ROOT {
            bail!("The root task group cannot be brought online again");
        }
        if uclamp[0] > uclamp[1] || uclamp[1] > UclampId::Max.none() {
            bail!("Invalid clamps {:?} for task group {}", uclamp, name);
        }

        let vendor_group = VendorGroup::from_cgroup_name(name);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = (**guard).clone();
        next.version += 1;
        next.groups.insert(
            id,
            TaskGroup {
                id,
                name: name.to_string(),
                vendor_group,
                uclamp,
                latency_sensitive,
            },
        );
        *guard = Arc::new(next);
        debug!("cgroup {} ({}) online as {}", name, id.0, vendor_group);
        Ok(vendor_group)
    }
}
