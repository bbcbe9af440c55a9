// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Utilization clamp accounting
//!
//! Each run-queue keeps, per clamp kind, a histogram of the effective clamps
//! of its runnable tasks: `UCLAMP_BUCKETS` buckets, each refcounting the
//! tasks whose clamp quantizes into it and tracking the largest clamp among
//! them. The run-queue clamp is the largest clamp of any non-empty bucket,
//! which makes both enqueue and dequeue O(1) except when the top bucket
//! empties.
//!
//! When the last task leaves, the max clamp is retained (and the run-queue
//! flagged idle) so that blocked utilization does not push the frequency up
//! while the CPU idles; the min clamp drops to zero. The next enqueue resets
//! the retained value.
//!
//! Both the frequency and the importance channels of the task clamps (see
//! `UclampSe`) are aggregated side by side.

use crate::policy::Policy;
use crate::rq::RqSnapshot;
use crate::rq::RunQueue;
use crate::task::UclampSe;
use crate::types::UclampId;
use crate::types::Util;
use crate::types::SCHED_CAPACITY_SCALE;
use crate::Task;
use static_assertions::const_assert;

pub const UCLAMP_BUCKETS: usize = 20;
/// Width of a bucket, DIV_ROUND_CLOSEST(1024, 20).
pub const UCLAMP_BUCKET_DELTA: u32 =
    ((SCHED_CAPACITY_SCALE as u32) + (UCLAMP_BUCKETS as u32) / 2) / UCLAMP_BUCKETS as u32;
/// Max clamp of tasks below default priority: just under the top bucket.
pub const LOW_PRIO_UCLAMP_MAX: u32 = UCLAMP_BUCKET_DELTA * (UCLAMP_BUCKETS as u32 - 1) - 1;

const_assert!(UCLAMP_BUCKET_DELTA == 51);
const_assert!(LOW_PRIO_UCLAMP_MAX / UCLAMP_BUCKET_DELTA == UCLAMP_BUCKETS as u32 - 2);

pub fn bucket_id(clamp_value: u32) -> usize {
    ((clamp_value / UCLAMP_BUCKET_DELTA) as usize).min(UCLAMP_BUCKETS - 1)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UclampBucket {
    pub tasks: u32,
    pub value: u32,
    pub importance: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UclampRq {
    pub value: u32,
    pub importance: u32,
    pub buckets: [UclampBucket; UCLAMP_BUCKETS],
}

impl UclampRq {
    pub fn new(clamp_id: UclampId) -> UclampRq {
        UclampRq {
            value: clamp_id.none(),
            importance: clamp_id.none(),
            buckets: [UclampBucket::default(); UCLAMP_BUCKETS],
        }
    }

    /// Top non-empty bucket as (value, importance).
    fn max_value(&self) -> Option<(u32, u32)> {
        self.buckets
            .iter()
            .rev()
            .find(|b| b.tasks != 0)
            .map(|b| (b.value, b.importance))
    }
}

impl<'a> Policy<'a> {
    /// Apply the task group, vendor group and inherited restrictions to the
    /// task's request.
    fn uclamp_tg_restrict(&self, p: &Task, clamp_id: UclampId) -> UclampSe {
        let req = p.uclamp_req[clamp_id.index()];
        let tg = self.task_groups.get(p.task_group);
        let vg = self.vendor_prop(p);

        let lo = tg.uclamp[0].max(vg.uclamp_req[0].value);
        let hi = tg.uclamp[1].min(vg.uclamp_req[1].value);
        let mut value = req.value.max(lo).min(hi);

        if p.binder.active {
            value = value.max(p.binder.uclamp[0]).min(p.binder.uclamp[1]);
        }
        value = value.max(p.uclamp_pi[0]).min(p.uclamp_pi[1]);

        // Placement-only adjustments: an explicit request at or below the
        // group floor still ranks above unboosted tasks, low priority tasks
        // never land in the top bucket.
        let mut importance = value;
        match clamp_id {
            UclampId::Min => {
                if req.user_defined && req.value <= lo && importance < SCHED_CAPACITY_SCALE as u32
                {
                    importance += 1;
                }
            }
            UclampId::Max => {
                if p.prio > crate::types::DEFAULT_PRIO {
                    importance = importance.min(LOW_PRIO_UCLAMP_MAX);
                }
            }
        }

        UclampSe {
            value,
            importance,
            bucket_id: bucket_id(importance),
            active: false,
            user_defined: req.user_defined,
        }
    }

    /// Effective clamp of `p`, the system default acting as a ceiling.
    pub fn uclamp_eff_get(&self, p: &Task, clamp_id: UclampId) -> UclampSe {
        let mut uc = self.uclamp_tg_restrict(p, clamp_id);
        let ceiling = self.tunables.uclamp_default[clamp_id.index()];

        if uc.value > ceiling || uc.importance > ceiling {
            uc.value = uc.value.min(ceiling);
            uc.importance = uc.importance.min(ceiling);
            uc.bucket_id = bucket_id(uc.importance);
        }
        uc
    }

    /// Frequency channel of the effective clamp.
    pub fn uclamp_eff_value(&self, p: &Task, clamp_id: UclampId) -> u32 {
        let uc = &p.uclamp[clamp_id.index()];
        if uc.active {
            return uc.value;
        }
        self.uclamp_eff_get(p, clamp_id).value
    }

    /// Placement channel of the effective clamp.
    pub fn uclamp_eff_importance(&self, p: &Task, clamp_id: UclampId) -> u32 {
        let uc = &p.uclamp[clamp_id.index()];
        if uc.active {
            return uc.importance;
        }
        self.uclamp_eff_get(p, clamp_id).importance
    }
}

/// Refcount `p` in the bucket of its effective clamp. `rq` lock held.
pub fn uclamp_rq_inc_id(policy: &Policy, rq: &mut RunQueue, p: &mut Task, clamp_id: UclampId) {
    if sched_warn_on!(!policy.uclamp_used) {
        return;
    }
    if sched_warn_on!(p.uclamp[clamp_id.index()].active) {
        return;
    }

    let mut uc_se = policy.uclamp_eff_get(p, clamp_id);
    uc_se.active = true;
    p.uclamp[clamp_id.index()] = uc_se;

    let idle = rq.uclamp_idle;
    let uc_rq = &mut rq.uclamp[clamp_id.index()];
    if idle {
        uc_rq.value = uc_se.value;
        uc_rq.importance = uc_se.importance;
    }

    let bucket = &mut uc_rq.buckets[uc_se.bucket_id];
    bucket.tasks += 1;
    if bucket.tasks == 1 || uc_se.value > bucket.value {
        bucket.value = uc_se.value;
    }
    if bucket.tasks == 1 || uc_se.importance > bucket.importance {
        bucket.importance = uc_se.importance;
    }

    if uc_se.value > uc_rq.value {
        uc_rq.value = uc_se.value;
    }
    if uc_se.importance > uc_rq.importance {
        uc_rq.importance = uc_se.importance;
    }
}

/// Release `p`'s bucket reference. Tasks that were never accounted (clamp
/// accounting enabled after their enqueue) are skipped. `rq` lock held.
pub fn uclamp_rq_dec_id(policy: &Policy, rq: &mut RunQueue, p: &mut Task, clamp_id: UclampId) {
    if sched_warn_on!(!policy.uclamp_used) {
        return;
    }

    let uc_se = &mut p.uclamp[clamp_id.index()];
    if !uc_se.active {
        return;
    }
    uc_se.active = false;
    let uc_se = *uc_se;

    let uc_rq = &mut rq.uclamp[clamp_id.index()];
    let bucket = &mut uc_rq.buckets[uc_se.bucket_id];
    sched_warn_on!(bucket.tasks == 0);
    if bucket.tasks > 0 {
        bucket.tasks -= 1;
    }
    if bucket.tasks > 0 {
        return;
    }

    let bucket = *bucket;
    sched_warn_on!(bucket.value > uc_rq.value || bucket.importance > uc_rq.importance);
    if bucket.value >= uc_rq.value || bucket.importance >= uc_rq.importance {
        let (value, importance) = match uc_rq.max_value() {
            Some(max) => max,
            None => match clamp_id {
                UclampId::Max => {
                    rq.uclamp_idle = true;
                    (uc_se.value, uc_se.importance)
                }
                UclampId::Min => (UclampId::Min.none(), UclampId::Min.none()),
            },
        };
        let uc_rq = &mut rq.uclamp[clamp_id.index()];
        uc_rq.value = value;
        uc_rq.importance = importance;
    }
}

pub fn uclamp_rq_inc(policy: &Policy, rq: &mut RunQueue, p: &mut Task) {
    if !policy.uclamp_used {
        return;
    }
    for clamp_id in UclampId::ALL {
        uclamp_rq_inc_id(policy, rq, p, clamp_id);
    }
    rq.uclamp_idle = false;
}

pub fn uclamp_rq_dec(policy: &Policy, rq: &mut RunQueue, p: &mut Task) {
    if !policy.uclamp_used {
        return;
    }
    for clamp_id in UclampId::ALL {
        uclamp_rq_dec_id(policy, rq, p, clamp_id);
    }
}

/// Clamp `util` with the run-queue clamps, optionally merged with the
/// clamps `p` would bring. Frequency channel.
pub fn uclamp_rq_util_with(policy: &Policy, rq: &RqSnapshot, util: Util, p: Option<&Task>) -> Util {
    let mut min_util = rq.uclamp_value(UclampId::Min) as Util;
    let mut max_util = rq.uclamp_value(UclampId::Max) as Util;

    if let Some(p) = p {
        min_util = min_util.max(policy.uclamp_eff_value(p, UclampId::Min) as Util);
        let p_max = policy.uclamp_eff_value(p, UclampId::Max) as Util;
        // A retained max clamp must not hold the new task back.
        max_util = if rq.uclamp_idle {
            p_max
        } else {
            max_util.max(p_max)
        };
    }

    if min_util >= max_util {
        return min_util;
    }
    util.clamp(min_util, max_util)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::task::TaskGroupSnapshot;
    use crate::task::TaskGroupTable;
    use crate::topology::ClusterSpec;
    use crate::topology::Topology;
    use crate::types::Pid;
    use crate::types::TaskGroupId;
    use crate::vendor_group::UclampRequest;
    use crate::vendor_group::VendorGroupSnapshot;
    use std::sync::Arc;

    fn topo() -> Topology {
        Topology::builder()
            .cluster(ClusterSpec::new("0-1", 512))
            .cluster(ClusterSpec::new("2-3", 1024))
            .build()
            .unwrap()
    }

    fn policy<'a>(
        topo: &'a Topology,
        tunables: &'a Tunables,
        task_groups: Arc<TaskGroupSnapshot>,
    ) -> Policy<'a> {
        Policy {
            topo,
            em: None,
            tunables,
            vendor_groups: Arc::new(VendorGroupSnapshot::default()),
            task_groups,
            capacity: (0..topo.nr_cpus()).map(|c| topo.capacity_orig(c)).collect(),
            cur_freq: vec![0; topo.nr_cpus()],
            active: topo.all_cpus(),
            online: topo.all_cpus(),
            uclamp_used: true,
        }
    }

    fn task_with_min(pid: i32, min: u32) -> Task {
        let mut p = Task::new(Pid(pid), 0, 4);
        p.uclamp_req[UclampId::Min.index()] = UclampRequest::user(min);
        p
    }

    #[test]
    fn test_inc_dec_restores_rq() {
        let topo = topo();
        let tunables = Tunables::default();
        let policy = policy(&topo, &tunables, Arc::default());
        let mut rq = RunQueue::new(0);
        let mut p1 = task_with_min(1, 300);
        let mut p2 = task_with_min(2, 600);

        uclamp_rq_inc(&policy, &mut rq, &mut p1);
        assert_eq!(rq.uclamp[0].value, 300);
        assert!(!rq.uclamp_idle);

        uclamp_rq_inc(&policy, &mut rq, &mut p2);
        assert_eq!(rq.uclamp[0].value, 600);
        assert_eq!(rq.uclamp[0].buckets[bucket_id(600)].tasks, 1);

        uclamp_rq_dec(&policy, &mut rq, &mut p2);
        assert_eq!(rq.uclamp[0].value, 300);
        assert_eq!(rq.uclamp[0].importance, 300);

        uclamp_rq_dec(&policy, &mut rq, &mut p1);
        assert_eq!(rq.uclamp[0].value, 0);
        assert!(rq.uclamp.iter().all(|uc| uc.buckets.iter().all(|b| b.tasks == 0)));
        assert!(!p1.uclamp[0].active && !p1.uclamp[1].active);
    }

    #[test]
    fn test_unclamped_task_alone() {
        let topo = topo();
        let tunables = Tunables::default();
        let policy = policy(&topo, &tunables, Arc::default());
        let mut rq = RunQueue::new(0);
        let mut p = Task::new(Pid(1), 0, 4);

        uclamp_rq_inc(&policy, &mut rq, &mut p);
        assert_eq!((rq.uclamp[0].value, rq.uclamp[0].importance), (0, 0));
        assert_eq!((rq.uclamp[1].value, rq.uclamp[1].importance), (1024, 1024));
        assert_eq!(rq.uclamp[0].buckets[bucket_id(0)].tasks, 1);
        assert_eq!(rq.uclamp[1].buckets[bucket_id(1024)].tasks, 1);
        assert!(!rq.uclamp_idle);
    }

    #[test]
    fn test_max_retained_when_idle() {
        let topo = topo();
        let tunables = Tunables::default();
        let policy = policy(&topo, &tunables, Arc::default());
        let mut rq = RunQueue::new(0);
        let mut p = Task::new(Pid(1), 0, 4);
        p.uclamp_req[UclampId::Max.index()] = UclampRequest::user(400);

        uclamp_rq_inc(&policy, &mut rq, &mut p);
        assert_eq!(rq.uclamp[1].value, 400);
        uclamp_rq_dec(&policy, &mut rq, &mut p);
        assert!(rq.uclamp_idle);
        assert_eq!(rq.uclamp[1].value, 400);
        assert_eq!(rq.uclamp[0].value, 0);

        // The next task replaces the retained clamp instead of maxing with it.
        let mut q = Task::new(Pid(2), 0, 4);
        q.uclamp_req[UclampId::Max.index()] = UclampRequest::user(200);
        uclamp_rq_inc(&policy, &mut rq, &mut q);
        assert_eq!(rq.uclamp[1].value, 200);
        assert!(!rq.uclamp_idle);
    }

    #[test]
    fn test_bucket_keeps_largest_clamp() {
        let topo = topo();
        let tunables = Tunables::default();
        let policy = policy(&topo, &tunables, Arc::default());
        let mut rq = RunQueue::new(0);
        let mut p1 = task_with_min(1, 340);
        let mut p2 = task_with_min(2, 310);
        assert_eq!(bucket_id(340), bucket_id(310));

        uclamp_rq_inc(&policy, &mut rq, &mut p1);
        uclamp_rq_inc(&policy, &mut rq, &mut p2);
        let bucket = rq.uclamp[0].buckets[bucket_id(310)];
        assert_eq!(bucket.tasks, 2);
        assert_eq!(bucket.value, 340);
        assert_eq!(rq.uclamp[0].value, 340);
    }

    #[test]
    fn test_importance_above_group_floor() {
        let topo = topo();
        let tunables = Tunables::default();
        let groups = TaskGroupTable::default();
        groups
            .cgroup_online(TaskGroupId(1), "top-app", [200, 1024], true)
            .unwrap();
        let policy = policy(&topo, &tunables, groups.snapshot());

        let mut p = task_with_min(1, 100);
        p.task_group = TaskGroupId(1);
        let uc = policy.uclamp_eff_get(&p, UclampId::Min);
        assert_eq!(uc.value, 200);
        assert_eq!(uc.importance, 201);

        // A request above the floor is taken as is.
        p.uclamp_req[UclampId::Min.index()] = UclampRequest::user(500);
        let uc = policy.uclamp_eff_get(&p, UclampId::Min);
        assert_eq!((uc.value, uc.importance), (500, 500));

        // Not an explicit request: no bump.
        p.uclamp_req[UclampId::Min.index()] = UclampRequest::none(UclampId::Min);
        let uc = policy.uclamp_eff_get(&p, UclampId::Min);
        assert_eq!((uc.value, uc.importance), (200, 200));
    }

    #[test]
    fn test_low_prio_max_importance() {
        let topo = topo();
        let tunables = Tunables::default();
        let policy = policy(&topo, &tunables, Arc::default());
        let mut p = Task::new(Pid(1), 0, 4);
        p.prio = 130;

        let uc = policy.uclamp_eff_get(&p, UclampId::Max);
        assert_eq!(uc.value, 1024);
        assert_eq!(uc.importance, LOW_PRIO_UCLAMP_MAX);
        assert_eq!(uc.bucket_id, UCLAMP_BUCKETS - 2);
    }

    #[test]
    fn test_system_default_ceiling() {
        let topo = topo();
        let tunables = Tunables {
            uclamp_default: [512, 1024],
            ..Default::default()
        };
        let policy = policy(&topo, &tunables, Arc::default());
        let p = task_with_min(1, 800);
        assert_eq!(policy.uclamp_eff_value(&p, UclampId::Min), 512);
        assert_eq!(policy.uclamp_eff_importance(&p, UclampId::Min), 512);
    }

    #[test]
    fn test_dec_skips_unaccounted_task() {
        let topo = topo();
        let tunables = Tunables::default();
        let mut off = policy(&topo, &tunables, Arc::default());
        off.uclamp_used = false;
        let on = policy(&topo, &tunables, Arc::default());
        let mut rq = RunQueue::new(0);
        let mut p = task_with_min(1, 300);

        uclamp_rq_inc(&off, &mut rq, &mut p);
        assert!(!p.uclamp[0].active);
        uclamp_rq_dec(&on, &mut rq, &mut p);
        assert!(rq.uclamp[0].buckets.iter().all(|b| b.tasks == 0));
        assert_eq!(rq.uclamp[0].value, 0);
    }

    #[test]
    fn test_util_with_idle_rq() {
        let topo = topo();
        let tunables = Tunables::default();
        let policy = policy(&topo, &tunables, Arc::default());
        let mut rq = RunQueue::new(0);
        let mut p = Task::new(Pid(1), 0, 4);
        p.uclamp_req[UclampId::Max.index()] = UclampRequest::user(400);
        uclamp_rq_inc(&policy, &mut rq, &mut p);
        uclamp_rq_dec(&policy, &mut rq, &mut p);

        let q = task_with_min(2, 100);
        let snap = rq.snapshot();
        // Retained 400 does not cap the unclamped task.
        assert_eq!(uclamp_rq_util_with(&policy, &snap, 700, Some(&q)), 700);
        assert_eq!(uclamp_rq_util_with(&policy, &snap, 50, Some(&q)), 100);
        assert_eq!(uclamp_rq_util_with(&policy, &snap, 700, None), 400);
    }
}
