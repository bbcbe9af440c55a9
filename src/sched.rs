// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The policy core as seen by the scheduler driving it.
//!
//! `VendorSched` owns one locked run-queue per CPU, the per-CPU capacity,
//! frequency and activity state, and the group tables. Each entry point
//! pins a [`Policy`] view for its duration and touches run-queues one lock
//! at a time.

use crate::config::Tunables;
use crate::energy::EnergyCache;
use crate::energy_model::EnergyModel;
use crate::policy::Policy;
use crate::rq::RqSnapshot;
use crate::rq::RunQueue;
use crate::select::cpumask_any_and_distribute;
use crate::select::select_task_rq_fair;
use crate::select::Placement;
use crate::select::WakeFlags;
use crate::stats::Metrics;
use crate::task::TaskGroupTable;
use crate::topology::Topology;
use crate::types::Pid;
use crate::types::TaskGroupId;
use crate::types::UclampId;
use crate::types::Util;
use crate::types::SCHED_CAPACITY_SCALE;
use crate::types::UCLAMP_CNT;
use crate::vendor_group::VendorGroup;
use crate::vendor_group::VendorGroupProperty;
use crate::vendor_group::VendorGroupTable;
use crate::Cpumask;
use crate::Task;
use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;

pub struct VendorSched {
    pub(crate) topo: Topology,
    pub(crate) em: Option<EnergyModel>,
    pub(crate) tunables: Tunables,
    pub(crate) vendor_groups: VendorGroupTable,
    pub(crate) task_groups: TaskGroupTable,
    rqs: Vec<Mutex<RunQueue>>,
    cpu_capacity: Vec<AtomicU64>,
    cpu_cur_freq: Vec<AtomicU64>,
    cpu_active: Vec<AtomicBool>,
    cpu_online: Vec<AtomicBool>,
    uclamp_used: AtomicBool,
    pub(crate) metrics: Metrics,
}

impl VendorSched {
    pub fn new(
        topo: Topology,
        em: Option<EnergyModel>,
        tunables: Tunables,
        vendor_groups: &BTreeMap<VendorGroup, VendorGroupProperty>,
    ) -> Result<VendorSched> {
        let nr_cpus = topo.nr_cpus();
        tunables.validate(nr_cpus)?;
        for (group, prop) in vendor_groups.iter() {
            if prop.group_throttle > SCHED_CAPACITY_SCALE as u32 {
                bail!("Invalid group throttle {} for {}", prop.group_throttle, group);
            }
        }

        if let Some(em) = em.as_ref() {
            for cpu in 0..nr_cpus {
                if em.get_pd_by_cpu_id(cpu).is_none() {
                    warn!("CPU {} is not covered by the energy model", cpu);
                }
            }
            if em.root_pd().map_or(true, |pd| !pd.span.test_cpu(0)) {
                warn!("The root performance domain does not hold CPU 0");
            }
        } else {
            info!("No energy model, placement falls back to utilization only");
        }

        let cpu_capacity = (0..nr_cpus)
            .map(|cpu| AtomicU64::new(topo.capacity_orig(cpu)))
            .collect();
        let cpu_cur_freq = (0..nr_cpus)
            .map(|cpu| {
                let freq = em
                    .as_ref()
                    .and_then(|em| em.get_pd_by_cpu_id(cpu))
                    .map_or(0, |pd| pd.max_freq);
                AtomicU64::new(freq)
            })
            .collect();

        Ok(VendorSched {
            rqs: (0..nr_cpus).map(|cpu| Mutex::new(RunQueue::new(cpu))).collect(),
            cpu_capacity,
            cpu_cur_freq,
            cpu_active: (0..nr_cpus).map(|_| AtomicBool::new(true)).collect(),
            cpu_online: (0..nr_cpus).map(|_| AtomicBool::new(true)).collect(),
            uclamp_used: AtomicBool::new(tunables.uclamp_used),
            vendor_groups: VendorGroupTable::new(vendor_groups),
            task_groups: TaskGroupTable::default(),
            metrics: Metrics::new(),
            topo,
            em,
            tunables,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    pub fn nr_cpus(&self) -> usize {
        self.topo.nr_cpus()
    }

    pub fn energy_model(&self) -> Option<&EnergyModel> {
        self.em.as_ref()
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Pin the current tables and per-CPU state for one decision.
    pub fn policy(&self) -> Policy<'_> {
        let nr_cpus = self.nr_cpus();
        let mask_of = |bits: &[AtomicBool]| {
            Cpumask::from_cpus(
                bits.iter()
                    .enumerate()
                    .filter(|(_, b)| b.load(Ordering::Relaxed))
                    .map(|(cpu, _)| cpu),
                nr_cpus,
            )
        };

        Policy {
            topo: &self.topo,
            em: self.em.as_ref(),
            tunables: &self.tunables,
            vendor_groups: self.vendor_groups.snapshot(),
            task_groups: self.task_groups.snapshot(),
            capacity: self
                .cpu_capacity
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            cur_freq: self
                .cpu_cur_freq
                .iter()
                .map(|f| f.load(Ordering::Relaxed))
                .collect(),
            active: mask_of(self.cpu_active.as_slice()),
            online: mask_of(self.cpu_online.as_slice()),
            uclamp_used: self.uclamp_used.load(Ordering::Relaxed),
        }
    }

    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.nr_cpus() {
            bail!("CPU {} is out of range ({} CPUs)", cpu, self.nr_cpus());
        }
        Ok(())
    }

    /// Lock `cpu`'s run-queue.
    ///
    /// # Panics
    ///
    /// If `cpu` is not below `nr_cpus()`. Entry points taking a CPU from
    /// outside check it first.
    pub fn lock_rq(&self, cpu: usize) -> MutexGuard<'_, RunQueue> {
        match self.rqs[cpu].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Snapshot every run-queue, one lock at a time.
    pub fn snapshot_rqs(&self) -> Vec<RqSnapshot> {
        (0..self.nr_cpus())
            .map(|cpu| self.lock_rq(cpu).snapshot())
            .collect()
    }

    pub fn set_cpu_capacity(&self, cpu: usize, capacity: Util) -> Result<()> {
        self.check_cpu(cpu)?;
        let capacity = capacity.min(self.topo.capacity_orig(cpu));
        self.cpu_capacity[cpu].store(capacity, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_cpu_active(&self, cpu: usize, active: bool) -> Result<()> {
        self.check_cpu(cpu)?;
        self.cpu_active[cpu].store(active, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_cpu_online(&self, cpu: usize, online: bool) -> Result<()> {
        self.check_cpu(cpu)?;
        self.cpu_online[cpu].store(online, Ordering::Relaxed);
        Ok(())
    }

    /// Clamp accounting can be switched while tasks are queued; tasks
    /// enqueued before it was enabled are skipped at dequeue.
    pub fn set_uclamp_used(&self, used: bool) {
        self.uclamp_used.store(used, Ordering::Relaxed);
    }

    pub fn new_energy_cache(&self) -> EnergyCache {
        EnergyCache::new(self.nr_cpus())
    }

    /// Enqueue `task` on `cpu`. A task coming from another CPU moves its
    /// PELT contribution along.
    pub fn enqueue_task(&self, cpu: usize, task: Task) {
        let policy = self.policy();
        let migrated = task.cpu != cpu;
        if migrated && task.cpu < self.nr_cpus() {
            self.lock_rq(task.cpu).detach_util(&task);
        }
        self.lock_rq(cpu).activate_task(&policy, task, migrated);
    }

    /// Dequeue `pid` from `cpu`. A task going to sleep refreshes its
    /// estimated utilization.
    pub fn dequeue_task(&self, cpu: usize, pid: Pid, sleep: bool) -> Option<Task> {
        let policy = self.policy();
        let mut rq = self.lock_rq(cpu);
        let mut task = rq.deactivate_task(&policy, pid, false)?;
        policy.util_est_update(&mut task, cpu, sleep);
        Some(task)
    }

    /// Wakeup placement. `cache` is scratch space for this call only.
    pub fn select_task_rq(
        &self,
        p: &Task,
        prev_cpu: usize,
        this_cpu: usize,
        flags: WakeFlags,
        cache: &mut EnergyCache,
    ) -> Placement {
        cache.reset();
        let policy = self.policy();
        let rqs = self.snapshot_rqs();
        let placement = select_task_rq_fair(&policy, &rqs, p, prev_cpu, this_cpu, flags, cache);

        self.metrics.placement(placement.reason).increment(1);
        if placement.sync_boost {
            self.metrics.sync_boost.increment(1);
        }
        self.metrics
            .feec_energy_calcs
            .record(cache.nr_calcs() as f64);
        placement
    }

    /// Destination of `p` after its affinity changed to `new_mask`.
    pub fn any_and_distribute(
        &self,
        p: &Task,
        new_mask: &Cpumask,
        dest_cpu: usize,
        cache: &mut EnergyCache,
    ) -> usize {
        cache.reset();
        let policy = self.policy();
        let rqs = self.snapshot_rqs();
        let cpu = cpumask_any_and_distribute(
            &policy,
            &rqs,
            p,
            &policy.online,
            new_mask,
            dest_cpu,
            cache,
        );
        if cpu != dest_cpu {
            self.metrics.affinity_moves.increment(1);
        }
        cpu
    }

    /// Child of `parent` for fork, with its initial utilization set.
    pub fn fork_task(&self, parent: &Task, pid: Pid) -> Task {
        let mut child = parent.fork(pid);
        self.post_init_entity_util_avg(&mut child);
        self.metrics.forks.increment(1);
        debug!(
            "fork {} -> {} vendor_group={} util={}",
            parent.pid, pid, child.vendor_group, child.util_avg
        );
        child
    }

    /// First wakeup of a forked task: place it, then account its initial
    /// utilization where it lands.
    pub fn wake_up_new_task(&self, mut child: Task, cache: &mut EnergyCache) -> Placement {
        child.waking = true;
        let placement =
            self.select_task_rq(&child, child.cpu, child.cpu, WakeFlags::default(), cache);
        child.cpu = placement.cpu;

        let policy = self.policy();
        self.lock_rq(placement.cpu)
            .activate_task(&policy, child, true);
        placement
    }

    /// A new task on an idle run-queue starts with a share of the CPU's
    /// capacity.
    pub fn post_init_entity_util_avg(&self, p: &mut Task) {
        if p.cpu >= self.nr_cpus() {
            return;
        }
        let policy = self.policy();
        let rq = self.lock_rq(p.cpu).snapshot();
        if let Some(util) = policy.post_init_util(&rq) {
            p.set_util_avg(util);
        }
    }

    pub fn cgroup_online(
        &self,
        id: TaskGroupId,
        name: &str,
        uclamp: [u32; UCLAMP_CNT],
        latency_sensitive: bool,
    ) -> Result<VendorGroup> {
        self.task_groups
            .cgroup_online(id, name, uclamp, latency_sensitive)
    }

    pub fn vendor_group_version(&self) -> u64 {
        self.vendor_groups.snapshot().version
    }

    pub fn update_vendor_group(
        &self,
        expected_version: u64,
        group: VendorGroup,
        prop: VendorGroupProperty,
    ) -> Result<u64> {
        self.vendor_groups.replace(expected_version, group, prop)
    }

    /// The CPUs of `cpus` now run at `freq`. Returns their capacity scale
    /// at that frequency.
    pub fn set_freq_scale(&self, cpus: &Cpumask, freq: u64) -> u64 {
        for cpu in cpus.iter() {
            if let Some(cur) = self.cpu_cur_freq.get(cpu) {
                cur.store(freq, Ordering::Relaxed);
            }
        }

        cpus.first()
            .and_then(|cpu| self.em.as_ref()?.get_pd_by_cpu_id(cpu))
            .map_or(SCHED_CAPACITY_SCALE, |pd| pd.freq_scale(freq))
    }

    /// Whether `cpu` runs above what its capacity serves, given the clamps
    /// of its run-queue.
    pub fn cpu_overutilized(&self, cpu: usize) -> Result<bool> {
        self.check_cpu(cpu)?;
        let policy = self.policy();
        let rq = self.lock_rq(cpu).snapshot();
        let util = policy.cpu_util(&rq);
        // Fitness is a placement question: the importance channel decides.
        Ok(!policy.util_fits_cpu(
            util,
            rq.uclamp_importance(UclampId::Min) as Util,
            rq.uclamp_importance(UclampId::Max) as Util,
            cpu,
        ))
    }

    pub fn should_iowait_boost(&self, p: &Task) -> bool {
        self.policy().should_iowait_boost(p)
    }

    pub fn uclamp_eff_value(&self, p: &Task, clamp_id: UclampId) -> u32 {
        self.policy().uclamp_eff_value(p, clamp_id)
    }

    /// Frequency `cpu` needs to serve `util`, given its top frequency and
    /// capacity.
    pub fn map_util_freq(&self, cpu: usize, util: Util, freq: u64, cap: Util) -> Result<u64> {
        self.check_cpu(cpu)?;
        let policy = self.policy();
        let rq = self.lock_rq(cpu).snapshot();
        Ok(policy.map_util_freq(&rq, util, freq, cap))
    }
}
