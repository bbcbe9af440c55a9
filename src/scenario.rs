// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Scenario replay
//!
//! A scenario is a JSON description of a system (clusters, energy model,
//! group tables, per-CPU signals), the tasks living on it and a sequence of
//! scheduler events. Replaying it drives [`VendorSched`] the way a
//! scheduler would and records every decision taken.
//!
//! ```json
//! {
//!   "clusters": [
//!     { "cpus": "0-3", "capacity": 160, "idle_states": [{ "name": "WFI", "exit_latency_us": 1 }] },
//!     { "cpus": "4-7", "capacity": 1024 }
//!   ],
//!   "tasks": [{ "pid": 100, "cpu": 0, "util": 120 }],
//!   "events": [{ "type": "wakeup", "pid": 100 }, { "type": "sleep", "pid": 100 }]
//! }
//! ```

use crate::config::Tunables;
use crate::energy::EnergyCache;
use crate::energy_model::EnergyModel;
use crate::energy_model::PerfDomainSpec;
use crate::select::WakeFlags;
use crate::stats::ReplayStats;
use crate::topology::ClusterSpec;
use crate::topology::Topology;
use crate::types::Pid;
use crate::types::TaskGroupId;
use crate::types::TimeNs;
use crate::types::UclampId;
use crate::types::Util;
use crate::types::UCLAMP_CNT;
use crate::vendor_group::UclampRequest;
use crate::vendor_group::VendorGroup;
use crate::vendor_group::VendorGroupProperty;
use crate::Cpumask;
use crate::Task;
use crate::VendorSched;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

fn default_true() -> bool {
    true
}

fn default_group_uclamp() -> [u32; UCLAMP_CNT] {
    [UclampId::Min.none(), UclampId::Max.none()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgroupSpec {
    pub id: u32,
    pub name: String,
    #[serde(default = "default_group_uclamp")]
    pub uclamp: [u32; UCLAMP_CNT],
    #[serde(default)]
    pub latency_sensitive: bool,
}

/// Initial state of one CPU. Task utilization is added on top of `util`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSpec {
    pub cpu: usize,
    /// Capacity left to CFS, defaults to the original capacity.
    #[serde(default)]
    pub capacity: Option<Util>,
    #[serde(default)]
    pub util: Util,
    /// Utilization of task group cfs_rqs, by task group id.
    #[serde(default)]
    pub leaves: BTreeMap<u32, Util>,
    #[serde(default)]
    pub rt_util: Util,
    /// Runnable tasks of higher classes.
    #[serde(default)]
    pub nr_other_running: u32,
    #[serde(default)]
    pub idle_state: Option<usize>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub active_balance: bool,
    #[serde(default)]
    pub clock: TimeNs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub pid: i32,
    pub cpu: usize,
    /// Allowed cpulist, all CPUs when absent.
    #[serde(default)]
    pub cpus: Option<String>,
    #[serde(default)]
    pub util: Util,
    #[serde(default)]
    pub util_est: Option<Util>,
    #[serde(default)]
    pub load: u64,
    #[serde(default)]
    pub prio: Option<i32>,
    /// Task group id, as brought online through `cgroups`.
    #[serde(default)]
    pub cgroup: Option<u32>,
    #[serde(default)]
    pub uclamp_min: Option<u32>,
    #[serde(default)]
    pub uclamp_max: Option<u32>,
    #[serde(default)]
    pub prefer_idle: bool,
    #[serde(default)]
    pub in_iowait: bool,
    #[serde(default)]
    pub sched_idle: bool,
    /// Enqueued on `cpu` from the start rather than sleeping.
    #[serde(default)]
    pub queued: bool,
    /// Currently running on `cpu`. Implies `queued`.
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Wakeup {
        pid: i32,
        #[serde(default)]
        this_cpu: Option<usize>,
        #[serde(default)]
        sync: bool,
        #[serde(default)]
        exec: bool,
        #[serde(default)]
        waker_exiting: bool,
    },
    Sleep {
        pid: i32,
    },
    /// `pid` starts running on `cpu`, or `cpu` switches to idle. A task
    /// going to sleep stays current until then.
    Run {
        cpu: usize,
        #[serde(default)]
        pid: Option<i32>,
    },
    Affinity {
        pid: i32,
        cpus: String,
    },
    Util {
        pid: i32,
        util: Util,
    },
    Newidle {
        cpu: usize,
    },
    Freq {
        cpus: String,
        freq: u64,
    },
    Fork {
        parent: i32,
        pid: i32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub clusters: Vec<ClusterSpec>,
    #[serde(default)]
    pub energy_model: Vec<PerfDomainSpec>,
    #[serde(default)]
    pub tunables: Tunables,
    #[serde(default)]
    pub vendor_groups: BTreeMap<VendorGroup, VendorGroupProperty>,
    #[serde(default)]
    pub cgroups: Vec<CgroupSpec>,
    #[serde(default)]
    pub cpus: Vec<CpuSpec>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Outcome of a replay: one line per decision and the totals.
#[derive(Debug, Default)]
pub struct Replay {
    pub records: Vec<String>,
    pub stats: ReplayStats,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Scenario> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Scenario::from_json(&data)
            .with_context(|| format!("Failed to parse scenario {}", path.display()))
    }

    pub fn from_json(data: &str) -> Result<Scenario> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn topology(&self) -> Result<Topology> {
        Topology::builder().clusters(self.clusters.clone()).build()
    }

    /// Build the system described by the scenario. `em` overrides the
    /// scenario's own energy model, e.g. one read from debugfs.
    pub fn build(&self, em: Option<EnergyModel>) -> Result<Replayer> {
        let topo = self.topology()?;
        let em = match em {
            Some(em) => Some(em),
            None if self.energy_model.is_empty() => None,
            None => Some(EnergyModel::from_specs(&self.energy_model, &topo)?),
        };
        let sched = VendorSched::new(topo, em, self.tunables.clone(), &self.vendor_groups)?;

        for cg in self.cgroups.iter() {
            sched.cgroup_online(TaskGroupId(cg.id), &cg.name, cg.uclamp, cg.latency_sensitive)?;
        }

        for spec in self.cpus.iter() {
            if spec.cpu >= sched.nr_cpus() {
                bail!("CPU {} is out of range", spec.cpu);
            }
            if let Some(capacity) = spec.capacity {
                sched.set_cpu_capacity(spec.cpu, capacity)?;
            }
            sched.set_cpu_active(spec.cpu, spec.active)?;

            let mut rq = sched.lock_rq(spec.cpu);
            rq.cfs.util_avg = spec.util;
            rq.cfs.leaves = spec
                .leaves
                .iter()
                .map(|(id, util)| (TaskGroupId(*id), *util))
                .collect();
            rq.rt_util = spec.rt_util;
            rq.nr_other_running = spec.nr_other_running;
            rq.idle_state = spec.idle_state;
            rq.active_balance = spec.active_balance;
            rq.clock = spec.clock;
        }

        let mut sleeping = BTreeMap::new();
        for spec in self.tasks.iter() {
            let task = task_of(&sched, spec)?;
            let policy = sched.policy();
            let mut rq = sched.lock_rq(spec.cpu);
            if spec.queued || spec.running {
                rq.activate_task(&policy, task, true);
                if spec.running {
                    rq.curr = Some(Pid(spec.pid));
                }
            } else {
                // Blocked utilization stays on the last CPU.
                rq.attach_util(&task);
                if sleeping.insert(task.pid, task).is_some() {
                    bail!("Duplicate task {}", spec.pid);
                }
            }
        }

        Ok(Replayer {
            cache: sched.new_energy_cache(),
            sched,
            sleeping,
        })
    }
}

fn task_of(sched: &VendorSched, spec: &TaskSpec) -> Result<Task> {
    let nr_cpus = sched.nr_cpus();
    if spec.cpu >= nr_cpus {
        bail!("Task {} is on CPU {} which is out of range", spec.pid, spec.cpu);
    }

    let mut task = Task::new(Pid(spec.pid), spec.cpu, nr_cpus);
    if let Some(cpus) = spec.cpus.as_ref() {
        task.cpus_allowed = Cpumask::from_cpulist(cpus, nr_cpus)
            .with_context(|| format!("Invalid cpulist for task {}", spec.pid))?;
    }
    task.util_avg = spec.util;
    task.util_est.ewma = spec.util_est.unwrap_or(spec.util);
    task.load_avg = spec.load;
    task.last_update_time = 1;
    if let Some(prio) = spec.prio {
        task.prio = prio;
    }
    if let Some(id) = spec.cgroup {
        let groups = sched.policy().task_groups;
        let tg = groups.get(TaskGroupId(id));
        if tg.id != TaskGroupId(id) {
            bail!("Task {} refers to unknown cgroup {}", spec.pid, id);
        }
        task.task_group = tg.id;
        task.vendor_group = tg.vendor_group;
    }
    if let Some(value) = spec.uclamp_min {
        task.uclamp_req[UclampId::Min.index()] = UclampRequest::user(value);
    }
    if let Some(value) = spec.uclamp_max {
        task.uclamp_req[UclampId::Max.index()] = UclampRequest::user(value);
    }
    task.prefer_idle = spec.prefer_idle;
    task.in_iowait = spec.in_iowait;
    task.sched_idle = spec.sched_idle;
    Ok(task)
}

/// A built scenario: the scheduler plus the tasks currently sleeping, which
/// no run-queue holds.
pub struct Replayer {
    sched: VendorSched,
    sleeping: BTreeMap<Pid, Task>,
    cache: EnergyCache,
}

impl Replayer {
    pub fn sched(&self) -> &VendorSched {
        &self.sched
    }

    pub fn sleeping(&self, pid: Pid) -> Option<&Task> {
        self.sleeping.get(&pid)
    }

    /// Where `pid` is queued, if anywhere.
    pub fn queued_on(&self, pid: Pid) -> Option<usize> {
        (0..self.sched.nr_cpus()).find(|cpu| self.sched.lock_rq(*cpu).task(pid).is_some())
    }

    pub fn replay(&mut self, events: &[Event]) -> Result<Replay> {
        let mut replay = Replay::default();

        for (idx, event) in events.iter().enumerate() {
            let record = self
                .replay_event(event, &mut replay.stats)
                .with_context(|| format!("Event {} ({:?}) failed", idx, event))?;
            replay.stats.events += 1;
            debug!("{}", record);
            replay.records.push(record);
        }

        info!("Replayed {}", replay.stats);
        Ok(replay)
    }

    fn take_sleeping(&mut self, pid: Pid) -> Result<Task> {
        match self.sleeping.remove(&pid) {
            Some(task) => Ok(task),
            None => bail!("Task {} is not sleeping", pid),
        }
    }

    fn replay_event(&mut self, event: &Event, stats: &mut ReplayStats) -> Result<String> {
        let record = match event {
            Event::Wakeup {
                pid,
                this_cpu,
                sync,
                exec,
                waker_exiting,
            } => {
                let mut task = self.take_sleeping(Pid(*pid))?;
                let prev_cpu = task.cpu;
                let flags = WakeFlags {
                    exec: *exec,
                    sync: *sync,
                    waker_exiting: *waker_exiting,
                };

                task.waking = true;
                let placement = self.sched.select_task_rq(
                    &task,
                    prev_cpu,
                    this_cpu.unwrap_or(prev_cpu),
                    flags,
                    &mut self.cache,
                );
                stats.record_placement(placement.reason, placement.cpu != prev_cpu);
                stats.energy_calcs += self.cache.nr_calcs() as u64;
                self.sched.enqueue_task(placement.cpu, task);

                format!(
                    "wakeup pid={} prev={} cpu={} reason={} sync_boost={} energy_calcs={}",
                    pid,
                    prev_cpu,
                    placement.cpu,
                    placement.reason.as_str(),
                    placement.sync_boost,
                    self.cache.nr_calcs()
                )
            }
            Event::Sleep { pid } => {
                let pid = Pid(*pid);
                let cpu = match self.queued_on(pid) {
                    Some(cpu) => cpu,
                    None => bail!("Task {} is not queued", pid),
                };
                let task = match self.sched.dequeue_task(cpu, pid, true) {
                    Some(task) => task,
                    None => bail!("Task {} left CPU {} meanwhile", pid, cpu),
                };

                let line = format!("sleep pid={} cpu={} util_est={}", pid, cpu, task.util_est.ewma);
                self.sleeping.insert(pid, task);
                line
            }
            Event::Run { cpu, pid } => {
                if *cpu >= self.sched.nr_cpus() {
                    bail!("CPU {} is out of range", cpu);
                }
                let pid = pid.map(Pid);
                let mut rq = self.sched.lock_rq(*cpu);
                if let Some(pid) = pid {
                    if rq.task(pid).is_none() {
                        bail!("Task {} is not queued on CPU {}", pid, cpu);
                    }
                }
                rq.curr = pid;
                match pid {
                    Some(pid) => format!("run cpu={} pid={}", cpu, pid),
                    None => format!("run cpu={} idle", cpu),
                }
            }
            Event::Affinity { pid, cpus } => {
                let pid = Pid(*pid);
                let new_mask = Cpumask::from_cpulist(cpus, self.sched.nr_cpus())?;
                if new_mask.and(&self.sched.policy().online).is_empty() {
                    return Ok(format!("affinity pid={} cpus={} ignored", pid, new_mask));
                }

                match self.queued_on(pid) {
                    Some(cpu) => {
                        let task = match self.sched.lock_rq(cpu).task(pid) {
                            Some(task) => task.clone(),
                            None => bail!("Task {} left CPU {} meanwhile", pid, cpu),
                        };
                        let dest =
                            self.sched
                                .any_and_distribute(&task, &new_mask, cpu, &mut self.cache);
                        if dest == cpu {
                            if let Some(task) = self.sched.lock_rq(cpu).task_mut(pid) {
                                task.cpus_allowed = new_mask.clone();
                            }
                        } else if let Some(mut task) = self.sched.dequeue_task(cpu, pid, false) {
                            task.cpus_allowed = new_mask.clone();
                            let mut rq = self.sched.lock_rq(cpu);
                            if rq.curr == Some(pid) {
                                rq.curr = None;
                            }
                            drop(rq);
                            self.sched.enqueue_task(dest, task);
                        }
                        format!("affinity pid={} cpus={} cpu={} -> {}", pid, new_mask, cpu, dest)
                    }
                    None => {
                        let task = match self.sleeping.get_mut(&pid) {
                            Some(task) => task,
                            None => bail!("Unknown task {}", pid),
                        };
                        task.cpus_allowed = new_mask.clone();
                        format!("affinity pid={} cpus={} cpu={}", pid, new_mask, task.cpu)
                    }
                }
            }
            Event::Util { pid, util } => {
                let pid = Pid(*pid);
                match self.queued_on(pid) {
                    Some(cpu) => {
                        let mut rq = self.sched.lock_rq(cpu);
                        if let Some(old) = rq.task(pid).cloned() {
                            rq.detach_util(&old);
                        }
                        if let Some(task) = rq.task_mut(pid) {
                            task.set_util_avg(*util);
                        }
                        if let Some(new) = rq.task(pid).cloned() {
                            rq.attach_util(&new);
                        }
                    }
                    None => {
                        let task = match self.sleeping.get_mut(&pid) {
                            Some(task) => task,
                            None => bail!("Unknown task {}", pid),
                        };
                        let mut rq = self.sched.lock_rq(task.cpu);
                        rq.detach_util(task);
                        task.set_util_avg(*util);
                        rq.attach_util(task);
                    }
                }
                format!("util pid={} util={}", pid, util)
            }
            Event::Newidle { cpu } => {
                if *cpu >= self.sched.nr_cpus() {
                    bail!("CPU {} is out of range", cpu);
                }
                let this_rq = self.sched.lock_rq(*cpu);
                let (this_rq, outcome) = self.sched.newidle_balance(this_rq);
                let nr_running = this_rq.nr_running();
                drop(this_rq);

                stats.newidle_runs += 1;
                if outcome.done {
                    stats.newidle_pulls += 1;
                }
                format!(
                    "newidle cpu={} pulled={:?} done={} nr_running={}",
                    cpu, outcome.pulled, outcome.done, nr_running
                )
            }
            Event::Freq { cpus, freq } => {
                let mask = Cpumask::from_cpulist(cpus, self.sched.nr_cpus())?;
                let scale = self.sched.set_freq_scale(&mask, *freq);
                format!("freq cpus={} freq={} scale={}", mask, freq, scale)
            }
            Event::Fork { parent, pid } => {
                let (parent, pid) = (Pid(*parent), Pid(*pid));
                let parent_task = match self.queued_on(parent) {
                    Some(cpu) => self.sched.lock_rq(cpu).task(parent).cloned(),
                    None => self.sleeping.get(&parent).cloned(),
                };
                let parent_task = match parent_task {
                    Some(task) => task,
                    None => bail!("Unknown parent task {}", parent),
                };
                if self.sleeping.contains_key(&pid) || self.queued_on(pid).is_some() {
                    bail!("Task {} already exists", pid);
                }

                let child = self.sched.fork_task(&parent_task, pid);
                let util = child.util_avg;
                let placement = self.sched.wake_up_new_task(child, &mut self.cache);
                stats.record_placement(placement.reason, placement.cpu != parent_task.cpu);
                stats.energy_calcs += self.cache.nr_calcs() as u64;
                format!(
                    "fork parent={} pid={} util={} cpu={} reason={}",
                    parent,
                    pid,
                    util,
                    placement.cpu,
                    placement.reason.as_str()
                )
            }
        };
        Ok(record)
    }
}
