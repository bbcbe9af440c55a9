// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Energy estimator
//!
//! Predicts, for each candidate destination of a task, the energy of every
//! performance domain with the task moved there. A domain's energy is the
//! cost of the operating point its busiest CPU would request, scaled by the
//! domain's summed busy time.
//!
//! The root domain (the one holding CPU 0) cannot run below a floor imposed
//! by the frequencies of the other domains. The other domains are therefore
//! evaluated first, each recording the root floor its new operating point
//! implies, and the root domain last.
//!
//! When the task moves, only the source and destination CPUs see their own
//! utilization change; the other CPUs of the source and destination domains
//! only see their domain frequency change. Their figures are memoized in an
//! [`EnergyCache`] owned by the caller and valid for one selection.

use crate::energy_model::PerfDomain;
use crate::policy::Policy;
use crate::rq::RqSnapshot;
use crate::types::Util;
use crate::util::UtilKind;
use crate::Cpumask;
use crate::Task;
use log::trace;
use std::collections::BTreeMap;

/// Utilization figures of one CPU for one candidate placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmCalc {
    /// Busy time, summed over the domain.
    pub energy_util: Util,
    /// Frequency demand, maxed over the domain.
    pub cpu_util: Util,
}

/// Caller-owned scratch space for one energy-aware selection.
///
/// Slot 0 holds figures for CPUs whose domain the task moves to, slot 1 for
/// CPUs whose domain the task moves from.
#[derive(Debug, Clone)]
pub struct EnergyCache {
    calc: [Vec<EmCalc>; 2],
    valid: [Cpumask; 2],
    nr_calcs: usize,
}

impl EnergyCache {
    pub fn new(nr_cpus: usize) -> EnergyCache {
        EnergyCache {
            calc: [vec![EmCalc::default(); nr_cpus], vec![EmCalc::default(); nr_cpus]],
            valid: [Cpumask::new(nr_cpus), Cpumask::new(nr_cpus)],
            nr_calcs: 0,
        }
    }

    /// Forget everything, including the calculation count.
    pub fn reset(&mut self) {
        self.invalidate();
        self.nr_calcs = 0;
    }

    fn invalidate(&mut self) {
        for mask in self.valid.iter_mut() {
            mask.clear_all();
        }
    }

    /// Per-CPU energy calculations performed since the last reset.
    pub fn nr_calcs(&self) -> usize {
        self.nr_calcs
    }
}

/// Root domain frequency floors imposed by the other domains.
#[derive(Debug)]
struct FloorState {
    /// Floor from each domain's current frequency.
    old: BTreeMap<usize, u64>,
    /// Floor from each domain's new frequency, per destination CPU.
    new: BTreeMap<usize, Vec<u64>>,
    spans: BTreeMap<usize, Cpumask>,
}

impl FloorState {
    fn new(policy: &Policy, root_id: usize) -> FloorState {
        let mut old = BTreeMap::new();
        let mut new = BTreeMap::new();
        let mut spans = BTreeMap::new();

        if let Some(em) = policy.em {
            for pd in em.perf_doms.values().filter(|pd| pd.id != root_id) {
                let cur_freq = policy.cur_freq.get(pd.first_cpu()).copied().unwrap_or(0);
                old.insert(pd.id, pd.root_floor(cur_freq));
                new.insert(pd.id, vec![0; policy.nr_cpus()]);
                spans.insert(pd.id, pd.span.clone());
            }
        }
        FloorState { old, new, spans }
    }

    fn set(&mut self, pd_id: usize, dst: usize, floor: u64) {
        if let Some(slot) = self.new.get_mut(&pd_id).and_then(|v| v.get_mut(dst)) {
            *slot = floor;
        }
    }

    /// Highest floor, using the new frequency of the domains the task moves
    /// from or to and the current one of the others.
    fn root_floor(&self, src: usize, dst: usize) -> u64 {
        let mut floor = 0;
        for (id, span) in self.spans.iter() {
            let pd_floor = if span.test_cpu(src) || span.test_cpu(dst) {
                self.new[id].get(dst).copied().unwrap_or(0)
            } else {
                self.old[id]
            };
            floor = floor.max(pd_floor);
        }
        floor
    }
}

/// Figures of `rq`'s CPU if `p` ran on `dst`.
fn calc_energy(policy: &Policy, rq: &RqSnapshot, p: &Task, cpu_cap: Util, dst: usize) -> EmCalc {
    let util_cfs = policy.cpu_util_next(rq, p, dst);

    // Busy time is not clamped: sum_util / capacity already scales the
    // power reported at the clamped capacity.
    let energy_util = policy.effective_cpu_util(rq, util_cfs, cpu_cap, UtilKind::Energy, None);

    let with = if rq.cpu == dst { Some(p) } else { None };
    let cpu_util = policy.effective_cpu_util(rq, util_cfs, cpu_cap, UtilKind::Frequency, with);

    EmCalc {
        energy_util,
        cpu_util,
    }
}

/// Energy of `pd` with the given busiest-CPU demand and summed busy time.
#[allow(clippy::too_many_arguments)]
fn em_cpu_energy(
    policy: &Policy,
    rqs: &[RqSnapshot],
    pd: &PerfDomain,
    is_root: bool,
    max_util: Util,
    sum_util: Util,
    floors: &mut FloorState,
    src: usize,
    dst: usize,
) -> u64 {
    if sum_util == 0 {
        // No busy time, no constraint on the root domain.
        if !is_root {
            floors.set(pd.id, dst, 0);
        }
        return 0;
    }

    let cpu = pd.first_cpu();
    let scale_cpu = policy.capacity_orig_of(cpu);
    let (max_ps, rq) = match (pd.max_state(), rqs.get(cpu)) {
        (Some(ps), Some(rq)) if scale_cpu > 0 => (ps, rq),
        _ => return 0,
    };

    let mut freq = policy.map_util_freq(rq, max_util, max_ps.frequency, scale_cpu);
    if is_root {
        freq = freq.max(floors.root_floor(src, dst));
    }
    let freq = pd.map_scaling_freq(freq);

    let ps = match pd.state_at_or_above(freq) {
        Some(ps) => ps,
        None => return 0,
    };

    if !is_root {
        floors.set(pd.id, dst, pd.root_floor(ps.frequency));
    }
    ps.cost * sum_util / scale_cpu
}

/// Add to `energy[dst]`, for every `dst` in `dst_mask`, the energy of the
/// whole system with `p` moved from `src` to `dst`.
///
/// `energy` must be zeroed for the CPUs of `dst_mask`. Nothing is added
/// without an energy model.
pub fn compute_energy_change(
    policy: &Policy,
    rqs: &[RqSnapshot],
    p: &Task,
    src: usize,
    dst_mask: &Cpumask,
    cache: &mut EnergyCache,
    energy: &mut [u64],
) {
    let em = match policy.em {
        Some(em) => em,
        None => return,
    };
    let root_id = match em.root_pd() {
        Some(pd) => pd.id,
        None => return,
    };

    cache.invalidate();
    let mut floors = FloorState::new(policy, root_id);
    let nr_calcs_before = cache.nr_calcs;

    // The root domain goes last so the other floors are known.
    for pd in em.perf_doms.values().rev() {
        let is_root = pd.id == root_id;
        let cap = policy.capacity_orig_of(pd.first_cpu());
        let from = pd.span.test_cpu(src) as usize;
        let cpus = pd.span.and(&policy.online);

        for dst in dst_mask.iter() {
            let mut sum_util = 0;
            let mut max_util = 0;

            for cpu in cpus.iter() {
                let rq = match rqs.get(cpu) {
                    Some(rq) => rq,
                    None => continue,
                };

                let no_cache = cpu == dst || cpu == src;
                let ec = if no_cache {
                    cache.nr_calcs += 1;
                    calc_energy(policy, rq, p, cap, dst)
                } else if cache.valid[from].test_cpu(cpu) {
                    cache.calc[from][cpu]
                } else {
                    cache.nr_calcs += 1;
                    let ec = calc_energy(policy, rq, p, cap, dst);
                    cache.calc[from][cpu] = ec;
                    cache.valid[from].assign_cpu(cpu, true);
                    ec
                };

                sum_util += ec.energy_util;
                max_util = max_util.max(ec.cpu_util);
            }

            if let Some(e) = energy.get_mut(dst) {
                *e += em_cpu_energy(
                    policy,
                    rqs,
                    pd,
                    is_root,
                    max_util,
                    sum_util,
                    &mut floors,
                    src,
                    dst,
                );
            }
        }
    }

    let nr_calcs = cache.nr_calcs - nr_calcs_before;
    metrics::counter!("energy_calcs_total").increment(nr_calcs as u64);
    trace!(
        "energy pid={} src={} dst_mask={} calcs={}",
        p.pid,
        src,
        dst_mask,
        nr_calcs
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::energy_model::EnergyModel;
    use crate::energy_model::PerfDomainSpec;
    use crate::energy_model::PerfStateSpec;
    use crate::rq::RunQueue;
    use crate::task::TaskGroupSnapshot;
    use crate::topology::ClusterSpec;
    use crate::topology::Topology;
    use crate::types::Pid;
    use crate::vendor_group::VendorGroupSnapshot;
    use std::sync::Arc;

    fn state(frequency: u64, power: u64) -> PerfStateSpec {
        PerfStateSpec {
            frequency,
            power,
            performance: None,
            cost: None,
            inefficient: false,
        }
    }

    fn setup() -> (Topology, EnergyModel, Tunables) {
        let topo = Topology::builder()
            .cluster(ClusterSpec::new("0-1", 512))
            .cluster(ClusterSpec::new("2-3", 1024))
            .build()
            .unwrap();
        let em = EnergyModel::from_specs(
            &[
                PerfDomainSpec {
                    cpus: "0-1".into(),
                    states: vec![state(500_000, 50), state(1_000_000, 200)],
                    min_freq: None,
                    max_freq: None,
                    root_constraint: vec![],
                },
                PerfDomainSpec {
                    cpus: "2-3".into(),
                    states: vec![state(1_000_000, 300), state(2_000_000, 1200)],
                    min_freq: None,
                    max_freq: None,
                    root_constraint: vec![(1_000_000, 0), (2_000_000, 1_000_000)],
                },
            ],
            &topo,
        )
        .unwrap();
        (topo, em, Tunables::default())
    }

    fn policy<'a>(topo: &'a Topology, em: &'a EnergyModel, tunables: &'a Tunables) -> Policy<'a> {
        Policy {
            topo,
            em: Some(em),
            tunables,
            vendor_groups: Arc::new(VendorGroupSnapshot::default()),
            task_groups: Arc::new(TaskGroupSnapshot::default()),
            capacity: (0..topo.nr_cpus()).map(|c| topo.capacity_orig(c)).collect(),
            cur_freq: vec![500_000, 500_000, 1_000_000, 1_000_000],
            active: topo.all_cpus(),
            online: topo.all_cpus(),
            uclamp_used: true,
        }
    }

    fn rqs(utils: &[Util]) -> Vec<RqSnapshot> {
        utils
            .iter()
            .enumerate()
            .map(|(cpu, util)| {
                let mut rq = RunQueue::new(cpu);
                rq.cfs.util_avg = *util;
                rq.snapshot()
            })
            .collect()
    }

    #[test]
    fn test_cache_skips_unaffected_cpus() {
        let (topo, em, tunables) = setup();
        let policy = policy(&topo, &em, &tunables);
        let rqs = rqs(&[100, 50, 0, 0]);
        let mut p = Task::new(Pid(1), 0, 4);
        p.util_avg = 100;
        p.last_update_time = 1;

        let mut cache = EnergyCache::new(4);
        let mut energy = vec![0; 4];
        let dst_mask = Cpumask::from_cpus([1, 2, 3], 4);
        compute_energy_change(&policy, &rqs, &p, 0, &dst_mask, &mut cache, &mut energy);

        // Big domain: 2 misses for dst=1, then only the dst CPU (1 + 1).
        // Little domain: src and dst for dst=1 (2), src and the miss on
        // CPU 1 for dst=2 (2), src alone for dst=3 (1).
        assert_eq!(cache.nr_calcs(), 9);
        // Waking the idle big domain costs more than staying little.
        assert!(energy[1] < energy[2]);
        assert_eq!(energy[2], energy[3]);

        cache.reset();
        assert_eq!(cache.nr_calcs(), 0);
    }

    #[test]
    fn test_root_floor_follows_destination() {
        let (topo, em, tunables) = setup();
        let mut policy = policy(&topo, &em, &tunables);
        // The big domain currently runs fast, holding the root floor high.
        policy.cur_freq = vec![500_000, 500_000, 2_000_000, 2_000_000];
        let rqs = rqs(&[100, 0, 0, 0]);
        let mut p = Task::new(Pid(1), 0, 4);
        p.util_avg = 10;
        p.last_update_time = 1;

        let mut cache = EnergyCache::new(4);
        let mut energy = vec![0; 4];
        let dst_mask = Cpumask::from_cpus([1], 4);
        compute_energy_change(&policy, &rqs, &p, 0, &dst_mask, &mut cache, &mut energy);
        // The big domain is not involved: its current floor applies and the
        // little domain runs at its top state.
        let busy = 100;
        let top_cost = em.root_pd().unwrap().max_state().unwrap().cost;
        assert_eq!(energy[1], top_cost * busy / 512);

        policy.cur_freq = vec![500_000, 500_000, 1_000_000, 1_000_000];
        let mut energy = vec![0; 4];
        compute_energy_change(&policy, &rqs, &p, 0, &dst_mask, &mut cache, &mut energy);
        let low_cost = em
            .root_pd()
            .unwrap()
            .state_at_or_above(0)
            .unwrap()
            .cost;
        assert_eq!(energy[1], low_cost * busy / 512);
    }

    #[test]
    fn test_no_energy_model() {
        let (topo, em, tunables) = setup();
        let mut policy = policy(&topo, &em, &tunables);
        policy.em = None;
        let rqs = rqs(&[100, 0, 0, 0]);
        let p = Task::new(Pid(1), 0, 4);
        let mut cache = EnergyCache::new(4);
        let mut energy = vec![0; 4];
        compute_energy_change(&policy, &rqs, &p, 0, &topo.all_cpus(), &mut cache, &mut energy);
        assert_eq!(energy, vec![0; 4]);
        assert_eq!(cache.nr_calcs(), 0);
    }
}
