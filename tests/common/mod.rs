// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

#![allow(dead_code)]

use std::collections::BTreeMap;

use scx_eas::energy_model::PerfStateSpec;
use scx_eas::types::Pid;
use scx_eas::types::UclampId;
use scx_eas::vendor_group::UclampRequest;
use scx_eas::ClusterSpec;
use scx_eas::EnergyModel;
use scx_eas::PerfDomainSpec;
use scx_eas::Task;
use scx_eas::Topology;
use scx_eas::Tunables;
use scx_eas::VendorGroup;
use scx_eas::VendorGroupProperty;
use scx_eas::VendorSched;

pub const NR_CPUS: usize = 8;

/// Four little CPUs, two mid and two big, each cluster with a shallow and a
/// deep idle state.
pub fn topology() -> Topology {
    Topology::builder()
        .cluster(ClusterSpec::new("0-3", 160).idle_state("WFI", 1).idle_state("C2", 300))
        .cluster(ClusterSpec::new("4-5", 498).idle_state("WFI", 1).idle_state("C2", 500))
        .cluster(ClusterSpec::new("6-7", 1024).idle_state("WFI", 1).idle_state("C2", 800))
        .build()
        .unwrap()
}

fn state(frequency: u64, power: u64) -> PerfStateSpec {
    PerfStateSpec {
        frequency,
        power,
        performance: None,
        cost: None,
        inefficient: false,
    }
}

/// One domain per cluster. Running the mid or big cluster at its top
/// frequency holds the little (root) domain at 1 GHz or more.
pub fn perf_domain_specs() -> Vec<PerfDomainSpec> {
    vec![
        PerfDomainSpec {
            cpus: "0-3".to_string(),
            states: vec![state(300_000, 10), state(1_000_000, 60), state(1_800_000, 150)],
            min_freq: None,
            max_freq: None,
            root_constraint: vec![],
        },
        PerfDomainSpec {
            cpus: "4-5".to_string(),
            states: vec![state(500_000, 100), state(2_000_000, 600)],
            min_freq: None,
            max_freq: None,
            root_constraint: vec![(500_000, 0), (2_000_000, 1_000_000)],
        },
        PerfDomainSpec {
            cpus: "6-7".to_string(),
            states: vec![state(500_000, 200), state(2_800_000, 1500)],
            min_freq: None,
            max_freq: None,
            root_constraint: vec![(500_000, 0), (2_800_000, 1_000_000)],
        },
    ]
}

pub fn energy_model(topo: &Topology) -> EnergyModel {
    EnergyModel::from_specs(&perf_domain_specs(), topo).unwrap()
}

pub fn sched_with(
    tunables: Tunables,
    vendor_groups: BTreeMap<VendorGroup, VendorGroupProperty>,
    with_em: bool,
) -> VendorSched {
    let topo = topology();
    let em = if with_em {
        Some(energy_model(&topo))
    } else {
        None
    };
    VendorSched::new(topo, em, tunables, &vendor_groups).unwrap()
}

pub fn sched() -> VendorSched {
    sched_with(Tunables::default(), BTreeMap::new(), true)
}

/// A plain task, already accounted by PELT.
pub fn task(pid: i32, cpu: usize, util: u64) -> Task {
    let mut p = Task::new(Pid(pid), cpu, NR_CPUS);
    p.util_avg = util;
    p.last_update_time = 1;
    p
}

/// A prefer-idle task asking for at least `min`. Critical when `min` is
/// non-zero; a zero request still makes it important.
pub fn important_task(pid: i32, cpu: usize, util: u64, min: u32) -> Task {
    let mut p = task(pid, cpu, util);
    p.prefer_idle = true;
    p.uclamp_req[UclampId::Min.index()] = UclampRequest::user(min);
    p
}
