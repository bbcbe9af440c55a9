// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cluster topology
//!
//! The policy reasons about a small heterogeneous system: an ordered list of
//! clusters, each a contiguous range of CPUs sharing one original capacity
//! and one table of idle states. Clusters are ordered by ascending capacity,
//! so CPU ids grow with capacity. That ordering is what makes the capacity
//! thresholds below meaningful:
//!
//! - `min_capacity_cpu()`: first CPU of the lowest-capacity cluster.
//! - `mid_capacity_cpu()`: first CPU of the second cluster (or `nr_cpus()` on
//!   a single-cluster system, so that no CPU is ever "at or above mid").
//! - `max_capacity_cpu()`: first CPU of the highest-capacity cluster.
//!
//!```
//!     use scx_eas::topology::{ClusterSpec, Topology};
//!     let topo = Topology::builder()
//!         .cluster(ClusterSpec::new("0-3", 160))
//!         .cluster(ClusterSpec::new("4-5", 498))
//!         .cluster(ClusterSpec::new("6-7", 1024))
//!         .build()
//!         .unwrap();
//!     assert_eq!(topo.mid_capacity_cpu(), 4);
//!     assert_eq!(topo.capacity_orig(7), 1024);
//!```

use crate::cpumask::read_cpulist;
use crate::types::Util;
use crate::types::SCHED_CAPACITY_SCALE;
use crate::Cpumask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

/// One idle state of a cluster, as exposed by cpuidle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleState {
    pub name: String,
    /// Exit latency in microseconds.
    pub exit_latency_us: u64,
}

/// Description of one cluster, as found in a scenario file or built in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Kernel-style cpulist, e.g. "4-5".
    pub cpus: String,
    pub capacity: Util,
    #[serde(default)]
    pub idle_states: Vec<IdleState>,
}

impl ClusterSpec {
    pub fn new(cpus: &str, capacity: Util) -> ClusterSpec {
        ClusterSpec {
            cpus: cpus.to_string(),
            capacity,
            idle_states: vec![],
        }
    }

    pub fn idle_state(mut self, name: &str, exit_latency_us: u64) -> ClusterSpec {
        self.idle_states.push(IdleState {
            name: name.to_string(),
            exit_latency_us,
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: usize,
    pub span: Cpumask,
    pub first_cpu: usize,
    pub capacity: Util,
    pub idle_states: Vec<IdleState>,
}

#[derive(Debug, Clone)]
pub struct Topology {
    clusters: Vec<Cluster>,
    cpu_to_cluster: Vec<usize>,
    nr_cpus: usize,
    mid_capacity_cpu: usize,
}

#[derive(Debug, Default)]
pub struct TopologyBuilder {
    specs: Vec<ClusterSpec>,
}

impl TopologyBuilder {
    pub fn cluster(mut self, spec: ClusterSpec) -> TopologyBuilder {
        self.specs.push(spec);
        self
    }

    pub fn clusters<I: IntoIterator<Item = ClusterSpec>>(mut self, specs: I) -> TopologyBuilder {
        self.specs.extend(specs);
        self
    }

    pub fn build(self) -> Result<Topology> {
        if self.specs.is_empty() {
            bail!("Topology needs at least one cluster");
        }

        let mut ranges = vec![];
        for spec in self.specs.iter() {
            let cpus = read_cpulist(&spec.cpus)
                .with_context(|| format!("Invalid cluster cpulist {:?}", spec.cpus))?;
            if cpus.is_empty() {
                bail!("Cluster {:?} has no CPU", spec.cpus);
            }
            ranges.push(cpus);
        }

        let nr_cpus: usize = ranges.iter().map(|r| r.len()).sum();
        let mut clusters = vec![];
        let mut cpu_to_cluster = vec![];
        let mut next_cpu = 0;
        let mut prev_cap = 0;

        for (id, (spec, cpus)) in self.specs.into_iter().zip(ranges).enumerate() {
            for (i, cpu) in cpus.iter().enumerate() {
                if *cpu != next_cpu + i {
                    bail!(
                        "Cluster {} is not contiguous with the previous one (cpu {}, expected {})",
                        id,
                        cpu,
                        next_cpu + i
                    );
                }
            }
            if spec.capacity == 0 || spec.capacity > SCHED_CAPACITY_SCALE {
                bail!("Cluster {} has invalid capacity {}", id, spec.capacity);
            }
            if spec.capacity < prev_cap {
                bail!(
                    "Clusters must be ordered by ascending capacity ({} < {})",
                    spec.capacity,
                    prev_cap
                );
            }
            prev_cap = spec.capacity;

            clusters.push(Cluster {
                id,
                span: Cpumask::from_cpus(cpus.iter().copied(), nr_cpus),
                first_cpu: next_cpu,
                capacity: spec.capacity,
                idle_states: spec.idle_states,
            });
            cpu_to_cluster.extend(std::iter::repeat(id).take(cpus.len()));
            next_cpu += cpus.len();
        }

        let mid_capacity_cpu = match clusters.get(1) {
            Some(c) => c.first_cpu,
            None => nr_cpus,
        };
        Ok(Topology {
            clusters,
            cpu_to_cluster,
            nr_cpus,
            mid_capacity_cpu,
        })
    }
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// The cluster `cpu` belongs to. `cpu` must be below `nr_cpus()`.
    pub fn cluster_of(&self, cpu: usize) -> &Cluster {
        let idx = self.cpu_to_cluster.get(cpu).copied().unwrap_or(0);
        &self.clusters[idx]
    }

    /// Original (maximum) capacity of `cpu`. Zero for CPUs outside the topology.
    pub fn capacity_orig(&self, cpu: usize) -> Util {
        match self.cpu_to_cluster.get(cpu) {
            Some(idx) => self.clusters[*idx].capacity,
            None => 0,
        }
    }

    pub fn min_capacity_cpu(&self) -> usize {
        0
    }

    pub fn mid_capacity_cpu(&self) -> usize {
        self.mid_capacity_cpu
    }

    pub fn max_capacity_cpu(&self) -> usize {
        // Clusters are never empty, checked in build().
        self.clusters[self.clusters.len() - 1].first_cpu
    }

    /// Mask with every CPU of the system set.
    pub fn all_cpus(&self) -> Cpumask {
        Cpumask::full(self.nr_cpus)
    }

    /// Exit latency of idle state `idx` of `cpu`'s cluster, if it exists.
    pub fn idle_exit_latency(&self, cpu: usize, idx: usize) -> Option<u64> {
        self.cluster_of(cpu)
            .idle_states
            .get(idx)
            .map(|s| s.exit_latency_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_clusters() -> TopologyBuilder {
        Topology::builder()
            .cluster(ClusterSpec::new("0-3", 160).idle_state("WFI", 0))
            .cluster(ClusterSpec::new("4-5", 498).idle_state("WFI", 0))
            .cluster(ClusterSpec::new("6-7", 1024).idle_state("WFI", 0).idle_state("C2", 200))
    }

    #[test]
    fn test_thresholds() {
        let topo = three_clusters().build().unwrap();
        assert_eq!(topo.nr_cpus(), 8);
        assert_eq!(topo.min_capacity_cpu(), 0);
        assert_eq!(topo.mid_capacity_cpu(), 4);
        assert_eq!(topo.max_capacity_cpu(), 6);
        assert_eq!(topo.cluster_of(5).id, 1);
        assert_eq!(topo.capacity_orig(3), 160);
        assert_eq!(topo.capacity_orig(8), 0);
        assert_eq!(topo.idle_exit_latency(7, 1), Some(200));
        assert_eq!(topo.idle_exit_latency(0, 1), None);
    }

    #[test]
    fn test_single_cluster_has_no_mid() {
        let topo = Topology::builder()
            .cluster(ClusterSpec::new("0-1", 1024))
            .build()
            .unwrap();
        assert_eq!(topo.mid_capacity_cpu(), 2);
        assert_eq!(topo.max_capacity_cpu(), 0);
    }

    #[test]
    fn test_invalid_layouts() {
        assert!(Topology::builder().build().is_err());
        assert!(Topology::builder()
            .cluster(ClusterSpec::new("0-1", 1024))
            .cluster(ClusterSpec::new("2-3", 512))
            .build()
            .is_err());
        assert!(Topology::builder()
            .cluster(ClusterSpec::new("0-1", 512))
            .cluster(ClusterSpec::new("3-4", 1024))
            .build()
            .is_err());
    }
}
