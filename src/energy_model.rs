// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Energy model
//!
//! Performance domains and their operating points, either loaded from the
//! kernel's debugfs energy model (`<debugfs>/energy_model/cpu*/ps:*`) or built
//! from an in-memory description.
//!
//! Each domain additionally carries the inter-cluster frequency constraint
//! towards the root domain (the domain holding CPU 0): for a given frequency
//! of this domain, the lowest frequency the root domain is allowed to run at.
//! Debugfs does not expose that table, so loaded models start without one.

use crate::topology::Topology;
use crate::Cpumask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub const DEBUGFS_EM_ROOT: &str = "/sys/kernel/debug/energy_model";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct PerfState {
    pub cost: u64,
    pub frequency: u64,
    pub inefficient: u64,
    pub performance: u64,
    pub power: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfDomain {
    /// Monotonically increasing unique id, ordered like the CPUs.
    pub id: usize,
    /// Cpumask of all CPUs in this performance domain.
    pub span: Cpumask,
    /// Table of performance states indexed by frequency.
    pub perf_table: BTreeMap<u64, Arc<PerfState>>,
    /// Scaling limits of the cpufreq policy.
    pub min_freq: u64,
    pub max_freq: u64,
    /// This domain's frequency -> minimum root domain frequency.
    pub root_constraint: BTreeMap<u64, u64>,
}

#[derive(Debug, Clone)]
pub struct EnergyModel {
    /// Performance domains indexed by domain id
    pub perf_doms: BTreeMap<usize, Arc<PerfDomain>>,
}

/// One operating point as described in a scenario file. `performance` and
/// `cost` are derived the way the kernel derives them when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfStateSpec {
    pub frequency: u64,
    pub power: u64,
    #[serde(default)]
    pub performance: Option<u64>,
    #[serde(default)]
    pub cost: Option<u64>,
    #[serde(default)]
    pub inefficient: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfDomainSpec {
    pub cpus: String,
    pub states: Vec<PerfStateSpec>,
    #[serde(default)]
    pub min_freq: Option<u64>,
    #[serde(default)]
    pub max_freq: Option<u64>,
    /// Pairs of (this domain's frequency, minimum root domain frequency).
    #[serde(default)]
    pub root_constraint: Vec<(u64, u64)>,
}

impl EnergyModel {
    pub fn has_energy_model(root: &Path) -> bool {
        get_pd_paths(root).is_ok()
    }

    /// Build a complete EnergyModel from a debugfs energy_model directory.
    pub fn from_debugfs(root: &Path, nr_cpus: usize) -> Result<EnergyModel> {
        let mut perf_doms = BTreeMap::new();
        let pd_paths = match get_pd_paths(root) {
            Ok(pd_paths) => pd_paths,
            Err(_) => {
                bail!("Fail to locate the energy model directory {:?}", root);
            }
        };

        for (pd_id, pd_path) in pd_paths {
            let pd = PerfDomain::from_debugfs(pd_id, &pd_path, nr_cpus)?;
            perf_doms.insert(pd.id, pd.into());
        }

        EnergyModel::validate(perf_doms)
    }

    /// Build an EnergyModel from in-memory domain descriptions. Capacities of
    /// the topology are used to derive missing performance values.
    pub fn from_specs(specs: &[PerfDomainSpec], topo: &Topology) -> Result<EnergyModel> {
        let mut perf_doms = BTreeMap::new();
        let mut specs: Vec<(usize, &PerfDomainSpec)> = specs
            .iter()
            .map(|s| {
                let first = Cpumask::from_cpulist(&s.cpus, topo.nr_cpus())
                    .with_context(|| format!("Invalid perf domain cpulist {:?}", s.cpus))?
                    .first()
                    .context("Perf domain has no CPU")?;
                Ok::<_, anyhow::Error>((first, s))
            })
            .collect::<Result<_>>()?;
        specs.sort_by_key(|(first, _)| *first);

        for (id, (_, spec)) in specs.into_iter().enumerate() {
            let pd = PerfDomain::from_spec(id, spec, topo)?;
            perf_doms.insert(pd.id, pd.into());
        }

        EnergyModel::validate(perf_doms)
    }

    fn validate(perf_doms: BTreeMap<usize, Arc<PerfDomain>>) -> Result<EnergyModel> {
        if perf_doms.is_empty() {
            bail!("There is no performance domain.");
        }
        for pd in perf_doms.values() {
            if pd.perf_table.is_empty() {
                bail!("Performance domain {} has no performance state", pd.id);
            }
            let mut prev_cost = 0;
            for ps in pd.perf_table.values() {
                if ps.cost < prev_cost {
                    bail!(
                        "Performance domain {}: cost must not decrease with frequency ({} kHz)",
                        pd.id,
                        ps.frequency
                    );
                }
                prev_cost = ps.cost;
            }
        }
        Ok(EnergyModel { perf_doms })
    }

    pub fn get_pd_by_cpu_id(&self, cpu_id: usize) -> Option<&PerfDomain> {
        self.perf_doms
            .values()
            .find(|&pd| pd.span.test_cpu(cpu_id))
            .map(|c| c as _)
    }

    /// The root domain, i.e. the one whose frequency is constrained by the
    /// other domains' frequencies.
    pub fn root_pd(&self) -> Option<&Arc<PerfDomain>> {
        self.perf_doms.values().next()
    }

    pub fn perf_total(&self) -> u64 {
        self.perf_doms.values().map(|pd| pd.perf_total()).sum()
    }
}

impl PerfDomain {
    /// Build a PerfDomain from its debugfs directory.
    pub fn from_debugfs(id: usize, root: &str, nr_cpus: usize) -> Result<PerfDomain> {
        let mut perf_table = BTreeMap::new();
        let cpulist = std::fs::read_to_string(root.to_owned() + "/cpus")
            .with_context(|| format!("Failed to read {}/cpus", root))?;
        let span = Cpumask::from_cpulist(&cpulist, nr_cpus)?;

        for ps_path in get_ps_paths(root)? {
            let ps = PerfState::from_debugfs(&ps_path)?;
            perf_table.insert(ps.frequency, Arc::new(ps));
        }

        let (min_freq, max_freq) = freq_range(&perf_table);
        Ok(PerfDomain {
            id,
            span,
            perf_table,
            min_freq,
            max_freq,
            root_constraint: BTreeMap::new(),
        })
    }

    pub fn from_spec(id: usize, spec: &PerfDomainSpec, topo: &Topology) -> Result<PerfDomain> {
        let span = Cpumask::from_cpulist(&spec.cpus, topo.nr_cpus())?;
        let first = span.first().context("Perf domain has no CPU")?;
        let capacity = topo.capacity_orig(first);
        for cpu in span.iter() {
            if topo.capacity_orig(cpu) != capacity {
                bail!("Perf domain {:?} spans CPUs of different capacity", spec.cpus);
            }
        }

        let fmax = match spec.states.iter().map(|s| s.frequency).max() {
            Some(f) if f > 0 => f,
            _ => bail!("Perf domain {:?} has no usable performance state", spec.cpus),
        };
        let mut perf_table = BTreeMap::new();
        for s in spec.states.iter() {
            if s.frequency == 0 {
                bail!("Perf domain {:?} has a zero frequency state", spec.cpus);
            }
            let ps = PerfState {
                cost: s.cost.unwrap_or(fmax * s.power / s.frequency),
                frequency: s.frequency,
                inefficient: s.inefficient as u64,
                performance: s.performance.unwrap_or(capacity * s.frequency / fmax),
                power: s.power,
            };
            perf_table.insert(ps.frequency, Arc::new(ps));
        }

        let (min_freq, max_freq) = freq_range(&perf_table);
        let min_freq = spec.min_freq.unwrap_or(min_freq);
        let max_freq = spec.max_freq.unwrap_or(max_freq);
        if min_freq > max_freq {
            bail!("Perf domain {:?}: min_freq {} > max_freq {}", spec.cpus, min_freq, max_freq);
        }

        Ok(PerfDomain {
            id,
            span,
            perf_table,
            min_freq,
            max_freq,
            root_constraint: spec.root_constraint.iter().copied().collect(),
        })
    }

    pub fn first_cpu(&self) -> usize {
        self.span.first().unwrap_or(0)
    }

    /// The highest performance state.
    pub fn max_state(&self) -> Option<&Arc<PerfState>> {
        self.perf_table.last_key_value().map(|(_, ps)| ps)
    }

    /// The lowest performance state running at `freq` or faster, or the
    /// highest one when `freq` exceeds the table.
    pub fn state_at_or_above(&self, freq: u64) -> Option<&Arc<PerfState>> {
        self.perf_table
            .range(freq..)
            .next()
            .map(|(_, ps)| ps)
            .or_else(|| self.max_state())
    }

    /// Clamp `freq` to the domain's scaling limits.
    pub fn map_scaling_freq(&self, freq: u64) -> u64 {
        freq.clamp(self.min_freq, self.max_freq)
    }

    /// Lowest root domain frequency allowed while this domain runs at `freq`.
    /// The constraint of the first listed frequency at or above `freq`
    /// applies, the last one beyond the table, none without a table.
    pub fn root_floor(&self, freq: u64) -> u64 {
        self.root_constraint
            .range(freq..)
            .next()
            .or_else(|| self.root_constraint.last_key_value())
            .map(|(_, root_freq)| *root_freq)
            .unwrap_or(0)
    }

    /// Capacity-relative scale of `freq`, on the capacity scale.
    pub fn freq_scale(&self, freq: u64) -> u64 {
        let perf = self.state_at_or_above(freq).map(|ps| ps.performance);
        let max_perf = self.max_state().map(|ps| ps.performance);
        match (perf, max_perf) {
            (Some(perf), Some(max_perf)) if max_perf > 0 => {
                (perf << crate::types::SCHED_CAPACITY_SHIFT) / max_perf
            }
            _ => crate::types::SCHED_CAPACITY_SCALE,
        }
    }

    pub fn perf_total(&self) -> u64 {
        match self.max_state() {
            Some(ps) => ps.performance * self.span.weight() as u64,
            None => 0,
        }
    }
}

impl PerfState {
    /// Build a PerfState from a debugfs `ps:<freq>` directory.
    pub fn from_debugfs(root: &str) -> Result<PerfState> {
        let cost = read_from_file(Path::new(&(root.to_owned() + "/cost")))?;
        let frequency = read_from_file(Path::new(&(root.to_owned() + "/frequency")))?;
        let inefficient = read_from_file(Path::new(&(root.to_owned() + "/inefficient")))?;
        let performance = read_from_file(Path::new(&(root.to_owned() + "/performance")))?;
        let power = read_from_file(Path::new(&(root.to_owned() + "/power")))?;

        Ok(PerfState {
            cost,
            frequency,
            inefficient,
            performance,
            power,
        })
    }
}

impl fmt::Display for EnergyModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (_, pd) in self.perf_doms.iter() {
            writeln!(f, "{pd:#}")?;
        }
        Ok(())
    }
}

impl fmt::Display for PerfDomain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "# perf domain: {:#}, cpus: {:#}, scaling: {}-{}",
            self.id, self.span, self.min_freq, self.max_freq
        )?;
        writeln!(f, "cost, frequency, inefficient, performance, power")?;
        for (_, ps) in self.perf_table.iter() {
            writeln!(f, "{ps:#}")?;
        }
        for (freq, root_freq) in self.root_constraint.iter() {
            writeln!(f, "constraint: {} -> root >= {}", freq, root_freq)?;
        }
        Ok(())
    }
}

impl fmt::Display for PerfState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, {}",
            self.cost, self.frequency, self.inefficient, self.performance, self.power
        )?;
        Ok(())
    }
}

/*********************************************************
 * Helper structs/functions for creating the EnergyModel *
 *********************************************************/
fn freq_range(perf_table: &BTreeMap<u64, Arc<PerfState>>) -> (u64, u64) {
    let min = perf_table.keys().next().copied().unwrap_or(0);
    let max = perf_table.keys().next_back().copied().unwrap_or(0);
    (min, max)
}

fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };
    let val = val.trim_end_matches('\0');

    match val.trim().parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse content '{}' from {:?}", val.trim(), path);
        }
    }
}

fn get_ps_paths(root: &str) -> Result<Vec<String>> {
    let ps_paths = glob(&(root.to_owned() + "/ps:[0-9]*"))?;
    let mut ps_vec = vec![];
    for ps_path in ps_paths.filter_map(Result::ok) {
        let ps_str = ps_path.to_string_lossy().into_owned();
        ps_vec.push(ps_str);
    }

    Ok(ps_vec)
}

fn get_pd_paths(root: &Path) -> Result<Vec<(usize, String)>> {
    let prefix = root.display().to_string() + "/cpu";
    let pd_paths = glob(&(prefix.clone() + "[0-9]*"))?;

    let mut pd_vec = vec![];
    for pd_path in pd_paths.filter_map(Result::ok) {
        let pd_str = pd_path.to_string_lossy().into_owned();
        let pd_id: usize = pd_str[prefix.len()..].parse()?;
        pd_vec.push((pd_id, pd_str));
    }
    if pd_vec.is_empty() {
        bail!("There is no performance domain.");
    }
    pd_vec.sort();

    let mut pd_vec2 = vec![];
    for (id, (_, pd_str)) in pd_vec.into_iter().enumerate() {
        pd_vec2.push((id, pd_str));
    }

    Ok(pd_vec2)
}
