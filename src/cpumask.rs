// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A fixed-width CPU set sized to the topology it describes.
//!
//! A Cpumask is a BitVec of u64's along with the helpers the placement and
//! balancing paths need: membership tests, weight, intersection, ascending
//! iteration and cpulist parsing. Unlike a host cpumask, its width is
//! chosen by the caller (normally `Topology::nr_cpus()`), which keeps
//! synthetic topologies and tests independent of the machine they run on.
//!
//!```
//!     use scx_eas::Cpumask;
//!     let mut mask = Cpumask::from_cpulist("0-3,6", 8).unwrap();
//!     assert!(mask.test_cpu(6));
//!     mask.clear_cpu(6).unwrap();
//!     assert_eq!(mask.weight(), 4);
//!     assert_eq!(format!("{}", mask), "0f");
//!```

use anyhow::bail;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask able to hold `nr_cpus` CPUs.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a Cpumask with all `nr_cpus` CPUs set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    /// Build a Cpumask from a kernel-style cpulist such as "0-3,6".
    pub fn from_cpulist(cpulist: &str, nr_cpus: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)?;
        }

        Ok(mask)
    }

    /// Build a Cpumask from an iterator of CPU ids. Out-of-range ids are
    /// ignored.
    pub fn from_cpus<I: IntoIterator<Item = usize>>(cpus: I, nr_cpus: usize) -> Cpumask {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in cpus {
            mask.assign_cpu(cpu, true);
        }
        mask
    }

    /// Return a slice of u64's whose bits reflect the Cpumask.
    pub fn as_raw_slice(&self) -> &[u64] {
        self.mask.as_raw_slice()
    }

    /// Set all bits in the Cpumask to 1
    pub fn set_all(&mut self) {
        self.mask.fill(true);
    }

    /// Set all bits in the Cpumask to 0
    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Set or clear a bit for a CPU the caller took from a mask of the same
    /// width. Out-of-range CPUs are left alone.
    pub fn assign_cpu(&mut self, cpu: usize, set: bool) {
        if cpu < self.mask.len() {
            self.mask.set(cpu, set);
        }
    }

    /// Test whether the specified CPU bit is set in the Cpumask. If the CPU
    /// exceeds the width of the Cpumask, false is returned.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The width of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Lowest CPU set in the mask.
    pub fn first(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// Create a Cpumask that is the negation of the current Cpumask.
    pub fn not(&self) -> Cpumask {
        let mut new = self.clone();
        new.mask = !new.mask;
        new
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    /// The result has the width of `self`.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new &= other;
        new
    }

    /// Create a Cpumask that is the OR of the current Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new |= other;
        new
    }

    /// Iterate over the CPUs set in the mask, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nr_cpus = self.len();
        if nr_cpus == 0 {
            return write!(f, "0");
        }

        // Built from the set bits so padding past the width never leaks.
        let mut masks: Vec<u32> = vec![0; nr_cpus.div_ceil(32)];
        for cpu in self.iter() {
            masks[cpu / 32] |= 1 << (cpu % 32);
        }

        // Print the highest 32bit trimmed to the mask width, then the rest in
        // descending order.
        let width = match nr_cpus.div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        if let Some(top) = masks.pop() {
            write!(f, "{:0width$x}", top, width = width)?;
        }
        for submask in masks.iter().rev() {
            write!(f, ",{submask:08x}")?;
        }
        Ok(())
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        for (i, mut bit) in self.mask.iter_mut().enumerate() {
            let keep = *bit && rhs.test_cpu(i);
            bit.set(keep);
        }
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        for cpu in rhs.iter() {
            self.assign_cpu(cpu, true);
        }
    }
}
