// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Newtype wrappers and type aliases for scheduling quantities.
//!
//! Identifiers (PIDs, task groups) are newtypes so they cannot be confused
//! with CPU numbers or utilization values. Plain quantities (utilization,
//! capacity, time) are aliases, all utilization and capacity figures being
//! expressed on the shared `SCHED_CAPACITY_SCALE` fixed-point scale.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

pub const SCHED_CAPACITY_SHIFT: u32 = 10;
pub const SCHED_CAPACITY_SCALE: u64 = 1 << SCHED_CAPACITY_SHIFT;

/// Default nice-0 priority. Tasks with a numerically larger priority are
/// below default priority.
pub const DEFAULT_PRIO: i32 = 120;

/// Utilization or capacity on the `SCHED_CAPACITY_SCALE` scale.
pub type Util = u64;

/// Time in nanoseconds.
pub type TimeNs = u64;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task group (cgroup) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskGroupId(pub u32);

impl TaskGroupId {
    /// The root task group. Tasks in it are accounted directly on the
    /// run-queue's root utilization signal.
    pub const ROOT: TaskGroupId = TaskGroupId(0);
}

/// The two utilization clamp kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UclampId {
    Min,
    Max,
}

pub const UCLAMP_CNT: usize = 2;

impl UclampId {
    pub const ALL: [UclampId; UCLAMP_CNT] = [UclampId::Min, UclampId::Max];

    pub fn index(self) -> usize {
        match self {
            UclampId::Min => 0,
            UclampId::Max => 1,
        }
    }

    /// The value a clamp of this kind takes when nothing restricts it.
    pub fn none(self) -> u32 {
        match self {
            UclampId::Min => 0,
            UclampId::Max => SCHED_CAPACITY_SCALE as u32,
        }
    }
}

impl fmt::Display for UclampId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UclampId::Min => write!(f, "UCLAMP_MIN"),
            UclampId::Max => write!(f, "UCLAMP_MAX"),
        }
    }
}

/// `cap_scale(v, s)`: scale `v` (on the capacity scale) by capacity `s`.
pub fn cap_scale(v: u64, s: u64) -> u64 {
    (v * s) >> SCHED_CAPACITY_SHIFT
}

/// floor(sqrt(x)), computed without going through floating point.
pub fn int_sqrt(x: u64) -> u64 {
    if x < 2 {
        return x;
    }

    let mut m: u64 = 1 << ((63 - x.leading_zeros()) & !1);
    let mut x = x;
    let mut y: u64 = 0;
    while m != 0 {
        let b = y + m;
        y >>= 1;
        if x >= b {
            x -= b;
            y += m;
        }
        m >>= 2;
    }
    y
}
