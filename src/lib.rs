// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Energy-aware placement policy core
//!
//! Wakeup placement, clamp accounting and idle pulling for asymmetric
//! (little/mid/big) systems, driven by an energy model. The scheduler using
//! it calls into [`VendorSched`] at enqueue, dequeue, wakeup, fork, affinity
//! change and new-idle time; everything else is policy it consults.

/// Report a scheduler invariant violation without aborting.
///
/// Evaluates to the condition so callers can bail out of the offending path.
macro_rules! sched_warn_on {
    ($cond:expr) => {{
        let cond = $cond;
        if cond {
            ::log::warn!(
                "SCHED_WARN_ON({}) at {}:{}",
                stringify!($cond),
                file!(),
                line!()
            );
            ::metrics::counter!("sched_warn_total").increment(1);
        }
        cond
    }};
}

pub mod types;

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;

pub mod topology;
pub use topology::ClusterSpec;
pub use topology::Topology;

pub mod energy_model;
pub use energy_model::EnergyModel;
pub use energy_model::PerfDomainSpec;

pub mod vendor_group;
pub use vendor_group::VendorGroup;
pub use vendor_group::VendorGroupProperty;

pub mod task;
pub use task::Task;

pub mod config;
pub use config::Tunables;

pub mod rq;
pub mod policy;
pub use policy::Policy;

pub mod uclamp;
pub mod util;

pub mod energy;
pub use energy::EnergyCache;

pub mod select;
pub use select::Placement;
pub use select::PlacementReason;
pub use select::WakeFlags;

pub mod balance;
pub use balance::NewIdleOutcome;
pub use balance::PulledTask;

mod sched;
pub use sched::VendorSched;

pub mod stats;

mod log_recorder;
pub use log_recorder::LogRecorder;
pub use log_recorder::LogRecorderBuilder;
pub use log_recorder::MetricsReport;

pub mod scenario;
pub use scenario::Scenario;
