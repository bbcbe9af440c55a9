// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Wakeup placement on a little/mid/big system.

use scx_eas::types::Pid;
use scx_eas::Cpumask;
use scx_eas::PlacementReason;
use scx_eas::WakeFlags;

mod common;
use common::NR_CPUS;

#[test]
fn test_small_task_leaves_big_cpu() {
    let sched = common::sched();
    let mut cache = sched.new_energy_cache();
    let p = common::task(1, 6, 50);
    // Blocked utilization of the task on its previous CPU.
    sched.lock_rq(6).cfs.util_avg = 50;

    let placement = sched.select_task_rq(&p, 6, 6, WakeFlags::default(), &mut cache);
    assert_eq!(placement.reason, PlacementReason::EnergyEfficient);
    assert!(placement.cpu < 4, "expected a little CPU, got {}", placement.cpu);
    assert!(cache.nr_calcs() > 0);
}

#[test]
fn test_placement_stays_in_allowed_mask() {
    let sched = common::sched();
    let mut cache = sched.new_energy_cache();
    for cpu in 0..NR_CPUS {
        sched.lock_rq(cpu).cfs.util_avg = (cpu as u64 % 3) * 20;
    }

    for allowed in ["4-5", "1,6", "3-7", "0"] {
        let mut p = common::task(2, 0, 80);
        p.cpus_allowed = Cpumask::from_cpulist(allowed, NR_CPUS).unwrap();
        let placement = sched.select_task_rq(&p, 0, 0, WakeFlags::default(), &mut cache);
        assert!(
            p.cpus_allowed.test_cpu(placement.cpu),
            "cpu {} outside {}",
            placement.cpu,
            allowed
        );
    }
}

#[test]
fn test_single_candidate_skips_energy() {
    let sched = common::sched();
    let mut cache = sched.new_energy_cache();
    let mut p = common::task(3, 0, 100);
    p.cpus_allowed = Cpumask::from_cpus([6], NR_CPUS);

    let placement = sched.select_task_rq(&p, 0, 0, WakeFlags::default(), &mut cache);
    assert_eq!(placement.cpu, 6);
    assert_eq!(cache.nr_calcs(), 0);
}

#[test]
fn test_obviously_best_cpu_skips_energy() {
    let sched = common::sched();
    let mut cache = sched.new_energy_cache();
    for (cpu, util) in [(4, 0), (5, 100), (6, 200), (7, 300)] {
        sched.lock_rq(cpu).cfs.util_avg = util;
    }
    let mut p = common::task(4, 0, 50);
    p.cpus_allowed = Cpumask::from_cpulist("4-7", NR_CPUS).unwrap();

    let placement = sched.select_task_rq(&p, 0, 0, WakeFlags::default(), &mut cache);
    assert_eq!(placement.cpu, 4);
    assert_eq!(cache.nr_calcs(), 0);
}

#[test]
fn test_inactive_allowed_cpus() {
    let sched = common::sched();
    let mut cache = sched.new_energy_cache();
    sched.set_cpu_active(4, false).unwrap();
    sched.set_cpu_active(5, false).unwrap();
    let mut p = common::task(5, 0, 50);
    p.cpus_allowed = Cpumask::from_cpulist("4-5", NR_CPUS).unwrap();

    let placement = sched.select_task_rq(&p, 0, 0, WakeFlags::default(), &mut cache);
    assert_eq!(placement.cpu, 4);
}

#[test]
fn test_nothing_fits() {
    let sched = common::sched();
    let mut cache = sched.new_energy_cache();
    let p = common::task(6, 6, 900);

    let placement = sched.select_task_rq(&p, 6, 6, WakeFlags::default(), &mut cache);
    assert_eq!(placement.cpu, 0);
    assert_eq!(cache.nr_calcs(), 0);
}

#[test]
fn test_full_tie_stays_on_prev() {
    let sched = common::sched();
    let mut cache = sched.new_energy_cache();
    let mut p = common::task(12, 2, 60);
    p.cpus_allowed = Cpumask::from_cpulist("0-3", NR_CPUS).unwrap();
    sched.lock_rq(2).cfs.util_avg = 60;

    // Every little CPU costs the same: the task stays where it was.
    let placement = sched.select_task_rq(&p, 2, 2, WakeFlags::default(), &mut cache);
    assert_eq!(placement.reason, PlacementReason::EnergyEfficient);
    assert_eq!(placement.cpu, 2);
    assert!(cache.nr_calcs() > 0);

    // A busier previous CPU is no longer part of the tie.
    sched.lock_rq(2).cfs.util_avg = 100;
    let placement = sched.select_task_rq(&p, 2, 2, WakeFlags::default(), &mut cache);
    assert_eq!(placement.cpu, 0);
}

#[test]
fn test_sync_wakeup_on_waker_cpu() {
    let sched = common::sched();
    let mut cache = sched.new_energy_cache();
    sched.enqueue_task(5, common::task(100, 5, 10));
    let p = common::task(7, 0, 100);
    let flags = WakeFlags {
        sync: true,
        ..Default::default()
    };

    let placement = sched.select_task_rq(&p, 0, 5, flags, &mut cache);
    assert_eq!(placement.cpu, 5);
    assert_eq!(placement.reason, PlacementReason::SyncWakeup);

    // An exiting waker does not hold the CPU.
    let flags = WakeFlags {
        sync: true,
        waker_exiting: true,
        ..Default::default()
    };
    let placement = sched.select_task_rq(&p, 0, 5, flags, &mut cache);
    assert_ne!(placement.reason, PlacementReason::SyncWakeup);
}

#[test]
fn test_sync_boost_from_big_waker() {
    let sched = common::sched();
    let mut cache = sched.new_energy_cache();
    sched.enqueue_task(6, common::task(100, 6, 10));
    sched.enqueue_task(6, common::task(101, 6, 10));
    let p = common::task(8, 0, 100);
    let flags = WakeFlags {
        sync: true,
        ..Default::default()
    };

    let placement = sched.select_task_rq(&p, 0, 6, flags, &mut cache);
    assert!(placement.sync_boost);
    assert_ne!(placement.reason, PlacementReason::SyncWakeup);
}

#[test]
fn test_prev_idle_in_shallow_state() {
    let sched = common::sched();
    let mut cache = sched.new_energy_cache();
    let p = common::task(9, 2, 60);

    sched.lock_rq(2).idle_state = Some(0);
    let placement = sched.select_task_rq(&p, 2, 2, WakeFlags::default(), &mut cache);
    assert_eq!(placement.cpu, 2);
    assert_eq!(placement.reason, PlacementReason::PrevIdle);

    sched.lock_rq(2).idle_state = Some(1);
    let placement = sched.select_task_rq(&p, 2, 2, WakeFlags::default(), &mut cache);
    assert_eq!(placement.reason, PlacementReason::EnergyEfficient);
}

#[test]
fn test_exec_keeps_prev() {
    let sched = common::sched();
    let mut cache = sched.new_energy_cache();
    let p = common::task(10, 7, 60);
    let flags = WakeFlags {
        exec: true,
        ..Default::default()
    };

    let placement = sched.select_task_rq(&p, 7, 0, flags, &mut cache);
    assert_eq!(placement.cpu, 7);
    assert_eq!(placement.reason, PlacementReason::Exec);
}

#[test]
fn test_affinity_change_moves_queued_task() {
    let sched = common::sched();
    let mut cache = sched.new_energy_cache();
    sched.enqueue_task(0, common::task(11, 0, 60));
    let p = sched.lock_rq(0).task(Pid(11)).cloned().unwrap();
    assert!(p.on_rq);

    let new_mask = Cpumask::from_cpulist("6-7", NR_CPUS).unwrap();
    let dest = sched.any_and_distribute(&p, &new_mask, 0, &mut cache);
    assert!(new_mask.test_cpu(dest));

    // Still allowed where it is: nothing to do.
    let wide = Cpumask::from_cpulist("0-7", NR_CPUS).unwrap();
    assert_eq!(sched.any_and_distribute(&p, &wide, 0, &mut cache), 0);

    // Asleep: the destination stands.
    let sleeping = sched.dequeue_task(0, Pid(11), true).unwrap();
    assert_eq!(sched.any_and_distribute(&sleeping, &new_mask, 0, &mut cache), 0);
}
