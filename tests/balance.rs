// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Idle pulling of important tasks towards little CPUs.

use scx_eas::balance::detach_important_task;
use scx_eas::types::Pid;
use scx_eas::PulledTask;
use scx_eas::VendorSched;

mod common;

/// CPU 6 runs a critical task, with a plain task and an important one
/// (boosted by an explicit zero request) queued behind it.
fn busy_big_cpu(sched: &VendorSched) {
    sched.enqueue_task(6, common::task(10, 6, 100));
    sched.enqueue_task(6, common::important_task(11, 6, 200, 200));
    let mut backup = common::important_task(12, 6, 120, 0);
    backup.load_avg = 77;
    sched.enqueue_task(6, backup);
    sched.lock_rq(6).curr = Some(Pid(11));
}

/// CPU 0 is about to switch away from its last task.
fn going_idle(sched: &VendorSched, cpu: usize) {
    let mut rq = sched.lock_rq(cpu);
    rq.curr = Some(Pid(99));
    rq.clock = 5000;
}

#[test]
fn test_pull_important_task_as_misfit() {
    let sched = common::sched();
    busy_big_cpu(&sched);
    going_idle(&sched, 0);

    let (rq, outcome) = sched.newidle_balance(sched.lock_rq(0));
    assert_eq!(outcome.pulled, PulledTask::Fair);
    assert!(outcome.done);
    assert_eq!(rq.idle_stamp, 0);
    assert_eq!(rq.h_nr_running(), 1);
    assert_eq!(rq.misfit_task_load, 77);
    assert_eq!(rq.cfs.util_avg, 120);
    let pulled = rq.task(Pid(12)).expect("task 12 pulled");
    assert_eq!(pulled.cpu, 0);
    drop(rq);

    // The running task and the unimportant one stay behind.
    let src = sched.lock_rq(6);
    assert!(src.task(Pid(10)).is_some());
    assert!(src.task(Pid(11)).is_some());
    assert!(src.task(Pid(12)).is_none());
}

#[test]
fn test_no_pull_below_importance_threshold() {
    let sched = common::sched();
    sched.enqueue_task(6, common::task(10, 6, 100));
    sched.enqueue_task(6, common::important_task(11, 6, 100, 0));
    sched.enqueue_task(6, common::important_task(12, 6, 100, 0));
    going_idle(&sched, 0);

    let (rq, outcome) = sched.newidle_balance(sched.lock_rq(0));
    assert_eq!(outcome.pulled, PulledTask::None);
    assert!(!outcome.done);
    assert_eq!(rq.idle_stamp, 5000);
    assert_eq!(rq.h_nr_running(), 0);
    drop(rq);

    assert_eq!(sched.lock_rq(6).h_nr_running(), 3);
}

#[test]
fn test_only_little_active_cpus_pull() {
    let sched = common::sched();
    busy_big_cpu(&sched);

    going_idle(&sched, 4);
    let (rq, outcome) = sched.newidle_balance(sched.lock_rq(4));
    assert_eq!(outcome.pulled, PulledTask::None);
    assert_eq!(rq.idle_stamp, 5000);
    drop(rq);

    going_idle(&sched, 1);
    sched.set_cpu_active(1, false).unwrap();
    let (rq, outcome) = sched.newidle_balance(sched.lock_rq(1));
    assert_eq!(outcome.pulled, PulledTask::None);
    assert_eq!(rq.h_nr_running(), 0);
    drop(rq);

    assert_eq!(sched.lock_rq(6).h_nr_running(), 3);
}

#[test]
fn test_idle_cpu_does_not_pull() {
    let sched = common::sched();
    busy_big_cpu(&sched);

    let (rq, outcome) = sched.newidle_balance(sched.lock_rq(2));
    assert_eq!(outcome.pulled, PulledTask::None);
    assert!(!outcome.done);
    drop(rq);

    assert_eq!(sched.lock_rq(6).h_nr_running(), 3);
}

#[test]
fn test_work_already_queued() {
    let sched = common::sched();
    going_idle(&sched, 0);
    sched.enqueue_task(0, common::task(20, 0, 30));

    let (rq, outcome) = sched.newidle_balance(sched.lock_rq(0));
    assert_eq!(outcome.pulled, PulledTask::Fair);
    assert!(outcome.done);
    assert_eq!(rq.idle_stamp, 0);
    drop(rq);

    going_idle(&sched, 1);
    sched.lock_rq(1).nr_other_running = 1;
    let (rq, outcome) = sched.newidle_balance(sched.lock_rq(1));
    assert_eq!(outcome.pulled, PulledTask::HigherClass);
    assert!(outcome.done);
    assert_eq!(rq.idle_stamp, 0);
}

#[test]
fn test_detach_prefers_critical_task() {
    let sched = common::sched();
    sched.enqueue_task(1, common::important_task(30, 1, 50, 200));
    sched.enqueue_task(1, common::important_task(31, 1, 50, 0));

    let policy = sched.policy();
    let mut src = sched.lock_rq(1);
    let detached = detach_important_task(&policy, &mut src, 4).expect("a task to detach");
    assert_eq!(detached.task.pid, Pid(30));
    assert_eq!(detached.task.cpu, 4);
    assert!(!detached.task.on_rq);
    assert_eq!(detached.misfit_load, 0);
    assert_eq!(src.h_nr_running(), 1);
}

#[test]
fn test_detach_skips_disallowed_and_running() {
    let sched = common::sched();
    let mut pinned = common::important_task(40, 6, 50, 0);
    pinned.cpus_allowed = scx_eas::Cpumask::from_cpulist("6-7", common::NR_CPUS).unwrap();
    sched.enqueue_task(6, pinned);
    sched.enqueue_task(6, common::important_task(41, 6, 50, 0));
    sched.lock_rq(6).curr = Some(Pid(41));

    let policy = sched.policy();
    let mut src = sched.lock_rq(6);
    assert!(detach_important_task(&policy, &mut src, 0).is_none());
    assert_eq!(src.h_nr_running(), 2);
}
