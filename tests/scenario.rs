// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;

use scx_eas::types::Pid;
use scx_eas::Scenario;

const LIFECYCLE: &str = r#"
{
  "clusters": [
    { "cpus": "0-3", "capacity": 160, "idle_states": [{ "name": "WFI", "exit_latency_us": 1 }] },
    { "cpus": "4-7", "capacity": 1024, "idle_states": [{ "name": "WFI", "exit_latency_us": 1 }] }
  ],
  "energy_model": [
    { "cpus": "0-3", "states": [{ "frequency": 300000, "power": 10 }, { "frequency": 1800000, "power": 150 }] },
    { "cpus": "4-7", "states": [{ "frequency": 500000, "power": 200 }, { "frequency": 2800000, "power": 1500 }] }
  ],
  "cpus": [{ "cpu": 0, "idle_state": 0 }],
  "tasks": [{ "pid": 100, "cpu": 0, "util": 120 }],
  "events": [
    { "type": "wakeup", "pid": 100 },
    { "type": "run", "cpu": 0, "pid": 100 },
    { "type": "sleep", "pid": 100 },
    { "type": "affinity", "pid": 100, "cpus": "4-7" },
    { "type": "wakeup", "pid": 100 },
    { "type": "freq", "cpus": "0-3", "freq": 900000 },
    { "type": "fork", "parent": 100, "pid": 101 }
  ]
}
"#;

const NEWIDLE: &str = r#"
{
  "clusters": [
    { "cpus": "0-3", "capacity": 160 },
    { "cpus": "4-7", "capacity": 1024 }
  ],
  "tasks": [
    { "pid": 20, "cpu": 0, "util": 30, "running": true },
    { "pid": 10, "cpu": 6, "util": 100, "queued": true },
    { "pid": 11, "cpu": 6, "util": 200, "prefer_idle": true, "uclamp_min": 200, "running": true },
    { "pid": 12, "cpu": 6, "util": 120, "load": 77, "prefer_idle": true, "uclamp_min": 0, "queued": true }
  ],
  "events": [
    { "type": "sleep", "pid": 20 },
    { "type": "newidle", "cpu": 0 }
  ]
}
"#;

#[test]
fn test_task_lifecycle() {
    let scenario = Scenario::from_json(LIFECYCLE).unwrap();
    let mut replayer = scenario.build(None).unwrap();
    let replay = replayer.replay(&scenario.events).unwrap();

    assert_eq!(replay.records.len(), 7);
    assert_eq!(
        replay.records[0],
        "wakeup pid=100 prev=0 cpu=0 reason=prev_idle sync_boost=false energy_calcs=0"
    );
    assert_eq!(replay.records[1], "run cpu=0 pid=100");
    assert!(replay.records[2].starts_with("sleep pid=100 cpu=0 "));
    assert_eq!(replay.records[3], "affinity pid=100 cpus=f0 cpu=0");
    assert!(replay.records[4].starts_with("wakeup pid=100 prev=0 cpu="));
    assert!(replay.records[4].contains("reason=energy_efficient"));
    assert!(replay.records[5].contains("freq=900000"));
    assert!(replay.records[6].starts_with("fork parent=100 pid=101 "));

    let cpu = replayer.queued_on(Pid(100)).unwrap();
    assert!((4..8).contains(&cpu));
    assert!(replayer.queued_on(Pid(101)).is_some());
    assert!(replayer.sleeping(Pid(100)).is_none());

    assert_eq!(replay.stats.events, 7);
    assert_eq!(replay.stats.wakeups, 3);
    assert_eq!(replay.stats.prev_idle, 1);
}

#[test]
fn test_newidle_pull() {
    let scenario = Scenario::from_json(NEWIDLE).unwrap();
    let mut replayer = scenario.build(None).unwrap();
    let replay = replayer.replay(&scenario.events).unwrap();

    assert_eq!(replay.records[0], "sleep pid=20 cpu=0 util_est=30");
    assert_eq!(
        replay.records[1],
        "newidle cpu=0 pulled=Fair done=true nr_running=1"
    );
    assert_eq!(replayer.queued_on(Pid(12)), Some(0));
    assert_eq!(replayer.sched().lock_rq(0).misfit_task_load, 77);
    assert_eq!(replay.stats.newidle_pulls, 1);
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(NEWIDLE.as_bytes()).unwrap();

    let scenario = Scenario::load(file.path()).unwrap();
    assert_eq!(scenario.clusters.len(), 2);
    assert_eq!(scenario.tasks.len(), 4);
    assert_eq!(scenario.events.len(), 2);
    assert_eq!(scenario.topology().unwrap().nr_cpus(), 8);
}

#[test]
fn test_bad_scenarios() {
    let scenario = Scenario::from_json(LIFECYCLE).unwrap();
    let mut replayer = scenario.build(None).unwrap();
    let events = serde_json::from_str::<Vec<scx_eas::scenario::Event>>(
        r#"[{ "type": "sleep", "pid": 5 }]"#,
    )
    .unwrap();
    let err = replayer.replay(&events).unwrap_err();
    assert!(format!("{:#}", err).contains("Task 5 is not queued"));

    let unknown_cgroup = LIFECYCLE.replace(r#""util": 120"#, r#""util": 120, "cgroup": 7"#);
    let scenario = Scenario::from_json(&unknown_cgroup).unwrap();
    assert!(scenario.build(None).is_err());

    assert!(Scenario::from_json(r#"{ "tasks": [] }"#).is_err());
}
