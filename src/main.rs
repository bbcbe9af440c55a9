// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use log::warn;
use scx_eas::EnergyModel;
use scx_eas::LogRecorderBuilder;
use scx_eas::Scenario;

/// scx_eas: replay scheduling scenarios through an energy-aware placement
/// policy for asymmetric CPU systems.
///
/// Wakeups are placed on the CPU that serves the task's utilization at the
/// lowest estimated energy, using the performance domains of the energy
/// model and the utilization clamps of the task and its group. Little CPUs
/// about to go idle pull important (boosted, latency sensitive) tasks from
/// busier run-queues.
///
/// The scenario file describes the clusters, the energy model, the group
/// tables, the per-CPU signals and the tasks, followed by a list of events
/// (wakeup, sleep, affinity change, new-idle, frequency update, fork). Each
/// decision is printed as it is taken.
#[derive(Debug, Parser)]
struct Opts {
    /// Scenario file (JSON).
    scenario: PathBuf,

    /// Read the energy model from this debugfs directory instead of the
    /// scenario, e.g. /sys/kernel/debug/energy_model.
    #[clap(short = 'e', long)]
    em_debugfs: Option<PathBuf>,

    /// Print the energy model in use before replaying.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    dump_em: bool,

    /// Dump every metric collected during the replay.
    #[clap(short = 's', long, action = clap::ArgAction::SetTrue)]
    stats: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let report = LogRecorderBuilder::new().install()?;

    let scenario = Scenario::load(&opts.scenario)?;
    let em = match opts.em_debugfs.as_ref() {
        Some(root) if EnergyModel::has_energy_model(root) => {
            let nr_cpus = scenario.topology()?.nr_cpus();
            Some(EnergyModel::from_debugfs(root, nr_cpus)?)
        }
        Some(root) => {
            warn!("No energy model under {}, using the scenario's", root.display());
            None
        }
        None => None,
    };

    let mut replayer = scenario.build(em)?;
    if opts.dump_em {
        match replayer.sched().energy_model() {
            Some(em) => info!("Energy model:\n{}", em),
            None => info!("No energy model"),
        }
    }

    let replay = replayer.replay(&scenario.events)?;
    for record in replay.records.iter() {
        println!("{}", record);
    }
    println!("{}", replay.stats);

    if opts.stats {
        report.log();
    }
    Ok(())
}
