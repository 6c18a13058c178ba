// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: axon host simulator
//! INTENT: Boot the kernel core from a TOML file and exercise it through scripted traps
//! DEPS: axon (kernel core), clap (CLI), toml/serde (boot file), env_logger (RUST_LOG)
//! TESTS: config parsing, every scenario on a small machine

mod config;
mod scenario;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;

use config::SimConfig;
use scenario::{Outcome, Scenario};

#[derive(Debug, Parser)]
#[command(name = "axon-sim", about = "Run axon kernel scenarios on the host")]
struct Cli {
    /// Boot file with `[kernel]` and `[[boot]]` tables. Defaults apply without one.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Scenario to run; every scenario runs when omitted.
    #[arg(short, long, value_enum)]
    scenario: Option<Scenario>,
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SimConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SimConfig::default(),
    };
    let scenarios = match cli.scenario {
        Some(one) => vec![one],
        None => Scenario::all().to_vec(),
    };

    let mut outcomes = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        let outcome = scenario::run(scenario, &config).with_context(|| format!("scenario {:?}", scenario))?;
        outcomes.push(outcome);
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        for outcome in &outcomes {
            print_outcome(outcome);
        }
    }
    Ok(())
}

fn print_outcome(outcome: &Outcome) {
    println!("== {:?}", outcome.scenario);
    for note in &outcome.notes {
        println!("   {}", note);
    }
    if !outcome.console.is_empty() {
        println!("   console: {:?}", outcome.console);
    }
    println!("   live envs: {}, free frames: {}", outcome.live_envs, outcome.free_frames);
}
