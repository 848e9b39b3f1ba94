use std::env;
use std::error::Error;
use std::path::Path;
use std::process;

use chrono::Local;
use log::{error, info};
use rand::prelude::*;

use crate::core::operations::registered_operators;
use crate::core::serialization::{archive_filename, deserialize, serialize};
use crate::core::Workspace;
use crate::scenario::{run_scenario, run_trials, Scenario, ScenarioConfiguration};

mod core;
mod scenario;

fn check(args: &[String]) -> Result<(), Box<dyn Error>> {
    let mut configuration = ScenarioConfiguration::default();
    if let Some(trial_count) = args.first() {
        configuration.trial_count = trial_count.parse()?;
    }
    if let Some(seed) = args.get(1) {
        configuration.seed = seed.parse()?;
    }
    info!(
        "checking {} random scenarios from seed {}",
        configuration.trial_count, configuration.seed
    );
    let reports = run_trials(&configuration)?;
    let failures = reports.iter().filter(|report| !report.passed()).count();
    if failures > 0 {
        return Err(format!("{} of {} trials disagreed with the reference", failures, reports.len()).into());
    }
    println!("all {} trials agree with the reference", reports.len());
    Ok(())
}

fn dump(args: &[String]) -> Result<(), Box<dyn Error>> {
    let mut configuration = ScenarioConfiguration::default();
    if let Some(seed) = args.first() {
        configuration.seed = seed.parse()?;
    }
    let mut rng = StdRng::seed_from_u64(configuration.seed);
    let scenario = Scenario::generate(&configuration, &mut rng);
    let mut workspace = Workspace::new();
    let report = run_scenario(&scenario, &configuration, &mut workspace)?;
    if !report.passed() {
        info!("scenario has {} mismatches", report.mismatches.len());
    }
    let filename = archive_filename(
        "lambdarank",
        &format!(
            "seed{}-{}",
            configuration.seed,
            Local::now().format("%Y%m%d-%H%M%S")
        ),
    );
    serialize(&workspace, Path::new(&filename))?;
    println!("wrote {}", filename);
    Ok(())
}

fn inspect(args: &[String]) -> Result<(), Box<dyn Error>> {
    let filename = args.first().ok_or("an NPZ file to inspect is required")?;
    let workspace = deserialize(Path::new(filename))?;
    for name in workspace.names() {
        let blob = workspace.get(&name)?;
        println!("{}: {} {:?}", name, blob.kind(), blob.shape());
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = env::args().collect::<Vec<_>>();

    let instructions =
        "pass `--check [trials] [seed]`, `--dump [seed]`, or `--inspect [NPZ file]`";

    if args.len() <= 1 {
        println!("{}", instructions);
        println!("registered operators: {:?}", registered_operators());
        return;
    }

    let outcome = match args[1].as_str() {
        "--check" => check(&args[2..]),
        "--dump" => dump(&args[2..]),
        "--inspect" => inspect(&args[2..]),
        _ => {
            println!("{}", instructions);
            return;
        }
    };
    if let Err(e) = outcome {
        error!("{}", e);
        process::exit(1);
    }
}
