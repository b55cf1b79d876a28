use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use log::{error, info};
use rayon::prelude::*;

use waternet_lib::cli::{Cli, Commands, ExportFormat};
use waternet_lib::errors::ScenarioError;
use waternet_lib::io;
use waternet_lib::scenario::ScenarioLoader;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Run {
            scenario,
            output_dir,
            format,
        } => run_scenario(&scenario, &output_dir, format),
        Commands::Batch {
            input_dir,
            output_dir,
            threads,
            format,
        } => run_batch(&input_dir, &output_dir, threads, format),
        Commands::Validate { scenario } => validate_scenario(&scenario),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn scenario_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scenario".to_string())
}

fn run_scenario(scenario: &Path, output_dir: &Path, format: ExportFormat) -> Result<(), ScenarioError> {
    let start = Instant::now();
    let mut harness = ScenarioLoader::new(scenario).load()?;
    harness.run()?;

    let output_path = output_dir.join(format!("{}.{}", scenario_name(scenario), format.extension()));
    let history = harness.history();
    match format {
        ExportFormat::Csv => io::write_history_csv(history, &output_path)?,
        ExportFormat::Json => io::write_history_json(history, &output_path)?,
        ExportFormat::Bin => io::write_history_bin(history, &output_path)?,
    }

    info!(
        "scenario '{}' finished: {} ticks in {:.2}s, history written to '{}'",
        scenario_name(scenario),
        history.len(),
        start.elapsed().as_secs_f64(),
        output_path.display()
    );
    Ok(())
}

fn run_batch(
    input_dir: &Path,
    output_dir: &Path,
    threads: usize,
    format: ExportFormat,
) -> Result<(), ScenarioError> {
    let scenario_dirs = discover_scenarios(input_dir)?;
    if scenario_dirs.is_empty() {
        info!("no scenario directories found under '{}'", input_dir.display());
        return Ok(());
    }
    info!(
        "running {} scenarios with {} threads",
        scenario_dirs.len(),
        threads
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .expect("worker pool construction cannot fail with a positive thread count");

    let start = Instant::now();
    let failures: Vec<String> = pool.install(|| {
        scenario_dirs
            .par_iter()
            .filter_map(|dir| match run_scenario(dir, output_dir, format) {
                Ok(()) => None,
                Err(err) => Some(format!("{}: {err}", scenario_name(dir))),
            })
            .collect()
    });

    info!(
        "batch finished: {}/{} scenarios succeeded in {:.2}s",
        scenario_dirs.len() - failures.len(),
        scenario_dirs.len(),
        start.elapsed().as_secs_f64()
    );

    if failures.is_empty() {
        Ok(())
    } else {
        for failure in &failures {
            eprintln!("failed: {failure}");
        }
        Err(ScenarioError::Config(
            waternet_lib::errors::ConfigError::Schema(format!(
                "{} of {} scenarios failed",
                failures.len(),
                scenario_dirs.len()
            )),
        ))
    }
}

fn discover_scenarios(input_dir: &Path) -> Result<Vec<PathBuf>, ScenarioError> {
    let mut dirs = Vec::new();
    let entries = std::fs::read_dir(input_dir).map_err(|source| {
        ScenarioError::Config(waternet_lib::errors::ConfigError::Io {
            path: input_dir.display().to_string(),
            source,
        })
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && path.join("config.yml").is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn validate_scenario(scenario: &Path) -> Result<(), ScenarioError> {
    ScenarioLoader::new(scenario).load()?;
    println!("scenario '{}' is valid", scenario_name(scenario));
    Ok(())
}
