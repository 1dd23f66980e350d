//! # manet-sim
//!
//! CLI runner for the MANET simulator.

use clap::{Parser, Subcommand, ValueEnum};
use manet_common::metric_defs;
use manet_runner::metrics_export::{self, InMemoryRecorder};
use manet_runner::{
    create_event_loop, format_flow_report, load_scenario, write_json, ProgressInfo, RunnerError, ScenarioConfig,
    SimTime,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration string with units into seconds.
///
/// Accepts a plain number of seconds (`30`, `12.5`) or unit-suffixed parts
/// (`30s`, `2m`, `1h`, `1m30s`).
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        return Ok(secs);
    }

    let mut total_seconds: f64 = 0.0;
    let mut current_number = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            current_number.push(c);
            continue;
        }
        if current_number.is_empty() {
            return Err(format!("Invalid duration format: unexpected '{}' in '{}'", c, s));
        }
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        let multiplier = match c {
            's' => 1.0,
            'm' => 60.0,
            'h' => 3600.0,
            _ => return Err(format!("Unknown duration unit '{}' in '{}'. Use s, m or h.", c, s)),
        };
        total_seconds += value * multiplier;
        current_number.clear();
    }
    if !current_number.is_empty() {
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        total_seconds += value;
    }
    if total_seconds <= 0.0 {
        return Err(format!("Invalid duration: '{}'", s));
    }
    Ok(total_seconds)
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// Output format for metrics at end of simulation.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum MetricsOutputFormat {
    /// JSON format for programmatic consumption.
    Json,
    /// Prometheus text exposition format.
    Prometheus,
}

/// MANET simulator: mobile nodes, 802.11 ad-hoc links, OLSR routing, UDP echo.
#[derive(Parser, Debug)]
#[command(name = "manet-sim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a scenario (the built-in five-node scenario if no file is given)
    Run(RunnerConfig),
    /// Print the default scenario as YAML
    Defaults,
    /// List all available metrics with descriptions and labels
    Metrics,
}

/// Options of the `run` command.
#[derive(Parser, Debug)]
pub struct RunnerConfig {
    /// Scenario YAML file
    pub scenario: Option<PathBuf>,

    /// Random seed (overrides the scenario)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Simulated duration, e.g. `30s`, `1m` (overrides the scenario stop time)
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Write the event trace as a JSON array to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Write the flow table as JSON to this file
    #[arg(long)]
    pub flows: Option<PathBuf>,

    /// Write collected metrics to this file
    #[arg(long)]
    pub metrics_output: Option<PathBuf>,

    /// Format of the metrics file
    #[arg(long, value_enum, default_value = "json")]
    pub metrics_format: MetricsOutputFormat,

    /// Log application events and progress
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Commands
// ============================================================================

fn resolve_scenario(config: &RunnerConfig) -> Result<ScenarioConfig, RunnerError> {
    let mut scenario = match &config.scenario {
        Some(path) => load_scenario(path)?,
        None => ScenarioConfig::default(),
    };
    if let Some(seed) = config.seed {
        scenario.simulation.seed = seed;
    }
    if let Some(duration) = config.duration {
        scenario.simulation.stop_time_s = duration;
    }
    scenario
        .validate()
        .map_err(|e| RunnerError::ConfigError(e.to_string()))?;
    Ok(scenario)
}

/// Run a scenario and write the requested outputs.
pub fn run_simulation(config: RunnerConfig) -> Result<(), RunnerError> {
    let scenario = resolve_scenario(&config)?;

    let recorder = if config.metrics_output.is_some() {
        let recorder = InMemoryRecorder::new();
        if let Err(e) = metrics::set_global_recorder(recorder.clone()) {
            tracing::warn!("failed to install metrics recorder: {}", e);
            None
        } else {
            Some(recorder)
        }
    } else {
        None
    };

    let trace_output: Option<Box<dyn std::io::Write>> = match &config.output {
        Some(path) => Some(Box::new(BufWriter::new(File::create(path)?))),
        None => None,
    };

    let mut event_loop = create_event_loop(&scenario, trace_output)?;
    if config.verbose {
        eprintln!(
            "Running {} nodes for {} s (seed {})",
            scenario.simulation.node_count, scenario.simulation.stop_time_s, scenario.simulation.seed
        );
    }

    let verbose = config.verbose;
    let stats = event_loop.run_with_progress(
        scenario.stop_time(),
        None,
        |_, progress: ProgressInfo, is_final| {
            if verbose && !is_final {
                eprintln!(
                    "  {:5.1}%  sim {:.1}s  events {}",
                    progress.progress_percent,
                    progress.sim_time.as_secs_f64(),
                    progress.events_processed
                );
            }
        },
    )?;
    let flows = event_loop.flows();
    print!("{}", format_flow_report(&flows));

    if let Some(path) = &config.flows {
        write_json(path, &flows)?;
    }
    if let (Some(path), Some(recorder)) = (&config.metrics_output, &recorder) {
        let snapshot = recorder.snapshot();
        let mut file = BufWriter::new(File::create(path)?);
        match config.metrics_format {
            MetricsOutputFormat::Json => metrics_export::export_json(&snapshot, &mut file)?,
            MetricsOutputFormat::Prometheus => metrics_export::export_prometheus(&snapshot, &mut file)?,
        }
        file.flush()?;
    }

    if config.verbose {
        eprintln!("{}", serde_json::to_string_pretty(&stats)?);
        eprintln!(
            "Finished at {} after {} events ({} ms)",
            SimTime::from_micros(stats.simulation_time_us),
            stats.total_events,
            stats.wall_time_ms
        );
    }
    Ok(())
}

/// Print information about all available metrics
fn print_metrics_info() {
    println!("MANET Simulator Metrics");
    println!("=======================\n");
    println!("Every metric carries a `node` label (node0, node1, ...).\n");

    let categories = [
        ("MAC/PHY Layer", "manet.mac."),
        ("Routing", "manet.olsr."),
        ("IP Layer", "manet.ip."),
        ("Applications", "manet.app."),
        ("Timing", "manet.timing."),
    ];
    for (category_name, prefix) in categories {
        println!("## {}\n", category_name);
        for metric in metric_defs::ALL.iter().filter(|m| m.name.starts_with(prefix)) {
            println!("  {}", metric.name);
            println!("    Type: {}", metric.kind);
            let unit_str = metric.unit_str();
            if !unit_str.is_empty() {
                println!("    Unit: {}", unit_str);
            }
            println!("    Description: {}", metric.description);
            if !metric.labels.is_empty() {
                println!("    Extra labels: {}", metric.labels.join(", "));
            }
            println!();
        }
    }
}

fn main() -> Result<(), RunnerError> {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run(config) if config.verbose => "info",
        _ => "warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run(config) => run_simulation(config)?,
        Commands::Defaults => print!("{}", ScenarioConfig::default().to_yaml()?),
        Commands::Metrics => print_metrics_info(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30"), Ok(30.0));
        assert_eq!(parse_duration("30s"), Ok(30.0));
        assert_eq!(parse_duration("1m"), Ok(60.0));
        assert_eq!(parse_duration("1m30s"), Ok(90.0));
        assert_eq!(parse_duration("0.5h"), Ok(1800.0));
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn test_cli_parses_run_options() {
        let cli = Cli::try_parse_from([
            "manet-sim", "run", "scenario.yaml", "--seed", "9", "--duration", "1m", "--flows", "flows.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(config) => {
                assert_eq!(config.seed, Some(9));
                assert_eq!(config.duration, Some(60.0));
                assert_eq!(config.scenario, Some(PathBuf::from("scenario.yaml")));
                assert_eq!(config.flows, Some(PathBuf::from("flows.json")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_overrides_applied() {
        let config = RunnerConfig {
            scenario: None,
            seed: Some(42),
            duration: Some(12.0),
            output: None,
            flows: None,
            metrics_output: None,
            metrics_format: MetricsOutputFormat::Json,
            verbose: false,
        };
        let scenario = resolve_scenario(&config).unwrap();
        assert_eq!(scenario.simulation.seed, 42);
        assert_eq!(scenario.stop_time(), SimTime::from_secs(12.0));
    }
}
