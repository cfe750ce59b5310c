//! Command-line interface for the two domain steps.
//!
//! `merge_fsm_outputs <domain>` consolidates archive and latest FSM tables,
//! `grid_fsm_to_netcdf <domain>` turns the consolidated tables into one NetCDF
//! file per variable. Both exit with 0 on success and with the code of the
//! first failure kind otherwise.

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::DomainConfig;
use crate::processors::domain::{self, ErrorKind, RunOptions, RunSummary};

/// Environment variable holding the log filter (`info`, `debug`, ...)
pub const LOG_ENV: &str = "SNOWMAPPER_LOG_LEVEL";

#[derive(Parser)]
#[command(name = "merge_fsm_outputs")]
#[command(about = "Merge archive and latest FSM outputs into consolidated tables", version)]
pub struct MergeCli {
    /// Domain directory (contains sim_archive/, sim_latest/, outputs/)
    domain_path: PathBuf,

    /// Path to YAML config file (default: <domain>/snowmapper.yml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Merge and report without writing tables
    #[arg(long)]
    dry_run: bool,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Parser)]
#[command(name = "grid_fsm_to_netcdf")]
#[command(about = "Grid consolidated FSM tables to NetCDF using the cluster map", version)]
pub struct GridCli {
    /// Domain directory (contains outputs/ with merged tables and landform.tif)
    domain_path: PathBuf,

    /// Path to YAML config file (default: <domain>/snowmapper.yml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write variables one after another instead of in parallel
    #[arg(long)]
    sequential: bool,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("{}...", value.chars().take(36).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

/// Initialise logging from `SNOWMAPPER_LOG_LEVEL`, raised by `-v` flags.
fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log::LevelFilter::Info);
    if let Ok(spec) = std::env::var(LOG_ENV) {
        builder.parse_filters(&spec);
    }
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(log::LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
        }
    }
    builder.format_timestamp_secs().init();
}

fn load_config_or_exit(domain_path: &Path, config: Option<&Path>) -> DomainConfig {
    match domain::load_config(domain_path, config) {
        Ok(cfg) => {
            info!("Domain '{}' at {}", cfg.name, domain_path.display());
            cfg
        }
        Err(e) => fail(&e),
    }
}

/// Report a fatal error with its kind and exit with the kind's code.
fn fail(err: &anyhow::Error) -> ! {
    let kind = ErrorKind::of(err);
    error!("{:#}", err);
    eprintln!("error[{}]: {:#}", kind, err);
    std::process::exit(kind.exit_code());
}

fn finish(title: &str, summary: &RunSummary, mut items: Vec<(&str, String)>) {
    summary.log(title);
    items.push(("Succeeded", summary.succeeded().to_string()));
    items.push(("Skipped", summary.skipped().to_string()));
    items.push(("Failed", summary.failed().to_string()));
    print_summary(title, &items);
    for line in summary.lines() {
        println!("  {}", line);
    }

    if let Some(kind) = summary.first_failure() {
        eprintln!("error[{}]: {} unit(s) failed", kind, summary.failed());
        std::process::exit(kind.exit_code());
    }
}

/// Entry point of `merge_fsm_outputs`.
pub fn merge_main() {
    let cli = MergeCli::parse();
    init_logging(cli.verbose);

    let start = Instant::now();
    let config = load_config_or_exit(&cli.domain_path, cli.config.as_deref());

    if cli.dry_run {
        println!("DRY RUN: No tables will be written");
    }

    let options = RunOptions {
        dry_run: cli.dry_run,
        ..RunOptions::default()
    };

    let spinner = create_spinner("Merging archive and latest FSM outputs...");
    let result = domain::run_merge(&config, &options);
    spinner.finish_and_clear();

    match result {
        Ok(summary) => finish(
            "Merge Complete",
            &summary,
            vec![
                ("Domain", config.name.clone()),
                ("Output directory", config.paths.merged_dir.display().to_string()),
                ("Dry run", cli.dry_run.to_string()),
                ("Duration", format!("{:.2?}", start.elapsed())),
            ],
        ),
        Err(e) => fail(&e),
    }
}

/// Entry point of `grid_fsm_to_netcdf`.
pub fn grid_main() {
    let cli = GridCli::parse();
    init_logging(cli.verbose);

    let start = Instant::now();
    let mut config = load_config_or_exit(&cli.domain_path, cli.config.as_deref());
    if cli.sequential {
        config.grid.parallel = false;
    }

    let spinner = create_spinner("Gridding variables to NetCDF...");
    let result = run_grid(&config);
    spinner.finish_and_clear();

    match result {
        Ok(summary) => finish(
            "Gridding Complete",
            &summary,
            vec![
                ("Domain", config.name.clone()),
                ("Output directory", config.paths.grid_dir.display().to_string()),
                ("Variables", config.variables.len().to_string()),
                ("Duration", format!("{:.2?}", start.elapsed())),
            ],
        ),
        Err(e) => fail(&e),
    }
}

#[cfg(feature = "netcdf")]
fn run_grid(config: &DomainConfig) -> anyhow::Result<RunSummary> {
    domain::run_grid(config, &RunOptions::default())
}

#[cfg(not(feature = "netcdf"))]
fn run_grid(_config: &DomainConfig) -> anyhow::Result<RunSummary> {
    anyhow::bail!("built without the `netcdf` feature, gridding is unavailable")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_merge_cli_args() {
        MergeCli::command().debug_assert();
        let cli = MergeCli::parse_from(["merge_fsm_outputs", "/data/alps", "--dry-run", "-vv"]);
        assert_eq!(cli.domain_path, PathBuf::from("/data/alps"));
        assert!(cli.dry_run);
        assert_eq!(cli.verbose, 2);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_grid_cli_args() {
        GridCli::command().debug_assert();
        let cli = GridCli::parse_from(["grid_fsm_to_netcdf", "/data/alps", "--config", "alt.yml"]);
        assert_eq!(cli.config, Some(PathBuf::from("alt.yml")));
        assert!(!cli.sequential);
    }

    #[test]
    fn test_domain_path_required() {
        assert!(MergeCli::try_parse_from(["merge_fsm_outputs"]).is_err());
        assert!(GridCli::try_parse_from(["grid_fsm_to_netcdf"]).is_err());
    }
}
