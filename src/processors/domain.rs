//! Domain-level runs: merge every variable, then grid every variable.
//!
//! Both runs collect per-cluster and per-variable failures into a
//! [`RunSummary`] and only return an error for conditions that make the rest
//! of the run meaningless (bad configuration, a merge invariant violation, a
//! cluster map that matches none of the clusters, cancellation).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rayon::prelude::*;
use thiserror::Error;

use crate::config::{ConfigError, DomainConfig, VariableConfig};
use crate::core::grid::{ClusterGridMap, Crs, GridMapError};
use crate::core::series::{ClusterId, ClusterSeries};
use crate::core::sink::{SinkFactory, VariableMeta};
use crate::core::store::{StoreError, TimeSeriesStore};

use super::cancel::CancelToken;
use super::gridding::{ClusterTimesteps, GridWriteError, GridWriter};
use super::mapper::{ClusterGridMapper, MapperError};
use super::merge::{ArchiveMerger, MergeError};

/// Domain-level failures that are not owned by a component.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("no merged tables in {0}; run merge_fsm_outputs first")]
    NoMergedTables(PathBuf),

    #[error("{failed} of {attempted} clusters failed to merge '{variable}' (limit {limit:.0}%)")]
    TooManyFailures {
        variable: String,
        failed: usize,
        attempted: usize,
        limit: f64,
    },
}

/// Classification of a failure, used for summaries and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Io,
    MissingVariable,
    TemporalGap,
    MergeInvariant,
    GridMapMismatch,
    GridWrite,
    NoData,
    Cancelled,
}

impl ErrorKind {
    /// Process exit code for this kind.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Config | ErrorKind::Io => 1,
            ErrorKind::MissingVariable => 2,
            ErrorKind::TemporalGap => 3,
            ErrorKind::MergeInvariant => 4,
            ErrorKind::GridMapMismatch => 5,
            ErrorKind::GridWrite => 6,
            ErrorKind::NoData => 7,
            ErrorKind::Cancelled => 130,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "Config",
            ErrorKind::Io => "Io",
            ErrorKind::MissingVariable => "MissingVariable",
            ErrorKind::TemporalGap => "TemporalGap",
            ErrorKind::MergeInvariant => "MergeInvariant",
            ErrorKind::GridMapMismatch => "GridMapMismatch",
            ErrorKind::GridWrite => "GridWrite",
            ErrorKind::NoData => "NoData",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    /// Classifies an error by the first component error found in its chain.
    pub fn of(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<MergeError>() {
                return Self::of_merge(e);
            }
            if let Some(e) = cause.downcast_ref::<StoreError>() {
                return Self::of_store(e);
            }
            if cause.downcast_ref::<MapperError>().is_some() {
                return ErrorKind::GridMapMismatch;
            }
            if let Some(e) = cause.downcast_ref::<GridWriteError>() {
                return Self::of_grid_write(e);
            }
            if let Some(e) = cause.downcast_ref::<DomainError>() {
                return match e {
                    DomainError::NoMergedTables(_) => ErrorKind::NoData,
                    DomainError::TooManyFailures { .. } => ErrorKind::TemporalGap,
                };
            }
            if cause.downcast_ref::<ConfigError>().is_some() {
                return ErrorKind::Config;
            }
            if cause.downcast_ref::<GridMapError>().is_some() {
                return ErrorKind::Io;
            }
        }
        ErrorKind::Io
    }

    fn of_merge(e: &MergeError) -> Self {
        match e {
            MergeError::TemporalGap { .. } => ErrorKind::TemporalGap,
            MergeError::MergeInvariant { .. } => ErrorKind::MergeInvariant,
            MergeError::NoData { .. } => ErrorKind::NoData,
            MergeError::Cancelled => ErrorKind::Cancelled,
            MergeError::Store(s) => Self::of_store(s),
        }
    }

    fn of_store(e: &StoreError) -> Self {
        match e {
            StoreError::MissingVariable { .. } => ErrorKind::MissingVariable,
            _ => ErrorKind::Io,
        }
    }

    fn of_grid_write(e: &GridWriteError) -> Self {
        match e {
            GridWriteError::NoTimesteps { .. } => ErrorKind::NoData,
            GridWriteError::Cancelled { .. } => ErrorKind::Cancelled,
            _ => ErrorKind::GridWrite,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one unit of work (a variable or a cluster/variable pair).
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded(String),
    Skipped(String),
    Failed(ErrorKind, String),
}

/// Per-unit outcomes of a domain run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub entries: Vec<(String, Outcome)>,
}

impl RunSummary {
    pub fn succeed(&mut self, unit: impl Into<String>, detail: impl Into<String>) {
        self.entries.push((unit.into(), Outcome::Succeeded(detail.into())));
    }

    pub fn skip(&mut self, unit: impl Into<String>, reason: impl Into<String>) {
        self.entries.push((unit.into(), Outcome::Skipped(reason.into())));
    }

    pub fn fail(&mut self, unit: impl Into<String>, kind: ErrorKind, message: impl Into<String>) {
        self.entries.push((unit.into(), Outcome::Failed(kind, message.into())));
    }

    /// Records `err` as a failure of `unit`, classified by [`ErrorKind::of`].
    pub fn fail_with(&mut self, unit: impl Into<String>, err: &anyhow::Error) {
        self.fail(unit, ErrorKind::of(err), format!("{:#}", err));
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Succeeded(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed(..)))
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.entries.iter().filter(|(_, o)| pred(o)).count()
    }

    /// Kind of the first failure, if any.
    pub fn first_failure(&self) -> Option<ErrorKind> {
        self.entries.iter().find_map(|(_, o)| match o {
            Outcome::Failed(kind, _) => Some(*kind),
            _ => None,
        })
    }

    /// Zero when nothing failed, else the exit code of the first failure.
    pub fn exit_code(&self) -> i32 {
        self.first_failure().map_or(0, ErrorKind::exit_code)
    }

    /// One `✓`/`⊘`/`✗` line per entry.
    pub fn lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(unit, outcome)| match outcome {
                Outcome::Succeeded(detail) if detail.is_empty() => format!("✓ {}", unit),
                Outcome::Succeeded(detail) => format!("✓ {} ({})", unit, detail),
                Outcome::Skipped(reason) => format!("⊘ {} ({})", unit, reason),
                Outcome::Failed(kind, message) => format!("✗ {} [{}] {}", unit, kind, message),
            })
            .collect()
    }

    /// Logs the summary through the `log` facade.
    pub fn log(&self, title: &str) {
        log::info!(
            "{}: {} succeeded, {} skipped, {} failed",
            title,
            self.succeeded(),
            self.skipped(),
            self.failed()
        );
        for line in self.lines() {
            log::info!("  {}", line);
        }
    }
}

/// Options shared by both domain runs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Merge only: compute and report, but write nothing
    pub dry_run: bool,
    pub cancel: CancelToken,
}

/// Merges archive and latest tables of every configured variable and writes
/// the consolidated tables.
pub fn run_merge(config: &DomainConfig, options: &RunOptions) -> Result<RunSummary> {
    let archive = TimeSeriesStore::new(&config.paths.archive_dir, &config.table);
    let latest = TimeSeriesStore::new(&config.paths.latest_dir, &config.table);
    let merged_store = TimeSeriesStore::new(&config.paths.merged_dir, &config.table);

    if !archive.exists() {
        log::warn!(
            "Archive directory {} not found, using latest only",
            archive.dir().display()
        );
    }

    let merger = ArchiveMerger::new(&config.merge).with_cancel(options.cancel.clone());
    let mut summary = RunSummary::default();
    let mut by_cluster: BTreeMap<ClusterId, Vec<ClusterSeries>> = BTreeMap::new();
    // Clusters whose merged column is replaced in this run, per variable
    let mut written: BTreeMap<&str, BTreeSet<ClusterId>> = BTreeMap::new();

    for variable in config.variable_names() {
        written.insert(variable, BTreeSet::new());
        if options.cancel.is_cancelled() {
            return Err(MergeError::Cancelled.into());
        }
        log::info!("Merging '{}'", variable);

        let merged = match merger.merge_variable(&archive, &latest, variable) {
            Ok(merged) => merged,
            Err(e @ (MergeError::MergeInvariant { .. } | MergeError::Cancelled)) => {
                return Err(anyhow::Error::new(e).context(format!("Merge of '{}' aborted", variable)));
            }
            Err(e) => {
                summary.fail_with(variable, &anyhow::Error::new(e));
                continue;
            }
        };

        for (id, e) in &merged.failures {
            summary.fail(
                format!("{} cluster {}", variable, id),
                ErrorKind::TemporalGap,
                e.to_string(),
            );
        }

        if merged.failed_fraction() > config.merge.max_failed_fraction {
            let err = DomainError::TooManyFailures {
                variable: variable.to_string(),
                failed: merged.failures.len(),
                attempted: merged.attempted(),
                limit: config.merge.max_failed_fraction * 100.0,
            };
            summary.fail_with(variable, &anyhow::Error::new(err));
            continue;
        }

        summary.succeed(
            variable,
            format!(
                "{} merged, {} skipped, {} failed",
                merged.merged.len(),
                merged.skipped.len(),
                merged.failures.len()
            ),
        );
        for id in &merged.skipped {
            summary.skip(
                format!("{} cluster {}", variable, id),
                "no data in archive or latest",
            );
        }
        for (id, series) in merged.merged {
            written.entry(variable).or_default().insert(id);
            by_cluster.entry(id).or_default().push(series);
        }
    }

    // A previous run's column must not outlive a cluster or variable that
    // failed or was skipped this time
    let mut stale: BTreeMap<ClusterId, Vec<&str>> = BTreeMap::new();
    let existing = merged_store
        .cluster_ids()
        .with_context(|| format!("Listing merged tables in {}", merged_store.dir().display()))?;
    for id in existing {
        let variables: Vec<&str> = written
            .iter()
            .filter(|(_, ids)| !ids.contains(&id))
            .map(|(&variable, _)| variable)
            .collect();
        if !variables.is_empty() {
            stale.insert(id, variables);
        }
    }

    if options.dry_run {
        log::info!(
            "Dry run, {} merged tables not written, {} not cleared",
            by_cluster.len(),
            stale.len()
        );
        return Ok(summary);
    }

    let targets: BTreeSet<ClusterId> = by_cluster.keys().chain(stale.keys()).copied().collect();
    let results: Vec<(ClusterId, std::result::Result<(), StoreError>)> = targets
        .par_iter()
        .map(|&id| {
            let result = refresh_table(&merged_store, id, stale.get(&id), by_cluster.get(&id));
            (id, result)
        })
        .collect();

    for (id, result) in results {
        if let Err(e) = result {
            summary.fail_with(format!("cluster {}", id), &anyhow::Error::new(e));
        }
    }

    log::info!(
        "Wrote {} merged tables to {}, cleared stale columns in {}",
        by_cluster.len(),
        merged_store.dir().display(),
        stale.len()
    );
    Ok(summary)
}

/// Clears the stale columns of one merged table, then writes its new series.
fn refresh_table(
    store: &TimeSeriesStore,
    id: ClusterId,
    stale: Option<&Vec<&str>>,
    series: Option<&Vec<ClusterSeries>>,
) -> std::result::Result<(), StoreError> {
    if let Some(variables) = stale {
        if store.clear(id, variables)? {
            log::debug!("Cleared stale {:?} of cluster {}", variables, id);
        }
    }
    if let Some(series) = series {
        store.write_all(id, series)?;
    }
    Ok(())
}

/// Output path of one variable: `<grid_dir>/<domain>_<OUT>.nc`.
pub fn output_path(config: &DomainConfig, variable: &VariableConfig) -> PathBuf {
    config
        .paths
        .grid_dir
        .join(format!("{}_{}.nc", config.name, variable.output_name))
}

/// Loads the domain's cluster map.
pub fn load_cluster_map(config: &DomainConfig) -> Result<ClusterGridMap> {
    let landform = &config.paths.landform;
    ClusterGridMap::from_geotiff(landform, Crs::from_epsg(config.grid.epsg), config.grid.nodata)
        .with_context(|| format!("Failed to load cluster map {}", landform.display()))
}

/// Grids every configured variable from the merged tables into NetCDF files.
#[cfg(feature = "netcdf")]
pub fn run_grid(config: &DomainConfig, options: &RunOptions) -> Result<RunSummary> {
    let map = load_cluster_map(config)?;
    run_grid_with(config, map, crate::core::netcdf::NetcdfSink::create, options)
}

/// Grids every configured variable through sinks from `factory`.
pub fn run_grid_with<F: SinkFactory>(
    config: &DomainConfig,
    map: ClusterGridMap,
    factory: F,
    options: &RunOptions,
) -> Result<RunSummary> {
    let store = TimeSeriesStore::new(&config.paths.merged_dir, &config.table);
    let ids: Vec<ClusterId> = store
        .cluster_ids()
        .with_context(|| format!("Failed to list {}", store.dir().display()))?;
    if ids.is_empty() {
        return Err(DomainError::NoMergedTables(store.dir().to_path_buf()).into());
    }

    let id_set: BTreeSet<ClusterId> = ids.iter().copied().collect();
    let mapper = ClusterGridMapper::new(Arc::new(map), &id_set)?;
    let shape = mapper.shape();
    log::info!(
        "Gridding {} clusters onto {}x{} cells",
        ids.len(),
        shape.0,
        shape.1
    );

    let mut summary = RunSummary::default();
    let mut prepared: Vec<(VariableMeta, BTreeMap<ClusterId, ClusterSeries>)> = Vec::new();

    for variable in &config.variables {
        match prepare_variable(config, &store, &ids, variable, &mapper) {
            Ok(Some(job)) => prepared.push(job),
            Ok(None) => summary.skip(&variable.output_name, "no values in merged tables"),
            Err(e) => summary.fail_with(&variable.output_name, &e),
        }
    }

    let writer = GridWriter::new(factory)
        .with_parallel(config.grid.parallel)
        .with_cancel(options.cancel.clone());
    let jobs: Vec<(VariableMeta, ClusterTimesteps<'_>)> = prepared
        .iter()
        .map(|(meta, series)| {
            (
                meta.clone(),
                ClusterTimesteps::new(&mapper, series, config.grid.fill_value),
            )
        })
        .collect();

    for (name, result) in writer.write_variables(jobs) {
        match result {
            Ok(path) => summary.succeed(name, path.display().to_string()),
            Err(e @ GridWriteError::Cancelled { .. }) => {
                return Err(anyhow::Error::new(e).context("Gridding aborted"));
            }
            Err(e) => summary.fail_with(name, &anyhow::Error::new(e)),
        }
    }

    Ok(summary)
}

/// Reads and unit-converts one variable, returning its sink metadata.
fn prepare_variable(
    config: &DomainConfig,
    store: &TimeSeriesStore,
    ids: &[ClusterId],
    variable: &VariableConfig,
    mapper: &ClusterGridMapper,
) -> Result<Option<(VariableMeta, BTreeMap<ClusterId, ClusterSeries>)>> {
    let series: BTreeMap<ClusterId, ClusterSeries> = store
        .read(ids, &variable.name)
        .with_context(|| format!("Failed to read '{}'", variable.name))?
        .into_iter()
        .filter(|(_, s)| !s.is_empty())
        .map(|(id, s)| (id, s.scaled(variable.scale)))
        .collect();

    if series.is_empty() {
        return Ok(None);
    }

    let shape = mapper.shape();
    let meta = VariableMeta {
        name: variable.output_name.clone(),
        long_name: variable.long_name.clone(),
        units: variable.units.clone(),
        fill_value: config.grid.fill_value,
        path: output_path(config, variable),
        shape,
        transform: *mapper.map().transform(),
        crs: mapper.map().crs(),
        chunk: (
            config.grid.chunk_rows.unwrap_or(shape.0),
            config.grid.chunk_cols.unwrap_or(shape.1),
        ),
        compression_level: config.grid.compression_level,
    };
    Ok(Some((meta, series)))
}

/// Loads the domain configuration, adding the directory to the error.
pub fn load_config(domain_dir: &Path, config_override: Option<&Path>) -> Result<DomainConfig> {
    DomainConfig::load(domain_dir, config_override)
        .with_context(|| format!("Failed to load configuration for {}", domain_dir.display()))
}
