//! Per-cluster time-series tables on disk.
//!
//! A store is a directory holding one table per cluster:
//! - `FSM_pt_<id>.csv`: a `time` column (ISO-8601) plus one column per variable,
//!   empty cells meaning "no value"
//! - `FSM_pt_<id>.txt`: the point model's whitespace output,
//!   `year month day hour v1 v2 ...`, value column names taken from
//!   [`TableConfig::fsm_columns`]
//!
//! Reads accept both formats (CSV wins when both exist); writes always produce
//! CSV through a temporary file and a rename, so a table on disk is never
//! half-written.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use csv::ReaderBuilder;
use rayon::prelude::*;
use regex::Regex;
use thiserror::Error;

use super::series::{format_timestamp, parse_timestamp, timestamp_from_parts, ClusterId, ClusterSeries};
use crate::config::TableConfig;

/// Name of the timestamp column in CSV tables.
pub const TIME_COLUMN: &str = "time";

/// Errors that can occur while reading or writing tables.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("variable '{variable}' is absent from every table in {dir}")]
    MissingVariable { variable: String, dir: PathBuf },

    #[error("no '{TIME_COLUMN}' column in {0}")]
    MissingTimeColumn(PathBuf),

    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// On-disk table format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// Header row with `time` + variable columns
    Csv,
    /// Whitespace separated `year month day hour` + value columns
    FsmText,
}

impl TableFormat {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" => Some(TableFormat::Csv),
            "txt" => Some(TableFormat::FsmText),
            _ => None,
        }
    }
}

/// All variables of one cluster, aligned on a shared time column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterTable {
    pub times: Vec<NaiveDateTime>,
    /// Columns in file order; `None` marks a missing cell
    pub columns: Vec<(String, Vec<Option<f64>>)>,
}

impl ClusterTable {
    /// Returns the column for `variable` (case-insensitive).
    pub fn column(&self, variable: &str) -> Option<&[Option<f64>]> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(variable))
            .map(|(_, values)| values.as_slice())
    }

    #[inline]
    pub fn has_column(&self, variable: &str) -> bool {
        self.column(variable).is_some()
    }

    /// Extracts one variable as a series, skipping missing cells.
    pub fn series(&self, cluster_id: ClusterId, variable: &str) -> Option<ClusterSeries> {
        let column = self.column(variable)?;
        let pairs = self
            .times
            .iter()
            .zip(column.iter())
            .filter_map(|(&t, v)| v.map(|v| (t, v)));
        Some(ClusterSeries::from_pairs(cluster_id, variable, pairs))
    }

    /// Replaces (or adds) the column of `series.variable`, outer-joined on time.
    ///
    /// Rows left without any value are dropped.
    pub fn set_series(&mut self, series: &ClusterSeries) {
        let mut all_times: BTreeSet<NaiveDateTime> = self.times.iter().copied().collect();
        all_times.extend(series.times.iter().copied());
        let times: Vec<NaiveDateTime> = all_times.into_iter().collect();

        let old_index: HashMap<NaiveDateTime, usize> =
            self.times.iter().enumerate().map(|(i, &t)| (t, i)).collect();
        let new_values: HashMap<NaiveDateTime, f64> = series.iter().collect();

        let mut replaced = false;
        let mut columns = Vec::with_capacity(self.columns.len() + 1);
        for (name, values) in self.columns.drain(..) {
            if name.eq_ignore_ascii_case(&series.variable) {
                replaced = true;
                let column: Vec<Option<f64>> = times.iter().map(|t| new_values.get(t).copied()).collect();
                columns.push((name, column));
            } else {
                let column: Vec<Option<f64>> = times
                    .iter()
                    .map(|t| old_index.get(t).and_then(|&i| values[i]))
                    .collect();
                columns.push((name, column));
            }
        }
        if !replaced {
            let column: Vec<Option<f64>> = times.iter().map(|t| new_values.get(t).copied()).collect();
            columns.push((series.variable.clone(), column));
        }

        self.times = times;
        self.columns = columns;
        self.drop_empty_rows();
    }

    /// Removes the column of `variable`, returning whether it was present.
    ///
    /// Rows left without any value are dropped.
    pub fn remove_column(&mut self, variable: &str) -> bool {
        let before = self.columns.len();
        self.columns.retain(|(name, _)| !name.eq_ignore_ascii_case(variable));
        if self.columns.len() == before {
            return false;
        }
        self.drop_empty_rows();
        true
    }

    fn drop_empty_rows(&mut self) {
        let keep: Vec<bool> = (0..self.times.len())
            .map(|row| self.columns.iter().any(|(_, values)| values[row].is_some()))
            .collect();
        if keep.iter().all(|&k| k) {
            return;
        }
        self.times = self
            .times
            .drain(..)
            .zip(keep.iter())
            .filter_map(|(t, &k)| k.then_some(t))
            .collect();
        for (_, values) in &mut self.columns {
            *values = values
                .drain(..)
                .zip(keep.iter())
                .filter_map(|(v, &k)| k.then_some(v))
                .collect();
        }
    }
}

/// Directory of per-cluster tables.
#[derive(Debug, Clone)]
pub struct TimeSeriesStore {
    dir: PathBuf,
    fsm_columns: Vec<String>,
}

fn table_name_regex() -> Regex {
    Regex::new(r"^FSM_pt_(\d+)\.(csv|txt)$").expect("static regex is valid")
}

impl TimeSeriesStore {
    /// Creates a store over `dir`. The directory is created on first write.
    pub fn new<P: AsRef<Path>>(dir: P, table: &TableConfig) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            fsm_columns: table.fsm_columns.clone(),
        }
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True when the store directory exists.
    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Path a CSV table for `cluster_id` is written to.
    pub fn csv_path(&self, cluster_id: ClusterId) -> PathBuf {
        self.dir.join(format!("FSM_pt_{:02}.csv", cluster_id))
    }

    /// Lists the tables in the store, keyed by cluster id.
    ///
    /// When a cluster has both a CSV and a text table, the CSV is used.
    pub fn tables(&self) -> Result<BTreeMap<ClusterId, (PathBuf, TableFormat)>> {
        let mut tables: BTreeMap<ClusterId, (PathBuf, TableFormat)> = BTreeMap::new();
        if !self.exists() {
            return Ok(tables);
        }

        let re = table_name_regex();
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::Io {
            path: self.dir.clone(),
            source: e,
        })?;

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(caps) = re.captures(name) else {
                continue;
            };
            let Ok(id) = caps[1].parse::<ClusterId>() else {
                continue;
            };
            let Some(format) = TableFormat::from_extension(&caps[2]) else {
                continue;
            };

            match tables.get(&id) {
                Some((_, TableFormat::Csv)) => {}
                _ => {
                    tables.insert(id, (path.clone(), format));
                }
            }
        }

        Ok(tables)
    }

    /// Sorted ids of all clusters with a table in this store.
    pub fn cluster_ids(&self) -> Result<Vec<ClusterId>> {
        Ok(self.tables()?.into_keys().collect())
    }

    /// Reads the whole table of one cluster, `None` when it has no table.
    pub fn read_table(&self, cluster_id: ClusterId) -> Result<Option<ClusterTable>> {
        let tables = self.tables()?;
        match tables.get(&cluster_id) {
            Some((path, format)) => self.read_table_file(path, *format).map(Some),
            None => Ok(None),
        }
    }

    fn read_table_file(&self, path: &Path, format: TableFormat) -> Result<ClusterTable> {
        match format {
            TableFormat::Csv => read_csv_table(path),
            TableFormat::FsmText => read_fsm_text_table(path, &self.fsm_columns),
        }
    }

    /// Reads `variable` for each of `cluster_ids`.
    ///
    /// Clusters without a table, or whose table lacks the variable, map to an
    /// empty series. Fails with [`StoreError::MissingVariable`] when no table in
    /// the store carries the variable at all.
    pub fn read(
        &self,
        cluster_ids: &[ClusterId],
        variable: &str,
    ) -> Result<BTreeMap<ClusterId, ClusterSeries>> {
        let tables = self.tables()?;

        let loaded: Vec<(ClusterId, Option<ClusterSeries>)> = cluster_ids
            .par_iter()
            .map(|&id| match tables.get(&id) {
                Some((path, format)) => {
                    let table = self.read_table_file(path, *format)?;
                    Ok((id, table.series(id, variable)))
                }
                None => Ok((id, None)),
            })
            .collect::<Result<_>>()?;

        let present = loaded.iter().any(|(_, s)| s.is_some());
        if !present {
            // The variable may still exist in tables that were not requested
            let mut elsewhere = false;
            for (id, (path, format)) in &tables {
                if cluster_ids.contains(id) {
                    continue;
                }
                if self.read_table_file(path, *format)?.has_column(variable) {
                    elsewhere = true;
                    break;
                }
            }
            if !elsewhere {
                return Err(StoreError::MissingVariable {
                    variable: variable.to_string(),
                    dir: self.dir.clone(),
                });
            }
        }

        Ok(loaded
            .into_iter()
            .map(|(id, s)| (id, s.unwrap_or_else(|| ClusterSeries::empty(id, variable))))
            .collect())
    }

    /// Writes one variable of one cluster, keeping its other columns.
    pub fn write(&self, cluster_id: ClusterId, variable: &str, series: &ClusterSeries) -> Result<PathBuf> {
        if series.variable == variable {
            self.write_all(cluster_id, std::slice::from_ref(series))
        } else {
            let mut renamed = series.clone();
            renamed.variable = variable.to_string();
            self.write_all(cluster_id, &[renamed])
        }
    }

    /// Writes several variables of one cluster in a single pass.
    ///
    /// Existing CSV columns not named in `series` are preserved; the columns
    /// named are replaced entirely. The result is byte-identical for identical
    /// inputs.
    pub fn write_all(&self, cluster_id: ClusterId, series: &[ClusterSeries]) -> Result<PathBuf> {
        let path = self.csv_path(cluster_id);
        let mut table = if path.is_file() {
            read_csv_table(&path)?
        } else {
            ClusterTable::default()
        };

        for s in series {
            table.set_series(s);
        }

        fs::create_dir_all(&self.dir).map_err(|e| StoreError::Io {
            path: self.dir.clone(),
            source: e,
        })?;
        write_csv_table_atomic(&path, &table)?;
        Ok(path)
    }

    /// Removes the columns of `variables` from one cluster's CSV table.
    ///
    /// A table left without columns is deleted. Returns whether anything on
    /// disk changed; a cluster without a CSV table is left alone.
    pub fn clear(&self, cluster_id: ClusterId, variables: &[&str]) -> Result<bool> {
        let path = self.csv_path(cluster_id);
        if !path.is_file() {
            return Ok(false);
        }
        let mut table = read_csv_table(&path)?;

        let mut removed = false;
        for variable in variables {
            removed |= table.remove_column(variable);
        }
        if !removed {
            return Ok(false);
        }

        if table.columns.is_empty() {
            fs::remove_file(&path).map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e,
            })?;
        } else {
            write_csv_table_atomic(&path, &table)?;
        }
        Ok(true)
    }
}

fn read_csv_table(path: &Path) -> Result<ClusterTable> {
    let file = File::open(path).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file));

    let headers = reader
        .headers()
        .map_err(|e| StoreError::Csv {
            path: path.to_path_buf(),
            source: e,
        })?
        .clone();

    let time_idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(TIME_COLUMN))
        .ok_or_else(|| StoreError::MissingTimeColumn(path.to_path_buf()))?;

    let value_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != time_idx)
        .map(|(i, name)| (i, name.to_string()))
        .collect();

    let mut table = ClusterTable {
        times: Vec::new(),
        columns: value_cols
            .iter()
            .map(|(_, name)| (name.clone(), Vec::new()))
            .collect(),
    };

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.map_err(|e| StoreError::Csv {
            path: path.to_path_buf(),
            source: e,
        })?;
        let line = row_idx + 2;

        let raw_time = record.get(time_idx).unwrap_or("");
        let time = parse_timestamp(raw_time).ok_or_else(|| StoreError::Parse {
            path: path.to_path_buf(),
            line,
            message: format!("invalid timestamp '{}'", raw_time),
        })?;
        table.times.push(time);

        for (col, (idx, name)) in value_cols.iter().enumerate() {
            let value = parse_cell(record.get(*idx).unwrap_or("")).map_err(|raw| StoreError::Parse {
                path: path.to_path_buf(),
                line,
                message: format!("invalid value '{}' in column '{}'", raw, name),
            })?;
            table.columns[col].1.push(value);
        }
    }

    Ok(table)
}

/// Parse one value cell. Empty and non-finite cells are missing values.
fn parse_cell(raw: &str) -> std::result::Result<Option<f64>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        Ok(_) => Ok(None),
        Err(_) => Err(raw.to_string()),
    }
}

fn read_fsm_text_table(path: &Path, columns: &[String]) -> Result<ClusterTable> {
    let file = File::open(path).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let reader = BufReader::new(file);

    let mut table = ClusterTable {
        times: Vec::with_capacity(8760),
        columns: columns.iter().map(|c| (c.clone(), Vec::with_capacity(8760))).collect(),
    };

    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }

        let parse_err = |message: String| StoreError::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            message,
        };

        if fields.len() < 4 + columns.len() {
            return Err(parse_err(format!(
                "expected {} fields, found {}",
                4 + columns.len(),
                fields.len()
            )));
        }

        let year: i32 = fields[0]
            .parse()
            .map_err(|_| parse_err(format!("invalid year '{}'", fields[0])))?;
        let month: u32 = fields[1]
            .parse()
            .map_err(|_| parse_err(format!("invalid month '{}'", fields[1])))?;
        let day: u32 = fields[2]
            .parse()
            .map_err(|_| parse_err(format!("invalid day '{}'", fields[2])))?;
        let hour = fields[3]
            .parse::<f64>()
            .ok()
            .filter(|h| h.fract() == 0.0 && (0.0..24.0).contains(h))
            .map(|h| h as u32)
            .ok_or_else(|| parse_err(format!("invalid hour '{}'", fields[3])))?;

        let time = timestamp_from_parts(year, month, day, hour)
            .ok_or_else(|| parse_err(format!("invalid date {}-{}-{} {}", year, month, day, hour)))?;
        table.times.push(time);

        for (col, raw) in fields[4..4 + columns.len()].iter().enumerate() {
            let value = parse_cell(raw)
                .map_err(|raw| parse_err(format!("invalid value '{}' in column '{}'", raw, columns[col])))?;
            table.columns[col].1.push(value);
        }
    }

    Ok(table)
}

fn write_csv_table_atomic(path: &Path, table: &ClusterTable) -> Result<()> {
    let tmp_path = path.with_extension("csv.tmp");
    let io_err = |p: &Path, e: std::io::Error| StoreError::Io {
        path: p.to_path_buf(),
        source: e,
    };
    let csv_err = |e: csv::Error| StoreError::Csv {
        path: tmp_path.clone(),
        source: e,
    };

    {
        let file = File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
        let mut writer = csv::Writer::from_writer(BufWriter::new(file));

        let mut header = Vec::with_capacity(table.columns.len() + 1);
        header.push(TIME_COLUMN.to_string());
        header.extend(table.columns.iter().map(|(name, _)| name.clone()));
        writer.write_record(&header).map_err(csv_err)?;

        let mut record = Vec::with_capacity(header.len());
        for (row, &t) in table.times.iter().enumerate() {
            record.clear();
            record.push(format_timestamp(t));
            for (_, values) in &table.columns {
                record.push(values[row].map(|v| v.to_string()).unwrap_or_default());
            }
            writer.write_record(&record).map_err(csv_err)?;
        }

        let mut inner = writer
            .into_inner()
            .map_err(|e| io_err(&tmp_path, e.into_error()))?;
        inner.flush().map_err(|e| io_err(&tmp_path, e))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        io_err(path, e)
    })
}
