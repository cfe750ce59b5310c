//! Destination of a streamed gridded variable.
//!
//! A [`GridSink`] receives one 2-D grid per timestep and never sees the whole
//! `(time, y, x)` cube. The NetCDF implementation lives in
//! [`crate::core::netcdf`]; tests use in-memory sinks.

use std::path::PathBuf;

use chrono::NaiveDateTime;
use thiserror::Error;

use super::grid::{Crs, GeoTransform, Grid2};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("format error: {0}")]
    Format(String),
}

#[cfg(feature = "netcdf")]
impl From<netcdf::Error> for SinkError {
    fn from(e: netcdf::Error) -> Self {
        SinkError::Format(e.to_string())
    }
}

/// Everything a sink needs to lay out one output variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableMeta {
    /// Name of the data variable, e.g. `HS`
    pub name: String,
    pub long_name: String,
    pub units: String,
    pub fill_value: f32,
    /// Final location of the file
    pub path: PathBuf,
    /// Domain shape `(rows, cols)`
    pub shape: (usize, usize),
    pub transform: GeoTransform,
    pub crs: Crs,
    /// Spatial tile `(rows, cols)`; the time chunk is always 1
    pub chunk: (usize, usize),
    /// Deflate level, 0 disables compression
    pub compression_level: u8,
}

impl VariableMeta {
    /// Sibling path written while the variable is in progress.
    pub fn partial_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".partial");
        self.path.with_file_name(name)
    }
}

/// Append-only writer for one variable.
pub trait GridSink {
    /// Appends the grid of the next timestep.
    fn append(&mut self, time: NaiveDateTime, grid: &Grid2) -> Result<(), SinkError>;

    /// Completes the variable and moves it into place.
    fn finish(self) -> Result<PathBuf, SinkError>;

    /// Discards everything written so far.
    fn abort(self);
}

/// Opens sinks for variables. Shared between parallel variable writers.
pub trait SinkFactory: Sync {
    type Sink: GridSink;

    fn create(&self, meta: &VariableMeta) -> Result<Self::Sink, SinkError>;
}

impl<F, S> SinkFactory for F
where
    F: Fn(&VariableMeta) -> Result<S, SinkError> + Sync,
    S: GridSink,
{
    type Sink = S;

    fn create(&self, meta: &VariableMeta) -> Result<S, SinkError> {
        self(meta)
    }
}
