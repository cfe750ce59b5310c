//! Streaming conversion of merged cluster series into gridded variables.
//!
//! A variable is written one timestep at a time: [`ClusterTimesteps`]
//! produces each 2-D grid lazily and [`GridWriter::write_variable`] hands it
//! to the sink and drops it before asking for the next one. At most one grid
//! per variable is alive at any moment.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use rayon::prelude::*;
use thiserror::Error;

use crate::core::grid::Grid2;
use crate::core::series::{format_timestamp, ClusterId, ClusterSeries};
use crate::core::sink::{GridSink, SinkError, SinkFactory, VariableMeta};

use super::cancel::CancelToken;
use super::mapper::ClusterGridMapper;

/// Errors that can occur while writing a gridded variable.
#[derive(Debug, Error)]
pub enum GridWriteError {
    #[error("'{variable}': grid shape {found:?} does not match domain shape {expected:?}")]
    ShapeMismatch {
        variable: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("'{variable}': timestep {} does not follow {}", format_timestamp(*time), format_timestamp(*previous))]
    OutOfOrder {
        variable: String,
        previous: NaiveDateTime,
        time: NaiveDateTime,
    },

    #[error("'{variable}': no timesteps to write")]
    NoTimesteps { variable: String },

    #[error("'{variable}': write cancelled")]
    Cancelled { variable: String },

    #[error("'{variable}': {source}")]
    Sink {
        variable: String,
        #[source]
        source: SinkError,
    },
}

pub type Result<T> = std::result::Result<T, GridWriteError>;

/// Writes variables through sinks opened by a [`SinkFactory`].
pub struct GridWriter<F> {
    factory: F,
    parallel: bool,
    cancel: CancelToken,
}

impl<F: SinkFactory> GridWriter<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            parallel: true,
            cancel: CancelToken::new(),
        }
    }

    /// Write variables concurrently in [`write_variables`](Self::write_variables).
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Streams `timesteps` into a new file described by `meta`.
    ///
    /// Each grid must have the domain shape and each timestamp must be
    /// strictly after the previous one. On any failure the partial output is
    /// removed and nothing is left at `meta.path` by this call.
    pub fn write_variable<I>(&self, meta: &VariableMeta, timesteps: I) -> Result<PathBuf>
    where
        I: IntoIterator<Item = (NaiveDateTime, Grid2)>,
    {
        let variable = meta.name.clone();
        if self.cancel.is_cancelled() {
            return Err(GridWriteError::Cancelled { variable });
        }

        let mut sink = self.factory.create(meta).map_err(|source| GridWriteError::Sink {
            variable: variable.clone(),
            source,
        })?;

        match stream(&mut sink, meta, timesteps, &self.cancel) {
            Ok(0) => {
                sink.abort();
                Err(GridWriteError::NoTimesteps { variable })
            }
            Ok(count) => {
                let path = sink
                    .finish()
                    .map_err(|source| GridWriteError::Sink { variable, source })?;
                log::info!("Wrote {} ({} timesteps)", path.display(), count);
                Ok(path)
            }
            Err(e) => {
                sink.abort();
                Err(e)
            }
        }
    }

    /// Writes several independent variables, one task per variable.
    ///
    /// Returns one result per input, in input order.
    pub fn write_variables<I>(&self, jobs: Vec<(VariableMeta, I)>) -> Vec<(String, Result<PathBuf>)>
    where
        I: IntoIterator<Item = (NaiveDateTime, Grid2)> + Send,
    {
        let write_one = |(meta, timesteps): (VariableMeta, I)| {
            let result = self.write_variable(&meta, timesteps);
            (meta.name, result)
        };

        if self.parallel {
            jobs.into_par_iter().map(write_one).collect()
        } else {
            jobs.into_iter().map(write_one).collect()
        }
    }
}

/// Appends every timestep to `sink`, returning the number written.
fn stream<S, I>(sink: &mut S, meta: &VariableMeta, timesteps: I, cancel: &CancelToken) -> Result<usize>
where
    S: GridSink,
    I: IntoIterator<Item = (NaiveDateTime, Grid2)>,
{
    let mut previous: Option<NaiveDateTime> = None;
    let mut count = 0;

    for (time, grid) in timesteps {
        if cancel.is_cancelled() {
            return Err(GridWriteError::Cancelled {
                variable: meta.name.clone(),
            });
        }
        if grid.shape() != meta.shape {
            return Err(GridWriteError::ShapeMismatch {
                variable: meta.name.clone(),
                expected: meta.shape,
                found: grid.shape(),
            });
        }
        if let Some(prev) = previous {
            if time <= prev {
                return Err(GridWriteError::OutOfOrder {
                    variable: meta.name.clone(),
                    previous: prev,
                    time,
                });
            }
        }

        sink.append(time, &grid).map_err(|source| GridWriteError::Sink {
            variable: meta.name.clone(),
            source,
        })?;
        drop(grid);

        previous = Some(time);
        count += 1;
    }

    Ok(count)
}

/// Lazy `(timestamp, grid)` sequence over merged cluster series.
///
/// The time axis is the sorted union of every cluster's timestamps. A cluster
/// without a sample at a timestamp, or with a non-finite sample, contributes
/// the fill value there.
pub struct ClusterTimesteps<'a> {
    mapper: &'a ClusterGridMapper,
    series: Vec<(ClusterId, &'a ClusterSeries)>,
    cursors: Vec<usize>,
    times: std::vec::IntoIter<NaiveDateTime>,
    fill: f32,
}

impl<'a> ClusterTimesteps<'a> {
    /// `series` must be sorted by time, as merged series are.
    pub fn new(mapper: &'a ClusterGridMapper, series: &'a BTreeMap<ClusterId, ClusterSeries>, fill: f32) -> Self {
        let mut times: Vec<NaiveDateTime> = series.values().flat_map(|s| s.times.iter().copied()).collect();
        times.sort_unstable();
        times.dedup();

        let series: Vec<(ClusterId, &ClusterSeries)> = series.iter().map(|(&id, s)| (id, s)).collect();
        let cursors = vec![0; series.len()];

        Self {
            mapper,
            series,
            cursors,
            times: times.into_iter(),
            fill,
        }
    }
}

impl Iterator for ClusterTimesteps<'_> {
    type Item = (NaiveDateTime, Grid2);

    fn next(&mut self) -> Option<Self::Item> {
        let time = self.times.next()?;

        let mut values = BTreeMap::new();
        for ((id, s), cursor) in self.series.iter().zip(self.cursors.iter_mut()) {
            while *cursor < s.times.len() && s.times[*cursor] < time {
                *cursor += 1;
            }
            if *cursor < s.times.len() && s.times[*cursor] == time {
                let v = s.values[*cursor];
                if v.is_finite() {
                    values.insert(*id, v as f32);
                }
            }
        }

        Some((time, self.mapper.broadcast(&values, self.fill)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.times.size_hint()
    }
}

impl ExactSizeIterator for ClusterTimesteps<'_> {}

#[cfg(test)]
pub(crate) mod test_sink {
    use std::fs::{self, File};
    use std::io::{BufWriter, Write};

    use super::*;

    /// Writes raw little-endian cells into `<path>.partial`, renamed on finish.
    pub struct RawSink {
        writer: BufWriter<File>,
        partial: PathBuf,
        path: PathBuf,
    }

    pub fn raw_sink(meta: &VariableMeta) -> std::result::Result<RawSink, SinkError> {
        let partial = meta.partial_path();
        let file = File::create(&partial).map_err(|e| SinkError::Io {
            path: partial.clone(),
            source: e,
        })?;
        Ok(RawSink {
            writer: BufWriter::new(file),
            partial,
            path: meta.path.clone(),
        })
    }

    impl GridSink for RawSink {
        fn append(&mut self, _time: NaiveDateTime, grid: &Grid2) -> std::result::Result<(), SinkError> {
            for v in grid.as_slice() {
                self.writer.write_all(&v.to_le_bytes()).map_err(|e| SinkError::Io {
                    path: self.partial.clone(),
                    source: e,
                })?;
            }
            Ok(())
        }

        fn finish(mut self) -> std::result::Result<PathBuf, SinkError> {
            self.writer.flush().map_err(|e| SinkError::Io {
                path: self.partial.clone(),
                source: e,
            })?;
            drop(self.writer);
            fs::rename(&self.partial, &self.path).map_err(|e| SinkError::Io {
                path: self.path.clone(),
                source: e,
            })?;
            Ok(self.path)
        }

        fn abort(self) {
            drop(self.writer);
            let _ = fs::remove_file(&self.partial);
        }
    }

    /// Reads back what [`RawSink`] wrote.
    pub fn read_raw(path: &std::path::Path) -> Vec<f32> {
        fs::read(path)
            .unwrap()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}
