//! Archive/latest merge of per-cluster time series.
//!
//! The archive holds the long historical run, `latest` the recent run plus
//! forecast. Both are produced independently and overlap by a few days. The
//! merged series is their union with `latest` taking precedence at identical
//! timestamps.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use rayon::prelude::*;
use thiserror::Error;

use crate::config::MergeConfig;
use crate::core::series::{format_timestamp, ClusterId, ClusterSeries};
use crate::core::store::{StoreError, TimeSeriesStore};

use super::cancel::CancelToken;

/// Errors that can occur while merging archives.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error(
        "cluster {cluster_id} '{variable}': gap of {}h between archive and latest exceeds {}h",
        gap.num_hours(),
        max_gap.num_hours()
    )]
    TemporalGap {
        cluster_id: ClusterId,
        variable: String,
        gap: Duration,
        max_gap: Duration,
    },

    #[error("cluster {cluster_id} '{variable}': merged series not strictly increasing at {}", format_timestamp(*time))]
    MergeInvariant {
        cluster_id: ClusterId,
        variable: String,
        time: NaiveDateTime,
    },

    #[error("no cluster has '{variable}' data in archive or latest")]
    NoData { variable: String },

    #[error("merge cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, MergeError>;

/// Merges one archive series with one latest series.
///
/// Both inputs are sorted first. The result contains every latest sample and
/// every archive sample whose timestamp latest does not have. When the two
/// ranges do not overlap, their gap must not exceed `max_gap`.
pub fn merge_series(archive: &ClusterSeries, latest: &ClusterSeries, max_gap: Duration) -> Result<ClusterSeries> {
    let cluster_id = latest.cluster_id;
    let variable = latest.variable.as_str();

    let mut a = archive.clone();
    let mut l = latest.clone();
    a.sort_by_time();
    l.sort_by_time();

    let merged = match (a.start().zip(a.end()), l.start().zip(l.end())) {
        (None, _) => l,
        (_, None) => a,
        (Some((a_start, a_end)), Some((l_start, l_end))) => {
            let gap = if a_end < l_start {
                Some(l_start - a_end)
            } else if l_end < a_start {
                Some(a_start - l_end)
            } else {
                None
            };
            if let Some(gap) = gap {
                if gap > max_gap {
                    return Err(MergeError::TemporalGap {
                        cluster_id,
                        variable: variable.to_string(),
                        gap,
                        max_gap,
                    });
                }
            }
            union_latest_wins(cluster_id, variable, &a, &l)
        }
    };

    if let Some(time) = merged.first_non_increasing() {
        return Err(MergeError::MergeInvariant {
            cluster_id,
            variable: variable.to_string(),
            time,
        });
    }

    Ok(merged)
}

/// Two-pointer union of sorted series; `latest` wins ties.
fn union_latest_wins(
    cluster_id: ClusterId,
    variable: &str,
    archive: &ClusterSeries,
    latest: &ClusterSeries,
) -> ClusterSeries {
    let mut out = ClusterSeries::empty(cluster_id, variable);
    out.times.reserve(archive.len() + latest.len());
    out.values.reserve(archive.len() + latest.len());

    let (mut i, mut j) = (0, 0);
    while i < archive.len() && j < latest.len() {
        let (ta, tl) = (archive.times[i], latest.times[j]);
        if ta < tl {
            out.push(ta, archive.values[i]);
            i += 1;
        } else if tl < ta {
            out.push(tl, latest.values[j]);
            j += 1;
        } else {
            out.push(tl, latest.values[j]);
            i += 1;
            j += 1;
        }
    }
    for k in i..archive.len() {
        out.push(archive.times[k], archive.values[k]);
    }
    for k in j..latest.len() {
        out.push(latest.times[k], latest.values[k]);
    }
    out
}

/// Result of merging one variable across the domain.
#[derive(Debug, Default)]
pub struct VariableMerge {
    pub variable: String,
    /// Merged series of every cluster that succeeded
    pub merged: BTreeMap<ClusterId, ClusterSeries>,
    /// Clusters with no data in either input
    pub skipped: Vec<ClusterId>,
    /// Clusters whose merge failed, with the reason
    pub failures: Vec<(ClusterId, MergeError)>,
}

impl VariableMerge {
    /// Number of clusters that had data in at least one input.
    pub fn attempted(&self) -> usize {
        self.merged.len() + self.failures.len()
    }

    /// Share of attempted clusters that failed.
    pub fn failed_fraction(&self) -> f64 {
        match self.attempted() {
            0 => 0.0,
            n => self.failures.len() as f64 / n as f64,
        }
    }
}

enum ClusterOutcome {
    Merged(ClusterSeries),
    Skipped,
    Failed(MergeError),
}

/// Merges archive and latest stores cluster by cluster.
#[derive(Debug, Clone)]
pub struct ArchiveMerger {
    max_gap: Duration,
    parallel: bool,
    cancel: CancelToken,
}

impl ArchiveMerger {
    pub fn new(config: &MergeConfig) -> Self {
        Self {
            max_gap: config.max_gap(),
            parallel: config.parallel,
            cancel: CancelToken::new(),
        }
    }

    /// Use `cancel` to stop between clusters.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[inline]
    pub fn max_gap(&self) -> Duration {
        self.max_gap
    }

    /// Merges one series pair with this merger's gap tolerance.
    pub fn merge(&self, archive: &ClusterSeries, latest: &ClusterSeries) -> Result<ClusterSeries> {
        merge_series(archive, latest, self.max_gap)
    }

    /// Merges `variable` for every cluster found in either store.
    ///
    /// Per-cluster gap failures are collected, never raised. A
    /// [`MergeError::MergeInvariant`] aborts the whole call. If no cluster
    /// has data in either store the call fails with [`MergeError::NoData`].
    pub fn merge_variable(
        &self,
        archive: &TimeSeriesStore,
        latest: &TimeSeriesStore,
        variable: &str,
    ) -> Result<VariableMerge> {
        let archive_ids = archive.cluster_ids()?;
        let latest_ids = latest.cluster_ids()?;

        let mut ids: Vec<ClusterId> = archive_ids.iter().chain(latest_ids.iter()).copied().collect();
        ids.sort_unstable();
        ids.dedup();

        let archive_series = read_or_empty(archive, &archive_ids, &ids, variable)?;
        let latest_series = read_or_empty(latest, &latest_ids, &ids, variable)?;

        log::debug!(
            "Merging '{}' for {} clusters ({} archive, {} latest)",
            variable,
            ids.len(),
            archive_ids.len(),
            latest_ids.len()
        );

        let merge_one = |&id: &ClusterId| -> Result<(ClusterId, ClusterOutcome)> {
            if self.cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }
            let a = archive_series
                .get(&id)
                .cloned()
                .unwrap_or_else(|| ClusterSeries::empty(id, variable));
            let l = latest_series
                .get(&id)
                .cloned()
                .unwrap_or_else(|| ClusterSeries::empty(id, variable));

            if a.is_empty() && l.is_empty() {
                return Ok((id, ClusterOutcome::Skipped));
            }
            match self.merge(&a, &l) {
                Ok(merged) => Ok((id, ClusterOutcome::Merged(merged))),
                Err(e @ MergeError::TemporalGap { .. }) => Ok((id, ClusterOutcome::Failed(e))),
                Err(e) => Err(e),
            }
        };

        let outcomes: Vec<(ClusterId, ClusterOutcome)> = if self.parallel {
            ids.par_iter().map(merge_one).collect::<Result<_>>()?
        } else {
            ids.iter().map(merge_one).collect::<Result<_>>()?
        };

        let mut result = VariableMerge {
            variable: variable.to_string(),
            ..Default::default()
        };
        for (id, outcome) in outcomes {
            match outcome {
                ClusterOutcome::Merged(series) => {
                    result.merged.insert(id, series);
                }
                ClusterOutcome::Skipped => {
                    log::warn!("Cluster {} has no '{}' data in archive or latest", id, variable);
                    result.skipped.push(id);
                }
                ClusterOutcome::Failed(e) => {
                    log::warn!("{}", e);
                    result.failures.push((id, e));
                }
            }
        }

        if result.merged.is_empty() && result.failures.is_empty() {
            return Err(MergeError::NoData {
                variable: variable.to_string(),
            });
        }

        Ok(result)
    }
}

/// Reads `variable` from a store, treating a store without tables as empty.
fn read_or_empty(
    store: &TimeSeriesStore,
    present: &[ClusterId],
    ids: &[ClusterId],
    variable: &str,
) -> Result<BTreeMap<ClusterId, ClusterSeries>> {
    if present.is_empty() {
        log::debug!("No tables in {}, treating as empty", store.dir().display());
        return Ok(BTreeMap::new());
    }
    Ok(store.read(ids, variable)?)
}
