//! Data processing modules.

pub mod cancel;
pub mod domain;
pub mod gridding;
pub mod mapper;
pub mod merge;

// Re-export key types for convenience
pub use cancel::CancelToken;
pub use domain::{run_grid_with, run_merge, ErrorKind, Outcome, RunOptions, RunSummary};
#[cfg(feature = "netcdf")]
pub use domain::run_grid;
pub use gridding::{ClusterTimesteps, GridWriteError, GridWriter};
pub use mapper::{ClusterGridMapper, MapperError};
pub use merge::{merge_series, ArchiveMerger, MergeError, VariableMerge};
