//! Core data types and I/O operations.

pub mod grid;
#[cfg(feature = "netcdf")]
pub mod netcdf;
pub mod series;
pub mod sink;
pub mod store;

pub use grid::{ClusterGridMap, Crs, GeoTransform, Grid2, GridMapError, NO_CLUSTER};
#[cfg(feature = "netcdf")]
pub use self::netcdf::{read_gridded_variable, GriddedVariable, NetcdfSink};
pub use series::{ClusterId, ClusterSeries};
pub use sink::{GridSink, SinkError, VariableMeta};
pub use store::{StoreError, TimeSeriesStore};
