//! Merge and regrid point-based snow model output.
//!
//! This crate provides tools for:
//! - Reading and writing per-cluster FSM time-series tables
//! - Merging the long archive run with the latest run into one gap-free series
//! - Broadcasting cluster values onto the domain grid through the cluster map
//! - Streaming gridded variables to NetCDF one timestep at a time
//!
//! # Example
//!
//! ```no_run
//! use snowmapper::config::DomainConfig;
//! use snowmapper::processors::{run_merge, RunOptions};
//!
//! let config = DomainConfig::load("/data/alps".as_ref(), None).unwrap();
//! let summary = run_merge(&config, &RunOptions::default()).unwrap();
//! println!("{} variables merged", summary.succeeded());
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;

pub use self::config::{DomainConfig, GridConfig, MergeConfig, VariableConfig};
pub use self::core::grid::{ClusterGridMap, Grid2};
pub use self::core::series::{ClusterId, ClusterSeries};
pub use self::core::store::TimeSeriesStore;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
