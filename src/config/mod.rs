//! Configuration types for a snowmapper domain.
//!
//! A domain directory may carry a `snowmapper.yml`; every field is optional and
//! falls back to the defaults below. Relative paths are resolved against the
//! domain directory when the config is loaded with [`DomainConfig::load`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name looked up inside a domain directory.
pub const CONFIG_FILE_NAME: &str = "snowmapper.yml";

/// Errors that can occur while loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in '{path}': {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("domain directory not found: {0}")]
    DomainNotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Locations of the inputs and outputs of one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Long historical FSM tables
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Recent + forecast FSM tables
    #[serde(default = "default_latest_dir")]
    pub latest_dir: PathBuf,

    /// Consolidated (merged) tables
    #[serde(default = "default_merged_dir")]
    pub merged_dir: PathBuf,

    /// Cluster membership raster produced by the clustering step
    #[serde(default = "default_landform")]
    pub landform: PathBuf,

    /// Directory receiving the gridded NetCDF files
    #[serde(default = "default_grid_dir")]
    pub grid_dir: PathBuf,
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("sim_archive/outputs")
}

fn default_latest_dir() -> PathBuf {
    PathBuf::from("sim_latest/outputs")
}

fn default_merged_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_landform() -> PathBuf {
    PathBuf::from("outputs/landform.tif")
}

fn default_grid_dir() -> PathBuf {
    PathBuf::from("outputs")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            archive_dir: default_archive_dir(),
            latest_dir: default_latest_dir(),
            merged_dir: default_merged_dir(),
            landform: default_landform(),
            grid_dir: default_grid_dir(),
        }
    }
}

/// Layout of the point model's tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Value columns of the whitespace text output, after `year month day hour`
    #[serde(default = "default_fsm_columns")]
    pub fsm_columns: Vec<String>,
}

fn default_fsm_columns() -> Vec<String> {
    ["swe", "snd", "rof", "gst"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            fsm_columns: default_fsm_columns(),
        }
    }
}

/// Archive/latest merge policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Largest tolerated gap between a non-overlapping archive and latest series
    #[serde(default = "default_max_gap_hours")]
    pub max_gap_hours: i64,

    /// Fraction of failing clusters above which the domain run fails
    #[serde(default = "default_max_failed_fraction")]
    pub max_failed_fraction: f64,

    /// Merge clusters on the rayon pool
    #[serde(default = "default_true")]
    pub parallel: bool,
}

fn default_max_gap_hours() -> i64 {
    24
}

fn default_max_failed_fraction() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

impl MergeConfig {
    /// The gap tolerance as a `chrono` duration.
    pub fn max_gap(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_gap_hours)
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_gap_hours: default_max_gap_hours(),
            max_failed_fraction: default_max_failed_fraction(),
            parallel: true,
        }
    }
}

/// Gridding and NetCDF output options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// EPSG code of the cluster map's projection
    #[serde(default = "default_epsg")]
    pub epsg: u32,

    /// Overrides the no-data value stored in the landform raster
    #[serde(default)]
    pub nodata: Option<f64>,

    /// Fill value written for pixels without data
    #[serde(default = "default_fill_value")]
    pub fill_value: f32,

    /// Spatial tile rows per chunk (whole grid when unset)
    #[serde(default)]
    pub chunk_rows: Option<usize>,

    /// Spatial tile columns per chunk (whole grid when unset)
    #[serde(default)]
    pub chunk_cols: Option<usize>,

    /// Deflate level 0-9, 0 disables compression
    #[serde(default = "default_compression_level")]
    pub compression_level: u8,

    /// Write variables on the rayon pool, one task per variable
    #[serde(default = "default_true")]
    pub parallel: bool,
}

fn default_epsg() -> u32 {
    32642
}

fn default_fill_value() -> f32 {
    -9999.0
}

fn default_compression_level() -> u8 {
    5
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            epsg: default_epsg(),
            nodata: None,
            fill_value: default_fill_value(),
            chunk_rows: None,
            chunk_cols: None,
            compression_level: default_compression_level(),
            parallel: true,
        }
    }
}

/// One gridded output variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableConfig {
    /// Column name in the FSM tables
    pub name: String,
    /// Name used in the output file and NetCDF variable
    pub output_name: String,
    #[serde(default)]
    pub long_name: String,
    pub units: String,
    /// Multiplier applied to every value before gridding (unit conversion)
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl VariableConfig {
    pub fn new(name: &str, output_name: &str, long_name: &str, units: &str) -> Self {
        Self {
            name: name.to_string(),
            output_name: output_name.to_string(),
            long_name: long_name.to_string(),
            units: units.to_string(),
            scale: 1.0,
        }
    }

    /// Set the unit conversion factor.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }
}

fn default_variables() -> Vec<VariableConfig> {
    vec![
        VariableConfig::new("swe", "SWE", "snow_water_equivalent", "mm"),
        VariableConfig::new("snd", "HS", "snow_height", "m"),
        VariableConfig::new("rof", "ROF", "snow_runoff", "mm"),
        VariableConfig::new("gst", "GST", "ground_surface_temperature", "K"),
    ]
}

/// Complete configuration of one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Domain name, used as the output file prefix
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub table: TableConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub grid: GridConfig,

    #[serde(default = "default_variables")]
    pub variables: Vec<VariableConfig>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            paths: PathsConfig::default(),
            table: TableConfig::default(),
            merge: MergeConfig::default(),
            grid: GridConfig::default(),
            variables: default_variables(),
        }
    }
}

impl DomainConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Yaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self).map_err(|e| ConfigError::Yaml {
            path: path.to_path_buf(),
            source: e,
        })?;
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load the configuration of a domain directory.
    ///
    /// Uses `config_override` when given, otherwise `<domain>/snowmapper.yml`
    /// if it exists, otherwise defaults. Paths are resolved against the domain
    /// directory and the name defaults to the directory name.
    pub fn load(domain_dir: &Path, config_override: Option<&Path>) -> Result<Self, ConfigError> {
        if !domain_dir.is_dir() {
            return Err(ConfigError::DomainNotFound(domain_dir.to_path_buf()));
        }

        let default_file = domain_dir.join(CONFIG_FILE_NAME);
        let mut config = match config_override {
            Some(path) => Self::from_yaml(path)?,
            None if default_file.is_file() => Self::from_yaml(&default_file)?,
            None => Self::default(),
        };

        config.resolve_paths(domain_dir);
        if config.name.is_empty() {
            config.name = domain_dir
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "domain".to_string());
        }
        config.validate()?;
        Ok(config)
    }

    /// Make every relative path absolute with respect to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.paths.archive_dir);
        resolve(&mut self.paths.latest_dir);
        resolve(&mut self.paths.merged_dir);
        resolve(&mut self.paths.landform);
        resolve(&mut self.paths.grid_dir);
    }

    /// Reject settings the components cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.merge.max_gap_hours < 0 {
            return Err(ConfigError::Invalid(
                "merge.max_gap_hours must not be negative".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.merge.max_failed_fraction) {
            return Err(ConfigError::Invalid(
                "merge.max_failed_fraction must be within 0..=1".to_string(),
            ));
        }
        if self.grid.compression_level > 9 {
            return Err(ConfigError::Invalid(
                "grid.compression_level must be within 0..=9".to_string(),
            ));
        }
        if matches!(self.grid.chunk_rows, Some(0)) || matches!(self.grid.chunk_cols, Some(0)) {
            return Err(ConfigError::Invalid("grid chunk sizes must be positive".to_string()));
        }
        if self.variables.is_empty() {
            return Err(ConfigError::Invalid("no variables configured".to_string()));
        }
        Ok(())
    }

    /// Names of the configured variables, in configuration order.
    pub fn variable_names(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_domain_config() {
        let config = DomainConfig::default();
        assert_eq!(config.merge.max_gap_hours, 24);
        assert_eq!(config.grid.compression_level, 5);
        assert_eq!(config.variable_names(), vec!["swe", "snd", "rof", "gst"]);
        assert_eq!(config.variables[1].output_name, "HS");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "merge:\n  max_gap_hours: 48\ngrid:\n  epsg: 4326\n";
        let config: DomainConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.merge.max_gap_hours, 48);
        assert_eq!(config.merge.max_failed_fraction, 0.1);
        assert_eq!(config.grid.epsg, 4326);
        assert_eq!(config.grid.fill_value, -9999.0);
        assert_eq!(config.variables.len(), 4);
    }

    #[test]
    fn test_load_resolves_paths_and_name() {
        let dir = TempDir::new().unwrap();
        let domain = dir.path().join("D2000");
        std::fs::create_dir_all(&domain).unwrap();

        let config = DomainConfig::load(&domain, None).unwrap();
        assert_eq!(config.name, "D2000");
        assert_eq!(config.paths.archive_dir, domain.join("sim_archive/outputs"));
        assert_eq!(config.paths.landform, domain.join("outputs/landform.tif"));
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = DomainConfig::default();
        config.variables[1] = config.variables[1].clone().with_scale(0.001);
        config.to_yaml(&path).unwrap();

        let loaded = DomainConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded.variables, config.variables);
    }

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let mut config = DomainConfig::default();
        config.merge.max_failed_fraction = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_domain_dir() {
        let result = DomainConfig::load(Path::new("/nonexistent/domain"), None);
        assert!(matches!(result, Err(ConfigError::DomainNotFound(_))));
    }
}
