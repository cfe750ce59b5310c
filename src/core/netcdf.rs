//! NetCDF-4 output of gridded variables.
//!
//! Layout of one file:
//!
//! ```text
//! dimensions: time (unlimited), y, x
//! variables:  time(time)      f64  seconds since 1970-01-01 00:00:00
//!             y(y), x(x)      f64  pixel-centre map coordinates
//!             crs             i32  epsg_code, spatial_ref, GeoTransform
//!             <NAME>(time,y,x) f32 units, long_name, _FillValue, grid_mapping
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};

use super::grid::{Crs, GeoTransform, Grid2};
use super::sink::{GridSink, SinkError, VariableMeta};

pub const TIME_UNITS: &str = "seconds since 1970-01-01 00:00:00";

/// Streams one variable into `<path>.partial`, renamed on [`GridSink::finish`].
pub struct NetcdfSink {
    file: netcdf::FileMut,
    name: String,
    shape: (usize, usize),
    partial: PathBuf,
    path: PathBuf,
    time_index: usize,
}

impl NetcdfSink {
    /// Creates the partial file with dimensions, coordinates and metadata.
    pub fn create(meta: &VariableMeta) -> Result<Self, SinkError> {
        let partial = meta.partial_path();
        if let Some(parent) = partial.parent() {
            fs::create_dir_all(parent).map_err(|e| SinkError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        remove_if_exists(&partial)?;

        let (rows, cols) = meta.shape;
        let mut file = netcdf::create(&partial)?;

        file.add_unlimited_dimension("time")?;
        file.add_dimension("y", rows)?;
        file.add_dimension("x", cols)?;

        {
            let mut time_var = file.add_variable::<f64>("time", &["time"])?;
            time_var.put_attribute("standard_name", "time")?;
            time_var.put_attribute("units", TIME_UNITS)?;
            time_var.put_attribute("calendar", "standard")?;
        }

        {
            let mut y_var = file.add_variable::<f64>("y", &["y"])?;
            y_var.put_attribute("standard_name", "projection_y_coordinate")?;
            y_var.put_attribute("units", "m")?;
            y_var.put_values(&meta.transform.y_coords(rows), ..)?;
        }

        {
            let mut x_var = file.add_variable::<f64>("x", &["x"])?;
            x_var.put_attribute("standard_name", "projection_x_coordinate")?;
            x_var.put_attribute("units", "m")?;
            x_var.put_values(&meta.transform.x_coords(cols), ..)?;
        }

        {
            let mut crs_var = file.add_variable::<i32>("crs", &[])?;
            crs_var.put_attribute("epsg_code", meta.crs.to_string().as_str())?;
            crs_var.put_attribute("spatial_ref", meta.crs.to_string().as_str())?;
            crs_var.put_attribute("GeoTransform", meta.transform.to_string().as_str())?;
        }

        {
            let mut data_var = file.add_variable::<f32>(&meta.name, &["time", "y", "x"])?;
            let (chunk_rows, chunk_cols) = meta.chunk;
            data_var.set_chunking(&[1, chunk_rows.clamp(1, rows.max(1)), chunk_cols.clamp(1, cols.max(1))])?;
            if meta.compression_level > 0 {
                data_var.set_compression(i32::from(meta.compression_level.min(9)), true)?;
            }
            data_var.put_attribute("_FillValue", meta.fill_value)?;
            data_var.put_attribute("units", meta.units.as_str())?;
            data_var.put_attribute("long_name", meta.long_name.as_str())?;
            data_var.put_attribute("grid_mapping", "crs")?;
        }

        file.add_attribute("Conventions", "CF-1.8")?;
        file.add_attribute(
            "history",
            format!("{}: Created by snowmapper", Utc::now().format("%Y-%m-%d %H:%M:%S UTC")).as_str(),
        )?;

        log::debug!("Opened {}", partial.display());

        Ok(Self {
            file,
            name: meta.name.clone(),
            shape: meta.shape,
            partial,
            path: meta.path.clone(),
            time_index: 0,
        })
    }

    /// Number of timesteps written so far.
    pub fn n_timesteps(&self) -> usize {
        self.time_index
    }
}

impl GridSink for NetcdfSink {
    fn append(&mut self, time: NaiveDateTime, grid: &Grid2) -> Result<(), SinkError> {
        if grid.shape() != self.shape {
            return Err(SinkError::Format(format!(
                "grid shape {:?} does not match file shape {:?}",
                grid.shape(),
                self.shape
            )));
        }
        let t_idx = self.time_index;

        {
            let mut time_var = self
                .file
                .variable_mut("time")
                .ok_or_else(|| SinkError::Format("missing variable 'time'".to_string()))?;
            time_var.put_value(time.and_utc().timestamp() as f64, [t_idx])?;
        }

        {
            let mut data_var = self
                .file
                .variable_mut(&self.name)
                .ok_or_else(|| SinkError::Format(format!("missing variable '{}'", self.name)))?;
            data_var.put_values(grid.as_slice(), (t_idx, .., ..))?;
        }

        self.time_index += 1;
        Ok(())
    }

    fn finish(self) -> Result<PathBuf, SinkError> {
        let NetcdfSink {
            file,
            partial,
            path,
            time_index,
            ..
        } = self;
        // Closing flushes the file
        drop(file);
        fs::rename(&partial, &path).map_err(|e| SinkError::Io {
            path: path.clone(),
            source: e,
        })?;
        log::debug!("Wrote {} ({} timesteps)", path.display(), time_index);
        Ok(path)
    }

    fn abort(self) {
        let NetcdfSink { file, partial, .. } = self;
        drop(file);
        if let Err(e) = fs::remove_file(&partial) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Could not remove {}: {}", partial.display(), e);
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<(), SinkError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SinkError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// A gridded variable read back into memory.
#[derive(Debug, Clone)]
pub struct GriddedVariable {
    pub name: String,
    pub units: Option<String>,
    pub long_name: Option<String>,
    pub fill_value: Option<f32>,
    pub times: Vec<NaiveDateTime>,
    pub y: Vec<f64>,
    pub x: Vec<f64>,
    pub crs: Option<Crs>,
    pub transform: Option<GeoTransform>,
    /// Row-major `(time, y, x)` values
    pub data: Vec<f32>,
}

impl GriddedVariable {
    /// `(time, y, x)` extents.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.times.len(), self.y.len(), self.x.len())
    }

    /// The 2-D grid at one time index.
    pub fn grid(&self, t: usize) -> Option<Grid2> {
        let (nt, ny, nx) = self.shape();
        if t >= nt {
            return None;
        }
        let n = ny * nx;
        Grid2::from_vec(ny, nx, self.data[t * n..(t + 1) * n].to_vec())
    }
}

/// Reads a whole variable written by [`NetcdfSink`].
pub fn read_gridded_variable<P: AsRef<Path>>(path: P, name: &str) -> Result<GriddedVariable, SinkError> {
    let file = netcdf::open(path.as_ref())?;

    let read_f64 = |var_name: &str| -> Result<Vec<f64>, SinkError> {
        let var = file
            .variable(var_name)
            .ok_or_else(|| SinkError::Format(format!("missing variable '{}'", var_name)))?;
        Ok(var.get_values::<f64, _>(..)?)
    };

    let times = read_f64("time")?
        .into_iter()
        .map(|secs| {
            DateTime::from_timestamp(secs as i64, 0)
                .map(|d| d.naive_utc())
                .ok_or_else(|| SinkError::Format(format!("time {} out of range", secs)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let y = read_f64("y")?;
    let x = read_f64("x")?;

    let (crs, transform) = match file.variable("crs") {
        Some(var) => (
            attr_string(&var, "epsg_code").and_then(|s| Crs::parse(&s)),
            attr_string(&var, "GeoTransform").and_then(|s| GeoTransform::parse(&s).ok()),
        ),
        None => (None, None),
    };

    let var = file
        .variable(name)
        .ok_or_else(|| SinkError::Format(format!("missing variable '{}'", name)))?;
    let data: Vec<f32> = var.get_values::<f32, _>(..)?;
    let fill_value = var
        .attribute_value("_FillValue")
        .and_then(|r| r.ok())
        .and_then(|v| match v {
            netcdf::AttributeValue::Float(f) => Some(f),
            netcdf::AttributeValue::Double(d) => Some(d as f32),
            _ => None,
        });

    Ok(GriddedVariable {
        name: name.to_string(),
        units: attr_string(&var, "units"),
        long_name: attr_string(&var, "long_name"),
        fill_value,
        times,
        y,
        x,
        crs,
        transform,
        data,
    })
}

fn attr_string(var: &netcdf::Variable, name: &str) -> Option<String> {
    var.attribute_value(name)
        .and_then(|r| r.ok())
        .and_then(|v| match v {
            netcdf::AttributeValue::Str(s) => Some(s),
            _ => None,
        })
}
