//! Raster types: 2-D grids, affine transforms and the cluster membership map.
//!
//! The cluster map is produced once per domain by the clustering step as a
//! GeoTIFF (`landform.tif`) whose pixel values are cluster ids. It is loaded
//! with the pure Rust `tiff` crate; the geotransform comes from the
//! ModelTiepoint and ModelPixelScale tags.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::path::Path;

use thiserror::Error;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

use super::series::ClusterId;

/// Cluster id stored for pixels outside the valid-data mask.
pub const NO_CLUSTER: ClusterId = ClusterId::MAX;

/// Errors that can occur while building or loading a cluster map.
#[derive(Debug, Error)]
pub enum GridMapError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TIFF error: {0}")]
    Tiff(String),

    #[error("missing geotransform: {0}")]
    MissingGeotransform(String),

    #[error("cell count {cells} does not match shape {rows}x{cols}")]
    ShapeMismatch { rows: usize, cols: usize, cells: usize },

    #[error("invalid GeoTransform '{0}'")]
    InvalidTransform(String),
}

impl From<tiff::TiffError> for GridMapError {
    fn from(e: tiff::TiffError) -> Self {
        GridMapError::Tiff(e.to_string())
    }
}

/// Row-major 2-D grid of `f32` values, shape `(rows, cols)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid2 {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Grid2 {
    /// Grid of `rows * cols` cells set to `value`.
    pub fn filled(rows: usize, cols: usize, value: f32) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Wraps row-major data. Returns `None` if the length does not match.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Option<Self> {
        (data.len() == rows * cols).then_some(Self { rows, cols, data })
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Size of the cell buffer in bytes.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// Affine pixel-to-map transform in GDAL order.
///
/// `x = x_origin + col * pixel_width + row * row_rotation`
/// `y = y_origin + col * col_rotation + row * pixel_height`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub x_origin: f64,
    pub pixel_width: f64,
    pub row_rotation: f64,
    pub y_origin: f64,
    pub col_rotation: f64,
    /// Negative for north-up rasters
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform from the upper-left corner and the pixel size.
    pub fn north_up(x_origin: f64, y_origin: f64, pixel_size_x: f64, pixel_size_y: f64) -> Self {
        Self {
            x_origin,
            pixel_width: pixel_size_x,
            row_rotation: 0.0,
            y_origin,
            col_rotation: 0.0,
            pixel_height: -pixel_size_y.abs(),
        }
    }

    /// The six GDAL coefficients.
    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.x_origin,
            self.pixel_width,
            self.row_rotation,
            self.y_origin,
            self.col_rotation,
            self.pixel_height,
        ]
    }

    pub fn from_gdal(c: [f64; 6]) -> Self {
        Self {
            x_origin: c[0],
            pixel_width: c[1],
            row_rotation: c[2],
            y_origin: c[3],
            col_rotation: c[4],
            pixel_height: c[5],
        }
    }

    /// Parses the space separated form written by [`fmt::Display`].
    pub fn parse(s: &str) -> Result<Self, GridMapError> {
        let coeffs: Vec<f64> = s
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| GridMapError::InvalidTransform(s.to_string()))?;
        let coeffs: [f64; 6] = coeffs
            .try_into()
            .map_err(|_| GridMapError::InvalidTransform(s.to_string()))?;
        Ok(Self::from_gdal(coeffs))
    }

    /// Map coordinates of a pixel centre.
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.x_origin + c * self.pixel_width + r * self.row_rotation,
            self.y_origin + c * self.col_rotation + r * self.pixel_height,
        )
    }

    /// Pixel-centre x coordinates of a non-rotated grid.
    pub fn x_coords(&self, cols: usize) -> Vec<f64> {
        (0..cols)
            .map(|c| self.x_origin + (c as f64 + 0.5) * self.pixel_width)
            .collect()
    }

    /// Pixel-centre y coordinates of a non-rotated grid.
    pub fn y_coords(&self, rows: usize) -> Vec<f64> {
        (0..rows)
            .map(|r| self.y_origin + (r as f64 + 0.5) * self.pixel_height)
            .collect()
    }
}

impl fmt::Display for GeoTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.to_gdal();
        write!(f, "{} {} {} {} {} {}", c[0], c[1], c[2], c[3], c[4], c[5])
    }
}

/// Coordinate reference system identified by its EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Crs {
    pub epsg: u32,
}

impl Crs {
    pub fn from_epsg(epsg: u32) -> Self {
        Self { epsg }
    }

    /// Parses `EPSG:32642` (case-insensitive) or a bare code.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let code = match s.get(..5) {
            Some(prefix) if prefix.eq_ignore_ascii_case("epsg:") => &s[5..],
            _ => s,
        };
        code.parse().ok().map(Self::from_epsg)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg)
    }
}

/// Immutable mapping from grid cell to cluster id.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterGridMap {
    rows: usize,
    cols: usize,
    transform: GeoTransform,
    crs: Crs,
    /// Row-major cluster ids, [`NO_CLUSTER`] outside the valid mask
    cells: Vec<ClusterId>,
}

impl ClusterGridMap {
    /// Builds a map from row-major cluster ids.
    pub fn new(
        rows: usize,
        cols: usize,
        transform: GeoTransform,
        crs: Crs,
        cells: Vec<ClusterId>,
    ) -> Result<Self, GridMapError> {
        if cells.len() != rows * cols {
            return Err(GridMapError::ShapeMismatch {
                rows,
                cols,
                cells: cells.len(),
            });
        }
        Ok(Self {
            rows,
            cols,
            transform,
            crs,
            cells,
        })
    }

    /// Loads the clustering step's landform raster.
    ///
    /// Pixel values are cluster ids. Non-finite values, negative values and
    /// values equal to the no-data value become [`NO_CLUSTER`]. `nodata`
    /// overrides the GDAL no-data tag when given.
    pub fn from_geotiff<P: AsRef<Path>>(path: P, crs: Crs, nodata: Option<f64>) -> Result<Self, GridMapError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| GridMapError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut decoder = Decoder::new(file)?;
        let (width, height) = decoder.dimensions()?;

        let pixel_scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok();
        let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok();

        // ModelTiepoint: [I, J, K, X, Y, Z], ModelPixelScale: [ScaleX, ScaleY, ScaleZ]
        let transform = match (pixel_scale, tiepoint) {
            (Some(scale), Some(tie)) if scale.len() >= 2 && tie.len() >= 6 => {
                let x0 = tie[3] - tie[0] * scale[0];
                let y0 = tie[4] + tie[1] * scale[1];
                GeoTransform::north_up(x0, y0, scale[0], scale[1])
            }
            _ => {
                return Err(GridMapError::MissingGeotransform(format!(
                    "{} lacks ModelTiepoint/ModelPixelScale tags",
                    path.display()
                )))
            }
        };

        let nodata = nodata.or_else(|| {
            decoder
                .get_tag_ascii_string(Tag::GdalNodata)
                .ok()
                .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok())
        });

        let raw: Vec<f64> = match decoder.read_image()? {
            DecodingResult::U8(data) => data.into_iter().map(f64::from).collect(),
            DecodingResult::U16(data) => data.into_iter().map(f64::from).collect(),
            DecodingResult::U32(data) => data.into_iter().map(f64::from).collect(),
            DecodingResult::U64(data) => data.into_iter().map(|v| v as f64).collect(),
            DecodingResult::I8(data) => data.into_iter().map(f64::from).collect(),
            DecodingResult::I16(data) => data.into_iter().map(f64::from).collect(),
            DecodingResult::I32(data) => data.into_iter().map(f64::from).collect(),
            DecodingResult::I64(data) => data.into_iter().map(|v| v as f64).collect(),
            DecodingResult::F32(data) => data.into_iter().map(f64::from).collect(),
            DecodingResult::F64(data) => data,
        };

        let cells = raw
            .into_iter()
            .map(|v| cell_to_cluster(v, nodata))
            .collect();

        let map = Self::new(height as usize, width as usize, transform, crs, cells)?;
        log::debug!(
            "Loaded cluster map {} ({}x{}, {} clusters)",
            path.display(),
            map.rows,
            map.cols,
            map.cluster_ids().len()
        );
        Ok(map)
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    #[inline]
    pub fn crs(&self) -> Crs {
        self.crs
    }

    #[inline]
    pub fn cells(&self) -> &[ClusterId] {
        &self.cells
    }

    /// Cluster id of a pixel, `None` outside the valid mask.
    pub fn cluster_at(&self, row: usize, col: usize) -> Option<ClusterId> {
        match self.cells[row * self.cols + col] {
            NO_CLUSTER => None,
            id => Some(id),
        }
    }

    /// Distinct cluster ids referenced by valid pixels.
    pub fn cluster_ids(&self) -> BTreeSet<ClusterId> {
        self.cells.iter().copied().filter(|&id| id != NO_CLUSTER).collect()
    }
}

fn cell_to_cluster(value: f64, nodata: Option<f64>) -> ClusterId {
    if !value.is_finite() || value < 0.0 || value >= NO_CLUSTER as f64 {
        return NO_CLUSTER;
    }
    if let Some(nd) = nodata {
        if value == nd {
            return NO_CLUSTER;
        }
    }
    value.round() as ClusterId
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tiff::encoder::{colortype, TiffEncoder};

    fn small_map() -> ClusterGridMap {
        ClusterGridMap::new(
            2,
            3,
            GeoTransform::north_up(500_000.0, 4_200_000.0, 500.0, 500.0),
            Crs::from_epsg(32642),
            vec![1, 2, 3, NO_CLUSTER, 2, 1],
        )
        .unwrap()
    }

    #[test]
    fn test_grid2_basics() {
        let mut grid = Grid2::filled(2, 3, 0.0);
        grid.as_mut_slice()[4] = 5.0;
        assert_eq!(grid.shape(), (2, 3));
        assert_eq!(grid.get(1, 1), 5.0);
        assert_eq!(grid.byte_size(), 24);
        assert!(Grid2::from_vec(2, 2, vec![0.0; 3]).is_none());
    }

    #[test]
    fn test_geotransform_coords() {
        let t = GeoTransform::north_up(100.0, 200.0, 10.0, 10.0);
        assert_eq!(t.x_coords(2), vec![105.0, 115.0]);
        assert_eq!(t.y_coords(2), vec![195.0, 185.0]);
        assert_eq!(t.pixel_center(1, 0), (105.0, 185.0));
    }

    #[test]
    fn test_geotransform_display_parse() {
        let t = GeoTransform::north_up(500000.0, 4200000.0, 30.0, 30.0);
        let parsed = GeoTransform::parse(&t.to_string()).unwrap();
        assert_eq!(parsed, t);
        assert!(GeoTransform::parse("1 2 3").is_err());
    }

    #[test]
    fn test_crs_parse() {
        assert_eq!(Crs::parse("EPSG:32642"), Some(Crs::from_epsg(32642)));
        assert_eq!(Crs::parse("epsg:4326"), Some(Crs::from_epsg(4326)));
        assert_eq!(Crs::parse("4326"), Some(Crs::from_epsg(4326)));
        assert_eq!(Crs::parse("WGS84"), None);
        assert_eq!(Crs::from_epsg(32642).to_string(), "EPSG:32642");
    }

    #[test]
    fn test_cluster_map_queries() {
        let map = small_map();
        assert_eq!(map.shape(), (2, 3));
        assert_eq!(map.cluster_at(0, 1), Some(2));
        assert_eq!(map.cluster_at(1, 0), None);
        assert_eq!(map.cluster_ids().into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_cluster_map_shape_mismatch() {
        let result = ClusterGridMap::new(
            2,
            2,
            GeoTransform::north_up(0.0, 0.0, 1.0, 1.0),
            Crs::from_epsg(4326),
            vec![0; 3],
        );
        assert!(matches!(result, Err(GridMapError::ShapeMismatch { cells: 3, .. })));
    }

    #[test]
    fn test_cell_to_cluster() {
        assert_eq!(cell_to_cluster(4.0, None), 4);
        assert_eq!(cell_to_cluster(-9999.0, None), NO_CLUSTER);
        assert_eq!(cell_to_cluster(f64::NAN, None), NO_CLUSTER);
        assert_eq!(cell_to_cluster(255.0, Some(255.0)), NO_CLUSTER);
    }

    #[test]
    fn test_from_geotiff() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("landform.tif");
        {
            let file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(file).unwrap();
            let mut image = encoder.new_image::<colortype::Gray32Float>(3, 2).unwrap();
            image
                .encoder()
                .write_tag(Tag::ModelPixelScaleTag, &[500.0f64, 500.0, 0.0][..])
                .unwrap();
            image
                .encoder()
                .write_tag(
                    Tag::ModelTiepointTag,
                    &[0.0f64, 0.0, 0.0, 500_000.0, 4_200_000.0, 0.0][..],
                )
                .unwrap();
            image
                .write_data(&[0.0f32, 1.0, 2.0, -9999.0, 1.0, f32::NAN])
                .unwrap();
        }

        let map = ClusterGridMap::from_geotiff(&path, Crs::from_epsg(32642), None).unwrap();
        assert_eq!(map.shape(), (2, 3));
        assert_eq!(map.cells(), &[0, 1, 2, NO_CLUSTER, 1, NO_CLUSTER]);
        assert_eq!(map.transform().x_origin, 500_000.0);
        assert_eq!(map.transform().pixel_height, -500.0);
        assert_eq!(map.crs().epsg, 32642);
    }

    #[test]
    fn test_from_geotiff_gdal_nodata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("landform.tif");
        {
            let file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(file).unwrap();
            let mut image = encoder.new_image::<colortype::Gray8>(2, 2).unwrap();
            image
                .encoder()
                .write_tag(Tag::ModelPixelScaleTag, &[30.0f64, 30.0, 0.0][..])
                .unwrap();
            image
                .encoder()
                .write_tag(Tag::ModelTiepointTag, &[0.0f64, 0.0, 0.0, 0.0, 900.0, 0.0][..])
                .unwrap();
            image.encoder().write_tag(Tag::GdalNodata, "255").unwrap();
            image.write_data(&[3u8, 255, 0, 3]).unwrap();
        }

        let map = ClusterGridMap::from_geotiff(&path, Crs::from_epsg(32642), None).unwrap();
        assert_eq!(map.cells(), &[3, NO_CLUSTER, 0, 3]);
        assert_eq!(map.transform().pixel_width, 30.0);

        // An explicit no-data value overrides the tag
        let map = ClusterGridMap::from_geotiff(&path, Crs::from_epsg(32642), Some(0.0)).unwrap();
        assert_eq!(map.cells(), &[3, 255, NO_CLUSTER, 3]);
    }

    #[test]
    fn test_from_geotiff_missing_file() {
        let result = ClusterGridMap::from_geotiff("/nonexistent/landform.tif", Crs::from_epsg(4326), None);
        assert!(matches!(result, Err(GridMapError::Io { .. })));
    }
}
