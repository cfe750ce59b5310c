//! End-to-end run over a small domain directory laid out like a real one.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use snowmapper::config::DomainConfig;
use snowmapper::core::store::TimeSeriesStore;
use snowmapper::processors::{run_merge, ErrorKind, RunOptions};

fn day(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
}

/// FSM text output: `year month day hour swe snd rof gst`, one line per day.
fn write_fsm_text(path: &Path, start: NaiveDate, days: u32, swe0: f64) {
    let mut f = File::create(path).unwrap();
    for i in 0..days {
        let d = start + chrono::Duration::days(i as i64);
        writeln!(
            f,
            "{} {} {} 0 {} {} 0 270.5",
            d.format("%Y"),
            d.format("%-m"),
            d.format("%-d"),
            swe0 + i as f64,
            (swe0 + i as f64) / 100.0
        )
        .unwrap();
    }
}

fn write_landform(path: &Path, cols: u32, rows: u32, cells: &[f32]) {
    let file = File::create(path).unwrap();
    let mut encoder = TiffEncoder::new(file).unwrap();
    let mut image = encoder.new_image::<colortype::Gray32Float>(cols, rows).unwrap();
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &[100.0f64, 100.0, 0.0][..])
        .unwrap();
    image
        .encoder()
        .write_tag(Tag::ModelTiepointTag, &[0.0f64, 0.0, 0.0, 600_000.0, 4_500_000.0, 0.0][..])
        .unwrap();
    image.write_data(cells).unwrap();
}

/// Domain with clusters 0..3 in the archive and latest runs.
///
/// Cluster 2 stops long before latest starts, so its merge fails on the gap.
fn build_domain(root: &Path) {
    let archive = root.join("sim_archive/outputs");
    let latest = root.join("sim_latest/outputs");
    let outputs = root.join("outputs");
    for d in [&archive, &latest, &outputs] {
        fs::create_dir_all(d).unwrap();
    }

    let sep1 = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
    let nov25 = NaiveDate::from_ymd_opt(2024, 11, 25).unwrap();
    write_fsm_text(&archive.join("FSM_pt_00.txt"), sep1, 90, 0.0);
    write_fsm_text(&archive.join("FSM_pt_01.txt"), sep1, 90, 10.0);
    write_fsm_text(&archive.join("FSM_pt_02.txt"), sep1, 30, 20.0);
    for id in 0..3 {
        write_fsm_text(&latest.join(format!("FSM_pt_{:02}.txt", id)), nov25, 14, 500.0);
    }

    #[rustfmt::skip]
    let cells = [
        0.0, 0.0, 1.0,
        2.0, 1.0, -9999.0,
    ];
    write_landform(&outputs.join("landform.tif"), 3, 2, &cells);

    fs::write(
        root.join("snowmapper.yml"),
        "merge:\n  max_failed_fraction: 0.5\ngrid:\n  epsg: 32632\n  nodata: -9999.0\n",
    )
    .unwrap();
}

#[test]
fn merge_collects_gap_failure_and_writes_tables() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("alps");
    build_domain(&root);

    let config = DomainConfig::load(&root, None).unwrap();
    assert_eq!(config.name, "alps");
    assert_eq!(config.grid.epsg, 32632);

    let summary = run_merge(&config, &RunOptions::default()).unwrap();

    // One TemporalGap failure for cluster 2 per variable, every variable succeeds
    assert_eq!(summary.succeeded(), 4);
    assert_eq!(summary.failed(), 4);
    assert_eq!(summary.first_failure(), Some(ErrorKind::TemporalGap));

    let merged = TimeSeriesStore::new(&config.paths.merged_dir, &config.table);
    assert_eq!(merged.cluster_ids().unwrap(), vec![0, 1]);

    let swe = merged.read(&[0, 1], "swe").unwrap();
    let c0 = &swe[&0];
    assert_eq!(c0.start(), Some(day(2024, 9, 1)));
    assert_eq!(c0.end(), Some(day(2024, 12, 8)));
    assert!(c0.is_strictly_increasing());
    // Latest wins inside the overlap
    assert_eq!(c0.value_at(day(2024, 11, 25)), Some(500.0));
    assert_eq!(c0.value_at(day(2024, 11, 24)), Some(84.0));
}

#[test]
fn merge_rerun_is_byte_identical() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("alps");
    build_domain(&root);
    let config = DomainConfig::load(&root, None).unwrap();

    run_merge(&config, &RunOptions::default()).unwrap();
    let first = fs::read(config.paths.merged_dir.join("FSM_pt_01.csv")).unwrap();
    run_merge(&config, &RunOptions::default()).unwrap();
    let second = fs::read(config.paths.merged_dir.join("FSM_pt_01.csv")).unwrap();

    assert_eq!(first, second);
}

#[cfg(feature = "netcdf")]
#[test]
fn merge_then_grid_to_netcdf() {
    use snowmapper::core::netcdf::read_gridded_variable;
    use snowmapper::processors::run_grid;

    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("alps");
    build_domain(&root);
    let config = DomainConfig::load(&root, None).unwrap();

    run_merge(&config, &RunOptions::default()).unwrap();
    let summary = run_grid(&config, &RunOptions::default()).unwrap();
    assert_eq!(summary.failed(), 0);
    assert_eq!(summary.succeeded(), 4);

    let hs_path = root.join("outputs/alps_HS.nc");
    assert!(hs_path.is_file());
    assert!(!root.join("outputs/alps_HS.nc.partial").exists());

    let hs = read_gridded_variable(&hs_path, "HS").unwrap();
    assert_eq!(hs.shape(), (99, 2, 3));
    assert_eq!(hs.units.as_deref(), Some("m"));
    assert_eq!(hs.crs.map(|c| c.epsg), Some(32632));
    assert_eq!(hs.times.first().copied(), Some(day(2024, 9, 1)));
    assert_eq!(hs.times.last().copied(), Some(day(2024, 12, 8)));

    // Cluster 2 failed to merge and the last pixel is outside the mask
    let first = hs.grid(0).unwrap();
    let fill = config.grid.fill_value;
    assert_eq!(first.get(0, 0), 0.0);
    assert_eq!(first.get(0, 2), 0.1);
    assert_eq!(first.get(1, 0), fill);
    assert_eq!(first.get(1, 2), fill);
}
