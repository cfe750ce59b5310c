//! Broadcasting of per-cluster values onto the domain grid.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use crate::core::grid::{ClusterGridMap, Grid2, NO_CLUSTER};
use crate::core::series::ClusterId;

#[derive(Debug, Error)]
pub enum MapperError {
    #[error(
        "cluster map ids ({} clusters, {}..={}) share no id with the {} requested clusters",
        map_count, map_min, map_max, requested
    )]
    GridMapMismatch {
        map_count: usize,
        map_min: ClusterId,
        map_max: ClusterId,
        requested: usize,
    },
}

/// Maps cluster values to pixels through a shared [`ClusterGridMap`].
///
/// The mapper holds no per-timestep state: every [`broadcast`] builds its
/// output from the values it is given and the fill value only.
///
/// [`broadcast`]: ClusterGridMapper::broadcast
#[derive(Debug, Clone)]
pub struct ClusterGridMapper {
    map: Arc<ClusterGridMap>,
    /// Sorted distinct ids referenced by the map
    ids: Vec<ClusterId>,
    /// Index into `ids` for every cell, `NO_SLOT` outside the mask
    slots: Vec<u32>,
}

const NO_SLOT: u32 = u32::MAX;

impl ClusterGridMapper {
    /// Builds a mapper for the clusters in `intended`.
    ///
    /// Fails with [`MapperError::GridMapMismatch`] when the map references
    /// none of them. A partial overlap only logs a warning: clusters missing
    /// from the map are never drawn, pixels of clusters missing from
    /// `intended` get the fill value.
    pub fn new(map: Arc<ClusterGridMap>, intended: &BTreeSet<ClusterId>) -> Result<Self, MapperError> {
        let map_ids = map.cluster_ids();
        let overlap = map_ids.intersection(intended).count();

        if overlap == 0 {
            return Err(MapperError::GridMapMismatch {
                map_count: map_ids.len(),
                map_min: map_ids.first().copied().unwrap_or(0),
                map_max: map_ids.last().copied().unwrap_or(0),
                requested: intended.len(),
            });
        }

        let not_in_map = intended.len() - overlap;
        let not_intended = map_ids.len() - overlap;
        if not_in_map > 0 || not_intended > 0 {
            log::warn!(
                "Cluster map and cluster list differ: {} clusters without pixels, {} mapped clusters without data",
                not_in_map,
                not_intended
            );
        }

        let ids: Vec<ClusterId> = map_ids.into_iter().collect();
        let slots = map
            .cells()
            .iter()
            .map(|&id| match id {
                NO_CLUSTER => NO_SLOT,
                id => ids.binary_search(&id).map_or(NO_SLOT, |slot| slot as u32),
            })
            .collect();

        Ok(Self { map, ids, slots })
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        self.map.shape()
    }

    #[inline]
    pub fn map(&self) -> &Arc<ClusterGridMap> {
        &self.map
    }

    /// Fills a grid from one value per cluster.
    ///
    /// Pixels outside the valid mask, or whose cluster has no entry in
    /// `values`, get `fill`.
    pub fn broadcast(&self, values: &BTreeMap<ClusterId, f32>, fill: f32) -> Grid2 {
        let (rows, cols) = self.map.shape();

        // One entry per mapped cluster, whatever the magnitude of its id
        let mut lut = vec![fill; self.ids.len()];
        for (&id, &v) in values {
            if let Ok(slot) = self.ids.binary_search(&id) {
                lut[slot] = v;
            }
        }

        let data = self
            .slots
            .iter()
            .map(|&slot| match slot {
                NO_SLOT => fill,
                slot => lut[slot as usize],
            })
            .collect();

        // cells().len() == rows * cols is a ClusterGridMap invariant
        Grid2::from_vec(rows, cols, data).unwrap_or_else(|| Grid2::filled(rows, cols, fill))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::grid::{Crs, GeoTransform};

    fn map_2x2(cells: Vec<ClusterId>) -> Arc<ClusterGridMap> {
        Arc::new(
            ClusterGridMap::new(
                2,
                2,
                GeoTransform::north_up(0.0, 0.0, 1.0, 1.0),
                Crs::from_epsg(32642),
                cells,
            )
            .unwrap(),
        )
    }

    fn ids(v: &[ClusterId]) -> BTreeSet<ClusterId> {
        v.iter().copied().collect()
    }

    #[test]
    fn test_broadcast_values() {
        let mapper = ClusterGridMapper::new(map_2x2(vec![0, 1, 1, NO_CLUSTER]), &ids(&[0, 1])).unwrap();
        let values = BTreeMap::from([(0, 2.5f32), (1, 7.0)]);
        let grid = mapper.broadcast(&values, -9999.0);
        assert_eq!(grid.as_slice(), &[2.5, 7.0, 7.0, -9999.0]);
    }

    #[test]
    fn test_missing_cluster_gets_fill() {
        // Map has clusters {1, 2, 3}, merged data only {1, 3}
        let mapper = ClusterGridMapper::new(map_2x2(vec![1, 2, 3, 1]), &ids(&[1, 3])).unwrap();
        let values = BTreeMap::from([(1, 0.5f32), (3, 1.5)]);
        let grid = mapper.broadcast(&values, f32::NAN);

        assert_eq!(grid.get(0, 0), 0.5);
        assert!(grid.get(0, 1).is_nan());
        assert_eq!(grid.get(1, 0), 1.5);
        assert_eq!(grid.get(1, 1), 0.5);
    }

    #[test]
    fn test_broadcast_is_pure() {
        let mapper = ClusterGridMapper::new(map_2x2(vec![1, 2, 1, 2]), &ids(&[1, 2])).unwrap();
        let first = mapper.broadcast(&BTreeMap::from([(1, 1.0f32), (2, 2.0)]), -1.0);
        let second = mapper.broadcast(&BTreeMap::from([(1, 3.0f32)]), -1.0);
        let again = mapper.broadcast(&BTreeMap::from([(1, 1.0f32), (2, 2.0)]), -1.0);

        assert_eq!(second.as_slice(), &[3.0, -1.0, 3.0, -1.0]);
        assert_eq!(first, again);
    }

    #[test]
    fn test_values_for_unknown_clusters_ignored() {
        let mapper = ClusterGridMapper::new(map_2x2(vec![0, 0, 0, 0]), &ids(&[0, 99])).unwrap();
        let grid = mapper.broadcast(&BTreeMap::from([(0, 1.0f32), (99, 5.0)]), 0.0);
        assert_eq!(grid.as_slice(), &[1.0; 4]);
    }

    #[test]
    fn test_sparse_large_ids() {
        let mapper = ClusterGridMapper::new(
            map_2x2(vec![1_000_000_000, 3, NO_CLUSTER - 1, NO_CLUSTER]),
            &ids(&[3, 1_000_000_000]),
        )
        .unwrap();
        assert_eq!(mapper.ids.len(), 3);

        let values = BTreeMap::from([(3, 0.5f32), (1_000_000_000, 9.0), (NO_CLUSTER - 1, 4.0)]);
        let grid = mapper.broadcast(&values, -1.0);
        assert_eq!(grid.as_slice(), &[9.0, 0.5, 4.0, -1.0]);

        let grid = mapper.broadcast(&BTreeMap::from([(3, 2.0f32)]), -1.0);
        assert_eq!(grid.as_slice(), &[-1.0, 2.0, -1.0, -1.0]);
    }

    #[test]
    fn test_no_overlap_is_mismatch() {
        let result = ClusterGridMapper::new(map_2x2(vec![1, 2, 3, 4]), &ids(&[10, 11]));
        assert!(matches!(
            result,
            Err(MapperError::GridMapMismatch {
                map_count: 4,
                requested: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_all_nodata_map_is_mismatch() {
        let result = ClusterGridMapper::new(map_2x2(vec![NO_CLUSTER; 4]), &ids(&[1]));
        assert!(result.is_err());
    }
}
