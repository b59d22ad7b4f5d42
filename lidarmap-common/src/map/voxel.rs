use crate::geometry::points::LidarPoint;
use nalgebra::{Point3, Vector3};
use std::collections::BTreeMap;

#[derive(Default)]
struct LeafAccumulator {
    position_sum: Vector3<f64>,
    intensity_sum: f64,
    curvature_sum: f64,
    count: usize,
}

/// Leaf-size grid filter: partitions space into axis-aligned cubes of edge
/// `leaf_size` and emits one point per occupied cube, the centroid of the
/// input points falling into it.
///
/// Output order is the leaf cell order, so identical inputs always produce
/// identical clouds.
#[derive(Debug, Clone, Copy)]
pub struct VoxelFilter {
    leaf_size: f64,
}

impl VoxelFilter {
    pub fn new(leaf_size: f64) -> Self {
        VoxelFilter { leaf_size }
    }

    pub fn leaf_size(&self) -> f64 {
        self.leaf_size
    }

    fn cell(&self, position: &Point3<f64>) -> (i64, i64, i64) {
        (
            (position.x / self.leaf_size).floor() as i64,
            (position.y / self.leaf_size).floor() as i64,
            (position.z / self.leaf_size).floor() as i64,
        )
    }

    pub fn filter(&self, points: &[LidarPoint]) -> Vec<LidarPoint> {
        let mut leaves: BTreeMap<(i64, i64, i64), LeafAccumulator> = BTreeMap::new();
        for point in points {
            let leaf = leaves.entry(self.cell(&point.position)).or_default();
            leaf.position_sum += point.position.coords;
            leaf.intensity_sum += point.intensity as f64;
            leaf.curvature_sum += point.curvature as f64;
            leaf.count += 1;
        }
        leaves
            .into_values()
            .map(|leaf| {
                let n = leaf.count as f64;
                LidarPoint {
                    position: Point3::from(leaf.position_sum / n),
                    intensity: (leaf.intensity_sum / n) as f32,
                    curvature: (leaf.curvature_sum / n) as f32,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn one_centroid_per_occupied_leaf() {
        let filter = VoxelFilter::new(1.0);
        let points = vec![
            LidarPoint::new(0.2, 0.2, 0.2, 10.0, 1.0),
            LidarPoint::new(0.8, 0.8, 0.8, 20.0, 3.0),
            LidarPoint::new(2.5, 0.5, 0.5, 5.0, 0.0),
        ];
        let filtered = filter.filter(&points);
        assert_eq!(filtered.len(), 2);
        let merged = filtered
            .iter()
            .find(|p| p.position.x < 1.0)
            .expect("leaf at origin");
        assert_relative_eq!(merged.position, Point3::new(0.5, 0.5, 0.5), epsilon = 1e-12);
        assert_relative_eq!(merged.intensity, 15.0);
        assert_relative_eq!(merged.curvature, 2.0);
    }

    #[test]
    fn negative_coordinates_use_their_own_leaf() {
        let filter = VoxelFilter::new(1.0);
        let points = vec![
            LidarPoint::new(-0.1, 0.0, 0.0, 0.0, 0.0),
            LidarPoint::new(0.1, 0.0, 0.0, 0.0, 0.0),
        ];
        assert_eq!(filter.filter(&points).len(), 2);
    }

    #[test]
    fn filtering_is_idempotent() {
        let filter = VoxelFilter::new(0.4);
        let points: Vec<LidarPoint> = (0..100)
            .map(|i| {
                let t = i as f64 * 0.11;
                LidarPoint::new(t.sin() * 3.0, t.cos() * 3.0, t * 0.1, 1.0, 2.0)
            })
            .collect();
        let once = filter.filter(&points);
        let twice = filter.filter(&once);
        assert_eq!(once, twice);
    }
}
