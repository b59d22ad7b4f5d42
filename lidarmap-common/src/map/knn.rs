use crate::geometry::points::LidarPoint;
use kdtree::distance::squared_euclidean;
use kdtree::KdTree;
use nalgebra::Point3;

/// Ephemeral k-nearest index over one frame's assembled map subset.
///
/// Rebuilt from scratch whenever the underlying point set changes; the
/// registration driver constructs two of these per frame (corner, surface).
pub struct NeighborIndex {
    tree: KdTree<f64, usize, [f64; 3]>,
    len: usize,
}

impl NeighborIndex {
    pub fn build(points: &[LidarPoint]) -> Self {
        let mut tree = KdTree::new(3);
        let mut len = 0;
        for (index, point) in points.iter().enumerate() {
            let coords = [point.position.x, point.position.y, point.position.z];
            // non-finite coordinates are not indexable
            if tree.add(coords, index).is_ok() {
                len += 1;
            }
        }
        NeighborIndex { tree, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The up-to-`k` nearest indexed points, as `(squared_distance, index)`
    /// pairs sorted by ascending distance. Returns fewer than `k` pairs when
    /// the index is small, and nothing for a non-finite query.
    pub fn nearest(&self, query: &Point3<f64>, k: usize) -> Vec<(f64, usize)> {
        let coords = [query.x, query.y, query.z];
        if coords.iter().any(|coordinate| !coordinate.is_finite()) {
            return Vec::new();
        }
        self.tree
            .nearest(&coords, k, &squared_euclidean)
            .map(|found| {
                found
                    .into_iter()
                    .map(|(distance, &index)| (distance, index))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud(coords: &[(f64, f64, f64)]) -> Vec<LidarPoint> {
        coords
            .iter()
            .map(|&(x, y, z)| LidarPoint::new(x, y, z, 0.0, 0.0))
            .collect()
    }

    #[test]
    fn nearest_returns_sorted_squared_distances() {
        let points = cloud(&[(0.0, 0.0, 0.0), (1.0, 0.0, 0.0), (3.0, 0.0, 0.0)]);
        let index = NeighborIndex::build(&points);
        let found = index.nearest(&Point3::new(0.9, 0.0, 0.0), 2);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1, 1);
        assert_eq!(found[1].1, 0);
        assert!(found[0].0 <= found[1].0);
    }

    #[test]
    fn small_index_returns_fewer_than_k() {
        let points = cloud(&[(0.0, 0.0, 0.0), (1.0, 1.0, 1.0)]);
        let index = NeighborIndex::build(&points);
        assert_eq!(index.nearest(&Point3::new(0.0, 0.0, 0.0), 5).len(), 2);
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = NeighborIndex::build(&[]);
        assert!(index.is_empty());
        assert!(index.nearest(&Point3::new(0.0, 0.0, 0.0), 5).is_empty());
    }

    #[test]
    fn non_finite_points_are_skipped() {
        let mut points = cloud(&[(0.0, 0.0, 0.0)]);
        points.push(LidarPoint::new(f64::NAN, 0.0, 0.0, 0.0, 0.0));
        let index = NeighborIndex::build(&points);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn non_finite_queries_return_nothing() {
        let points = cloud(&[(0.0, 0.0, 0.0), (1.0, 0.0, 0.0)]);
        let index = NeighborIndex::build(&points);
        assert!(index
            .nearest(&Point3::new(f64::NAN, 0.0, 0.0), 2)
            .is_empty());
        assert!(index
            .nearest(&Point3::new(0.0, f64::INFINITY, 0.0), 2)
            .is_empty());
        assert!(index
            .nearest(&Point3::new(0.0, 0.0, f64::NEG_INFINITY), 2)
            .is_empty());
    }
}
