use crate::geometry::pose::Pose;
use nalgebra::{Matrix3, SMatrix, SVector, SymmetricEigen, Vector3, Vector6};
use std::cmp::Ordering;

/// Neighbors drawn from the map per query point.
pub const NEIGHBOR_COUNT: usize = 5;

/// Gate on the worst of the five squared neighbor distances.
pub const MAX_NEIGHBOR_SQ_DIST: f64 = 1.0;

/// The neighborhood is a line iff the largest eigenvalue exceeds the
/// second-largest by this factor.
const LINE_EIGENVALUE_RATIO: f64 = 3.0;

/// Offset of the two synthetic anchor points along the fitted line.
const LINE_ANCHOR_OFFSET: f64 = 0.1;

/// A plane fit is rejected if any neighbor is further from it than this.
const PLANE_FIT_TOLERANCE: f64 = 0.2;

/// Huber loss scale applied to every residual.
pub const HUBER_SCALE: f64 = 0.1;

/// IRLS weight of the Huber loss at the given residual value.
pub fn huber_weight(residual: f64) -> f64 {
    let magnitude = residual.abs();
    if magnitude <= HUBER_SCALE {
        1.0
    } else {
        HUBER_SCALE / magnitude
    }
}

/// Distance of a transformed corner feature from a line fitted to its map
/// neighborhood. The query point is kept in the sensor frame; the anchors
/// are in the map frame.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeResidual {
    pub point: Vector3<f64>,
    pub anchor_a: Vector3<f64>,
    pub anchor_b: Vector3<f64>,
}

/// Signed distance of a transformed surface feature from a plane fitted to
/// its map neighborhood.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneResidual {
    pub point: Vector3<f64>,
    pub normal: Vector3<f64>,
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Residual {
    Edge(EdgeResidual),
    Plane(PlaneResidual),
}

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

impl Residual {
    /// Residual value and its gradient with respect to the pose tangent
    /// `[ω, t]`, where ω is a right-multiplicative rotation perturbation
    /// (`q ⊞ ω = q · exp(ω/2)`).
    pub fn evaluate(&self, pose: &Pose) -> (f64, Vector6<f64>) {
        match self {
            Residual::Edge(edge) => edge.evaluate(pose),
            Residual::Plane(plane) => plane.evaluate(pose),
        }
    }
}

impl EdgeResidual {
    fn evaluate(&self, pose: &Pose) -> (f64, Vector6<f64>) {
        let world = pose.rotation * self.point + pose.translation;
        let to_a = world - self.anchor_a;
        let to_b = world - self.anchor_b;
        let base = self.anchor_a - self.anchor_b;
        let cross = to_a.cross(&to_b);
        let base_norm = base.norm();
        let cross_norm = cross.norm();
        let value = cross_norm / base_norm;

        if cross_norm < 1e-12 {
            // exactly on the line; the distance gradient is undefined there
            return (value, Vector6::zeros());
        }
        let grad_world = base.cross(&cross) / (cross_norm * base_norm);
        (value, chain_to_tangent(&grad_world, &self.point, pose))
    }
}

impl PlaneResidual {
    fn evaluate(&self, pose: &Pose) -> (f64, Vector6<f64>) {
        let world = pose.rotation * self.point + pose.translation;
        let value = self.normal.dot(&world) + self.offset;
        (value, chain_to_tangent(&self.normal, &self.point, pose))
    }
}

/// Chains a gradient w.r.t. the world-frame point through the pose:
/// ∂p_w/∂t = I and ∂p_w/∂ω = −R·[p]ₓ for a right tangent perturbation.
fn chain_to_tangent(
    grad_world: &Vector3<f64>,
    point_sensor: &Vector3<f64>,
    pose: &Pose,
) -> Vector6<f64> {
    let grad_rotation = skew(point_sensor) * (pose.rotation.inverse() * grad_world);
    let mut gradient = Vector6::zeros();
    gradient.fixed_rows_mut::<3>(0).copy_from(&grad_rotation);
    gradient.fixed_rows_mut::<3>(3).copy_from(grad_world);
    gradient
}

/// Fits a line to the five map neighbors of a corner feature.
/// Returns None when the neighborhood is not sufficiently line-like.
pub fn fit_edge(point_sensor: &Vector3<f64>, neighbors: &[Vector3<f64>]) -> Option<EdgeResidual> {
    let mut mean = Vector3::zeros();
    for neighbor in neighbors {
        mean += *neighbor;
    }
    mean /= neighbors.len() as f64;
    let mut covariance = Matrix3::zeros();
    for neighbor in neighbors {
        let centered = neighbor - mean;
        covariance += centered * centered.transpose();
    }

    let eigen = SymmetricEigen::new(covariance);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[a]
            .partial_cmp(&eigen.eigenvalues[b])
            .unwrap_or(Ordering::Equal)
    });
    let second = eigen.eigenvalues[order[1]];
    let largest = eigen.eigenvalues[order[2]];
    if largest <= LINE_EIGENVALUE_RATIO * second {
        return None;
    }

    let direction = eigen.eigenvectors.column(order[2]).into_owned();
    Some(EdgeResidual {
        point: *point_sensor,
        anchor_a: mean + LINE_ANCHOR_OFFSET * direction,
        anchor_b: mean - LINE_ANCHOR_OFFSET * direction,
    })
}

/// Fits a plane `n·x + d = 0` to the five map neighbors of a surface
/// feature by solving `A·n = −1` in least squares. Returns None when any
/// neighbor lies too far off the fitted plane.
pub fn fit_plane(point_sensor: &Vector3<f64>, neighbors: &[Vector3<f64>]) -> Option<PlaneResidual> {
    let mut stacked = SMatrix::<f64, 5, 3>::zeros();
    for (row, neighbor) in neighbors.iter().enumerate().take(5) {
        stacked.set_row(row, &neighbor.transpose());
    }
    let rhs = SVector::<f64, 5>::repeat(-1.0);
    let normal = stacked.svd(true, true).solve(&rhs, 1e-12).ok()?;
    let offset = 1.0 / normal.norm();
    let normal = normal.normalize();

    for neighbor in neighbors {
        if (normal.dot(neighbor) + offset).abs() > PLANE_FIT_TOLERANCE {
            return None;
        }
    }
    Some(PlaneResidual {
        point: *point_sensor,
        normal,
        offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn boxplus(pose: &Pose, delta: &Vector6<f64>) -> Pose {
        Pose {
            rotation: pose.rotation
                * UnitQuaternion::from_scaled_axis(delta.fixed_rows::<3>(0).into_owned()),
            translation: pose.translation + delta.fixed_rows::<3>(3),
        }
    }

    fn numeric_gradient(residual: &Residual, pose: &Pose) -> Vector6<f64> {
        let step = 1e-7;
        let mut gradient = Vector6::zeros();
        for i in 0..6 {
            let mut forward = Vector6::zeros();
            forward[i] = step;
            let mut backward = Vector6::zeros();
            backward[i] = -step;
            let (plus, _) = residual.evaluate(&boxplus(pose, &forward));
            let (minus, _) = residual.evaluate(&boxplus(pose, &backward));
            gradient[i] = (plus - minus) / (2.0 * step);
        }
        gradient
    }

    #[test]
    fn edge_residual_is_the_point_to_line_distance() {
        let residual = Residual::Edge(EdgeResidual {
            point: Vector3::new(0.5, 2.0, 0.0),
            anchor_a: Vector3::new(0.1, 0.0, 0.0),
            anchor_b: Vector3::new(-0.1, 0.0, 0.0),
        });
        let (value, _) = residual.evaluate(&Pose::identity());
        assert_relative_eq!(value, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn plane_residual_is_the_signed_plane_distance() {
        let residual = Residual::Plane(PlaneResidual {
            point: Vector3::new(1.0, 2.0, 3.0),
            normal: Vector3::new(0.0, 0.0, 1.0),
            offset: -1.0,
        });
        let (value, _) = residual.evaluate(&Pose::identity());
        assert_relative_eq!(value, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let pose = Pose::new(
            UnitQuaternion::from_euler_angles(0.2, -0.1, 0.4),
            Vector3::new(0.3, -0.6, 1.2),
        );
        let residuals = [
            Residual::Edge(EdgeResidual {
                point: Vector3::new(0.7, 1.1, -0.4),
                anchor_a: Vector3::new(1.0, 0.2, 0.1),
                anchor_b: Vector3::new(0.4, -0.3, 0.2),
            }),
            Residual::Plane(PlaneResidual {
                point: Vector3::new(-0.2, 0.9, 0.5),
                normal: Vector3::new(0.0, 0.6, 0.8),
                offset: 0.3,
            }),
        ];
        for residual in &residuals {
            let (_, analytic) = residual.evaluate(&pose);
            let numeric = numeric_gradient(residual, &pose);
            assert_relative_eq!(analytic, numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn collinear_neighbors_fit_a_line_through_their_mean() {
        let neighbors: Vec<Vector3<f64>> = (0..5)
            .map(|i| Vector3::new(i as f64 * 0.2, 1.0, 1.0))
            .collect();
        let edge = fit_edge(&Vector3::new(0.4, 3.0, 1.0), &neighbors).expect("line-like");
        let (value, _) = Residual::Edge(edge).evaluate(&Pose::identity());
        assert_relative_eq!(value, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn isotropic_neighbors_are_rejected() {
        let neighbors = vec![
            Vector3::new(0.3, 0.0, 0.0),
            Vector3::new(-0.3, 0.0, 0.0),
            Vector3::new(0.0, 0.3, 0.0),
            Vector3::new(0.0, -0.3, 0.0),
            Vector3::new(0.0, 0.0, 0.3),
        ];
        assert_eq!(fit_edge(&Vector3::zeros(), &neighbors), None);
    }

    #[test]
    fn coplanar_neighbors_fit_the_known_plane() {
        // z = 2 plane; expected normal (0,0,-1) with offset 2 (n·x + d = 0)
        let neighbors = vec![
            Vector3::new(0.0, 0.0, 2.0),
            Vector3::new(1.0, 0.0, 2.0),
            Vector3::new(0.0, 1.0, 2.0),
            Vector3::new(1.0, 1.0, 2.0),
            Vector3::new(0.5, 0.5, 2.0),
        ];
        let plane = fit_plane(&Vector3::new(0.0, 0.0, 5.0), &neighbors).expect("planar");
        let (value, _) = Residual::Plane(plane).evaluate(&Pose::identity());
        assert_relative_eq!(value.abs(), 3.0, epsilon = 1e-9);
    }

    #[test]
    fn skewed_neighbors_fail_the_planarity_gate() {
        let neighbors = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(1.0, 1.0, 1.5),
            Vector3::new(0.5, 0.5, -1.5),
        ];
        assert_eq!(fit_plane(&Vector3::zeros(), &neighbors), None);
    }

    #[test]
    fn huber_weight_caps_large_residuals() {
        assert_relative_eq!(huber_weight(0.05), 1.0);
        assert_relative_eq!(huber_weight(-0.05), 1.0);
        assert_relative_eq!(huber_weight(0.5), 0.2);
        assert_relative_eq!(huber_weight(-1.0), 0.1);
    }
}
