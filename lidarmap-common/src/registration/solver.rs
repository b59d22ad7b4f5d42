use crate::geometry::pose::Pose;
use crate::registration::residual::{huber_weight, Residual};
use nalgebra::{Matrix6, UnitQuaternion, Vector6};

/// Maximum Gauss-Newton iterations per inner solve.
pub const MAX_ITERATIONS: usize = 10;

/// The solve has converged once the tangent step is this small.
const CONVERGENCE_STEP: f64 = 1e-10;

const DAMPING: f64 = 1e-6;

/// Refines a pose against a fixed set of residuals.
///
/// The quaternion lives on the unit-quaternion manifold: each iteration
/// solves the Huber-weighted normal equations over the 6-dimensional
/// tangent `[ω, t]` with a dense QR factorization and applies the rotation
/// part by right-multiplication, `q ← q · exp(ω/2)`. Associations are the
/// caller's business; re-associate and call again for an outer iteration.
pub fn solve(residuals: &[Residual], initial: Pose) -> Pose {
    let mut pose = initial;
    if residuals.is_empty() {
        return pose;
    }

    for _ in 0..MAX_ITERATIONS {
        let mut hessian = Matrix6::<f64>::zeros();
        let mut gradient = Vector6::<f64>::zeros();
        for residual in residuals {
            let (value, jacobian) = residual.evaluate(&pose);
            let weight = huber_weight(value);
            hessian += weight * jacobian * jacobian.transpose();
            gradient += weight * value * jacobian;
        }
        // damping for weakly observed directions
        for i in 0..6 {
            hessian[(i, i)] += DAMPING;
        }

        let step = match hessian.qr().solve(&(-gradient)) {
            Some(step) => step,
            // rank-deficient normal equations, the pose is unobservable
            None => break,
        };

        pose.rotation *= UnitQuaternion::from_scaled_axis(step.fixed_rows::<3>(0).into_owned());
        pose.translation += step.fixed_rows::<3>(3).into_owned();
        if step.norm() < CONVERGENCE_STEP {
            break;
        }
    }

    pose.rotation.renormalize();
    pose
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::residual::PlaneResidual;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    /// Plane residuals from three orthogonal planes pin down the full pose.
    fn orthogonal_plane_residuals(true_pose: &Pose) -> Vec<Residual> {
        let mut residuals = Vec::new();
        let planes = [
            (Vector3::<f64>::new(1.0, 0.0, 0.0), -4.0),
            (Vector3::<f64>::new(0.0, 1.0, 0.0), -4.0),
            (Vector3::<f64>::new(0.0, 0.0, 1.0), -4.0),
        ];
        let inverse = true_pose.inverse();
        for (normal, offset) in planes {
            // sample world points on the plane, express them in the sensor frame
            let (u, v) = if normal.x.abs() > 0.5 {
                (Vector3::y(), Vector3::z())
            } else if normal.y.abs() > 0.5 {
                (Vector3::x(), Vector3::z())
            } else {
                (Vector3::x(), Vector3::y())
            };
            for a in -3..=3 {
                for b in -3..=3 {
                    let world = normal * -offset + u * a as f64 + v * b as f64;
                    let sensor = inverse.rotation * world + inverse.translation;
                    residuals.push(Residual::Plane(PlaneResidual {
                        point: sensor,
                        normal,
                        offset,
                    }));
                }
            }
        }
        residuals
    }

    #[test]
    fn recovers_a_translated_pose() {
        let truth = Pose::new(
            UnitQuaternion::identity(),
            Vector3::new(0.08, -0.05, 0.03),
        );
        let solved = solve(&orthogonal_plane_residuals(&truth), Pose::identity());
        assert_relative_eq!(solved.translation, truth.translation, epsilon = 1e-6);
    }

    #[test]
    fn recovers_a_rotated_pose() {
        let truth = Pose::new(
            UnitQuaternion::from_euler_angles(0.01, -0.02, 0.03),
            Vector3::new(0.02, 0.01, -0.01),
        );
        let solved = solve(&orthogonal_plane_residuals(&truth), Pose::identity());
        assert_relative_eq!(solved.rotation.angle_to(&truth.rotation), 0.0, epsilon = 1e-6);
        assert_relative_eq!(solved.translation, truth.translation, epsilon = 1e-6);
    }

    #[test]
    fn quaternion_stays_unit() {
        let truth = Pose::new(
            UnitQuaternion::from_euler_angles(0.05, 0.04, -0.06),
            Vector3::new(0.1, 0.0, 0.0),
        );
        let solved = solve(&orthogonal_plane_residuals(&truth), Pose::identity());
        assert!(solved.rotation_norm_error() < 1e-6);
    }

    #[test]
    fn no_residuals_leaves_the_initial_guess() {
        let initial = Pose::new(UnitQuaternion::identity(), Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(solve(&[], initial), initial);
    }
}
