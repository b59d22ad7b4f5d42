use nalgebra::{Point3, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// A rigid transform as unit quaternion plus translation.
///
/// `compose` follows the usual convention: if `a` maps frame B to frame A
/// and `b` maps frame C to frame B, then `a.compose(&b)` maps C to A.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn identity() -> Self {
        Pose {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            rotation,
            translation,
        }
    }

    /// Builds a pose from raw quaternion components (x, y, z, w), normalizing.
    pub fn from_parts(x: f64, y: f64, z: f64, w: f64, translation: Vector3<f64>) -> Self {
        Pose {
            rotation: UnitQuaternion::new_normalize(Quaternion::new(w, x, y, z)),
            translation,
        }
    }

    pub fn compose(&self, other: &Pose) -> Pose {
        Pose {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn inverse(&self) -> Pose {
        let inv_rotation = self.rotation.inverse();
        Pose {
            rotation: inv_rotation,
            translation: -(inv_rotation * self.translation),
        }
    }

    #[inline]
    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.rotation * point + self.translation
    }

    /// Deviation of the quaternion norm from one. Zero for a well-formed pose.
    pub fn rotation_norm_error(&self) -> f64 {
        (self.rotation.as_ref().norm() - 1.0).abs()
    }
}

impl Default for Pose {
    fn default() -> Self {
        Pose::identity()
    }
}

/// The drift correction accumulated by mapping: `world_pose = correction ∘ odom_pose`,
/// so after a frame is refined the correction is re-derived as
/// `world_pose ∘ odom_pose⁻¹` and seeds the next frame's initial guess.
pub fn update_correction(world_pose: &Pose, odom_pose: &Pose) -> Pose {
    world_pose.compose(&odom_pose.inverse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_4;

    #[test]
    fn compose_with_inverse_is_identity() {
        let pose = Pose::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(1.0, -2.0, 3.0),
        );
        let round_trip = pose.compose(&pose.inverse());
        assert_relative_eq!(round_trip.translation.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(round_trip.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn transform_point_rotates_then_translates() {
        let pose = Pose::new(
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), FRAC_PI_4 * 2.0),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let p = pose.transform_point(&Point3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(p, Point3::new(1.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn correction_reproduces_world_pose() {
        let odom = Pose::new(
            UnitQuaternion::from_euler_angles(0.05, 0.0, -0.1),
            Vector3::new(4.0, 0.5, -1.0),
        );
        let world = Pose::new(
            UnitQuaternion::from_euler_angles(0.04, 0.01, -0.09),
            Vector3::new(4.2, 0.4, -1.1),
        );
        let correction = update_correction(&world, &odom);
        let recomposed = correction.compose(&odom);
        assert_relative_eq!(recomposed.translation, world.translation, epsilon = 1e-9);
        assert_relative_eq!(
            recomposed.rotation.angle_to(&world.rotation),
            0.0,
            epsilon = 1e-9
        );
    }
}
