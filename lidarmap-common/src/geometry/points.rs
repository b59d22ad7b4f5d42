use crate::geometry::pose::Pose;
use nalgebra::Point3;

/// A single LiDAR return.
///
/// Besides the coordinate it carries the two scalar payload channels handed
/// down by the upstream feature extractor: the sensor reflectance
/// (`intensity`) and the feature score (`curvature`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LidarPoint {
    pub position: Point3<f64>,
    pub intensity: f32,
    pub curvature: f32,
}

impl LidarPoint {
    pub fn new(x: f64, y: f64, z: f64, intensity: f32, curvature: f32) -> Self {
        LidarPoint {
            position: Point3::new(x, y, z),
            intensity,
            curvature,
        }
    }

    /// The same point expressed in the target frame of `pose`.
    /// The payload channels are carried over unchanged.
    pub fn transformed(&self, pose: &Pose) -> LidarPoint {
        LidarPoint {
            position: pose.transform_point(&self.position),
            ..*self
        }
    }
}

/// A timestamped unordered set of points, as delivered by one upstream message.
#[derive(Debug, Clone, Default)]
pub struct FeatureCloud {
    pub timestamp: f64,
    pub points: Vec<LidarPoint>,
}

impl FeatureCloud {
    pub fn new(timestamp: f64, points: Vec<LidarPoint>) -> Self {
        FeatureCloud { timestamp, points }
    }
}

/// A point with an RGB payload, used for the false-colored and the
/// camera-colored registered clouds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorPoint {
    pub position: Point3<f64>,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}
