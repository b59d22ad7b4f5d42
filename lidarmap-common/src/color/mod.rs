use crate::geometry::points::{ColorPoint, LidarPoint};
use crate::geometry::pose::Pose;
use image::RgbImage;
use nalgebra::{Matrix3, Point3, Vector3};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default maximum gap between a frame and its color image.
pub const DEFAULT_MAX_TIME_DIFF: f64 = 0.05;

/// Brown-Conrady lens distortion, `(k1, k2, p1, p2, k3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn from_coefficients(d: [f64; 5]) -> Self {
        Distortion {
            k1: d[0],
            k2: d[1],
            p1: d[2],
            p2: d[3],
            k3: d[4],
        }
    }

    /// Applies the distortion to a normalized image-plane point.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r2 * r4;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        let dx = radial * x + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = radial * y + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (dx, dy)
    }
}

/// Pinhole camera with distortion and the camera-from-lidar extrinsic.
#[derive(Debug, Clone)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub distortion: Distortion,
    pub extrinsic_rotation: Matrix3<f64>,
    pub extrinsic_translation: Vector3<f64>,
}

impl CameraModel {
    /// Builds the model from a row-major 3×3 intrinsic matrix, the five
    /// distortion coefficients and the camera-from-lidar extrinsic.
    pub fn new(
        k: [f64; 9],
        d: [f64; 5],
        extrinsic_rotation: Matrix3<f64>,
        extrinsic_translation: Vector3<f64>,
    ) -> Self {
        CameraModel {
            fx: k[0],
            fy: k[4],
            cx: k[2],
            cy: k[5],
            distortion: Distortion::from_coefficients(d),
            extrinsic_rotation,
            extrinsic_translation,
        }
    }

    /// Projects a sensor-frame point to pixel coordinates.
    /// Returns None for points at or behind the image plane.
    pub fn project(&self, point_sensor: &Point3<f64>) -> Option<(f64, f64)> {
        let cam = self.extrinsic_rotation * point_sensor.coords + self.extrinsic_translation;
        if cam.z <= 0.0 {
            return None;
        }
        let (x, y) = self.distortion.apply(cam.x / cam.z, cam.y / cam.z);
        Some((self.fx * x + self.cx, self.fy * y + self.cy))
    }
}

/// Writes camera RGB onto the registered cloud.
pub struct Colorizer {
    model: CameraModel,
}

impl Colorizer {
    pub fn new(model: CameraModel) -> Self {
        Colorizer { model }
    }

    /// Projects each sensor-frame point into the image; points that land on
    /// a pixel are emitted in the world frame with that pixel's color,
    /// everything else is discarded.
    pub fn colorize(
        &self,
        points: &[LidarPoint],
        pose: &Pose,
        image: &RgbImage,
    ) -> Vec<ColorPoint> {
        let mut colored = Vec::new();
        for point in points {
            let Some((u, v)) = self.model.project(&point.position) else {
                continue;
            };
            let (u, v) = (u as i64, v as i64);
            if u < 0 || u >= image.width() as i64 || v < 0 || v >= image.height() as i64 {
                continue;
            }
            let pixel = image.get_pixel(u as u32, v as u32);
            let world = pose.transform_point(&point.position);
            colored.push(ColorPoint {
                position: world,
                red: pixel.0[0],
                green: pixel.0[1],
                blue: pixel.0[2],
            });
        }
        colored
    }
}

/// A timestamped camera image.
pub struct CameraFrame {
    pub timestamp: f64,
    pub image: RgbImage,
}

/// Time-ordered buffer of camera frames, filled by the image ingress thread
/// and drained by the mapping worker.
pub struct CameraBuffer {
    frames: Mutex<VecDeque<CameraFrame>>,
    max_time_diff: f64,
}

impl CameraBuffer {
    pub fn new(max_time_diff: f64) -> Self {
        CameraBuffer {
            frames: Mutex::new(VecDeque::new()),
            max_time_diff,
        }
    }

    pub fn push(&self, frame: CameraFrame) {
        self.frames.lock().unwrap().push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().unwrap().is_empty()
    }

    /// Removes and returns the frame whose timestamp is closest to
    /// `timestamp`, together with everything buffered before it. Returns
    /// None (and drops nothing) when the closest frame is further away
    /// than the configured threshold.
    pub fn take_best_match(&self, timestamp: f64) -> Option<CameraFrame> {
        let mut frames = self.frames.lock().unwrap();
        if frames.is_empty() {
            return None;
        }
        // frames are pushed in timestamp order; binary search for the
        // insertion point, then compare the two candidates around it
        let partition = frames.partition_point(|frame| frame.timestamp < timestamp);
        let mut best = partition.min(frames.len() - 1);
        if partition > 0 {
            let before = partition - 1;
            if (frames[before].timestamp - timestamp).abs()
                <= (frames[best].timestamp - timestamp).abs()
            {
                best = before;
            }
        }
        if (frames[best].timestamp - timestamp).abs() > self.max_time_diff {
            return None;
        }
        frames.drain(..best).for_each(drop);
        frames.pop_front()
    }
}

/// The reflectance channel both registered outputs are derived from.
fn reflectance(point: &LidarPoint) -> f64 {
    point.curvature as f64 * 10.0
}

/// Registered full cloud with the 4-band blue→green→yellow→red false-color
/// ramp over reflectance 0–255.
pub fn falsecolor_registered(points: &[LidarPoint], pose: &Pose) -> Vec<ColorPoint> {
    points
        .iter()
        .map(|point| {
            let (red, green, blue) = reflectance_color(reflectance(point));
            ColorPoint {
                position: pose.transform_point(&point.position),
                red,
                green,
                blue,
            }
        })
        .collect()
}

fn reflectance_color(reflectance: f64) -> (u8, u8, u8) {
    let r = reflectance as i64;
    if r < 30 {
        (0, ((r * 255 / 30) & 0xff) as u8, 0xff)
    } else if r < 90 {
        (0, 0xff, (((90 - r) * 255 / 60) & 0xff) as u8)
    } else if r < 150 {
        ((((r - 90) * 255 / 60) & 0xff) as u8, 0xff, 0)
    } else {
        (0xff, (((255 - r) * 255 / 105) & 0xff) as u8, 0)
    }
}

/// Registered full cloud carrying the reflectance (curvature·10) in the
/// intensity channel. Deliberately distinct from the intensity-preserving
/// transform used for map insertion.
pub fn intensity_registered(points: &[LidarPoint], pose: &Pose) -> Vec<LidarPoint> {
    points
        .iter()
        .map(|point| LidarPoint {
            position: pose.transform_point(&point.position),
            intensity: point.curvature * 10.0,
            curvature: point.curvature,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Rgb;

    fn pinhole() -> CameraModel {
        CameraModel::new(
            [500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0],
            [0.0; 5],
            Matrix3::identity(),
            Vector3::zeros(),
        )
    }

    #[test]
    fn zero_distortion_projection_is_the_pinhole_formula() {
        let model = pinhole();
        let (u, v) = model.project(&Point3::new(0.4, -0.2, 2.0)).unwrap();
        assert_relative_eq!(u, 500.0 * 0.2 + 320.0, epsilon = 1.0);
        assert_relative_eq!(v, 500.0 * -0.1 + 240.0, epsilon = 1.0);
    }

    #[test]
    fn points_behind_the_camera_are_skipped() {
        let model = pinhole();
        assert_eq!(model.project(&Point3::new(0.0, 0.0, -1.0)), None);
        assert_eq!(model.project(&Point3::new(0.0, 0.0, 0.0)), None);
    }

    #[test]
    fn distortion_matches_the_closed_form() {
        let distortion = Distortion::from_coefficients([0.1, -0.05, 0.001, 0.002, 0.01]);
        let (x, y) = (0.3, -0.2);
        let r2: f64 = x * x + y * y;
        let radial = 1.0 + 0.1 * r2 - 0.05 * r2 * r2 + 0.01 * r2 * r2 * r2;
        let expected_x = radial * x + 2.0 * 0.001 * x * y + 0.002 * (r2 + 2.0 * x * x);
        let expected_y = radial * y + 0.001 * (r2 + 2.0 * y * y) + 2.0 * 0.002 * x * y;
        let (dx, dy) = distortion.apply(x, y);
        assert_relative_eq!(dx, expected_x, epsilon = 1e-12);
        assert_relative_eq!(dy, expected_y, epsilon = 1e-12);
    }

    #[test]
    fn center_point_gets_the_center_pixel_color() {
        let mut image = RgbImage::new(640, 480);
        image.put_pixel(320, 240, Rgb([255, 0, 255]));
        let colorizer = Colorizer::new(pinhole());
        let points = vec![LidarPoint::new(0.0, 0.0, 1.0, 0.0, 0.0)];
        let colored = colorizer.colorize(&points, &Pose::identity(), &image);
        assert_eq!(colored.len(), 1);
        assert_eq!(
            (colored[0].red, colored[0].green, colored[0].blue),
            (255, 0, 255)
        );
        assert_relative_eq!(colored[0].position, Point3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn points_outside_the_image_are_discarded() {
        let image = RgbImage::new(64, 64);
        let colorizer = Colorizer::new(pinhole());
        let points = vec![
            LidarPoint::new(10.0, 0.0, 1.0, 0.0, 0.0),
            LidarPoint::new(0.0, 0.0, -1.0, 0.0, 0.0),
        ];
        assert!(colorizer.colorize(&points, &Pose::identity(), &image).is_empty());
    }

    #[test]
    fn best_match_consumes_the_buffer_prefix() {
        let buffer = CameraBuffer::new(DEFAULT_MAX_TIME_DIFF);
        for i in 0..5 {
            buffer.push(CameraFrame {
                timestamp: i as f64 * 0.1,
                image: RgbImage::new(1, 1),
            });
        }
        let matched = buffer.take_best_match(0.21).expect("within threshold");
        assert_relative_eq!(matched.timestamp, 0.2);
        // everything up to and including the match is gone
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn too_large_a_gap_rejects_and_keeps_the_buffer() {
        let buffer = CameraBuffer::new(DEFAULT_MAX_TIME_DIFF);
        buffer.push(CameraFrame {
            timestamp: 0.0,
            image: RgbImage::new(1, 1),
        });
        assert!(buffer.take_best_match(1.0).is_none());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn reflectance_ramp_hits_the_band_anchors() {
        assert_eq!(reflectance_color(0.0), (0, 0, 255));
        assert_eq!(reflectance_color(29.0), (0, 246, 255));
        assert_eq!(reflectance_color(30.0), (0, 255, 255));
        assert_eq!(reflectance_color(89.0), (0, 255, 4));
        assert_eq!(reflectance_color(90.0), (0, 255, 0));
        assert_eq!(reflectance_color(149.0), (250, 255, 0));
        assert_eq!(reflectance_color(150.0), (255, 255, 0));
        assert_eq!(reflectance_color(255.0), (255, 0, 0));
    }

    #[test]
    fn intensity_output_carries_the_scaled_curvature() {
        let points = vec![LidarPoint::new(1.0, 2.0, 3.0, 42.0, 7.5)];
        let out = intensity_registered(&points, &Pose::identity());
        assert_relative_eq!(out[0].intensity, 75.0);
        assert_relative_eq!(out[0].curvature, 7.5);
    }
}
