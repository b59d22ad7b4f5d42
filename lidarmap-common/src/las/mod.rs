use crate::geometry::points::{ColorPoint, LidarPoint};
use las::{Builder, Color, Write, Writer};
use log::info;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriteMapError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Las(#[from] las::Error),
}

/// Collects the registered per-frame clouds for the final persisted map.
///
/// Only one of the two channels is populated in a given run: the monochrome
/// channel (intensity + per-point GPS time) without a camera, the colored
/// channel with one. The colored channel wins if both ever hold points.
#[derive(Default)]
pub struct MapAccumulator {
    intensity: Vec<(f64, LidarPoint)>,
    colored: Vec<ColorPoint>,
}

impl MapAccumulator {
    pub fn new() -> Self {
        MapAccumulator::default()
    }

    pub fn append_intensity(&mut self, timestamp: f64, points: &[LidarPoint]) {
        self.intensity
            .extend(points.iter().map(|point| (timestamp, *point)));
    }

    pub fn append_colored(&mut self, points: &[ColorPoint]) {
        self.colored.extend_from_slice(points);
    }

    pub fn len(&self) -> usize {
        self.intensity.len() + self.colored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensity.is_empty() && self.colored.is_empty()
    }

    /// Writes the accumulated map as LAS 1.2. Point format 2 (XYZRGB) in
    /// color mode, point format 1 (XYZI + GPS time) otherwise; LAZ
    /// compression is selected by a `.laz` output extension.
    pub fn save(&self, path: &Path) -> Result<(), WriteMapError> {
        let compressed = path
            .extension()
            .map(|extension| extension == "laz")
            .unwrap_or(false);
        let color_mode = !self.colored.is_empty();

        let mut builder = Builder::from((1, 2));
        let mut format = las::point::Format::new(if color_mode { 2 } else { 1 })?;
        format.is_compressed = compressed;
        builder.point_format = format;
        let header = builder.into_header()?;
        let mut writer = Writer::from_path(path, header)?;

        if color_mode {
            for point in &self.colored {
                writer.write(las::Point {
                    x: point.position.x,
                    y: point.position.y,
                    z: point.position.z,
                    color: Some(Color::new(
                        (point.red as u16) << 8,
                        (point.green as u16) << 8,
                        (point.blue as u16) << 8,
                    )),
                    ..Default::default()
                })?;
            }
        } else {
            for (timestamp, point) in &self.intensity {
                writer.write(las::Point {
                    x: point.position.x,
                    y: point.position.y,
                    z: point.position.z,
                    intensity: point.intensity.round().clamp(0.0, u16::MAX as f32) as u16,
                    gps_time: Some(*timestamp),
                    ..Default::default()
                })?;
            }
        }
        writer.close()?;
        info!("wrote {} map points to {}", self.len(), path.display());
        Ok(())
    }
}
