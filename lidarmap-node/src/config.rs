use lidarmap_common::color::{CameraModel, DEFAULT_MAX_TIME_DIFF};
use lidarmap_common::registration::MapperParams;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerDe(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperConfig {
    /// Corner voxel leaf size.
    #[serde(default = "default_line_resolution")]
    pub mapping_line_resolution: f64,

    /// Surface voxel leaf size.
    #[serde(default = "default_plane_resolution")]
    pub mapping_plane_resolution: f64,

    /// Enables the camera colorization pipeline.
    #[serde(default)]
    pub use_color: bool,

    /// LiDAR-from-IMU extrinsic.
    #[serde(default)]
    pub mapping: ExtrinsicConfig,

    /// Camera-from-LiDAR extrinsic and camera model.
    #[serde(default)]
    pub color_mapping: ColorMappingConfig,

    /// Output path of the persisted map; a `.laz` extension enables
    /// compression.
    pub pcd_save_path: PathBuf,

    /// Maximum gap between a frame and the color image used for it.
    #[serde(default = "default_max_camera_time_diff")]
    pub max_camera_time_diff: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtrinsicConfig {
    #[serde(rename = "extrinsic_T", default = "zero_translation")]
    pub extrinsic_t: [f64; 3],
    #[serde(rename = "extrinsic_R", default = "identity_rotation")]
    pub extrinsic_r: [f64; 9],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorMappingConfig {
    #[serde(rename = "extrinsic_T", default = "zero_translation")]
    pub extrinsic_t: [f64; 3],
    #[serde(rename = "extrinsic_R", default = "identity_rotation")]
    pub extrinsic_r: [f64; 9],
    /// Row-major 3×3 camera intrinsics.
    #[serde(rename = "K_camera", default = "identity_rotation")]
    pub k_camera: [f64; 9],
    /// Brown-Conrady coefficients (k1, k2, p1, p2, k3).
    #[serde(rename = "D_camera", default = "zero_distortion")]
    pub d_camera: [f64; 5],
}

fn default_line_resolution() -> f64 {
    0.4
}

fn default_plane_resolution() -> f64 {
    0.8
}

fn default_max_camera_time_diff() -> f64 {
    DEFAULT_MAX_TIME_DIFF
}

fn zero_translation() -> [f64; 3] {
    [0.0; 3]
}

fn identity_rotation() -> [f64; 9] {
    [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
}

fn zero_distortion() -> [f64; 5] {
    [0.0; 5]
}

impl Default for ExtrinsicConfig {
    fn default() -> Self {
        ExtrinsicConfig {
            extrinsic_t: zero_translation(),
            extrinsic_r: identity_rotation(),
        }
    }
}

impl Default for ColorMappingConfig {
    fn default() -> Self {
        ColorMappingConfig {
            extrinsic_t: zero_translation(),
            extrinsic_r: identity_rotation(),
            k_camera: identity_rotation(),
            d_camera: [0.0; 5],
        }
    }
}

impl MapperConfig {
    pub fn load_from_file(file_name: &Path) -> Result<Self, ConfigError> {
        let file = File::open(file_name)?;
        let config = serde_json::from_reader(file)?;
        Ok(config)
    }

    pub fn mapper_params(&self) -> MapperParams {
        MapperParams {
            line_resolution: self.mapping_line_resolution,
            plane_resolution: self.mapping_plane_resolution,
        }
    }

    pub fn camera_model(&self) -> CameraModel {
        let color = &self.color_mapping;
        CameraModel::new(
            color.k_camera,
            color.d_camera,
            Matrix3::from_row_slice(&color.extrinsic_r),
            Vector3::new(
                color.extrinsic_t[0],
                color.extrinsic_t[1],
                color.extrinsic_t[2],
            ),
        )
    }
}
