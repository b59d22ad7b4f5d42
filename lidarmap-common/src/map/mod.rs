pub mod grid;
pub mod knn;
pub mod voxel;
