pub mod residual;
pub mod solver;

use crate::geometry::points::LidarPoint;
use crate::geometry::pose::{update_correction, Pose};
use crate::map::grid::CubeGrid;
use crate::map::knn::NeighborIndex;
use crate::map::voxel::VoxelFilter;
use crate::registration::residual::{
    fit_edge, fit_plane, Residual, MAX_NEIGHBOR_SQ_DIST, NEIGHBOR_COUNT,
};
use log::{debug, warn};
use nalgebra::{Point3, Vector3};
use std::collections::BTreeSet;

/// The optimizer only runs with more corner map points than this.
pub const MIN_CORNER_MAP_POINTS: usize = 10;

/// The optimizer only runs with more surface map points than this.
pub const MIN_SURFACE_MAP_POINTS: usize = 50;

/// Association passes per frame; each re-queries all neighbors with the
/// current pose estimate before solving again.
const OUTER_ITERATIONS: usize = 2;

const SURROUND_EVERY: u64 = 5;
const FULL_MAP_EVERY: u64 = 20;

#[derive(Debug, Clone, Copy)]
pub struct MapperParams {
    /// Corner voxel leaf size.
    pub line_resolution: f64,
    /// Surface voxel leaf size.
    pub plane_resolution: f64,
}

impl Default for MapperParams {
    fn default() -> Self {
        MapperParams {
            line_resolution: 0.4,
            plane_resolution: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseStamped {
    pub timestamp: f64,
    pub pose: Pose,
}

/// One timestamp-aligned tuple popped from the input queues.
#[derive(Debug, Clone)]
pub struct SyncedFrame {
    pub timestamp: f64,
    pub corner: Vec<LidarPoint>,
    pub surface: Vec<LidarPoint>,
    pub full: Vec<LidarPoint>,
    pub odom_pose: Pose,
}

/// Everything one frame produces besides the mapper-internal state updates.
/// The full cloud is passed through in the sensor frame so the downstream
/// color/intensity transforms can project it before moving it to the world.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub timestamp: f64,
    pub pose: Pose,
    pub full_cloud: Vec<LidarPoint>,
    pub surround_cloud: Option<Vec<LidarPoint>>,
    pub map_cloud: Option<Vec<LidarPoint>>,
    /// Set when the surrounding map was too sparse and the optimizer was
    /// skipped; the pose is the plain composed odometry guess then.
    pub degenerate: bool,
}

/// Owns all mapping state: the cube grid, the input down-samplers, the
/// pose chain and the refined path. Single-threaded by design; the
/// mapping worker is its only user.
pub struct Mapper {
    grid: CubeGrid,
    corner_filter: VoxelFilter,
    surface_filter: VoxelFilter,
    correction: Pose,
    world_pose: Pose,
    path: Vec<PoseStamped>,
    frame_count: u64,
}

impl Mapper {
    pub fn new(params: MapperParams) -> Self {
        Mapper {
            grid: CubeGrid::new(),
            corner_filter: VoxelFilter::new(params.line_resolution),
            surface_filter: VoxelFilter::new(params.plane_resolution),
            correction: Pose::identity(),
            world_pose: Pose::identity(),
            path: Vec::new(),
            frame_count: 0,
        }
    }

    /// The latest map-world ← odom-world correction. Composing it with a
    /// fresh odometry pose gives the low-latency refined pose estimate.
    pub fn correction(&self) -> Pose {
        self.correction
    }

    pub fn world_pose(&self) -> Pose {
        self.world_pose
    }

    pub fn path(&self) -> &[PoseStamped] {
        &self.path
    }

    pub fn grid(&self) -> &CubeGrid {
        &self.grid
    }

    pub fn process_frame(&mut self, frame: SyncedFrame) -> FrameResult {
        // initial guess from the coarse odometry and the accumulated correction
        self.world_pose = self.correction.compose(&frame.odom_pose);

        let center = self.grid.recenter(&Point3::from(self.world_pose.translation));
        let window = self.grid.window_indices(center);
        let (corner_map, surface_map) = self.grid.collect_buckets(&window);

        let corner_stack = self.corner_filter.filter(&frame.corner);
        let surface_stack = self.surface_filter.filter(&frame.surface);

        let degenerate = corner_map.len() <= MIN_CORNER_MAP_POINTS
            || surface_map.len() <= MIN_SURFACE_MAP_POINTS;
        if degenerate {
            warn!(
                "map support too sparse ({} corner / {} surface points), keeping the odometry guess",
                corner_map.len(),
                surface_map.len()
            );
        } else {
            let corner_index = NeighborIndex::build(&corner_map);
            let surface_index = NeighborIndex::build(&surface_map);
            for _ in 0..OUTER_ITERATIONS {
                let residuals = associate(
                    &self.world_pose,
                    &corner_stack,
                    &corner_map,
                    &corner_index,
                    &surface_stack,
                    &surface_map,
                    &surface_index,
                );
                debug!(
                    "frame {}: {} residuals from {} corner / {} surface features",
                    self.frame_count,
                    residuals.len(),
                    corner_stack.len(),
                    surface_stack.len()
                );
                self.world_pose = solver::solve(&residuals, self.world_pose);
            }
        }

        self.correction = update_correction(&self.world_pose, &frame.odom_pose);

        // move the down-sampled features into their cubes
        let mut touched = BTreeSet::new();
        for point in &corner_stack {
            if let Some(index) = self.grid.insert_corner(point.transformed(&self.world_pose)) {
                touched.insert(index);
            }
        }
        for point in &surface_stack {
            if let Some(index) = self.grid.insert_surface(point.transformed(&self.world_pose)) {
                touched.insert(index);
            }
        }
        for index in touched {
            let cube = self.grid.cube_mut(index);
            let corner = self.corner_filter.filter(&cube.corner);
            let surface = self.surface_filter.filter(&cube.surface);
            cube.corner = corner;
            cube.surface = surface;
        }

        let surround_cloud =
            (self.frame_count % SURROUND_EVERY == 0).then(|| self.grid.collect_merged(&window));
        let map_cloud =
            (self.frame_count % FULL_MAP_EVERY == 0).then(|| self.grid.collect_all());

        self.path.push(PoseStamped {
            timestamp: frame.timestamp,
            pose: self.world_pose,
        });
        self.frame_count += 1;

        FrameResult {
            timestamp: frame.timestamp,
            pose: self.world_pose,
            full_cloud: frame.full,
            surround_cloud,
            map_cloud,
            degenerate,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn associate(
    pose: &Pose,
    corner_stack: &[LidarPoint],
    corner_map: &[LidarPoint],
    corner_index: &NeighborIndex,
    surface_stack: &[LidarPoint],
    surface_map: &[LidarPoint],
    surface_index: &NeighborIndex,
) -> Vec<Residual> {
    let mut residuals = Vec::new();

    for point in corner_stack {
        let world = pose.transform_point(&point.position);
        let found = corner_index.nearest(&world, NEIGHBOR_COUNT);
        if found.len() < NEIGHBOR_COUNT || found[NEIGHBOR_COUNT - 1].0 >= MAX_NEIGHBOR_SQ_DIST {
            continue;
        }
        let neighbors: Vec<Vector3<f64>> = found
            .iter()
            .map(|&(_, index)| corner_map[index].position.coords)
            .collect();
        if let Some(edge) = fit_edge(&point.position.coords, &neighbors) {
            residuals.push(Residual::Edge(edge));
        }
    }

    for point in surface_stack {
        let world = pose.transform_point(&point.position);
        let found = surface_index.nearest(&world, NEIGHBOR_COUNT);
        if found.len() < NEIGHBOR_COUNT || found[NEIGHBOR_COUNT - 1].0 >= MAX_NEIGHBOR_SQ_DIST {
            continue;
        }
        let neighbors: Vec<Vector3<f64>> = found
            .iter()
            .map(|&(_, index)| surface_map[index].position.coords)
            .collect();
        if let Some(plane) = fit_plane(&point.position.coords, &neighbors) {
            residuals.push(Residual::Plane(plane));
        }
    }

    residuals
}
