use crate::geometry::points::LidarPoint;
use nalgebra::Point3;

pub const GRID_WIDTH: usize = 21;
pub const GRID_HEIGHT: usize = 21;
pub const GRID_DEPTH: usize = 11;
pub const CUBE_COUNT: usize = GRID_WIDTH * GRID_HEIGHT * GRID_DEPTH; // 4851

/// Physical edge length of one cube.
pub const CUBE_EDGE: f64 = 50.0;

/// Minimum number of cubes between the sensor cube and every grid face.
const CENTER_MARGIN: i32 = 3;

/// One element of the map grid: the corner and surface points accumulated
/// for a 50×50×50 region of the world.
#[derive(Debug, Clone, Default)]
pub struct Cube {
    pub corner: Vec<LidarPoint>,
    pub surface: Vec<LidarPoint>,
}

impl Cube {
    fn clear(&mut self) {
        self.corner.clear();
        self.surface.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.corner.is_empty() && self.surface.is_empty()
    }
}

/// A fixed-extent 3D grid of point accumulators that slides with the sensor.
///
/// All 4851 cubes are allocated once and recycled forever: when the sensor
/// gets within [CENTER_MARGIN] cubes of a face, bucket contents rotate one
/// step along that axis, the cube reclaimed from the opposite face is
/// cleared, and the logical center offset moves with the rotation so that
/// cube indices of unaffected points stay stable relative to the world.
#[derive(Debug, Clone)]
pub struct CubeGrid {
    cubes: Vec<Cube>,
    center: [i32; 3],
}

impl CubeGrid {
    pub fn new() -> Self {
        CubeGrid {
            cubes: vec![Cube::default(); CUBE_COUNT],
            center: [
                GRID_WIDTH as i32 / 2,
                GRID_HEIGHT as i32 / 2,
                GRID_DEPTH as i32 / 2,
            ],
        }
    }

    /// The logical center offset (the cube index of the world origin cell).
    pub fn center_offset(&self) -> (i32, i32, i32) {
        (self.center[0], self.center[1], self.center[2])
    }

    #[inline]
    fn flat_index(i: usize, j: usize, k: usize) -> usize {
        i + GRID_WIDTH * j + GRID_WIDTH * GRID_HEIGHT * k
    }

    fn axis_cell(coordinate: f64, center: i32) -> i32 {
        let shifted = coordinate + CUBE_EDGE / 2.0;
        let mut cell = (shifted / CUBE_EDGE) as i32;
        if shifted < 0.0 {
            cell -= 1;
        }
        cell + center
    }

    /// Cube coordinates of a world point. May lie outside the grid.
    pub fn cell_coords(&self, point: &Point3<f64>) -> (i32, i32, i32) {
        (
            Self::axis_cell(point.x, self.center[0]),
            Self::axis_cell(point.y, self.center[1]),
            Self::axis_cell(point.z, self.center[2]),
        )
    }

    fn in_grid(i: i32, j: i32, k: i32) -> bool {
        i >= 0
            && i < GRID_WIDTH as i32
            && j >= 0
            && j < GRID_HEIGHT as i32
            && k >= 0
            && k < GRID_DEPTH as i32
    }

    /// Rotates all bucket contents by one cube along `axis`. `forward` moves
    /// contents towards higher indices (clearing the low face), which is the
    /// response to the sensor approaching the low face; the center offset is
    /// adjusted in lock-step so surviving cubes keep their world region.
    fn shift_axis(&mut self, axis: usize, forward: bool) {
        let (dim, u_dim, v_dim) = match axis {
            0 => (GRID_WIDTH, GRID_HEIGHT, GRID_DEPTH),
            1 => (GRID_HEIGHT, GRID_WIDTH, GRID_DEPTH),
            _ => (GRID_DEPTH, GRID_WIDTH, GRID_HEIGHT),
        };
        for u in 0..u_dim {
            for v in 0..v_dim {
                let at = |c: usize| match axis {
                    0 => Self::flat_index(c, u, v),
                    1 => Self::flat_index(u, c, v),
                    _ => Self::flat_index(u, v, c),
                };
                if forward {
                    for c in (1..dim).rev() {
                        self.cubes.swap(at(c), at(c - 1));
                    }
                    self.cubes[at(0)].clear();
                } else {
                    for c in 0..dim - 1 {
                        self.cubes.swap(at(c), at(c + 1));
                    }
                    self.cubes[at(dim - 1)].clear();
                }
            }
        }
        self.center[axis] += if forward { 1 } else { -1 };
    }

    /// Shifts the grid until the cube containing `sensor` is at least
    /// [CENTER_MARGIN] cubes away from every face, and returns that cube.
    pub fn recenter(&mut self, sensor: &Point3<f64>) -> (usize, usize, usize) {
        let (mut ci, mut cj, mut ck) = self.cell_coords(sensor);
        let dims = [GRID_WIDTH as i32, GRID_HEIGHT as i32, GRID_DEPTH as i32];
        for (axis, cell) in [&mut ci, &mut cj, &mut ck].into_iter().enumerate() {
            while *cell < CENTER_MARGIN {
                self.shift_axis(axis, true);
                *cell += 1;
            }
            while *cell >= dims[axis] - CENTER_MARGIN {
                self.shift_axis(axis, false);
                *cell -= 1;
            }
        }
        (ci as usize, cj as usize, ck as usize)
    }

    /// Flat indices of the 5×5×3 window around the sensor cube, clamped to
    /// the grid. These cubes feed the neighbor index and the surround output.
    pub fn window_indices(&self, center: (usize, usize, usize)) -> Vec<usize> {
        let (ci, cj, ck) = (center.0 as i32, center.1 as i32, center.2 as i32);
        let mut indices = Vec::with_capacity(75);
        for i in ci - 2..=ci + 2 {
            for j in cj - 2..=cj + 2 {
                for k in ck - 1..=ck + 1 {
                    if Self::in_grid(i, j, k) {
                        indices.push(Self::flat_index(i as usize, j as usize, k as usize));
                    }
                }
            }
        }
        indices
    }

    /// Concatenates the corner and surface buckets of the given cubes into
    /// the two working clouds for registration.
    pub fn collect_buckets(&self, indices: &[usize]) -> (Vec<LidarPoint>, Vec<LidarPoint>) {
        let mut corner = Vec::new();
        let mut surface = Vec::new();
        for &index in indices {
            corner.extend_from_slice(&self.cubes[index].corner);
            surface.extend_from_slice(&self.cubes[index].surface);
        }
        (corner, surface)
    }

    /// All points (both buckets) of the given cubes, for the surround output.
    pub fn collect_merged(&self, indices: &[usize]) -> Vec<LidarPoint> {
        let mut points = Vec::new();
        for &index in indices {
            points.extend_from_slice(&self.cubes[index].corner);
            points.extend_from_slice(&self.cubes[index].surface);
        }
        points
    }

    /// All points of all 4851 cubes, for the periodic full-map output.
    pub fn collect_all(&self) -> Vec<LidarPoint> {
        let indices: Vec<usize> = (0..CUBE_COUNT).collect();
        self.collect_merged(&indices)
    }

    /// Appends a world-frame point to the corner bucket of its cube.
    /// Returns the cube's flat index, or None if the point is out of grid.
    pub fn insert_corner(&mut self, point: LidarPoint) -> Option<usize> {
        let index = self.target_cube(&point.position)?;
        self.cubes[index].corner.push(point);
        Some(index)
    }

    /// Appends a world-frame point to the surface bucket of its cube.
    pub fn insert_surface(&mut self, point: LidarPoint) -> Option<usize> {
        let index = self.target_cube(&point.position)?;
        self.cubes[index].surface.push(point);
        Some(index)
    }

    fn target_cube(&self, position: &Point3<f64>) -> Option<usize> {
        let (i, j, k) = self.cell_coords(position);
        if Self::in_grid(i, j, k) {
            Some(Self::flat_index(i as usize, j as usize, k as usize))
        } else {
            None
        }
    }

    pub fn cube(&self, index: usize) -> &Cube {
        &self.cubes[index]
    }

    pub fn cube_mut(&mut self, index: usize) -> &mut Cube {
        &mut self.cubes[index]
    }
}

impl Default for CubeGrid {
    fn default() -> Self {
        CubeGrid::new()
    }
}
