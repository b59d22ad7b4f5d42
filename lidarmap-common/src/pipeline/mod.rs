use crate::color::{falsecolor_registered, intensity_registered, CameraBuffer, Colorizer};
use crate::geometry::points::{ColorPoint, FeatureCloud, LidarPoint};
use crate::geometry::pose::Pose;
use crate::registration::{FrameResult, Mapper, SyncedFrame};
use crossbeam_channel::Sender;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::sleep;
use std::time::Duration;

/// Upper bound per input queue; mirrors the transport-layer capacity.
pub const QUEUE_CAPACITY: usize = 100;

/// How long the worker naps when no synchronized tuple is available.
const IDLE_SLEEP: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OdometryMessage {
    pub timestamp: f64,
    pub pose: Pose,
}

#[derive(Default)]
struct Queues {
    corner: VecDeque<FeatureCloud>,
    surface: VecDeque<FeatureCloud>,
    full: VecDeque<FeatureCloud>,
    odometry: VecDeque<OdometryMessage>,
}

/// The four input FIFOs behind a single mutex. Ingress threads append,
/// the mapping worker pops whole timestamp-aligned tuples.
pub struct MessageQueues {
    inner: Mutex<Queues>,
}

impl MessageQueues {
    pub fn new() -> Self {
        MessageQueues {
            inner: Mutex::new(Queues::default()),
        }
    }

    pub fn push_corner(&self, cloud: FeatureCloud) {
        let mut queues = self.inner.lock().unwrap();
        push_bounded(&mut queues.corner, cloud, "corner");
    }

    pub fn push_surface(&self, cloud: FeatureCloud) {
        let mut queues = self.inner.lock().unwrap();
        push_bounded(&mut queues.surface, cloud, "surface");
    }

    pub fn push_full(&self, cloud: FeatureCloud) {
        let mut queues = self.inner.lock().unwrap();
        push_bounded(&mut queues.full, cloud, "full");
    }

    pub fn push_odometry(&self, message: OdometryMessage) {
        let mut queues = self.inner.lock().unwrap();
        push_bounded(&mut queues.odometry, message, "odometry");
    }

    /// Length of the longest queue. Replay producers use this to pace
    /// themselves instead of overrunning the capacity bound.
    pub fn backlog(&self) -> usize {
        let queues = self.inner.lock().unwrap();
        queues
            .corner
            .len()
            .max(queues.surface.len())
            .max(queues.full.len())
            .max(queues.odometry.len())
    }

    /// Pops one timestamp-aligned tuple, or None when the queues cannot
    /// currently produce one.
    ///
    /// The corner head defines the frame timestamp. Older heads of the other
    /// three queues are discarded to catch up; if the remaining heads still
    /// disagree the corner head itself is stale and gets dropped, so the
    /// consumer always advances.
    pub fn try_take_synced(&self) -> Option<SyncedFrame> {
        let mut queues = self.inner.lock().unwrap();
        if queues.corner.is_empty()
            || queues.surface.is_empty()
            || queues.full.is_empty()
            || queues.odometry.is_empty()
        {
            return None;
        }
        let timestamp = queues.corner[0].timestamp;

        while queues.odometry.front().is_some_and(|m| m.timestamp < timestamp) {
            queues.odometry.pop_front();
        }
        while queues.surface.front().is_some_and(|c| c.timestamp < timestamp) {
            queues.surface.pop_front();
        }
        while queues.full.front().is_some_and(|c| c.timestamp < timestamp) {
            queues.full.pop_front();
        }
        let (Some(odometry_head), Some(surface_head), Some(full_head)) = (
            queues.odometry.front(),
            queues.surface.front(),
            queues.full.front(),
        ) else {
            return None;
        };

        if odometry_head.timestamp != timestamp
            || surface_head.timestamp != timestamp
            || full_head.timestamp != timestamp
        {
            warn!(
                "unsynchronized messages (corner {}, surface {}, full {}, odometry {}), dropping the corner frame",
                timestamp, surface_head.timestamp, full_head.timestamp, odometry_head.timestamp
            );
            queues.corner.pop_front();
            return None;
        }

        let (Some(corner), Some(surface), Some(full), Some(odometry)) = (
            queues.corner.pop_front(),
            queues.surface.pop_front(),
            queues.full.pop_front(),
            queues.odometry.pop_front(),
        ) else {
            return None;
        };
        Some(SyncedFrame {
            timestamp,
            corner: corner.points,
            surface: surface.points,
            full: full.points,
            odom_pose: odometry.pose,
        })
    }
}

impl Default for MessageQueues {
    fn default() -> Self {
        MessageQueues::new()
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, message: T, name: &str) {
    if queue.len() >= QUEUE_CAPACITY {
        warn!("{} queue full, dropping the newest message", name);
        return;
    }
    queue.push_back(message);
}

/// The latest map-world ← odom-world correction, shared between the mapping
/// worker (writer) and the odometry ingress (reader).
pub struct SharedCorrection {
    inner: Mutex<Pose>,
}

impl SharedCorrection {
    pub fn new() -> Self {
        SharedCorrection {
            inner: Mutex::new(Pose::identity()),
        }
    }

    pub fn get(&self) -> Pose {
        *self.inner.lock().unwrap()
    }

    pub fn set(&self, pose: Pose) {
        *self.inner.lock().unwrap() = pose;
    }
}

impl Default for SharedCorrection {
    fn default() -> Self {
        SharedCorrection::new()
    }
}

/// Low-latency refined pose: the coarse odometry composed with the latest
/// correction. Emitted by the odometry ingress at ingress rate.
pub fn high_frequency_pose(correction: &SharedCorrection, message: &OdometryMessage) -> Pose {
    correction.get().compose(&message.pose)
}

/// One fully processed frame as handed to the output sink.
#[derive(Debug, Clone)]
pub struct MappedFrame {
    pub timestamp: f64,
    pub pose: Pose,
    /// Registered full cloud with the false-color reflectance ramp.
    pub registered_cloud: Vec<ColorPoint>,
    /// Registered full cloud with intensity = curvature·10, feeding the
    /// monochrome map accumulator. Absent when colorization is active.
    pub intensity_cloud: Option<Vec<LidarPoint>>,
    /// Camera-colorized registered cloud, when an image matched.
    pub colored_cloud: Option<Vec<ColorPoint>>,
    pub surround_cloud: Option<Vec<LidarPoint>>,
    pub map_cloud: Option<Vec<LidarPoint>>,
    pub degenerate: bool,
}

/// Runs the dedicated mapping worker until shutdown is requested or the
/// result sink goes away. All heavy work happens here with the queue mutex
/// released; ingress threads only ever append.
pub fn run_mapping_loop(
    mapper: &mut Mapper,
    queues: &MessageQueues,
    camera: Option<(&CameraBuffer, &Colorizer)>,
    correction: &SharedCorrection,
    results: &Sender<MappedFrame>,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let Some(frame) = queues.try_take_synced() else {
            sleep(IDLE_SLEEP);
            continue;
        };
        let result = mapper.process_frame(frame);
        correction.set(mapper.correction());
        let mapped = finish_frame(result, camera);
        if results.send(mapped).is_err() {
            break;
        }
    }
}

fn finish_frame(
    result: FrameResult,
    camera: Option<(&CameraBuffer, &Colorizer)>,
) -> MappedFrame {
    let registered_cloud = falsecolor_registered(&result.full_cloud, &result.pose);
    let (intensity_cloud, colored_cloud) = match camera {
        Some((buffer, colorizer)) => {
            let colored = buffer.take_best_match(result.timestamp).map(|frame| {
                colorizer.colorize(&result.full_cloud, &result.pose, &frame.image)
            });
            if colored.is_none() {
                debug!("no camera frame close enough to t = {}", result.timestamp);
            }
            (None, colored)
        }
        None => (
            Some(intensity_registered(&result.full_cloud, &result.pose)),
            None,
        ),
    };
    MappedFrame {
        timestamp: result.timestamp,
        pose: result.pose,
        registered_cloud,
        intensity_cloud,
        colored_cloud,
        surround_cloud: result.surround_cloud,
        map_cloud: result.map_cloud,
        degenerate: result.degenerate,
    }
}
