use anyhow::{anyhow, Context, Result};
use lidarmap_common::color::{CameraBuffer, CameraFrame};
use lidarmap_common::geometry::points::{FeatureCloud, LidarPoint};
use lidarmap_common::geometry::pose::Pose;
use lidarmap_common::pipeline::{
    high_frequency_pose, MessageQueues, OdometryMessage, SharedCorrection, QUEUE_CAPACITY,
};
use log::{debug, info};
use nalgebra::Vector3;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, sleep, JoinHandle};
use std::time::Duration;

/// Parses one `trajectory.txt` line:
/// `timestamp qx qy qz qw tx ty tz`, whitespace separated.
fn parse_trajectory_line(line: &str, number: usize) -> Result<OdometryMessage> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 8 {
        return Err(anyhow!(
            "Trajectory file, line {}: Expecting 8 columns, got {}",
            number,
            fields.len()
        ));
    }
    let mut values = [0.0_f64; 8];
    for (slot, field) in values.iter_mut().zip(&fields) {
        *slot = field
            .parse()
            .with_context(|| format!("Trajectory file, line {}: Unable to parse '{}'", number, field))?;
    }
    Ok(OdometryMessage {
        timestamp: values[0],
        pose: Pose::from_parts(
            values[1],
            values[2],
            values[3],
            values[4],
            Vector3::new(values[5], values[6], values[7]),
        ),
    })
}

pub fn load_trajectory(dataset: &Path) -> Result<Vec<OdometryMessage>> {
    let path = dataset.join("trajectory.txt");
    let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    let mut messages = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Trajectory file, line {}: I/O error", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        messages.push(parse_trajectory_line(&line, index + 1)?);
    }
    Ok(messages)
}

/// Reads one per-frame point file: `x y z intensity curvature` per line.
fn read_point_file(path: &Path) -> Result<Vec<LidarPoint>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut points = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("{}, line {}: I/O error", path.display(), index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(anyhow!(
                "{}, line {}: Expecting 5 columns, got {}",
                path.display(),
                index + 1,
                fields.len()
            ));
        }
        let mut values = [0.0_f64; 5];
        for (slot, field) in values.iter_mut().zip(&fields) {
            *slot = field.parse().with_context(|| {
                format!("{}, line {}: Unable to parse '{}'", path.display(), index + 1, field)
            })?;
        }
        points.push(LidarPoint::new(
            values[0],
            values[1],
            values[2],
            values[3] as f32,
            values[4] as f32,
        ));
    }
    Ok(points)
}

fn frame_file(dataset: &Path, stream: &str, index: usize) -> PathBuf {
    dataset.join(stream).join(format!("{}.txt", index))
}

/// Blocks until the queues have room again. Returns false when a shutdown
/// was requested while waiting.
fn wait_for_room(queues: &MessageQueues, shutdown: &AtomicBool) -> bool {
    while queues.backlog() >= QUEUE_CAPACITY / 2 {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        sleep(Duration::from_millis(1));
    }
    !shutdown.load(Ordering::Relaxed)
}

/// Starts one ingress thread per subscription: the three cloud streams, the
/// odometry stream (which also emits the high-frequency refined pose) and,
/// with a camera configured, the image stream.
pub fn spawn_ingress(
    dataset: PathBuf,
    trajectory: Vec<OdometryMessage>,
    queues: Arc<MessageQueues>,
    camera: Option<Arc<CameraBuffer>>,
    correction: Arc<SharedCorrection>,
    shutdown: Arc<AtomicBool>,
) -> Vec<JoinHandle<Result<()>>> {
    let mut handles = Vec::new();

    for stream in ["corner", "surface", "full"] {
        let dataset = dataset.clone();
        let trajectory = trajectory.clone();
        let queues = Arc::clone(&queues);
        let shutdown = Arc::clone(&shutdown);
        handles.push(thread::spawn(move || {
            for (index, message) in trajectory.iter().enumerate() {
                if !wait_for_room(&queues, &shutdown) {
                    return Ok(());
                }
                let points = read_point_file(&frame_file(&dataset, stream, index))?;
                let cloud = FeatureCloud::new(message.timestamp, points);
                match stream {
                    "corner" => queues.push_corner(cloud),
                    "surface" => queues.push_surface(cloud),
                    _ => queues.push_full(cloud),
                }
            }
            info!("{} stream finished", stream);
            Ok(())
        }));
    }

    {
        let trajectory = trajectory.clone();
        let queues = Arc::clone(&queues);
        let shutdown = Arc::clone(&shutdown);
        handles.push(thread::spawn(move || {
            for message in trajectory {
                if !wait_for_room(&queues, &shutdown) {
                    return Ok(());
                }
                // low-latency output: coarse odometry with the latest correction
                let refined = high_frequency_pose(&correction, &message);
                debug!(
                    "high-frequency pose t={:.3}: ({:.3}, {:.3}, {:.3})",
                    message.timestamp,
                    refined.translation.x,
                    refined.translation.y,
                    refined.translation.z
                );
                queues.push_odometry(message);
            }
            info!("odometry stream finished");
            Ok(())
        }));
    }

    if let Some(camera) = camera {
        handles.push(thread::spawn(move || {
            for (index, message) in trajectory.iter().enumerate() {
                if shutdown.load(Ordering::Relaxed) {
                    return Ok(());
                }
                let path = dataset.join("images").join(format!("{}.png", index));
                if !path.exists() {
                    continue;
                }
                let image = image::open(&path)
                    .with_context(|| format!("loading {}", path.display()))?
                    .to_rgb8();
                camera.push(CameraFrame {
                    timestamp: message.timestamp,
                    image,
                });
            }
            info!("image stream finished");
            Ok(())
        }));
    }

    handles
}
