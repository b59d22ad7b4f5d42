#![deny(unused_must_use)]

mod cli;
mod config;
mod replay;

use crate::cli::Args;
use crate::config::MapperConfig;
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use human_panic::setup_panic;
use lidarmap_common::color::{CameraBuffer, Colorizer};
use lidarmap_common::las::MapAccumulator;
use lidarmap_common::pipeline::{run_mapping_loop, MessageQueues, SharedCorrection};
use lidarmap_common::registration::Mapper;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    // panic handler
    setup_panic!();

    let args = Args::parse();

    // logger
    // unwrap: will only fail, if the logger is already initialized - which it clearly is not
    simple_logger::init_with_level(args.log_level).unwrap();

    let config = MapperConfig::load_from_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    info!(
        "line resolution {} plane resolution {}",
        config.mapping_line_resolution, config.mapping_plane_resolution
    );
    debug!(
        "lidar-from-imu extrinsic: t = {:?}, r = {:?}",
        config.mapping.extrinsic_t, config.mapping.extrinsic_r
    );

    let trajectory = replay::load_trajectory(&args.dataset)?;
    info!(
        "replaying {} frames from {}",
        trajectory.len(),
        args.dataset.display()
    );

    let queues = Arc::new(MessageQueues::new());
    let correction = Arc::new(SharedCorrection::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let camera = config
        .use_color
        .then(|| Arc::new(CameraBuffer::new(config.max_camera_time_diff)));
    let colorizer = config.use_color.then(|| Colorizer::new(config.camera_model()));

    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed))
            .context("installing the ctrl-c handler")?;
    }

    let (result_sender, result_receiver) = crossbeam_channel::bounded(16);

    // the dedicated mapping worker
    let worker = {
        let queues = Arc::clone(&queues);
        let correction = Arc::clone(&correction);
        let shutdown = Arc::clone(&shutdown);
        let camera = camera.clone();
        let params = config.mapper_params();
        thread::spawn(move || {
            let mut mapper = Mapper::new(params);
            let camera_pair = camera.as_deref().zip(colorizer.as_ref());
            run_mapping_loop(
                &mut mapper,
                &queues,
                camera_pair,
                &correction,
                &result_sender,
                &shutdown,
            );
        })
    };

    let ingress = replay::spawn_ingress(
        args.dataset.clone(),
        trajectory,
        Arc::clone(&queues),
        camera.clone(),
        Arc::clone(&correction),
        Arc::clone(&shutdown),
    );

    // once all producers finished and the queues drained, stop the worker
    let supervisor = {
        let queues = Arc::clone(&queues);
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || {
            for handle in ingress {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("ingress failed: {:#}", e);
                        shutdown.store(true, Ordering::Relaxed);
                    }
                    Err(_) => {
                        error!("ingress thread panicked");
                        shutdown.store(true, Ordering::Relaxed);
                    }
                }
            }
            while queues.backlog() > 0 && !shutdown.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(10));
            }
            // grace period for the frame still in flight
            thread::sleep(Duration::from_millis(50));
            shutdown.store(true, Ordering::Relaxed);
        })
    };

    // consume results until the worker hangs up
    let mut accumulator = MapAccumulator::new();
    for frame in result_receiver.iter() {
        info!(
            "frame t={:.3}{}: pose ({:.3}, {:.3}, {:.3}), {} registered points",
            frame.timestamp,
            if frame.degenerate { " (sparse map)" } else { "" },
            frame.pose.translation.x,
            frame.pose.translation.y,
            frame.pose.translation.z,
            frame.registered_cloud.len()
        );
        if let Some(cloud) = &frame.surround_cloud {
            debug!("surround cloud: {} points", cloud.len());
        }
        if let Some(cloud) = &frame.map_cloud {
            debug!("full map cloud: {} points", cloud.len());
        }
        if let Some(cloud) = &frame.intensity_cloud {
            accumulator.append_intensity(frame.timestamp, cloud);
        }
        if let Some(cloud) = &frame.colored_cloud {
            accumulator.append_colored(cloud);
        }
    }

    worker
        .join()
        .map_err(|_| anyhow!("mapping worker panicked"))?;
    supervisor
        .join()
        .map_err(|_| anyhow!("supervisor panicked"))?;

    info!(
        "writing {} accumulated points to {}",
        accumulator.len(),
        config.pcd_save_path.display()
    );
    accumulator
        .save(&config.pcd_save_path)
        .with_context(|| format!("writing the map to {}", config.pcd_save_path.display()))?;
    Ok(())
}
