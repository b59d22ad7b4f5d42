use clap::Parser;
use std::path::PathBuf;

/// Replays a recorded LiDAR feature/odometry dataset through the mapping
/// back-end and writes the accumulated map on shutdown.
#[derive(Debug, Parser)]
pub struct Args {
    /// Verbosity of the command line output.
    #[clap(long, default_value = "info")]
    pub log_level: log::Level,

    /// JSON file with the mapping configuration.
    #[clap(long)]
    pub config: PathBuf,

    /// Folder with the recorded dataset: a `trajectory.txt` plus `corner/`,
    /// `surface/` and `full/` point folders and an optional `images/` folder.
    /// By default, the current folder will be used.
    #[clap(default_value = ".", hide_default_value = true)]
    pub dataset: PathBuf,
}
