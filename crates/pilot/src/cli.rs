use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "gridpilot", version, about = "grid workload agent")]
pub struct Cli {
    /// Pilot configuration file.
    #[arg(long, env = "GRIDPILOT_CONFIG", default_value = "pilot.json")]
    pub config: PathBuf,

    /// Queue/storage configuration document.
    #[arg(long, env = "GRIDPILOT_QUEUE_CONFIG", default_value = "queuedata.json")]
    pub queue_config: PathBuf,

    /// Panda queue to serve (overrides the configuration file).
    #[arg(short = 'q', long, env = "GRIDPILOT_QUEUE")]
    pub queue: Option<String>,

    /// Workload-management server base URL (overrides the configuration
    /// file; `PANDA_SERVER_URL` still wins at request time).
    #[arg(long, env = "GRIDPILOT_SERVER_URL")]
    pub server_url: Option<String>,

    /// Replica catalog base URL (overrides the configuration file).
    #[arg(long, env = "GRIDPILOT_CATALOG_URL")]
    pub catalog_url: Option<String>,

    /// Base directory for per-job work directories.
    #[arg(short = 'w', long, env = "GRIDPILOT_WORKDIR")]
    pub workdir: Option<PathBuf>,
}
