mod cli;
mod logging;

use clap::Parser;
use tracing::{info, warn};

use gridpilot_core::config::PilotConfig;
use gridpilot_core::infosys::InfoService;
use gridpilot_engine::context::PilotContext;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();

    let mut config = PilotConfig::load(&cli.config)
        .map_err(|err| anyhow::anyhow!("failed to load pilot configuration: {err}"))?;
    if let Some(queue) = cli.queue {
        config.pandaqueue = queue;
    }
    if let Some(server_url) = cli.server_url {
        config.server_url = server_url;
    }
    if let Some(catalog_url) = cli.catalog_url {
        config.catalog_url = catalog_url;
    }
    if let Some(workdir) = cli.workdir {
        config.workdir = workdir;
    }

    let info = if cli.queue_config.exists() {
        InfoService::load(&cli.queue_config)
            .map_err(|err| anyhow::anyhow!("failed to load queue configuration: {err}"))?
    } else {
        warn!(
            "queue configuration {} not found, running with defaults",
            cli.queue_config.display()
        );
        InfoService::default()
    };

    info!(
        "gridpilot {} starting: queue={}, server={}",
        env!("CARGO_PKG_VERSION"),
        config.pandaqueue,
        config.resolved_server_url()
    );

    let ctx = PilotContext::new(config, info);
    gridpilot_engine::run(ctx)
        .await
        .map_err(|err| anyhow::anyhow!("pilot ended with an error: {err}"))?;

    info!("gridpilot finished");
    Ok(())
}
