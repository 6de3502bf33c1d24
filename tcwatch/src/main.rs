use std::sync::Arc;

use clap::Parser;
use tracing::info;

use tcwatch::capture;
use tcwatch::config::{CaptureConfig, CliArgs};
use tcwatch::logging;
use tcwatch::sink::{EventSink, LineSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();
    logging::init()?;

    let config = CaptureConfig::from_cli(&cli);
    info!(
        "tcwatch starting (iface={}, all_interfaces={}, workers={}, buffer={}, dns={})",
        config.interface,
        config.all_interfaces,
        config.worker_count,
        config.event_buffer_size,
        config.dns_enabled
    );

    let sink: Arc<dyn EventSink> = Arc::new(LineSink);
    capture::run(config, sink).await
}
