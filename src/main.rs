use coral_decoy::cli::Cli;
use coral_decoy::config::{Config, EventOutput};
use coral_decoy::error::AppError;
use coral_decoy::event::{write_events, ChannelSink, Event, EventSink, LogSink};
use coral_decoy::server::Server;
use coral_decoy::telemetry;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    telemetry::init_logging(cli.log_level())?;

    let config = Config::from_sources(&cli)?;
    let _telemetry = telemetry::init_telemetry()?;

    let (sink, rx) = ChannelSink::with_capacity(config.events.queue_capacity);
    spawn_event_writer(&config.events.output, rx).await?;

    let server = Server::bind(&config, Arc::new(sink)).await?;
    info!(
        "Decoy started with {} listener(s) on {}",
        config.services.len(),
        config.server.host
    );
    server.run().await?;
    Ok(())
}

async fn spawn_event_writer(output: &EventOutput, mut rx: Receiver<Event>) -> Result<(), AppError> {
    match output {
        EventOutput::Log => {
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    LogSink.submit(event);
                }
            });
        }
        EventOutput::File { path } => {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            info!("Writing events to {}", path.display());
            tokio::spawn(async move {
                if let Err(e) = write_events(rx, file).await {
                    error!("Event writer stopped: {}", e);
                }
            });
        }
    }
    Ok(())
}
