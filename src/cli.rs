use crate::services::ServiceKind;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(name = "coral-decoy")]
#[command(about = "Low-interaction decoy for Claymore, CouchDB, Redis and MongoDB")]
#[command(long_about = "Coral Decoy listens on the ports of commonly probed services, answers \
with canned replies that look real enough to keep a scanner talking, and records every request \
as a structured event")]
#[command(version)]
pub struct Cli {
    /// Address every listener binds to
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Configuration file path (JSON format)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port for the Claymore miner API
    #[arg(long)]
    pub claymore_port: Option<u16>,

    /// Port for the CouchDB REST API
    #[arg(long)]
    pub couchdb_port: Option<u16>,

    /// Port for the Redis listener
    #[arg(long)]
    pub redis_port: Option<u16>,

    /// Port for the MongoDB listener
    #[arg(long)]
    pub mongodb_port: Option<u16>,

    /// Append events as JSON lines to this file instead of logging them
    #[arg(short, long)]
    pub events_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Port override given for `kind`, if any.
    pub fn port_for(&self, kind: ServiceKind) -> Option<u16> {
        match kind {
            ServiceKind::Claymore => self.claymore_port,
            ServiceKind::Couchdb => self.couchdb_port,
            ServiceKind::Redis => self.redis_port,
            ServiceKind::Mongodb => self.mongodb_port,
        }
    }

    /// Maximum log level implied by the verbosity flags.
    pub fn log_level(&self) -> tracing::Level {
        if self.debug {
            tracing::Level::TRACE
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "coral-decoy",
            "--host",
            "0.0.0.0",
            "--redis-port",
            "6380",
            "--events-file",
            "/tmp/events.json",
            "-v",
        ])
        .unwrap();

        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cli.port_for(ServiceKind::Redis), Some(6380));
        assert_eq!(cli.port_for(ServiceKind::Mongodb), None);
        assert_eq!(cli.log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_debug_wins_over_verbose() {
        let cli = Cli::try_parse_from(["coral-decoy", "-v", "-d"]).unwrap();
        assert_eq!(cli.log_level(), tracing::Level::TRACE);
    }

    #[test]
    fn test_rejects_bad_port() {
        assert!(Cli::try_parse_from(["coral-decoy", "--mongodb-port", "70000"]).is_err());
    }
}
