use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "courier-broker",
    version,
    about = "Uniform send/receive front for named message-broker connections"
)]
pub struct Cli {
    #[arg(short, long, default_value = "courier.json")]
    pub config: PathBuf,

    #[arg(long, default_value = "127.0.0.1:7171")]
    pub listen: SocketAddr,

    /// Also write the process log to this file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: log::LevelFilter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_arguments() {
        let cli = Cli::parse_from(["courier-broker"]);
        assert_eq!(cli.config, PathBuf::from("courier.json"));
        assert_eq!(cli.listen.port(), 7171);
        assert!(cli.log_file.is_none());
        assert_eq!(cli.log_level, log::LevelFilter::Info);
    }

    #[test]
    fn explicit_arguments_override_defaults() {
        let cli = Cli::parse_from([
            "courier-broker",
            "--config",
            "/etc/courier/brokers.json",
            "--listen",
            "0.0.0.0:9000",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/courier/brokers.json"));
        assert_eq!(cli.listen.port(), 9000);
        assert_eq!(cli.log_level, log::LevelFilter::Debug);
    }
}
