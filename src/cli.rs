//! CLI definitions for the daemon and the client.

use clap::Parser;
use std::path::PathBuf;

pub const MAX_WARM: u32 = 120;

#[derive(Parser)]
#[clap(
    name = "simdad",
    version,
    about = "System Information Monitoring DAemon",
    long_about = None
)]
pub struct DaemonCli {
    /// Path to configuration file
    #[clap(long, short, default_value = "/etc/simda/config.yml")]
    pub config: PathBuf,
}

#[derive(Parser)]
#[clap(
    name = "simda",
    version,
    about = "System Information Monitoring DAemon client",
    long_about = None
)]
pub struct ClientCli {
    /// Receive snapshots every N seconds
    #[clap(long, short, default_value = "5")]
    pub receive: u32,

    /// Warm up time in seconds
    #[clap(long, short, default_value = "5")]
    pub warm: u32,

    /// Server ip
    #[clap(long, short, default_value = "127.0.0.1")]
    pub server: String,

    /// Server port
    #[clap(long, short, default_value = "50051")]
    pub port: u16,
}

impl ClientCli {
    pub fn validate(&self) -> Result<(), String> {
        if self.warm > MAX_WARM {
            return Err(format!("warm cannot be greater than {MAX_WARM} seconds"));
        }
        if self.warm < self.receive {
            return Err("warm cannot be less than receive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let cli = ClientCli::parse_from(["simda"]);
        assert_eq!(cli.receive, 5);
        assert_eq!(cli.warm, 5);
        assert_eq!(cli.server, "127.0.0.1");
        assert_eq!(cli.port, 50051);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn client_rejects_bad_windows() {
        let cli = ClientCli::parse_from(["simda", "--warm", "121", "--receive", "1"]);
        assert!(cli.validate().is_err());

        let cli = ClientCli::parse_from(["simda", "--warm", "3", "--receive", "5"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn daemon_default_config_path() {
        let cli = DaemonCli::parse_from(["simdad"]);
        assert_eq!(cli.config, PathBuf::from("/etc/simda/config.yml"));
    }
}
