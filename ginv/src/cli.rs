//! CLI argument parsing for GINV

use std::path::PathBuf;

use clap::Parser;

/// GPU Inventory Controller - cluster GPU discovery and device records
#[derive(Debug, Parser)]
#[command(name = "ginv")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ginv/config.yaml")]
    pub config: PathBuf,

    /// Number of reconcile workers (overrides config)
    #[arg(long, env = "GINV_WORKERS")]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GINV_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "GINV_LOG_JSON")]
    pub log_json: bool,

    /// Run a single reconciliation pass over all nodes and exit
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["ginv"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/etc/ginv/config.yaml");
        assert_eq!(cli.log_level, "info");
        assert!(!cli.log_json);
        assert!(!cli.once);
        assert!(cli.workers.is_none());
    }

    #[test]
    fn test_cli_custom_config() {
        let cli = Cli::try_parse_from(["ginv", "-c", "/custom/config.yaml"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/custom/config.yaml");
    }

    #[test]
    fn test_cli_workers_override() {
        let cli = Cli::try_parse_from(["ginv", "--workers", "8"]).unwrap();
        assert_eq!(cli.workers, Some(8));
    }
}
