//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Gangway - a single-port gateway for dynamically managed backend servers
#[derive(Parser, Debug)]
#[command(name = "gangway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "GANGWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "GANGWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "GANGWAY_HOST")]
    pub host: Option<String>,

    /// Path to the backend config store (JSON)
    #[arg(long, env = "GANGWAY_STORE")]
    pub store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GANGWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "GANGWAY_LOG_FORMAT")]
    pub log_format: Option<String>,
}
