//! Command-line interface

use clap::Parser;

/// Earth Engine auth gateway
#[derive(Parser, Debug)]
#[command(name = "earthgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "EARTHGATE_CONFIG")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "EARTHGATE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "EARTHGATE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "EARTHGATE_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "EARTHGATE_LOG_FORMAT")]
    pub log_format: Option<String>,
}
