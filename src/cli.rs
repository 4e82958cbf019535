use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser)]
#[command(author, version, about, propagate_version = true)]
#[must_use]
pub struct Args {
    /// Enable debug messages.
    #[clap(long, env = "POWERWALL_EXPORTER_DEBUG")]
    pub debug: bool,

    /// Style of log output to produce.
    #[clap(
        long = "log.style",
        value_enum,
        default_value = "text",
        env = "POWERWALL_EXPORTER_LOG_STYLE",
    )]
    pub log_style: LogStyle,

    /// Path to the configuration file.
    #[clap(
        long = "config.file",
        default_value = "powerwall-exporter.toml",
        env = "POWERWALL_EXPORTER_CONFIG_FILE",
    )]
    pub config_file: PathBuf,

    /// Retrieve the gateway TLS certificate, store it in the configured
    /// certificate file, and exit without starting the server.
    #[clap(long = "fetchcert")]
    pub fetch_cert: bool,
}

#[derive(Copy, Clone, ValueEnum)]
pub enum LogStyle {
    /// Compact human-readable output.
    Text,

    /// Full single-line output with timestamps.
    Logfmt,

    /// Structured JSON output.
    Json,
}
