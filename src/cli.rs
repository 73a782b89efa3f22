//! Command line interface for the `gosoc` demo server.

use clap::Parser;

/// Command line arguments for the `gosoc` binary.
#[derive(Debug, Parser)]
#[command(name = "gosoc", version, about = "GOSOC demo chat server")]
pub struct Cli {
    /// JSON configuration file; when given, the flags below are ignored.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub addr: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 9701)]
    pub port: u16,
}
