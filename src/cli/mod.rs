use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pluct",
    about = "Pluct - Transcribe short videos through the Pluct Business Engine",
    version,
    long_about = "A CLI client for the Pluct Business Engine. Submits short-video URLs for transcription, polls the job to completion, and prints or saves the transcript. Requests are shielded by a local rate limiter, retry with backoff, and a circuit breaker."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Transcribe a short-video URL
    Transcribe {
        /// Video URL to transcribe
        #[arg(value_name = "URL")]
        url: String,

        /// Output file path (prints to console if not specified)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the remaining credit balance
    Balance,

    /// Probe engine health and show client-side request counters
    Health,

    /// Configure engine connection and resilience settings
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum OutputFormat {
    /// Plain transcript text
    Text,
    /// Full result as JSON (confidence, language, duration)
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}
