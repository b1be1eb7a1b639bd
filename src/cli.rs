use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "transcodeq")]
#[command(author, version, about = "Background conversion queue for uploaded media")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "transcodeq.json")]
    pub config: PathBuf,

    /// Override the SQLite database location
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the worker pool until interrupted
    Run {
        /// Number of concurrent conversions (overrides config)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },

    /// Register an upload and queue its conversion if the format needs one
    Enqueue {
        /// Uploaded file
        #[arg(required = true)]
        input: PathBuf,

        /// MIME type reported by the uploader (guessed from the extension if omitted)
        #[arg(long)]
        mime_type: Option<String>,

        /// Lower values are converted first
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,

        /// Queue a conversion even for formats browsers can already play
        #[arg(long)]
        force: bool,
    },

    /// Show queue counts
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a single job
    Job {
        /// Job id
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop handing out new jobs
    Pause,

    /// Resume handing out jobs
    Resume,

    /// Delete finished jobs older than the given age
    Clean {
        /// Age in hours (defaults to the configured value)
        #[arg(long)]
        older_than_hours: Option<u64>,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate,
}
