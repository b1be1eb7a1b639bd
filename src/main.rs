mod cli;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use tokio_util::sync::CancellationToken;
use tq_core::config::Config;
use tq_core::ConversionStatus;
use tq_db::SqliteMediaStore;
use tq_worker::QueueController;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "transcodeq=debug,tq_worker=debug,tq_av=debug,tq_db=debug,tq_core=debug".to_string()
        } else {
            "transcodeq=info,tq_worker=info,tq_av=info,tq_db=warn,tq_core=info".to_string()
        }
    });

    tracing_subscriber::fmt().with_env_filter(&env_filter).init();

    let mut config = Config::load_or_default(Some(cli.config.as_path()));
    if let Some(db) = cli.db.clone() {
        config.store.db_path = db;
    }

    match cli.command {
        Commands::Run { concurrency } => {
            if let Some(n) = concurrency {
                config.queue.concurrency = n;
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(tq_worker::start(config, CancellationToken::new()))?;
            Ok(())
        }
        Commands::Enqueue {
            input,
            mime_type,
            priority,
            force,
        } => enqueue(config, &input, mime_type, priority, force),
        Commands::Stats { json } => stats(config, json),
        Commands::Job { id, json } => job_info(config, &id, json),
        Commands::Pause => {
            controller(config)?.pause()?;
            println!("Queue paused");
            Ok(())
        }
        Commands::Resume => {
            controller(config)?.resume()?;
            println!("Queue resumed");
            Ok(())
        }
        Commands::Clean { older_than_hours } => {
            let controller = controller(config)?;
            let removed = match older_than_hours {
                Some(h) => controller.clean(Duration::from_secs(h * 3600))?,
                None => controller.clean_default()?,
            };
            println!("Removed {removed} finished jobs");
            Ok(())
        }
        Commands::CheckTools => check_tools(&config),
        Commands::Validate => validate_config(&cli.config),
    }
}

fn controller(config: Config) -> Result<QueueController> {
    let db = tq_db::init_pool(&config.store.db_path)
        .with_context(|| format!("opening {}", config.store.db_path.display()))?;
    Ok(QueueController::new(tq_worker::context_with_pool(config, db)))
}

/// MIME type for an upload when the uploader did not send one.
fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

fn enqueue(
    config: Config,
    input: &Path,
    mime_type: Option<String>,
    priority: i32,
    force: bool,
) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input file does not exist: {}", input.display());
    }
    let input = input
        .canonicalize()
        .with_context(|| format!("resolving {}", input.display()))?;
    let mime_type = mime_type.unwrap_or_else(|| guess_mime_type(&input).to_string());
    let filename = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let db = tq_db::init_pool(&config.store.db_path)?;
    let media = SqliteMediaStore::new(db.clone())
        .create(&filename, &mime_type, ConversionStatus::None)?;
    let controller = QueueController::new(tq_worker::context_with_pool(config, db));

    let job_id = if force {
        Some(controller.enqueue(media.id, &input, priority)?)
    } else {
        controller.schedule_if_needed(media.id, &input, &mime_type)?
    };

    println!("Media: {}", media.id);
    match job_id {
        Some(id) => println!("Job:   {id}"),
        None => println!("No conversion needed for {mime_type}"),
    }
    Ok(())
}

fn stats(config: Config, json: bool) -> Result<()> {
    let stats = controller(config)?.stats()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Waiting:   {}", stats.waiting);
        println!("Active:    {}", stats.active);
        println!("Delayed:   {}", stats.delayed);
        println!("Completed: {}", stats.completed);
        println!("Failed:    {}", stats.failed);
        println!("Total:     {}", stats.total);
        if stats.paused {
            println!("\nQueue is paused");
        }
    }
    Ok(())
}

fn job_info(config: Config, id: &str, json: bool) -> Result<()> {
    let Some(info) = controller(config)?.get_job_info(id)? else {
        anyhow::bail!("No job with id {id}");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Job:       {}", info.id);
    println!("Media:     {}", info.media_id);
    println!("Input:     {}", info.input_path.display());
    println!("State:     {}", info.state);
    println!("Progress:  {}%", info.progress);
    println!("Attempts:  {}/{}", info.attempts_made, info.max_attempts);
    println!("Created:   {}", info.created_at);
    if let Some(t) = info.processed_at {
        println!("Processed: {t}");
    }
    if let Some(t) = info.finished_at {
        println!("Finished:  {t}");
    }
    if let Some(reason) = &info.failed_reason {
        println!("Error:     {reason}");
    }
    Ok(())
}

fn check_tools(config: &Config) -> Result<()> {
    println!("Checking external tools...\n");

    let tools = tq_av::ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);
        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }
        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }
        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Conversions fail until they are installed.");
    }
    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    println!("Validating config: {}", path.display());

    let config = match std::fs::read_to_string(path) {
        Ok(contents) => Config::from_json(&contents)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No config file found, using defaults");
            Config::default()
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ Configuration is valid");
    } else {
        for w in &warnings {
            println!("⚠ {w}");
        }
    }
    println!("  Database: {}", config.store.db_path.display());
    println!("  Output dir: {}", config.transcoder.output_dir.display());
    println!("  Concurrency: {}", config.queue.concurrency);
    println!("  Max attempts: {}", config.queue.max_attempts);
    println!(
        "  Backoff: {}s doubling, capped at {}s",
        config.queue.backoff_base_secs, config.queue.backoff_max_secs
    );
    println!("  Job timeout: {}s", config.queue.job_timeout_secs);
    Ok(())
}
