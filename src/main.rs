use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use ferry::backends::LocalBackend;
use ferry::context::AppContext;
use ferry::core::{Item, Plan, TransferMode, TransferRequest, TransferStatus, TransferSummary};
use ferry::logging::ProgressThrottle;
use ferry::{TransferError, config, logging};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Copy, move and download file trees between storage roots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy items, natively when both roots are the same
    Copy(TransferArgs),
    /// Copy items, then remove them from the source
    Move(TransferArgs),
    /// Copy items, always streaming the bytes through ferry
    Download(TransferArgs),
}

impl Commands {
    fn split(&self) -> (TransferMode, &TransferArgs) {
        match self {
            Commands::Copy(args) => (TransferMode::Copy, args),
            Commands::Move(args) => (TransferMode::Move, args),
            Commands::Download(args) => (TransferMode::Download, args),
        }
    }
}

#[derive(Args)]
struct TransferArgs {
    /// Source root directory
    #[arg(long)]
    from: PathBuf,

    /// Destination root directory
    #[arg(long)]
    to: PathBuf,

    /// Destination directory, relative to the destination root
    #[arg(long, default_value = "/")]
    into: String,

    /// Merge into existing folders and skip files already present
    #[arg(long)]
    keep_existing: bool,

    /// Fail on a taken name instead of picking "name (n)"
    #[arg(long)]
    fail_on_conflict: bool,

    #[arg(long)]
    parallelism: Option<usize>,

    /// Tee files at least this many bytes into the cache directory
    #[arg(long)]
    backup_threshold: Option<u64>,

    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[arg(long)]
    keep_backups: bool,

    /// Log as JSON lines and print the summary as JSON
    #[arg(long)]
    json: bool,

    #[arg(long)]
    verbose: bool,

    /// Entries to transfer, relative to the source root
    #[arg(required = true)]
    items: Vec<String>,
}

/// Command line values that override the config file and environment.
#[derive(Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    parallelism: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backup_threshold: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_backups: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rename_conflicts: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_logs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,
}

impl From<&TransferArgs> for Overrides {
    fn from(args: &TransferArgs) -> Self {
        Self {
            parallelism: args.parallelism,
            backup_threshold: args.backup_threshold,
            cache_dir: args.cache_dir.clone(),
            keep_backups: args.keep_backups.then_some(true),
            rename_conflicts: args.fail_on_conflict.then_some(false),
            json_logs: args.json.then_some(true),
            verbose: args.verbose.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mode, args) = cli.command.split();

    let config = config::AppConfig::new(Some(&Overrides::from(args)))
        .context("Failed to load configuration")?;
    logging::init(config.log_config()).context("Failed to initialize logging")?;

    let ctx = AppContext::new(config);
    run_transfer(ctx, mode, args)
        .await
        .with_context(|| format!("{} failed", mode.verb()))
}

async fn run_transfer(ctx: AppContext, mode: TransferMode, args: &TransferArgs) -> Result<()> {
    let source = Arc::new(LocalBackend::new(&args.from));
    let target = if same_root(&args.from, &args.to)? {
        Arc::clone(&source)
    } else {
        Arc::new(LocalBackend::new(&args.to))
    };

    let mut items: Vec<Item> = Vec::with_capacity(args.items.len());
    for entry in &args.items {
        let item = source
            .item(&LocalBackend::id_for(entry))
            .await
            .with_context(|| format!("Cannot read '{}' in {}", entry, args.from.display()))?;
        items.push(item);
    }
    let target_dir = LocalBackend::id_for(&args.into);

    let engine = ctx.engine(source, target);
    let collisions = engine
        .find_collisions(&items, &target_dir)
        .await
        .context("Failed to list the destination")?;
    for item in &collisions {
        warn!(item = %item.name(), "Already present at the destination");
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling transfer");
            interrupt.cancel();
        }
    });

    let request = TransferRequest {
        mode,
        items,
        target_dir,
        keep_existing: args.keep_existing,
    };
    let plan: Arc<Plan> = Arc::new(
        engine
            .plan(&request, &cancel)
            .await
            .context("Failed to plan transfer")?,
    );
    info!(
        nodes = plan.len(),
        files = plan.file_count(),
        total_bytes = plan.total_bytes(),
        "{} {} item(s)",
        mode.verb(),
        request.items.len()
    );
    if !plan.skipped().is_empty() {
        warn!(count = plan.skipped().len(), "Some files cannot be read and will be skipped");
    }

    let done = CancellationToken::new();
    let reporter = tokio::spawn(report_progress(ctx.clone(), done.clone()));
    let result = engine.execute(&plan, &cancel).await;
    done.cancel();
    let _ = reporter.await;

    match result {
        Ok(summary) => {
            print_summary(&summary, ctx.config.json_logs)?;
            Ok(())
        }
        Err(TransferError::Aggregate(agg)) => {
            for failure in &agg.failures {
                error!(item = %failure.label, error = %failure.error, "Not transferred");
            }
            bail!("{}", agg.user_message())
        }
        Err(e) => Err(e.into()),
    }
}

fn same_root(a: &Path, b: &Path) -> Result<bool> {
    let a = a
        .canonicalize()
        .with_context(|| format!("Source root {} is not accessible", a.display()))?;
    let b = b
        .canonicalize()
        .with_context(|| format!("Destination root {} is not accessible", b.display()))?;
    Ok(a == b)
}

async fn report_progress(ctx: AppContext, done: CancellationToken) {
    let throttle = ProgressThrottle::new(Duration::from_secs(5), 10);
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
        if let TransferStatus::InProgress {
            bytes_copied,
            total_bytes,
            current_file,
            percentage,
        } = ctx.progress.status().await
        {
            if throttle.should_report(percentage) {
                info!(bytes_copied, total_bytes, current_file = %current_file, "{}% done", percentage);
            }
        }
    }
}

fn print_summary(summary: &TransferSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(summary)?);
        return Ok(());
    }
    println!(
        "Done: {} file(s), {} folder(s), {} native, {} bytes",
        summary.files, summary.directories, summary.direct, summary.bytes
    );
    if summary.skipped > 0 {
        println!("Skipped {} unreadable file(s)", summary.skipped);
    }
    if summary.removed_sources > 0 {
        println!("Removed {} source item(s)", summary.removed_sources);
    }
    Ok(())
}
