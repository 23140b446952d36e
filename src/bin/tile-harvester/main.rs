mod args;
mod validators;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use args::{Args, FetchArgs, InventoryArgs, PlanArgs, PublishArgs, Subcommand};
use planning_tile_harvester::{
    build_descriptors, init_logging, inventory, summarize, ConfigError, ExitStatus, Fetcher,
    HttpTileSource, ProgressEvent, ProgressHook, Publisher, RunContext, RunError, RunStats,
    S3Store, StorageConfig, StoreError, TemplateRegistry,
};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbosity);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, finishing in-flight work");
                cancel.cancel();
            }
        }
    });

    let status = match run(args.command, cancel).await {
        Ok(status) => status,
        Err(err) => {
            error!("{:#}", err);
            exit_status_of(&err)
        }
    };

    std::process::exit(status.code());
}

async fn run(command: Subcommand, cancel: CancellationToken) -> Result<ExitStatus> {
    match command {
        Subcommand::Plan(args) => plan(args),
        Subcommand::Fetch(args) => fetch(args, cancel).await,
        Subcommand::Publish(args) => publish(args, cancel).await,
        Subcommand::Inventory(args) => show_inventory(args).await,
    }
}

fn exit_status_of(err: &anyhow::Error) -> ExitStatus {
    if let Some(err) = err.downcast_ref::<RunError>() {
        ExitStatus::from_error(err)
    } else if err.downcast_ref::<ConfigError>().is_some()
        || err.downcast_ref::<StoreError>().is_some()
    {
        ExitStatus::ConfigError
    } else {
        ExitStatus::PartialFailure
    }
}

fn plan(args: PlanArgs) -> Result<ExitStatus> {
    let registry = TemplateRegistry::load(&args.input)?;
    let descriptors = build_descriptors(&registry, &args.zooms, &args.filter)?;
    let summary = summarize(&descriptors);

    for (combination, count) in &summary.by_combination {
        println!("{:<40} {:>9}", combination, count);
    }
    println!("{}", summary.describe());

    Ok(ExitStatus::Success)
}

async fn fetch(args: FetchArgs, cancel: CancellationToken) -> Result<ExitStatus> {
    let registry = TemplateRegistry::load(&args.input)?;
    let descriptors = build_descriptors(&registry, &args.config.zooms, &args.filter)?;
    if descriptors.is_empty() {
        return Err(ConfigError::NothingToFetch.into());
    }

    if args.dry_run {
        eprintln!("{}", summarize(&descriptors).describe());
        return Ok(ExitStatus::Success);
    }

    let source = HttpTileSource::new(&args.config.http)?;
    let ctx = RunContext::new(source, args.config.rate_per_second)
        .with_shared(cancel, Arc::new(RunStats::default()));

    let pb = progress_bar(descriptors.len() as u64)?;
    let fetcher = Fetcher::new(ctx, args.config)
        .await?
        .with_hook(progress_hook(pb.clone()));
    let report = fetcher.run(descriptors).await?;
    pb.finish_and_clear();

    report
        .write(&args.report)
        .await
        .with_context(|| format!("failed writing report {}", args.report.display()))?;
    eprint!("{}", report.summary());

    Ok(report.exit_status())
}

async fn publish(args: PublishArgs, cancel: CancellationToken) -> Result<ExitStatus> {
    let storage = StorageConfig::from_env(Some(&args.storage_config))?;
    let store = S3Store::new(&storage)?;
    let ctx = RunContext::new(store, args.config.rate_per_second)
        .with_shared(cancel, Arc::new(RunStats::default()));

    let pb = progress_bar(0)?;
    let publisher = Publisher::new(ctx).with_hook(progress_hook(pb.clone()));
    let report = publisher
        .publish(
            &args.config.tile_root,
            &args.config.prefix,
            &args.config.filters,
            &args.config.options,
        )
        .await?;
    pb.finish_and_clear();

    report
        .write(&args.report)
        .await
        .with_context(|| format!("failed writing report {}", args.report.display()))?;
    eprint!("{}", report.summary());

    Ok(report.exit_status())
}

async fn show_inventory(args: InventoryArgs) -> Result<ExitStatus> {
    let root = args.tiles.clone();
    let inventory = tokio::task::spawn_blocking(move || inventory(&root))
        .await
        .context("inventory task failed")??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&inventory)?);
    } else {
        for (key, entry) in &inventory.entries {
            println!(
                "{:<48} {:>9} {:>12}",
                key,
                entry.files,
                pretty_bytes::converter::convert(entry.bytes as f64)
            );
        }
        println!(
            "{} tiles, {} ({} files outside the tile layout)",
            inventory.total_files,
            pretty_bytes::converter::convert(inventory.total_bytes as f64),
            inventory.unrecognized
        );
    }

    Ok(ExitStatus::Success)
}

fn progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:60.cyan/blue} {pos:>7}/{len:7} ETA: {eta} {msg}")?
            .progress_chars("##-"),
    );
    Ok(pb)
}

fn progress_hook(pb: ProgressBar) -> ProgressHook {
    Arc::new(move |event: &ProgressEvent<'_>| match event {
        ProgressEvent::Started { total } => pb.set_length(*total),
        ProgressEvent::Fetched(_) | ProgressEvent::Published(_) => pb.inc(1),
    })
}
