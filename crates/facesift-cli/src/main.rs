use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facesift_core::Scorer;
use facesift_pipeline::ingest::ingest;
use facesift_pipeline::session::Session;
use facesift_pipeline::{
    BatchPipeline, Config, EmbeddingOracle, OnnxOracle, PhotoFilter, RunState, RunStatus, Stores,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facesift", about = "Find the photos you appear in, entirely on this machine")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set the reference face from a selfie
    Calibrate {
        /// Image containing your face
        image: PathBuf,
    },
    /// Add photos (files or directories) to the library
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Match every unprocessed photo against the reference face
    Scan,
    /// List processed photos
    Results {
        /// Only photos that matched the reference
        #[arg(long)]
        matches: bool,
    },
    /// Show library and reference status
    Status,
    /// Delete the reference face, all records and all stored photos
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Serialize)]
struct LibraryStatus {
    data_dir: PathBuf,
    metric: String,
    threshold: f32,
    reference_dim: Option<usize>,
    photos: usize,
    unprocessed: usize,
    with_face: usize,
    matches: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let stores = facesift_store::open(&config.db_path(), &config.blob_dir())
        .await
        .with_context(|| format!("failed to open library at {}", config.data_dir.display()))?;

    match cli.command {
        Commands::Calibrate { image } => calibrate(&config, stores, &image).await,
        Commands::Ingest { paths } => ingest_paths(&stores, &paths).await,
        Commands::Scan => scan(&config, stores).await,
        Commands::Results { matches } => results(&stores, matches).await,
        Commands::Status => status(&config, &stores).await,
        Commands::Reset { yes } => reset(&config, stores, yes).await,
    }
}

fn oracle(config: &Config) -> Arc<dyn EmbeddingOracle> {
    Arc::new(OnnxOracle::new(config.oracle_settings()))
}

async fn calibrate(config: &Config, stores: Stores, image: &Path) -> Result<()> {
    let bytes = tokio::fs::read(image)
        .await
        .with_context(|| format!("failed to read {}", image.display()))?;
    let session = Session::new(oracle(config), stores);
    let reference = session.calibrate(bytes).await.context("calibration failed")?;
    println!("Reference face set ({} dimensions)", reference.dim());
    Ok(())
}

async fn ingest_paths(stores: &Stores, paths: &[PathBuf]) -> Result<()> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries = tokio::fs::read_dir(path)
                .await
                .with_context(|| format!("failed to list {}", path.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    files.push(entry.path());
                }
            }
        } else {
            files.push(path.clone());
        }
    }
    files.sort();

    let mut added = 0;
    for file in &files {
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = match tokio::fs::read(file).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %file.display(), error = %e, "skipping unreadable file");
                continue;
            }
        };
        match ingest(stores, &filename, bytes).await {
            Ok(record) => {
                added += 1;
                tracing::info!(id = %record.id, path = %file.display(), "ingested");
            }
            Err(e) => tracing::warn!(path = %file.display(), error = %e, "skipping file"),
        }
    }

    println!("Ingested {added} of {} files", files.len());
    Ok(())
}

async fn scan(config: &Config, stores: Stores) -> Result<()> {
    let (tx, mut rx) = watch::channel(RunState::default());

    let mut pipeline = BatchPipeline::new(oracle(config), Scorer::new(config.scorer_config()), stores)
        .with_sink(Arc::new(tx))
        .with_yielder(config.yielder());

    let cancel = pipeline.cancel_flag();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling after the current photo...");
            cancel.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        let mut last = None;
        while rx.changed().await.is_ok() {
            let s = rx.borrow_and_update().clone();
            let line = (s.status, s.processed);
            if s.status == RunStatus::Running && last != Some(line) {
                eprint!("\r{}/{} processed, {} matched", s.processed, s.total, s.matched);
            }
            last = Some(line);
        }
        eprintln!();
    });

    let state = pipeline.run().await;
    drop(pipeline);
    ctrl_c.abort();
    let _ = printer.await;

    println!("{}", serde_json::to_string_pretty(&state)?);
    match state.status {
        RunStatus::Error => bail!(state.error.unwrap_or_else(|| "scan failed".into())),
        _ => Ok(()),
    }
}

async fn results(stores: &Stores, matches_only: bool) -> Result<()> {
    let filter = if matches_only {
        PhotoFilter::matches()
    } else {
        PhotoFilter {
            processed: Some(true),
            ..PhotoFilter::default()
        }
    };
    for record in stores.records.query(filter).await? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

async fn status(config: &Config, stores: &Stores) -> Result<()> {
    let scorer = config.scorer_config();
    let records = &stores.records;
    let report = LibraryStatus {
        data_dir: config.data_dir.clone(),
        metric: scorer.metric.to_string(),
        threshold: scorer.threshold,
        reference_dim: stores.reference.get().await?.map(|r| r.dim()),
        photos: records.count(PhotoFilter::all()).await?,
        unprocessed: records.count(PhotoFilter::unprocessed()).await?,
        with_face: records
            .count(PhotoFilter {
                has_face: Some(true),
                ..PhotoFilter::default()
            })
            .await?,
        matches: records.count(PhotoFilter::matches()).await?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn reset(config: &Config, stores: Stores, yes: bool) -> Result<()> {
    if !yes {
        bail!("reset deletes every stored photo and the reference face; rerun with --yes");
    }
    let session = Session::new(oracle(config), stores);
    let summary = session.reset().await?;
    println!("Removed {} records and {} photos", summary.records, summary.blobs);
    Ok(())
}
