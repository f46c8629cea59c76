use anyhow::{bail, Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ingest_coordinator::{
    BatchCoordinator, BatchRecord, BatchSession, BatchStatus, BatchSummary, CoordinatorError,
    FsStateStore, MemoryJobQueue, MemoryStateStore, NewFile, StateStore, UploadKind,
};
use ingest_discovery::{build, DiscoveryProcessor};
use ingest_protocol::{document_schema, DiscoveryJob, Document, Manifest};
use ingest_store::{EntityClient, EntityStore, FsBlobStore, HttpEntityStore, MemoryEntityStore};
use ingest_text_chunker::TextChunker;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod config;
mod render;

pub use config::IngestConfig;

/// Bearer token for `--entity-url`.
pub const ENTITY_TOKEN_ENV: &str = "INGEST_ENTITY_TOKEN";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn print_stdout(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    print_stdout(&serde_json::to_string_pretty(value)?)
}

#[derive(Parser)]
#[command(name = "ingest")]
#[command(about = "Discover, chunk and publish uploaded file batches", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors (stdout is reserved for JSON)
    #[arg(long, global = true)]
    quiet: bool,

    /// TOML config file
    #[arg(long, global = true, env = "INGEST_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Preview the chunk plan of a text file
    Chunk(ChunkArgs),

    /// Print the directory tree a manifest produces
    Tree(TreeArgs),

    /// Run discovery for a manifest and print the downstream job
    Discover(DiscoverArgs),

    /// Show a persisted batch
    Status(StatusArgs),

    /// Continue every batch left mid-discovery
    Resume(ResumeArgs),

    /// Print the JSON Schema of an exchanged document
    Schema(SchemaArgs),
}

#[derive(Args)]
struct ChunkArgs {
    /// Text file to chunk
    file: PathBuf,

    /// Include chunk text in the output
    #[arg(long)]
    with_text: bool,
}

#[derive(Args)]
struct TreeArgs {
    /// Manifest JSON file
    manifest: PathBuf,

    /// Emit JSON instead of a drawing
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DiscoverMode {
    /// Inline for small batches, scheduled steps otherwise
    Auto,
    /// Always inline
    Sync,
    /// Always scheduled steps
    Async,
}

#[derive(Args)]
struct BackendArgs {
    /// Directory blob keys resolve against
    #[arg(long)]
    blobs: PathBuf,

    /// Entity service base URL; in-memory store when omitted
    #[arg(long, env = "INGEST_ENTITY_URL")]
    entity_url: Option<String>,
}

#[derive(Args)]
struct DiscoverArgs {
    /// Manifest JSON file
    #[arg(long)]
    manifest: PathBuf,

    #[command(flatten)]
    backend: BackendArgs,

    /// Directory for durable batch state; in-memory when omitted
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Entity to attach the published root to
    #[arg(long)]
    parent_pi: Option<String>,

    /// Override the manifest's batch id
    #[arg(long)]
    batch_id: Option<String>,

    #[arg(long, value_enum, default_value_t = DiscoverMode::Auto)]
    mode: DiscoverMode,
}

#[derive(Args)]
struct StatusArgs {
    batch_id: String,

    #[arg(long)]
    state_dir: PathBuf,

    /// Print the whole record, discovery state included
    #[arg(long)]
    full: bool,
}

#[derive(Args)]
struct ResumeArgs {
    #[arg(long)]
    state_dir: PathBuf,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SchemaDocument {
    Manifest,
    Job,
    ChunkIndex,
}

#[derive(Args)]
struct SchemaArgs {
    #[arg(value_enum)]
    document: SchemaDocument,
}

pub async fn main_entry() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let config = IngestConfig::load(cli.config.as_deref())?;
    config.validate()?;

    match cli.command {
        Commands::Chunk(args) => run_chunk(args, &config)?,
        Commands::Tree(args) => run_tree(args, &config)?,
        Commands::Discover(args) => run_discover(args, config).await?,
        Commands::Status(args) => run_status(args).await?,
        Commands::Resume(args) => run_resume(args, config).await?,
        Commands::Schema(args) => run_schema(args)?,
    }
    Ok(())
}

#[derive(Serialize)]
struct ChunkView {
    id: String,
    char_start: usize,
    char_end: usize,
    chars: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Serialize)]
struct ChunkPlanOutput {
    file: String,
    total_chars: usize,
    chunked: bool,
    chunk_size: usize,
    chunks: Vec<ChunkView>,
}

fn run_chunk(args: ChunkArgs, config: &IngestConfig) -> Result<()> {
    let text = fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let chunker = TextChunker::new(config.chunking.clone())?;

    let total_chars = text.chars().count();
    let chunks = chunker.plan(&text);
    if !chunks.is_empty() {
        log::info!("{}", TextChunker::get_stats(&chunks));
    }

    let output = ChunkPlanOutput {
        file: args.file.display().to_string(),
        total_chars,
        chunked: !chunks.is_empty(),
        chunk_size: chunker.chunk_size(total_chars),
        chunks: chunks
            .into_iter()
            .map(|chunk| ChunkView {
                chars: chunk.char_end - chunk.char_start,
                id: chunk.id,
                char_start: chunk.char_start,
                char_end: chunk.char_end,
                text: args.with_text.then_some(chunk.text),
            })
            .collect(),
    };
    print_json(&output)
}

fn read_manifest(path: &Path) -> Result<Manifest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid manifest {}", path.display()))
}

fn run_tree(args: TreeArgs, config: &IngestConfig) -> Result<()> {
    let manifest = read_manifest(&args.manifest)?;
    let state = build(&manifest, &config.discovery);
    if args.json {
        return print_json(&render::tree_view(&state));
    }
    print_stdout(render::tree_text(&state).trim_end())
}

struct Runtime {
    coordinator: BatchCoordinator,
    queue: Arc<MemoryJobQueue>,
}

fn open_runtime(
    config: &IngestConfig,
    backend: &BackendArgs,
    state_dir: Option<&Path>,
) -> Result<Runtime> {
    let entities: Arc<dyn EntityStore> = match &backend.entity_url {
        Some(url) => {
            let mut store = HttpEntityStore::new(url.as_str())
                .with_context(|| format!("Invalid entity service URL {url}"))?;
            if let Ok(token) = std::env::var(ENTITY_TOKEN_ENV) {
                store = store.with_token(token);
            }
            Arc::new(store)
        }
        None => {
            log::info!("No --entity-url given, publishing into an in-memory entity store");
            Arc::new(MemoryEntityStore::new())
        }
    };
    let state: Arc<dyn StateStore> = match state_dir {
        Some(dir) => Arc::new(FsStateStore::new(dir)),
        None => Arc::new(MemoryStateStore::new()),
    };

    let processor = DiscoveryProcessor::new(
        EntityClient::new(entities, config.entity_retry),
        Arc::new(FsBlobStore::new(&backend.blobs)),
        &config.discovery,
    )?;
    let queue = Arc::new(MemoryJobQueue::new());
    let coordinator = BatchCoordinator::new(
        config.coordinator.clone(),
        config.discovery.clone(),
        Arc::new(processor),
        state,
        queue.clone(),
    )?;
    Ok(Runtime { coordinator, queue })
}

async fn run_discover(args: DiscoverArgs, mut config: IngestConfig) -> Result<()> {
    let manifest = read_manifest(&args.manifest)?;
    match args.mode {
        DiscoverMode::Auto => {}
        DiscoverMode::Sync => {
            config.coordinator.sync_max_files = usize::MAX;
            config.coordinator.sync_max_text_files = usize::MAX;
        }
        DiscoverMode::Async => {
            config.coordinator.sync_max_files = 0;
            config.coordinator.sync_max_text_files = 0;
        }
    }

    let runtime = open_runtime(&config, &args.backend, args.state_dir.as_deref())?;
    let coordinator = &runtime.coordinator;
    let batch_id = args
        .batch_id
        .clone()
        .unwrap_or_else(|| manifest.batch_id.clone());

    let existing = match coordinator.get_state(&batch_id).await {
        Ok(record) => Some(record),
        Err(CoordinatorError::BatchNotFound(_)) => None,
        Err(err) => return Err(err).context("Failed to load batch state"),
    };

    match existing {
        Some(record) if record.discovery_pending() => {
            log::info!("Batch {batch_id} was interrupted mid-discovery, resuming");
            coordinator.resume_pending().await?;
        }
        Some(record) if record.status != BatchStatus::Uploading => {
            bail!("Batch {batch_id} is already {}", record.status);
        }
        existing => {
            if existing.is_none() {
                let session = BatchSession {
                    uploader: None,
                    parent_pi: args.parent_pi.clone(),
                    processing_config: manifest
                        .directories
                        .first()
                        .map(|group| group.processing_config.clone())
                        .unwrap_or_default(),
                };
                coordinator.init(&batch_id, session).await?;
            }
            register_files(coordinator, &batch_id, &manifest).await?;
            let outcome = coordinator
                .finalize(&batch_id, manifest)
                .await
                .with_context(|| format!("Discovery failed for batch {batch_id}"))?;
            log::info!("Batch {batch_id} finalized ({:?} discovery)", outcome.mode);
        }
    }

    let record = wait_for_discovery(coordinator, &batch_id).await?;
    if record.status == BatchStatus::Failed {
        bail!(
            "Discovery failed for batch {batch_id}: {}",
            record.error.as_deref().unwrap_or("unknown error")
        );
    }

    let job = latest_job(&runtime.queue, &batch_id)
        .with_context(|| format!("Batch {batch_id} finished without a downstream job"))?;
    print_json(&job)
}

/// Announce and complete every manifest file; the bytes are already in the
/// blob directory.
async fn register_files(
    coordinator: &BatchCoordinator,
    batch_id: &str,
    manifest: &Manifest,
) -> Result<()> {
    for file in manifest.files() {
        coordinator
            .add_file(
                batch_id,
                NewFile {
                    r2_key: file.r2_key.clone(),
                    logical_path: file.logical_path.clone(),
                    file_name: file.file_name.clone(),
                    file_size: file.file_size,
                    content_type: file.content_type.clone(),
                    upload: UploadKind::Simple,
                },
            )
            .await?;
        coordinator
            .complete_file(batch_id, &file.r2_key, Vec::new())
            .await?;
    }
    log::debug!("registered {} files for batch {batch_id}", manifest.total_files);
    Ok(())
}

async fn wait_for_discovery(coordinator: &BatchCoordinator, batch_id: &str) -> Result<BatchRecord> {
    let mut last_phase = None;
    loop {
        let record = coordinator.get_state(batch_id).await?;
        if record.status != BatchStatus::Discovery {
            return Ok(record);
        }
        let phase = record.discovery.as_ref().map(|state| state.phase);
        if phase != last_phase {
            if let Some(progress) = record.discovery.as_ref().map(|state| state.progress()) {
                log::info!(
                    "Batch {batch_id}: {} ({}/{} files, {}/{} chunks, {}/{} directories)",
                    progress.phase,
                    progress.counters.files_uploaded,
                    progress.counters.files_total,
                    progress.counters.chunks_uploaded,
                    progress.counters.chunks_total,
                    progress.counters.directories_published,
                    progress.counters.directories_total
                );
            }
            last_phase = phase;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn latest_job(queue: &MemoryJobQueue, batch_id: &str) -> Option<DiscoveryJob> {
    queue
        .jobs()
        .into_iter()
        .rev()
        .find(|job| job.batch_id == batch_id)
}

async fn run_status(args: StatusArgs) -> Result<()> {
    let store = FsStateStore::new(&args.state_dir);
    let record = store
        .load(&args.batch_id)
        .await?
        .with_context(|| {
            format!(
                "Batch {} not found in {}",
                args.batch_id,
                args.state_dir.display()
            )
        })?;
    if args.full {
        return print_json(&record);
    }
    print_json(&record.summary())
}

#[derive(Serialize)]
struct ResumeOutput {
    batches: Vec<BatchSummary>,
    jobs: Vec<DiscoveryJob>,
}

async fn run_resume(args: ResumeArgs, config: IngestConfig) -> Result<()> {
    let runtime = open_runtime(&config, &args.backend, Some(&args.state_dir))?;
    let resumed = runtime.coordinator.resume_pending().await?;
    if resumed.is_empty() {
        log::info!("Nothing to resume in {}", args.state_dir.display());
    }

    let mut batches = Vec::with_capacity(resumed.len());
    for batch_id in &resumed {
        let record = wait_for_discovery(&runtime.coordinator, batch_id).await?;
        if record.status == BatchStatus::Failed {
            log::warn!(
                "Batch {batch_id} failed: {}",
                record.error.as_deref().unwrap_or("unknown error")
            );
        }
        batches.push(record.summary());
    }
    print_json(&ResumeOutput {
        batches,
        jobs: runtime.queue.jobs(),
    })
}

fn run_schema(args: SchemaArgs) -> Result<()> {
    let document = match args.document {
        SchemaDocument::Manifest => Document::Manifest,
        SchemaDocument::Job => Document::DiscoveryJob,
        SchemaDocument::ChunkIndex => Document::ChunkIndex,
    };
    print_json(&document_schema(document))
}
