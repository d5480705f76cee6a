//! certaudio-gen - certification audio pipeline
//!
//! Subcommands:
//! - `discover`: fetch catalogs, merge, reconcile coverage, hash and persist
//! - `generate`: extend the plan ledger and run the batch orchestrator
//! - `index`: publish the episode index of a series
//! - `serve`: read API and progress stream

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use certaudio_common::config::{
    default_config_path, load_toml_config, resolve_root_folder, RootFolder, TomlConfig,
};
use certaudio_common::events::EventBus;
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use certaudio_gen::config::{resolve_narration_api_key, resolve_speech_api_key, PipelineConfig};
use certaudio_gen::models::{DiscoveryMode, NarrationFormat, RunSummary};
use certaudio_gen::services::{
    build_index, extend_ledger, publish, AmendmentEngine, BatchOrchestrator, Collaborators,
    DiscoveryService, DiscoverySources, HttpCatalogClient, HttpDocumentationSearch,
    HttpNarrationClient, HttpSkillOutlineClient, HttpSpeechClient, LocalObjectStore,
    SsmlConverter,
};
use certaudio_gen::AppState;

/// Command-line arguments for certaudio-gen
#[derive(Parser, Debug)]
#[command(name = "certaudio-gen")]
#[command(about = "Turns certification study material into narrated audio episodes")]
#[command(version)]
struct Cli {
    /// TOML bootstrap config (defaults to ~/.config/certaudio/certaudio-gen.toml)
    #[arg(long, global = true, env = "CERTAUDIO_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder holding the database and local object store
    #[arg(long, global = true)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover the topic graph of a subject
    Discover {
        #[arg(long)]
        subject: String,

        /// quick, deep or comprehensive
        #[arg(long, default_value = "comprehensive")]
        mode: DiscoveryMode,
    },

    /// Plan and generate episodes for a subject
    Generate {
        #[arg(long)]
        subject: String,

        /// instructional, podcast-solo or podcast-duo
        #[arg(long, default_value = "instructional")]
        format: NarrationFormat,

        /// Run only this batch (0-based)
        #[arg(long)]
        batch_index: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        max_workers: Option<usize>,

        /// Regenerate units that already have an episode record
        #[arg(long)]
        force_regenerate: bool,
    },

    /// Publish the episode index of a series
    Index {
        #[arg(long)]
        subject: String,

        #[arg(long)]
        format: NarrationFormat,

        #[arg(long, default_value = "1")]
        min_episodes: usize,
    },

    /// Serve the read API and progress stream
    Serve {
        #[arg(short, long, default_value = "5780", env = "CERTAUDIO_PORT")]
        port: u16,
    },
}

/// Everything a subcommand needs after bootstrap
struct Runtime {
    toml: TomlConfig,
    root: RootFolder,
    db: SqlitePool,
    event_bus: EventBus,
    pipeline: PipelineConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .or_else(|| default_config_path("certaudio-gen"));
    let toml = match &config_path {
        Some(path) => load_toml_config(path).context("Failed to load TOML config")?,
        None => TomlConfig::default(),
    };

    // RUST_LOG wins over the TOML level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter(&toml.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting certaudio-gen {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Config: {}", path.display());
    }

    let root = RootFolder::new(resolve_root_folder(cli.root_folder.as_deref(), &toml));
    root.ensure_exists()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", root.path().display());

    let db_path = root.database_path();
    let db = certaudio_gen::db::init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;
    info!("Database: {}", db_path.display());

    let pipeline = PipelineConfig::from_toml(&toml);
    let runtime = Runtime {
        toml,
        root,
        db,
        event_bus: EventBus::new(256),
        pipeline,
    };

    match cli.command {
        Command::Discover { subject, mode } => discover(&runtime, &subject, mode).await,
        Command::Generate {
            subject,
            format,
            batch_index,
            batch_size,
            max_workers,
            force_regenerate,
        } => {
            let mut runtime = runtime;
            if let Some(v) = batch_size {
                runtime.pipeline.batch_size = v;
            }
            if let Some(v) = max_workers {
                runtime.pipeline.max_workers = v;
            }
            let code = generate(&runtime, &subject, format, batch_index, force_regenerate).await?;
            std::process::exit(code);
        }
        Command::Index {
            subject,
            format,
            min_episodes,
        } => index(&runtime, &subject, format, min_episodes).await,
        Command::Serve { port } => serve(runtime, port).await,
    }
}

/// Expand a bare level into a filter for this crate and the HTTP layer
fn log_filter(level: &str) -> String {
    if level.contains('=') {
        level.to_string()
    } else {
        format!("certaudio_gen={},tower_http={}", level, level)
    }
}

async fn discover(runtime: &Runtime, subject: &str, mode: DiscoveryMode) -> Result<()> {
    let p = &runtime.pipeline;
    let timeout = p.retry.call_timeout;
    let sources = DiscoverySources {
        catalog: Arc::new(HttpCatalogClient::new(
            &p.endpoints.catalog_url,
            p.requests_per_second,
            timeout,
        )?),
        skills: Arc::new(HttpSkillOutlineClient::new(
            &p.endpoints.skills_url,
            p.requests_per_second,
            timeout,
        )?),
        search: Arc::new(HttpDocumentationSearch::new(
            &p.endpoints.search_url,
            p.requests_per_second,
            timeout,
        )?),
    };

    let service = DiscoveryService::new(
        runtime.db.clone(),
        runtime.event_bus.clone(),
        sources,
        p.discovery(),
    );
    let result = service
        .discover(subject, mode)
        .await
        .with_context(|| format!("Discovery failed for {}", subject))?;

    let c = &result.confidence;
    println!("Subject:     {} ({} mode)", result.subject_id, result.mode);
    println!("Topics:      {}", result.topics.len());
    println!("Confidence:  {:.2} ({})", c.score, c.grade);
    println!(
        "Coverage:    {} title, {} description, {} search, {} gap",
        c.breakdown.title_match,
        c.breakdown.description_match,
        c.breakdown.documentation_search,
        c.breakdown.gap
    );
    for gap in result.gaps.iter().filter_map(|id| result.topic(id)) {
        println!("  gap: {} ({})", gap.title, gap.parent_grouping);
    }

    let d = &result.delta;
    println!(
        "Delta:       {} changed, {} unchanged, {} new, {} fetch errors, {} orphaned",
        d.changed.len(),
        d.unchanged_count,
        d.new_topics.len(),
        d.fetch_error_count,
        d.orphaned_topics.len()
    );
    for change in &d.changed {
        println!(
            "  changed: {} ({} episode(s) affected)",
            change.topic_id,
            change.affected_episodes.len()
        );
    }
    Ok(())
}

async fn generate(
    runtime: &Runtime,
    subject: &str,
    format: NarrationFormat,
    batch_index: Option<usize>,
    force_regenerate: bool,
) -> Result<i32> {
    let result = certaudio_gen::db::discovery_runs::load_latest(&runtime.db, subject)
        .await?
        .with_context(|| format!("No discovery result for {}; run discover first", subject))?;

    let p = &runtime.pipeline;
    let engine = AmendmentEngine::new(p.planner());
    let ledger = extend_ledger(&runtime.db, &engine, &result, format).await?;
    if ledger.is_empty() {
        warn!(subject_id = subject, format = %format, "Nothing planned");
    }

    let narration_key = resolve_narration_api_key(&runtime.db, &runtime.toml).await?;
    let speech_key = resolve_speech_api_key(&runtime.db, &runtime.toml).await?;
    let timeout = p.retry.call_timeout;
    let collaborators = Collaborators {
        narration: Arc::new(HttpNarrationClient::new(
            &p.endpoints.narration_url,
            &p.endpoints.narration_model,
            narration_key,
            p.requests_per_second,
            timeout,
        )?),
        markup: Arc::new(SsmlConverter::new(p.max_segment_chars)),
        speech: Arc::new(HttpSpeechClient::new(
            &p.endpoints.speech_url,
            speech_key,
            p.requests_per_second,
            timeout,
        )?),
        objects: Arc::new(object_store(runtime)),
    };

    let orchestrator = BatchOrchestrator::new(
        runtime.db.clone(),
        runtime.event_bus.clone(),
        collaborators,
        p.orchestrator(force_regenerate),
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, cancelling after in-flight units");
            on_signal.cancel();
        }
    });

    let summary = orchestrator
        .run(&result, &ledger, batch_index, &cancel)
        .await?;
    print_summary(&summary, orchestrator.batch_count(ledger.len()));

    Ok(summary.status().exit_code())
}

fn print_summary(summary: &RunSummary, batches: usize) {
    println!(
        "Run {} for {} ({}): {} unit(s) in {} batch(es)",
        summary.run_id,
        summary.subject_id,
        summary.format,
        summary.reports.len(),
        batches
    );
    println!(
        "  persisted {}, skipped {}, failed {}, cancelled {}",
        summary.persisted(),
        summary.skipped(),
        summary.failed(),
        summary.cancelled()
    );
    for (seq, failure) in summary.failures() {
        println!("  #{:03}: {}", seq, failure);
    }
    println!("  status: {:?}", summary.status());
}

async fn index(
    runtime: &Runtime,
    subject: &str,
    format: NarrationFormat,
    min_episodes: usize,
) -> Result<()> {
    let records = certaudio_gen::db::episodes::load_records(&runtime.db, subject, format).await?;
    let index = build_index(subject, format, &records, min_episodes)?;
    let url = publish(&object_store(runtime), &index).await?;

    println!(
        "Published index of {} episode(s) ({} amendment(s)): {}",
        index.total_episodes, index.amendment_count, url
    );
    Ok(())
}

async fn serve(runtime: Runtime, port: u16) -> Result<()> {
    let state = AppState::new(runtime.db, runtime.event_bus);
    let app = certaudio_gen::build_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

fn object_store(runtime: &Runtime) -> LocalObjectStore {
    LocalObjectStore::new(
        runtime.root.objects_path(),
        runtime.pipeline.endpoints.objects_base_url.clone(),
    )
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
