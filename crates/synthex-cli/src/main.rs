use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use synthex_core::inference::ollama::{OllamaBackend, OllamaServer};
use synthex_core::source::{self, ArxivSource};
use synthex_core::{Config, ExtractionOptions, ExtractionOrchestrator, PagePolicy, Paper, config_file};
use synthex_pdf_mupdf::MupdfRenderer;
use synthex_store::SynthesisStore;

mod output;
mod pipeline;
mod report;

use output::ColorMode;
use pipeline::{BatchSummary, DocumentOutcome, Pipeline};

/// Synthesis Extractor - Pull structured synthesis protocols out of scientific PDFs
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug, Default)]
struct CommonArgs {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Ollama server URL
    #[arg(long, global = true)]
    ollama_url: Option<String>,

    /// Vision model to use
    #[arg(long, global = true)]
    model: Option<String>,

    /// Leading pages considered per document
    #[arg(long, global = true)]
    max_pages: Option<usize>,

    /// Page images sent per inference request
    #[arg(long, global = true)]
    pages_per_request: Option<usize>,

    /// Process every page in the window and merge same-target extractions
    #[arg(long, global = true)]
    merge_pages: bool,

    /// Timeout for a single inference call, in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Do not start `ollama serve` when no server is running
    #[arg(long, global = true)]
    no_autostart: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract synthesis protocols from local PDF files
    Extract {
        /// PDF files to process
        #[arg(required = true)]
        pdfs: Vec<PathBuf>,

        /// Stable identifier (DOI, arXiv id, URL) for a single PDF
        #[arg(long)]
        id: Option<String>,

        /// Title for a single PDF
        #[arg(long)]
        title: Option<String>,

        /// Re-extract documents already in the database, replacing their syntheses
        #[arg(long)]
        force: bool,
    },

    /// Search arXiv, download the matching PDFs and extract from them
    Search {
        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(long = "max")]
        max_results: Option<usize>,

        /// Where downloaded PDFs are kept
        #[arg(long)]
        download_dir: Option<PathBuf>,

        /// Re-extract documents already in the database, replacing their syntheses
        #[arg(long)]
        force: bool,
    },

    /// Show database row counts
    Stats,

    /// Export every stored paper and synthesis as JSON
    Report {
        /// Write the report to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _log_guard = init_tracing(cli.common.log_file.as_deref())?;
    let config = resolve_config(&cli.common, config_file::load_config(), |key| {
        std::env::var(key).ok()
    });
    tracing::debug!(?config, "resolved configuration");
    let color = ColorMode(!cli.common.no_color);

    match cli.command {
        Command::Stats => stats(&config, color),
        Command::Report { out } => export_report(&config, out.as_deref()),
        Command::Extract {
            pdfs,
            id,
            title,
            force,
        } => {
            if pdfs.len() > 1 && (id.is_some() || title.is_some()) {
                anyhow::bail!("--id and --title apply to a single PDF");
            }
            let docs = pdfs
                .into_iter()
                .map(|path| {
                    let paper = source::local_document(&path, id.as_deref(), title.as_deref());
                    (paper, path)
                })
                .collect();
            run_batch(&config, docs, force, color).await
        }
        Command::Search {
            query,
            max_results,
            download_dir,
            force,
        } => {
            let max_results = max_results.unwrap_or(config.max_results);
            let download_dir = download_dir.unwrap_or_else(|| config.download_dir.clone());
            search(&config, &query, max_results, &download_dir, force, color).await
        }
    }
}

/// Install the tracing subscriber: stderr always, plus a log file if asked.
/// The returned guard must live until exit so buffered file logs are flushed.
fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("invalid log file path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Ok(Some(guard))
}

/// Resolve configuration: CLI flags > env vars > config file > defaults.
fn resolve_config(
    args: &CommonArgs,
    file: config_file::ConfigFile,
    env: impl Fn(&str) -> Option<String>,
) -> Config {
    let mut config = Config::default();
    file.apply(&mut config);

    if let Some(url) = env("OLLAMA_URL") {
        config.ollama_url = url;
    }
    if let Some(model) = env("SYNTHEX_MODEL") {
        config.model = model;
    }
    if let Some(db) = env("SYNTHEX_DB") {
        config.db_path = PathBuf::from(db);
    }

    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }
    if let Some(url) = &args.ollama_url {
        config.ollama_url = url.clone();
    }
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(max_pages) = args.max_pages {
        config.max_pages = max_pages;
    }
    if let Some(n) = args.pages_per_request {
        config.pages_per_request = n.max(1);
    }
    if args.merge_pages {
        config.page_policy = PagePolicy::MergeAll;
    }
    if let Some(secs) = args.timeout {
        config.inference_timeout_secs = secs;
    }
    if args.no_autostart {
        config.autostart_server = false;
    }
    config
}

fn stats(config: &Config, color: ColorMode) -> anyhow::Result<()> {
    let store = SynthesisStore::open(&config.db_path)?;
    let counts = store.counts()?;
    output::print_stats(&mut std::io::stdout(), &config.db_path, &counts, color)?;
    Ok(())
}

fn export_report(config: &Config, out: Option<&Path>) -> anyhow::Result<()> {
    let store = SynthesisStore::open(&config.db_path)?;
    let papers = report::build_report(&store)?;

    let Some(path) = out else {
        return report::write_report(&mut std::io::stdout().lock(), &papers);
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    report::write_report(&mut file, &papers)?;
    file.flush()?;
    println!("Report written: {} ({} papers)", path.display(), papers.len());
    Ok(())
}

async fn search(
    config: &Config,
    query: &str,
    max_results: usize,
    download_dir: &Path,
    force: bool,
    color: ColorMode,
) -> anyhow::Result<()> {
    let arxiv = ArxivSource::default().with_api_url(config.arxiv_api_url.clone());
    let results = arxiv.search(query, max_results).await?;

    let mut stdout = std::io::stdout();
    output::print_search_results(&mut stdout, query, &results, color)?;
    if results.is_empty() {
        return Ok(());
    }

    let mut docs = Vec::new();
    for meta in &results {
        let Some(url) = meta.pdf_url.as_deref() else {
            tracing::warn!(document = %meta.stable_identifier, "no PDF link, skipping");
            continue;
        };
        match arxiv.download_pdf(url, download_dir, &meta.title).await {
            Ok(path) => docs.push((meta.to_paper(), path)),
            Err(e) => {
                tracing::error!(document = %meta.stable_identifier, error = %e, "download failed");
            }
        }
    }

    if docs.is_empty() {
        anyhow::bail!("none of the {} result(s) could be downloaded", results.len());
    }
    run_batch(config, docs, force, color).await
}

/// Acquire the inference server, process every document, then release the
/// model and server whether or not the batch succeeded.
async fn run_batch(
    config: &Config,
    docs: Vec<(Paper, PathBuf)>,
    force: bool,
    color: ColorMode,
) -> anyhow::Result<()> {
    let store = SynthesisStore::open(&config.db_path)?;

    let mut server = OllamaServer::acquire(&config.ollama_url, config.autostart_server).await?;
    let backend = Arc::new(
        OllamaBackend::new(server.base_url(), config.model.clone())
            .with_num_ctx(config.num_ctx)
            .with_keep_alive(config.keep_alive),
    );

    let cancel = CancellationToken::new();

    // Set up Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let orchestrator = ExtractionOrchestrator::new(
        backend.clone(),
        ExtractionOptions::from(config),
        cancel.clone(),
    );
    let renderer = MupdfRenderer::new().with_zoom(config.render_zoom);
    let pipeline = Pipeline::new(&renderer, &orchestrator, &store, force);

    let result = process_all(&pipeline, &docs, &cancel, color).await;

    if let Err(e) = backend.unload().await {
        tracing::warn!(error = %e, "failed to unload model");
    }
    server.shutdown();

    let summary = result?;
    output::print_summary(&mut std::io::stdout(), &summary, color)?;
    Ok(())
}

async fn process_all(
    pipeline: &Pipeline<'_>,
    docs: &[(Paper, PathBuf)],
    cancel: &CancellationToken,
    color: ColorMode,
) -> anyhow::Result<BatchSummary> {
    use indicatif::{ProgressBar, ProgressStyle};

    let bar = ProgressBar::new(docs.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:30.green/dim}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let mut summary = BatchSummary::default();
    for (index, (paper, path)) in docs.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        bar.set_message(paper.stable_identifier.clone());

        let outcome = match std::fs::read(path) {
            Ok(pdf) => {
                pipeline
                    .process(paper, &pdf, |event| {
                        bar.set_message(format!(
                            "{}: {}",
                            paper.stable_identifier,
                            output::describe_event(&event)
                        ));
                    })
                    .await
            }
            Err(e) => DocumentOutcome::failed(paper, format!("{}: {}", path.display(), e)),
        };

        summary.record(&outcome);
        bar.suspend(|| {
            let mut stdout = std::io::stdout();
            let _ = output::print_outcome(&mut stdout, index, docs.len(), &outcome, color);
            let _ = stdout.flush();
        });
        bar.inc(1);
    }
    bar.finish_and_clear();

    Ok(summary)
}
