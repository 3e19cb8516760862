//! `studypack` command-line entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: load the TOML file and apply flag overrides.
//! 2. **Wire observability**: install `tracing-subscriber` (JSON or pretty)
//!    and, when configured, an OpenTelemetry OTLP span exporter.
//! 3. **Construct infrastructure**: the provider adapter, capability table,
//!    file-backed segment source, dictionary and duration table, all
//!    injected into [`compiler::PacketCompiler`].
//! 4. **Run**: compile one work, cancel cleanly on Ctrl-C and write the packet
//!    as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use compiler::PacketCompiler;
use llm::{CapabilityTable, OpenAiGateway};
use packet::issues::tally;
use packet::{
    CapabilityResolver, CompileError, DictionaryEntry, DurationStat, FixedCapabilities,
    InMemoryStore, PacketState, PhaseView, Progress, WorkId, WorkRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod observability;
mod storage;

use config::AppConfig;
use storage::{FileDictionary, FileSegmentSource, JsonFileStore};

#[derive(Debug, Parser)]
#[command(name = "studypack", version, about = "Compile a source text into a phase-ordered study packet")]
struct Args {
    /// Work to compile, e.g. `mn10`.
    work: String,

    /// Work file, or directory of `<work>.json` files.
    #[arg(long, short = 's', default_value = "works")]
    source: PathBuf,

    /// Edition suffix of the work file.
    #[arg(long)]
    edition: Option<String>,

    /// TOML configuration file.
    #[arg(long, short = 'c', env = "STUDYPACK_CONFIG")]
    config: Option<PathBuf>,

    /// Output path; defaults to `<work>.packet.json`.
    #[arg(long, short = 'o')]
    out: Option<PathBuf>,

    /// Provider label recorded in every segment reference.
    #[arg(long, default_value = "local")]
    source_provider: String,

    /// Stop after this many phases.
    #[arg(long)]
    max_phases: Option<usize>,

    /// Plan with deterministic chunking only.
    #[arg(long)]
    no_llm_planner: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Args::parse()).await {
        Ok(PacketState::Error) => ExitCode::from(2),
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<PacketState> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if args.max_phases.is_some() {
        config.compiler.max_phases = args.max_phases;
    }
    if args.no_llm_planner {
        config.compiler.use_llm_planner = false;
    }

    let _telemetry = observability::init(&config.observability)?;

    let compiler = build_compiler(&config)?;
    let source = FileSegmentSource::new(&args.source, &args.source_provider);
    let work = WorkRequest {
        work_id: WorkId::new(args.work.clone()).context("work id must not be blank")?,
        edition: args.edition.clone(),
    };
    let request = source
        .request(&work)
        .await
        .with_context(|| format!("failed to load work '{}'", args.work))?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current call");
                cancel.cancel();
            }
        }
    });

    let report = |progress: &Progress, phase: Option<&PhaseView>| {
        if let Some(view) = phase {
            info!(
                phase = %view.id,
                ready = progress.ready_phases,
                total = progress.total_phases,
                eta_ms = progress.eta_ms,
                degraded = view.degraded,
                "phase ready"
            );
        }
    };

    let packet = match compiler.compile(request, &report, cancel).await {
        Ok(packet) => packet,
        Err(CompileError::Cancelled) => bail!("compilation cancelled"),
        Err(err) => return Err(err).context("compilation failed"),
    };

    let out = args
        .out
        .unwrap_or_else(|| PathBuf::from(format!("{}.packet.json", args.work)));
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&packet).context("failed to serialise packet")?;
    std::fs::write(&out, json).with_context(|| format!("failed to write {}", out.display()))?;

    let (_, warnings, errors) = tally(&packet.validation_issues);
    info!(
        out = %out.display(),
        state = ?packet.progress.state,
        phases = packet.phases.len(),
        warnings,
        errors,
        "packet written"
    );
    Ok(packet.progress.state)
}

fn build_compiler(config: &AppConfig) -> Result<PacketCompiler> {
    let gateway = OpenAiGateway::from_env(config.llm.provider.clone())
        .context("failed to configure the model provider")?;
    let capabilities: Arc<dyn CapabilityResolver> = match config.llm.structured_output {
        Some(forced) => Arc::new(FixedCapabilities(forced)),
        None => Arc::new(CapabilityTable::new(config.llm.capabilities.clone())),
    };

    let mut compiler = PacketCompiler::new(Arc::new(gateway), config.compiler.clone())?
        .with_capabilities(capabilities);

    if let Some(path) = &config.storage.dictionary {
        let dictionary = FileDictionary::load(path)?;
        info!(entries = dictionary.len(), "dictionary loaded");
        let cache: Arc<InMemoryStore<Option<DictionaryEntry>>> = Arc::new(InMemoryStore::new());
        compiler = compiler.with_dictionary(Arc::new(dictionary), cache);
    }
    if let Some(path) = &config.storage.durations {
        let durations: Arc<JsonFileStore<DurationStat>> = Arc::new(JsonFileStore::open(path)?);
        compiler = compiler.with_durations(durations);
    }
    Ok(compiler)
}
