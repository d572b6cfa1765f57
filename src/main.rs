use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use ttperf::config::Config;
use ttperf::host::HostProfiler;
use ttperf::pipeline::{self, Pipeline, PipelineSummary};
use ttperf::poller::MemoryTransport;
use ttperf::state::descriptor::RunDescriptor;
use ttperf::state::PerfState;

/// Device performance-trace postprocessor.
#[derive(Parser)]
#[command(name = "ttperf", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse textual dumps against a run descriptor and write reports.
    Offline {
        /// Textual dump, one per executed instruction in order.
        #[arg(long, required = true)]
        dump: Vec<PathBuf>,

        /// Run descriptor YAML.
        #[arg(long)]
        run: PathBuf,
    },
    /// Feed a binary slot dump through the concurrent pipeline.
    Replay {
        /// Little-endian u32 words, one scratch slot after another.
        #[arg(long)]
        dump: PathBuf,

        /// Run descriptor YAML.
        #[arg(long)]
        run: PathBuf,
    },
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("ttperf {}", version::full());
        return Ok(ExitCode::SUCCESS);
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting ttperf",
    );

    let summary = match cli.command {
        Command::Offline { dump, run } => {
            let state = load_state(&cfg, &run)?;
            let profiler = HostProfiler::new(cfg.perf.quiet());
            pipeline::run_offline(state, &profiler, &dump)?
        }
        Command::Replay { dump, run } => {
            let state = load_state(&cfg, &run)?;
            let words = read_words(&dump)?;
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;
            rt.block_on(replay(cfg, state, words))?
        }
        Command::Version => return Ok(ExitCode::SUCCESS),
    };

    if summary.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn load_state(cfg: &Config, run: &Path) -> Result<Arc<PerfState>> {
    let desc = RunDescriptor::load(run)
        .with_context(|| format!("loading run descriptor {}", run.display()))?;
    let state = PerfState::from_descriptor(&desc, cfg.perf.clone(), &cfg.output_dir)
        .context("replaying executed instructions")?;
    Ok(Arc::new(state))
}

fn read_words(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() % 4 != 0 {
        bail!("{} is not a whole number of 32-bit words", path.display());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

async fn replay(cfg: Config, state: Arc<PerfState>, words: Vec<u32>) -> Result<PipelineSummary> {
    let transport = Arc::new(MemoryTransport::new(&cfg.scratch));
    let profiler = Arc::new(HostProfiler::new(cfg.perf.quiet()));
    let slot_words = cfg.scratch.slot_words();
    let num_queues = cfg.scratch.num_queues;
    let poll_interval = cfg.scratch.poll_interval;

    let mut pipeline = Pipeline::new(cfg, state, Arc::clone(&transport), profiler)?;
    pipeline.start().await?;

    let feed = async {
        for (i, slot) in words.chunks(slot_words).enumerate() {
            let queue = i % num_queues;
            while !transport.push_dump(queue, slot) {
                tokio::time::sleep(poll_interval).await;
            }
        }
        tracing::info!(slots = words.len().div_ceil(slot_words), "replay dump fed");
    };

    tokio::select! {
        _ = feed => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
    }

    pipeline.stop().await
}
