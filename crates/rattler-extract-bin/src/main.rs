use std::path::PathBuf;

use clap::{ArgAction, Parser};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use once_cell::sync::Lazy;
use rattler_extract::{ExtractSummary, ExtractorBuilder, DEFAULT_CHUNK_SIZE};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt, EnvFilter};

mod writer;

/// Returns a global instance of [`indicatif::MultiProgress`].
///
/// Logging is routed through the same instance so log lines do not tear the progress bar.
pub fn global_multi_progress() -> MultiProgress {
    static GLOBAL_MP: Lazy<MultiProgress> = Lazy::new(|| {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stderr_with_hz(20));
        mp
    });
    GLOBAL_MP.clone()
}

/// Extract entries from a (compressed) tar or zip archive
#[derive(Parser)]
#[command(name = "rattler-extract", author, version, about, long_about = None)]
struct Cli {
    /// Archive to read, `-` reads standard input
    #[arg(short = 'f', long = "file", value_name = "FILE", default_value = "-")]
    file: PathBuf,

    /// Change to DIR before extracting
    #[arg(short = 'C', long = "directory", value_name = "DIR")]
    directory: Option<PathBuf>,

    /// List extracted entries, repeat to also list skipped entries
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Write runs of zeros as holes
    #[arg(short = 'S', long)]
    sparse: bool,

    /// Stop reading once every pattern has matched an entry
    #[arg(short = 'q', long)]
    fast_read: bool,

    /// Number of bytes to read from the archive at once (at most 64 MiB)
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Show a progress bar
    #[arg(long)]
    progress: bool,

    /// Print the supported formats and filters and exit
    #[arg(long)]
    version_details: bool,

    /// Only extract entries matching these patterns
    #[arg(value_name = "PATTERN")]
    patterns: Vec<String>,
}

/// Entry point of the `rattler-extract` cli.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.version_details {
        println!("{}", rattler_extract::version_details());
        return Ok(());
    }

    // Verbose output is emitted at info level, skipped entries at debug level
    let default_filter = match cli.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer::IndicatifWriter::new(global_multi_progress()))
        .without_time()
        .with_target(false)
        .finish()
        .try_init()?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping extraction");
                cancel.cancel();
            }
        }
    });

    let mut builder = ExtractorBuilder::new()
        .with_archive_path(cli.file)
        .with_verbosity(cli.verbose)
        .with_sparse(cli.sparse)
        .with_fast_read(cli.fast_read)
        .with_patterns(cli.patterns)
        .with_chunk_size(cli.chunk_size);
    if let Some(directory) = cli.directory {
        builder = builder.with_chdir(directory);
    }

    let summary = if cli.progress {
        let progress_bar = global_multi_progress().add(
            ProgressBar::new(0).with_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
                )?,
            ),
        );
        builder
            .with_progress_bar(progress_bar)
            .build()
            .extract(cancel)
            .await?
    } else {
        builder.build().extract(cancel).await?
    };

    report(&summary)
}

fn report(summary: &ExtractSummary) -> anyhow::Result<()> {
    tracing::debug!(
        extracted = summary.extracted,
        skipped = summary.skipped,
        warnings = summary.warnings,
        stopped_early = summary.stopped_early,
        "extraction finished"
    );

    if !summary.unmatched_patterns.is_empty() {
        anyhow::bail!(
            "{} pattern(s) not found in archive: {}",
            summary.unmatched_patterns.len(),
            summary.unmatched_patterns.join(", ")
        );
    }
    Ok(())
}
