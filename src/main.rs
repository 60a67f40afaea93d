use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use imgdedupe::app::{self, OutputSummary, RunSummary};
use imgdedupe::config::{Config, OutputMode, RunMode};
use imgdedupe::logging::{self, LogTarget};

#[derive(Parser, Debug)]
#[command(
    name = "imgdedupe",
    version,
    about = "Find near-duplicate images by perceptual hash",
    after_help = "ENVIRONMENT:\n    IMGDEDUPE_CONFIG    Path to config file (overrides default location)\n    IMGDEDUPE_LOG       Log level (trace, debug, info, warn, error)"
)]
struct Cli {
    /// Directory to walk
    #[arg(value_name = "DIR")]
    source: Option<PathBuf>,

    /// Path to config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum)]
    mode: Option<RunMode>,

    /// What to do with the groups once found
    #[arg(short, long, value_enum)]
    output: Option<OutputMode>,

    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum hash edit distance counted as a match
    #[arg(short, long)]
    threshold: Option<u32>,

    /// Hash grid side length
    #[arg(long)]
    detail_level: Option<u32>,

    /// Candidates fetched per lookup
    #[arg(long)]
    resolution: Option<usize>,

    /// Skip files smaller than this many bytes
    #[arg(long)]
    minimum_bytes: Option<u64>,

    /// Keep images and groups from earlier runs
    #[arg(long)]
    keep_store: bool,

    /// Log to stderr instead of journald or the log file
    #[arg(long)]
    log_stderr: bool,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        let dedupe = &mut config.dedupe;
        if let Some(source) = self.source {
            dedupe.source_directory = source;
        }
        if let Some(mode) = self.mode {
            dedupe.mode = mode;
        }
        if let Some(workers) = self.workers {
            dedupe.workers = workers;
        }
        if let Some(threshold) = self.threshold {
            dedupe.threshold = threshold;
        }
        if let Some(detail_level) = self.detail_level {
            dedupe.detail_level = detail_level;
        }
        if let Some(resolution) = self.resolution {
            dedupe.resolution = resolution;
        }
        if let Some(minimum_bytes) = self.minimum_bytes {
            dedupe.minimum_bytes = minimum_bytes;
        }
        if self.keep_store {
            dedupe.reset_store = false;
        }
        if let Some(output) = self.output {
            config.output.mode = output;
        }
    }
}

fn print_summary(summary: &RunSummary) {
    if let Some(h) = &summary.hashing {
        println!(
            "hashed {} of {} files ({} skipped, {} failed, {} new)",
            h.hashed, h.scanned, h.skipped, h.failed, h.inserted
        );
    }
    if let Some(g) = &summary.grouping {
        println!(
            "examined {} images: {} new groups, {} joined existing groups, {} images grouped",
            g.examined, g.groups_created, g.groups_reused, g.images_assigned
        );
        if g.comparison_failures > 0 {
            println!("{} comparisons failed", g.comparison_failures);
        }
    }
    if let Some(count) = summary.image_count {
        println!("approximately {} images would be processed", count);
    }
    match &summary.output {
        Some(OutputSummary::Page(path)) => println!("report written to {}", path.display()),
        Some(OutputSummary::Copied(report)) => println!(
            "{} images placed in {} ({} failed)",
            report.copied,
            report.folder.display(),
            report.failed
        ),
        None => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let target = if cli.log_stderr {
        LogTarget::Stderr
    } else {
        LogTarget::System
    };
    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(target, Some(Config::config_dir().join("logs")));

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    cli.apply(&mut config);

    let summary = app::run(config).await?;
    print_summary(&summary);
    Ok(())
}
