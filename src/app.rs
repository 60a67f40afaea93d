//! Runs the stages a configuration asks for, in order.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, OutputMode, RunMode};
use crate::db::{Database, DatabaseBackend};
use crate::output::{self, CopyReport};
use crate::pipeline::{run_grouping, run_hashing, GroupingReport, HashingReport, MatchStrategy};

/// What the output step produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSummary {
    Page(PathBuf),
    Copied(CopyReport),
}

/// Everything a run did, for the caller to print.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub hashing: Option<HashingReport>,
    pub grouping: Option<GroupingReport>,
    /// Set by dry runs.
    pub image_count: Option<usize>,
    pub output: Option<OutputSummary>,
}

pub async fn run(config: Config) -> Result<RunSummary> {
    config.validate()?;
    let mode = config.dedupe.mode;
    info!(mode = mode.name(), "starting run");

    let store = {
        let db_config = config.database.clone();
        tokio::task::spawn_blocking(move || Database::open_initialized(&db_config))
            .await?
            .context("Failed to open image store")?
    };
    let store = Arc::new(store);
    let config = Arc::new(config);
    let mut summary = RunSummary::default();

    // Modes that hash start from an empty store.
    if mode != RunMode::Output && config.dedupe.reset_store {
        info!("resetting image store");
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || store.reset()).await??;
    }

    match MatchStrategy::for_mode(mode) {
        Some(strategy) => {
            summary.hashing = Some(run_hashing(Arc::clone(&config), Arc::clone(&store)).await?);
            summary.grouping =
                Some(run_grouping(Arc::clone(&config), Arc::clone(&store), strategy).await?);
            summary.output = Some(write_output(&config, &store).await?);
        }
        None if mode == RunMode::Dry => {
            summary.hashing = Some(run_hashing(Arc::clone(&config), Arc::clone(&store)).await?);
            summary.image_count = Some(output::dry_run_stats(&*store)?);
        }
        None => {
            summary.output = Some(write_output(&config, &store).await?);
        }
    }

    info!(mode = mode.name(), "run complete");
    Ok(summary)
}

async fn write_output(config: &Config, store: &Arc<Database>) -> Result<OutputSummary> {
    let groups = {
        let store = Arc::clone(store);
        tokio::task::spawn_blocking(move || store.groups_with_images()).await??
    };

    match config.output.mode {
        OutputMode::Page => {
            let source = std::fs::canonicalize(&config.dedupe.source_directory)
                .unwrap_or_else(|_| config.dedupe.source_directory.clone());
            let path = output::write_html_report(&groups, &source, &config.output.directory)?;
            Ok(OutputSummary::Page(path))
        }
        mode @ (OutputMode::Copy | OutputMode::Move) => {
            let report = output::copy_representatives(
                groups,
                &config.output.directory,
                mode,
                config.output.copy_batch_size,
            )
            .await?;
            Ok(OutputSummary::Copied(report))
        }
    }
}
