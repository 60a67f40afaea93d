//! Hash every matching file under the source directory and store the results.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::batch::{run_isolated, ItemOutcome};
use crate::config::{Config, DedupeConfig};
use crate::db::{Database, DatabaseBackend, NewImage};
use crate::scanner::{extension_matcher, perceptual_hash, scan_in_batches};
use crate::tasks::{run_pool, TaskHandler, TaskPool, WorkerContext};

pub const ACTION_ID: &str = "hashing";

type HashingPool = TaskPool<Vec<PathBuf>, Vec<ItemOutcome<NewImage>>>;

/// Totals for one hashing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashingReport {
    /// Matching files found by the scanner.
    pub scanned: usize,
    pub hashed: usize,
    /// Files under the minimum size.
    pub skipped: usize,
    pub failed: usize,
    /// New rows; already stored paths are not counted.
    pub inserted: usize,
}

/// Worker side: turns a chunk of paths into image rows.
pub struct HashingWorker {
    detail_level: u32,
    minimum_bytes: u64,
}

impl HashingWorker {
    pub fn new(config: &DedupeConfig) -> Self {
        Self {
            detail_level: config.detail_level,
            minimum_bytes: config.minimum_bytes,
        }
    }

    async fn setup(ctx: WorkerContext<Config>) -> Result<Self> {
        debug!(worker = ctx.index, "hashing worker starting");
        Ok(Self::new(&ctx.config.dedupe))
    }
}

impl TaskHandler<Vec<PathBuf>, Vec<ItemOutcome<NewImage>>> for HashingWorker {
    async fn handle(&self, paths: Vec<PathBuf>) -> Vec<ItemOutcome<NewImage>> {
        let detail_level = self.detail_level;
        let minimum_bytes = self.minimum_bytes;
        run_isolated(paths, |path| hash_file(path, detail_level, minimum_bytes)).await
    }
}

async fn hash_file(path: PathBuf, detail_level: u32, minimum_bytes: u64) -> Result<Option<NewImage>> {
    let bytes = tokio::fs::metadata(&path)
        .await
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();

    if bytes < minimum_bytes {
        debug!(path = %path.display(), bytes, minimum_bytes, "skipping small file");
        return Ok(None);
    }

    let hash = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || perceptual_hash(&path, detail_level)).await??
    };

    Ok(Some(NewImage {
        path: path.to_string_lossy().into_owned(),
        hash,
        bytes,
    }))
}

/// Scan the source directory, hash every image across a worker pool and
/// insert the results.
pub async fn run_hashing(config: Arc<Config>, store: Arc<Database>) -> Result<HashingReport> {
    let root = std::fs::canonicalize(&config.dedupe.source_directory).with_context(|| {
        format!(
            "Source directory {} is not readable",
            config.dedupe.source_directory.display()
        )
    })?;

    info!(root = %root.display(), workers = config.dedupe.workers, "hashing images");

    let options = super::pool_options(&config);
    let controller_config = Arc::clone(&config);
    let report = run_pool(
        ACTION_ID,
        config,
        options,
        HashingWorker::setup,
        |pool: Arc<HashingPool>| async move {
            send_batches(&pool, &controller_config, &root, &store).await
        },
    )
    .await??;

    info!(
        scanned = report.scanned,
        hashed = report.hashed,
        skipped = report.skipped,
        failed = report.failed,
        inserted = report.inserted,
        "hashing complete"
    );
    Ok(report)
}

async fn send_batches(
    pool: &HashingPool,
    config: &Config,
    root: &Path,
    store: &Arc<Database>,
) -> Result<HashingReport> {
    let chunk_size = config.dedupe.hashing_chunk_size;
    let matches = extension_matcher(&config.dedupe.image_extensions);
    let mut batches = scan_in_batches(root.to_path_buf(), matches, config.hashing_batch_size());
    let mut report = HashingReport::default();

    while let Some(batch) = batches.recv().await {
        let batch = batch?;
        report.scanned += batch.len();
        debug!(files = batch.len(), "hashing batch");

        let chunks: Vec<Vec<PathBuf>> = batch.chunks(chunk_size).map(<[PathBuf]>::to_vec).collect();
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        let replies = join_all(chunks.into_iter().map(|chunk| pool.dispatch(chunk))).await;

        let mut records = Vec::with_capacity(batch.len());
        for (size, reply) in sizes.into_iter().zip(replies) {
            match reply {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome {
                            ItemOutcome::Done(image) => {
                                report.hashed += 1;
                                records.push(image);
                            }
                            ItemOutcome::Skipped { .. } => report.skipped += 1,
                            ItemOutcome::Failed { .. } => report.failed += 1,
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, files = size, "hashing chunk lost");
                    report.failed += size;
                }
            }
        }

        if !records.is_empty() {
            let store = Arc::clone(store);
            report.inserted +=
                tokio::task::spawn_blocking(move || store.insert_images(&records)).await??;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use image::{Rgb, RgbImage};
    use tempfile::{tempdir, TempDir};

    fn write_image(dir: &Path, name: &str, shade: u32) {
        let img = RgbImage::from_fn(64, 48, |x, y| {
            Rgb([((x * shade) % 256) as u8, ((y * 5) % 256) as u8, 64])
        });
        img.save(dir.join(name)).unwrap();
    }

    fn setup() -> (TempDir, Arc<Config>, Arc<Database>) {
        let dir = tempdir().unwrap();
        let photos = dir.path().join("photos");
        std::fs::create_dir_all(photos.join("nested")).unwrap();

        write_image(&photos, "a.png", 3);
        write_image(&photos, "b.png", 4);
        write_image(&photos.join("nested"), "c.png", 7);
        std::fs::write(photos.join("notes.txt"), "not an image").unwrap();
        std::fs::write(photos.join("broken.png"), "definitely not a png").unwrap();
        std::fs::write(photos.join("empty.jpg"), "").unwrap();

        let mut config = Config::default();
        config.dedupe.source_directory = photos;
        config.dedupe.workers = 2;
        config.dedupe.hashing_chunk_size = 2;
        config.dedupe.detail_level = 8;
        config.database = DatabaseConfig {
            sqlite_path: dir.path().join("store.db"),
            ..DatabaseConfig::default()
        };

        let store = Database::open_initialized(&config.database).unwrap();
        (dir, Arc::new(config), Arc::new(store))
    }

    #[tokio::test]
    async fn test_hashing_stores_images_and_counts_outcomes() {
        let (_dir, config, store) = setup();

        let report = run_hashing(Arc::clone(&config), Arc::clone(&store)).await.unwrap();

        assert_eq!(
            report,
            HashingReport {
                scanned: 5,
                hashed: 3,
                skipped: 1,
                failed: 1,
                inserted: 3,
            }
        );
        assert_eq!(store.count_images().unwrap(), 3);

        let image = store.get_image(1).unwrap().unwrap();
        assert!(Path::new(&image.path).is_absolute());
        assert_eq!(image.hash.len(), 16);
        assert!(!image.processed);
        assert_eq!(image.group_id, None);
    }

    #[tokio::test]
    async fn test_rehashing_does_not_duplicate_rows() {
        let (_dir, config, store) = setup();

        run_hashing(Arc::clone(&config), Arc::clone(&store)).await.unwrap();
        let before: Vec<_> = (1..=3).map(|id| store.get_image(id).unwrap()).collect();

        let again = run_hashing(Arc::clone(&config), Arc::clone(&store)).await.unwrap();
        assert_eq!(again.hashed, 3);
        assert_eq!(again.inserted, 0);
        assert_eq!(store.count_images().unwrap(), 3);

        let after: Vec<_> = (1..=3).map(|id| store.get_image(id).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_missing_source_directory_is_fatal() {
        let (dir, config, store) = setup();
        let mut config = (*config).clone();
        config.dedupe.source_directory = dir.path().join("missing");

        assert!(run_hashing(Arc::new(config), store).await.is_err());
    }

    #[tokio::test]
    async fn test_worker_skips_small_files() {
        let dir = tempdir().unwrap();
        write_image(dir.path(), "a.png", 3);
        let size = std::fs::metadata(dir.path().join("a.png")).unwrap().len();

        let worker = HashingWorker {
            detail_level: 8,
            minimum_bytes: size + 1,
        };
        let outcomes = worker.handle(vec![dir.path().join("a.png")]).await;
        assert!(matches!(outcomes[0], ItemOutcome::Skipped { .. }));

        let worker = HashingWorker {
            detail_level: 8,
            minimum_bytes: size,
        };
        let outcomes = worker.handle(vec![dir.path().join("a.png")]).await;
        assert!(outcomes[0].is_done());
    }
}
