//! Walk the unclaimed images in batches and cluster them.

use anyhow::Result;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::matching::{assign_matches, find_matches, Assignment, FuzzyMatch, MatchParams, MatchStrategy};
use crate::batch::{run_isolated, ItemOutcome};
use crate::config::Config;
use crate::db::{Candidate, Database, DatabaseBackend, ImageRecord};
use crate::tasks::{run_pool, TaskHandler, TaskPool, WorkerContext};

pub const ACTION_ID: &str = "grouping";

type GroupingPool = TaskPool<Vec<Candidate>, Vec<ItemOutcome<Vec<FuzzyMatch>>>>;

/// Totals for one grouping run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupingReport {
    /// Images fetched and claimed.
    pub examined: usize,
    pub groups_created: usize,
    pub groups_reused: usize,
    pub images_assigned: usize,
    /// Images whose comparison failed; they stay ungrouped.
    pub comparison_failures: usize,
}

impl GroupingReport {
    fn record(&mut self, assignment: Assignment) {
        match assignment {
            Assignment::Unmatched => {}
            Assignment::NewGroup { assigned, .. } => {
                self.groups_created += 1;
                self.images_assigned += assigned;
            }
            Assignment::ExistingGroup { assigned, .. } => {
                self.groups_reused += 1;
                self.images_assigned += assigned;
            }
        }
    }
}

/// Worker side: looks up matches for each candidate on its own store handle.
pub struct GroupingWorker {
    store: Arc<Database>,
    strategy: MatchStrategy,
    params: MatchParams,
}

impl GroupingWorker {
    async fn setup(ctx: WorkerContext<Config>, strategy: MatchStrategy) -> Result<Self> {
        let db_config = ctx.config.database.clone();
        let store = tokio::task::spawn_blocking(move || Database::open(&db_config)).await??;
        debug!(worker = ctx.index, backend = store.backend_name(), "grouping worker connected");

        Ok(Self {
            store: Arc::new(store),
            strategy,
            params: MatchParams::from(&ctx.config.dedupe),
        })
    }
}

impl TaskHandler<Vec<Candidate>, Vec<ItemOutcome<Vec<FuzzyMatch>>>> for GroupingWorker {
    async fn handle(&self, candidates: Vec<Candidate>) -> Vec<ItemOutcome<Vec<FuzzyMatch>>> {
        let store = &self.store;
        let strategy = self.strategy;
        let params = self.params;
        run_isolated(candidates, |candidate| async move {
            let matches = find_matches(store, strategy, &candidate.hash, params).await?;
            Ok::<_, anyhow::Error>(Some(matches))
        })
        .await
    }
}

/// Group every unclaimed image in the store.
pub async fn run_grouping(
    config: Arc<Config>,
    store: Arc<Database>,
    strategy: MatchStrategy,
) -> Result<GroupingReport> {
    info!(?strategy, workers = config.dedupe.workers, "grouping images");

    let options = super::pool_options(&config);
    let batch_size = config.comparison_batch_size();
    let chunk_size = config.dedupe.comparison_chunk_size;
    let report = run_pool(
        ACTION_ID,
        config,
        options,
        move |ctx| GroupingWorker::setup(ctx, strategy),
        |pool: Arc<GroupingPool>| async move {
            send_batches(&pool, &store, strategy, batch_size, chunk_size).await
        },
    )
    .await??;

    info!(
        examined = report.examined,
        groups_created = report.groups_created,
        groups_reused = report.groups_reused,
        images_assigned = report.images_assigned,
        comparison_failures = report.comparison_failures,
        "grouping complete"
    );
    Ok(report)
}

/// Fetch the next unclaimed images and mark them processed in one step.
fn claim_next(store: &Database, limit: usize) -> Result<Vec<ImageRecord>> {
    let batch = store.fetch_unclaimed(limit)?;
    let ids: Vec<i64> = batch.iter().map(|image| image.id).collect();
    store.claim_images(&ids)?;
    Ok(batch)
}

async fn send_batches(
    pool: &GroupingPool,
    store: &Arc<Database>,
    strategy: MatchStrategy,
    batch_size: usize,
    chunk_size: usize,
) -> Result<GroupingReport> {
    let mut report = GroupingReport::default();

    loop {
        let batch = {
            let store = Arc::clone(store);
            tokio::task::spawn_blocking(move || claim_next(&store, batch_size)).await??
        };
        if batch.is_empty() {
            break;
        }
        report.examined += batch.len();
        debug!(images = batch.len(), "comparing batch");

        let candidates: Vec<Candidate> = batch.iter().map(Candidate::from).collect();
        drop(batch);

        let chunks: Vec<Vec<Candidate>> = candidates
            .chunks(chunk_size)
            .map(<[Candidate]>::to_vec)
            .collect();
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        let replies = join_all(chunks.into_iter().map(|chunk| pool.dispatch(chunk))).await;

        // One entry per candidate, in fetch order.
        let mut match_lists: Vec<Option<Vec<FuzzyMatch>>> = Vec::with_capacity(candidates.len());
        for (size, reply) in sizes.into_iter().zip(replies) {
            match reply {
                Ok(outcomes) => match_lists.extend(outcomes.into_iter().map(ItemOutcome::into_done)),
                Err(e) => {
                    warn!(error = %e, images = size, "comparison chunk lost");
                    match_lists.extend(std::iter::repeat_with(|| None).take(size));
                }
            }
        }
        report.comparison_failures += match_lists.iter().filter(|m| m.is_none()).count();

        let assignments = {
            let store = Arc::clone(store);
            tokio::task::spawn_blocking(move || {
                candidates
                    .iter()
                    .zip(match_lists)
                    .filter_map(|(candidate, matches)| matches.map(|m| (candidate, m)))
                    .map(|(candidate, matches)| {
                        assign_matches(&*store, strategy, candidate, &matches)
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .await??
        };

        for assignment in assignments {
            report.record(assignment);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::NewImage;
    use tempfile::{tempdir, TempDir};

    fn setup(workers: usize, hashes: &[&str]) -> (TempDir, Arc<Config>, Arc<Database>) {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.dedupe.workers = workers;
        config.dedupe.comparison_chunk_size = 1;
        config.dedupe.threshold = 5;
        config.database = DatabaseConfig {
            sqlite_path: dir.path().join("store.db"),
            ..DatabaseConfig::default()
        };

        let store = Database::open_initialized(&config.database).unwrap();
        let images: Vec<NewImage> = hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| NewImage {
                path: format!("/img/{}.png", i + 1),
                hash: hash.to_string(),
                bytes: 100 + i as u64,
            })
            .collect();
        store.insert_images(&images).unwrap();

        (dir, Arc::new(config), Arc::new(store))
    }

    const A: &str = "0000000000";
    // Distance 3 from A, 10 from everything else.
    const B: &str = "0000000fff";
    const C: &str = "aaaaaaaaaa";
    const D: &str = "bbbbbbbbbb";
    const E: &str = "cccccccccc";

    #[tokio::test]
    async fn test_lazy_groups_only_close_pair() {
        let (_dir, config, store) = setup(1, &[A, B, C, D, E]);

        let report = run_grouping(config, Arc::clone(&store), MatchStrategy::Lazy)
            .await
            .unwrap();

        assert_eq!(report.examined, 4);
        assert_eq!(report.groups_created, 1);
        assert_eq!(report.images_assigned, 2);
        assert_eq!(report.comparison_failures, 0);

        let groups = store.groups_with_images().unwrap();
        assert_eq!(groups.len(), 1);
        let ids: Vec<i64> = groups[0].images.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(groups[0].group.hash, A);

        for id in 3..=5 {
            let image = store.get_image(id).unwrap().unwrap();
            assert_eq!(image.group_id, None);
            assert!(image.processed);
        }
    }

    #[tokio::test]
    async fn test_top_joins_existing_group() {
        // Image 1 founded a group before this run; image 2 is within range of it.
        let (_dir, config, store) = setup(2, &[A, "0000000ff0", E]);
        let existing = store.create_group(A).unwrap();
        store.assign_group(existing, &[1]).unwrap();
        store.claim_images(&[1]).unwrap();

        let report = run_grouping(config, Arc::clone(&store), MatchStrategy::Top)
            .await
            .unwrap();

        assert_eq!(report.groups_created, 0);
        assert_eq!(report.groups_reused, 1);
        assert_eq!(store.count_groups().unwrap(), 1);
        assert_eq!(store.get_image(2).unwrap().unwrap().group_id, Some(existing));
        assert_eq!(store.get_image(3).unwrap().unwrap().group_id, None);
    }

    #[tokio::test]
    async fn test_every_image_is_claimed_and_groups_stay_put() {
        let (_dir, config, store) = setup(3, &[A, B, A, C, D, C, E]);

        run_grouping(Arc::clone(&config), Arc::clone(&store), MatchStrategy::Lazy)
            .await
            .unwrap();
        let first: Vec<_> = (1..=7)
            .map(|id| store.get_image(id).unwrap().unwrap())
            .collect();
        assert!(first.iter().all(|image| image.processed));

        // Nothing is left to claim, so a second pass changes nothing.
        let again = run_grouping(config, Arc::clone(&store), MatchStrategy::Lazy)
            .await
            .unwrap();
        assert_eq!(again, GroupingReport::default());
        let second: Vec<_> = (1..=7)
            .map(|id| store.get_image(id).unwrap().unwrap())
            .collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_store_finishes_immediately() {
        let (_dir, config, store) = setup(2, &[]);
        let report = run_grouping(config, store, MatchStrategy::Top).await.unwrap();
        assert_eq!(report, GroupingReport::default());
    }
}
