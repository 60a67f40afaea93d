//! The two worker-pool stages of a run: hashing files into the store, then
//! grouping the stored images.

pub mod grouping;
pub mod hashing;
pub mod matching;

use std::time::Duration;

pub use grouping::{run_grouping, GroupingReport};
pub use hashing::{run_hashing, HashingReport};
pub use matching::{Assignment, FuzzyMatch, MatchParams, MatchStrategy, MatchTarget};

use crate::config::Config;
use crate::tasks::PoolOptions;

fn pool_options(config: &Config) -> PoolOptions {
    PoolOptions::new(config.dedupe.workers)
        .with_timeout(config.pool.task_timeout_secs.map(Duration::from_secs))
}
