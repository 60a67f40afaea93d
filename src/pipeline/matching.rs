//! Fuzzy hash matching and cluster assignment.
//!
//! Distances are computed by the store; this layer picks which queries to run,
//! applies the threshold and decides which group an image lands in.

use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

use crate::config::{DedupeConfig, RunMode};
use crate::db::{Candidate, DatabaseBackend, DistanceRow};

/// How matches are looked up and turned into groups, fixed for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Compare against ungrouped images only and always found a new group.
    Lazy,
    /// Also compare against existing groups and join the closest one.
    Top,
}

impl MatchStrategy {
    /// The strategy a run mode groups with, if it groups at all.
    pub fn for_mode(mode: RunMode) -> Option<Self> {
        match mode {
            RunMode::Lazy => Some(MatchStrategy::Lazy),
            RunMode::Top => Some(MatchStrategy::Top),
            RunMode::Dry | RunMode::Output => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTarget {
    Image(i64),
    Group(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzyMatch {
    pub target: MatchTarget,
    pub distance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchParams {
    /// Largest distance still counted as a match.
    pub threshold: u32,
    /// Rows fetched per store lookup.
    pub resolution: usize,
}

impl From<&DedupeConfig> for MatchParams {
    fn from(config: &DedupeConfig) -> Self {
        Self {
            threshold: config.threshold,
            resolution: config.resolution,
        }
    }
}

/// What cluster assignment did with one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Unmatched,
    NewGroup { group_id: i64, assigned: usize },
    ExistingGroup { group_id: i64, assigned: usize },
}

#[derive(Debug, Clone, Copy)]
enum Lookup {
    Images,
    Groups,
}

async fn nearest<B>(
    store: Arc<B>,
    lookup: Lookup,
    hash: String,
    params: MatchParams,
) -> Result<Vec<FuzzyMatch>>
where
    B: DatabaseBackend + 'static,
{
    let rows = tokio::task::spawn_blocking(move || match lookup {
        Lookup::Images => store.nearest_images(&hash, params.resolution),
        Lookup::Groups => store.nearest_groups(&hash, params.resolution),
    })
    .await??;

    Ok(within_threshold(rows, params.threshold, |id| match lookup {
        Lookup::Images => MatchTarget::Image(id),
        Lookup::Groups => MatchTarget::Group(id),
    }))
}

fn within_threshold(
    rows: Vec<DistanceRow>,
    threshold: u32,
    target: impl Fn(i64) -> MatchTarget,
) -> Vec<FuzzyMatch> {
    rows.into_iter()
        .filter(|row| row.distance <= threshold)
        .map(|row| FuzzyMatch {
            target: target(row.id),
            distance: row.distance,
        })
        .collect()
}

/// Matches for `hash`, closest first.
pub async fn find_matches<B>(
    store: &Arc<B>,
    strategy: MatchStrategy,
    hash: &str,
    params: MatchParams,
) -> Result<Vec<FuzzyMatch>>
where
    B: DatabaseBackend + 'static,
{
    match strategy {
        MatchStrategy::Lazy => {
            nearest(Arc::clone(store), Lookup::Images, hash.to_string(), params).await
        }
        MatchStrategy::Top => {
            let (groups, images) = tokio::try_join!(
                nearest(Arc::clone(store), Lookup::Groups, hash.to_string(), params),
                nearest(Arc::clone(store), Lookup::Images, hash.to_string(), params),
            )?;

            let mut all = groups;
            all.extend(images);
            // Stable, so groups win ties.
            all.sort_by_key(|m| m.distance);
            Ok(all)
        }
    }
}

/// Put `primary` and its image matches into a group.
///
/// Only images without a group are updated, so an image that another
/// assignment already claimed keeps its group.
pub fn assign_matches<B>(
    store: &B,
    strategy: MatchStrategy,
    primary: &Candidate,
    matches: &[FuzzyMatch],
) -> Result<Assignment>
where
    B: DatabaseBackend + ?Sized,
{
    let Some(closest) = matches.first() else {
        return Ok(Assignment::Unmatched);
    };

    let existing = match (strategy, closest.target) {
        (MatchStrategy::Top, MatchTarget::Group(id)) => Some(id),
        _ => None,
    };
    let group_id = match existing {
        Some(id) => id,
        None => store.create_group(&primary.hash)?,
    };

    let ids: Vec<i64> = std::iter::once(primary.id)
        .chain(matches.iter().filter_map(|m| match m.target {
            MatchTarget::Image(id) => Some(id),
            MatchTarget::Group(_) => None,
        }))
        .collect();

    let assigned = store.assign_group(group_id, &ids)?;
    debug!(
        image = primary.id,
        group = group_id,
        assigned,
        existing = existing.is_some(),
        "placed images into group"
    );

    Ok(match existing {
        Some(_) => Assignment::ExistingGroup { group_id, assigned },
        None => Assignment::NewGroup { group_id, assigned },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::SqliteDb;
    use crate::db::NewImage;
    use tempfile::tempdir;

    fn store_with(hashes: &[&str]) -> (tempfile::TempDir, Arc<SqliteDb>) {
        let dir = tempdir().unwrap();
        let db = SqliteDb::open(&dir.path().join("match.db")).unwrap();
        db.initialize().unwrap();
        let images: Vec<NewImage> = hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| NewImage {
                path: format!("/img/{}.png", i + 1),
                hash: hash.to_string(),
                bytes: 100,
            })
            .collect();
        db.insert_images(&images).unwrap();
        (dir, Arc::new(db))
    }

    fn params(threshold: u32) -> MatchParams {
        MatchParams {
            threshold,
            resolution: 1024,
        }
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        // 1 is the query; 2 is at distance 2, 3 at distance 3.
        let (_dir, store) = store_with(&["aaaa", "aabb", "abbb"]);
        store.claim_images(&[1]).unwrap();

        let matches = find_matches(&store, MatchStrategy::Lazy, "aaaa", params(2))
            .await
            .unwrap();
        assert_eq!(
            matches,
            vec![FuzzyMatch {
                target: MatchTarget::Image(2),
                distance: 2
            }]
        );

        let matches = find_matches(&store, MatchStrategy::Lazy, "aaaa", params(3))
            .await
            .unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[tokio::test]
    async fn test_resolution_caps_lookup() {
        let (_dir, store) = store_with(&["aaaa", "aaaa", "aaaa", "aaaa"]);
        let matches = find_matches(
            &store,
            MatchStrategy::Lazy,
            "aaaa",
            MatchParams {
                threshold: 0,
                resolution: 2,
            },
        )
        .await
        .unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[tokio::test]
    async fn test_top_merges_groups_and_images() {
        let (_dir, store) = store_with(&["aaaa", "aaab", "abbb", "zzzz"]);
        let group = store.create_group("aaba").unwrap();
        store.assign_group(group, &[4]).unwrap();
        store.claim_images(&[1]).unwrap();

        let matches = find_matches(&store, MatchStrategy::Top, "aaaa", params(3))
            .await
            .unwrap();
        assert_eq!(
            matches,
            vec![
                FuzzyMatch {
                    target: MatchTarget::Group(group),
                    distance: 1
                },
                FuzzyMatch {
                    target: MatchTarget::Image(2),
                    distance: 1
                },
                FuzzyMatch {
                    target: MatchTarget::Image(3),
                    distance: 3
                },
            ]
        );

        // Lazy never looks at groups.
        let lazy = find_matches(&store, MatchStrategy::Lazy, "aaaa", params(3))
            .await
            .unwrap();
        assert!(lazy
            .iter()
            .all(|m| matches!(m.target, MatchTarget::Image(_))));
    }

    #[test]
    fn test_lazy_assignment_creates_group() {
        let (_dir, store) = store_with(&["aaaa", "aaab", "zzzz"]);
        let primary = Candidate {
            id: 1,
            hash: "aaaa".to_string(),
        };

        let unmatched = assign_matches(&*store, MatchStrategy::Lazy, &primary, &[]).unwrap();
        assert_eq!(unmatched, Assignment::Unmatched);
        assert_eq!(store.count_groups().unwrap(), 0);

        let matches = [FuzzyMatch {
            target: MatchTarget::Image(2),
            distance: 1,
        }];
        let assignment = assign_matches(&*store, MatchStrategy::Lazy, &primary, &matches).unwrap();
        let Assignment::NewGroup { group_id, assigned } = assignment else {
            panic!("expected a new group, got {:?}", assignment);
        };
        assert_eq!(assigned, 2);
        assert_eq!(store.get_image(1).unwrap().unwrap().group_id, Some(group_id));
        assert_eq!(store.get_image(2).unwrap().unwrap().group_id, Some(group_id));
        assert_eq!(store.get_image(3).unwrap().unwrap().group_id, None);
    }

    #[test]
    fn test_top_assignment_reuses_closest_group() {
        let (_dir, store) = store_with(&["aaaa", "aaab", "aabb"]);
        let existing = store.create_group("aaaa").unwrap();
        store.assign_group(existing, &[1]).unwrap();

        let primary = Candidate {
            id: 2,
            hash: "aaab".to_string(),
        };
        let matches = [
            FuzzyMatch {
                target: MatchTarget::Group(existing),
                distance: 1,
            },
            FuzzyMatch {
                target: MatchTarget::Image(3),
                distance: 1,
            },
        ];

        let assignment = assign_matches(&*store, MatchStrategy::Top, &primary, &matches).unwrap();
        assert_eq!(
            assignment,
            Assignment::ExistingGroup {
                group_id: existing,
                assigned: 2
            }
        );
        assert_eq!(store.count_groups().unwrap(), 1);
        assert_eq!(store.get_image(3).unwrap().unwrap().group_id, Some(existing));
    }

    #[test]
    fn test_top_assignment_founds_group_when_image_is_closest() {
        let (_dir, store) = store_with(&["aaaa", "aaab", "zzzz"]);
        let far = store.create_group("aabb").unwrap();

        let primary = Candidate {
            id: 1,
            hash: "aaaa".to_string(),
        };
        let matches = [
            FuzzyMatch {
                target: MatchTarget::Image(2),
                distance: 1,
            },
            FuzzyMatch {
                target: MatchTarget::Group(far),
                distance: 2,
            },
        ];

        let assignment = assign_matches(&*store, MatchStrategy::Top, &primary, &matches).unwrap();
        let Assignment::NewGroup { group_id, assigned } = assignment else {
            panic!("expected a new group, got {:?}", assignment);
        };
        assert_ne!(group_id, far);
        assert_eq!(assigned, 2);
    }

    #[test]
    fn test_assignment_never_moves_grouped_images() {
        let (_dir, store) = store_with(&["aaaa", "aaab"]);
        let first = store.create_group("aaab").unwrap();
        store.assign_group(first, &[2]).unwrap();

        let primary = Candidate {
            id: 1,
            hash: "aaaa".to_string(),
        };
        let matches = [FuzzyMatch {
            target: MatchTarget::Image(2),
            distance: 1,
        }];
        let assignment = assign_matches(&*store, MatchStrategy::Lazy, &primary, &matches).unwrap();
        let Assignment::NewGroup { group_id, assigned } = assignment else {
            panic!("expected a new group, got {:?}", assignment);
        };

        assert_eq!(assigned, 1);
        assert_eq!(store.get_image(1).unwrap().unwrap().group_id, Some(group_id));
        assert_eq!(store.get_image(2).unwrap().unwrap().group_id, Some(first));
    }

    #[test]
    fn test_strategy_for_mode() {
        assert_eq!(MatchStrategy::for_mode(RunMode::Lazy), Some(MatchStrategy::Lazy));
        assert_eq!(MatchStrategy::for_mode(RunMode::Top), Some(MatchStrategy::Top));
        assert_eq!(MatchStrategy::for_mode(RunMode::Dry), None);
    }
}
