//! Store contract shared by the SQLite and PostgreSQL backends.

use anyhow::Result;

use super::models::{DistanceRow, GroupWithImages, ImageRecord, NewImage};

/// Operations the hashing and grouping pipelines need from a relational store.
///
/// Distance queries return rows ordered by ascending Levenshtein distance
/// between the stored `hash` and the supplied one, computed inside the store.
pub trait DatabaseBackend: Send + Sync {
    /// Create tables and indexes if they do not exist.
    fn initialize(&self) -> Result<()>;

    /// Drop all images and groups and recreate the schema.
    fn reset(&self) -> Result<()>;

    // === Images ===

    /// Insert images, skipping any whose path is already stored.
    /// Returns the number of rows actually inserted.
    fn insert_images(&self, images: &[NewImage]) -> Result<usize>;

    /// Unclaimed, ungrouped images in ascending id order.
    fn fetch_unclaimed(&self, limit: usize) -> Result<Vec<ImageRecord>>;

    /// Mark images as processed so they are not fetched or matched again.
    fn claim_images(&self, ids: &[i64]) -> Result<usize>;

    /// Closest unclaimed, ungrouped images to `hash`.
    fn nearest_images(&self, hash: &str, limit: usize) -> Result<Vec<DistanceRow>>;

    fn get_image(&self, id: i64) -> Result<Option<ImageRecord>>;

    fn count_images(&self) -> Result<usize>;

    // === Groups ===

    fn create_group(&self, hash: &str) -> Result<i64>;

    /// Closest group representative hashes to `hash`.
    fn nearest_groups(&self, hash: &str, limit: usize) -> Result<Vec<DistanceRow>>;

    /// Set `group_id` on the given images, leaving already grouped images untouched.
    /// Returns the number of images that changed.
    fn assign_group(&self, group_id: i64, image_ids: &[i64]) -> Result<usize>;

    /// Every group with its images, groups in ascending id order.
    fn groups_with_images(&self) -> Result<Vec<GroupWithImages>>;

    fn count_groups(&self) -> Result<usize>;
}
