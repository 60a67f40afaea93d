//! PostgreSQL backend implementation.
//!
//! Distances come from the `fuzzystrmatch` extension's `levenshtein`.

use anyhow::Result;
use postgres::NoTls;
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;

use super::backend::DatabaseBackend;
use super::models::{DistanceRow, GroupRecord, GroupWithImages, ImageRecord, NewImage};
use super::postgres_schema::{POSTGRES_DROP_SCHEMA, POSTGRES_SCHEMA};

pub struct PgDb {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

fn row_to_image(row: &postgres::Row, offset: usize) -> ImageRecord {
    let bytes: i64 = row.get(offset + 2);
    ImageRecord {
        id: row.get(offset),
        path: row.get(offset + 1),
        bytes: bytes as u64,
        hash: row.get(offset + 3),
        processed: row.get(offset + 4),
        group_id: row.get(offset + 5),
    }
}

fn row_to_distance(row: &postgres::Row) -> DistanceRow {
    let distance: i32 = row.get(1);
    DistanceRow {
        id: row.get(0),
        distance: distance as u32,
    }
}

impl PgDb {
    pub fn open(url: &str, pool_size: u32) -> Result<Self> {
        let manager = PostgresConnectionManager::new(url.parse()?, NoTls);
        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        Ok(Self { pool })
    }
}

impl DatabaseBackend for PgDb {
    fn initialize(&self) -> Result<()> {
        let mut client = self.pool.get()?;
        client.batch_execute(POSTGRES_SCHEMA)?;
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let mut client = self.pool.get()?;
        client.batch_execute(POSTGRES_DROP_SCHEMA)?;
        client.batch_execute(POSTGRES_SCHEMA)?;
        Ok(())
    }

    fn insert_images(&self, images: &[NewImage]) -> Result<usize> {
        let mut client = self.pool.get()?;
        let mut tx = client.transaction()?;
        let stmt = tx.prepare(
            "INSERT INTO images (path, bytes, hash) VALUES ($1, $2, $3) ON CONFLICT (path) DO NOTHING",
        )?;
        let mut inserted = 0;
        for image in images {
            let bytes = image.bytes as i64;
            inserted += tx.execute(&stmt, &[&image.path, &bytes, &image.hash])? as usize;
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn fetch_unclaimed(&self, limit: usize) -> Result<Vec<ImageRecord>> {
        let mut client = self.pool.get()?;
        let limit = limit as i64;
        let rows = client.query(
            r#"
            SELECT id, path, bytes, hash, processed, group_id
            FROM images
            WHERE processed = FALSE AND group_id IS NULL
            ORDER BY id ASC
            LIMIT $1
            "#,
            &[&limit],
        )?;
        Ok(rows.iter().map(|row| row_to_image(row, 0)).collect())
    }

    fn claim_images(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut client = self.pool.get()?;
        let ids = ids.to_vec();
        let changed = client.execute(
            "UPDATE images SET processed = TRUE WHERE id = ANY($1)",
            &[&ids],
        )?;
        Ok(changed as usize)
    }

    fn nearest_images(&self, hash: &str, limit: usize) -> Result<Vec<DistanceRow>> {
        let mut client = self.pool.get()?;
        let limit = limit as i64;
        let rows = client.query(
            r#"
            SELECT id, levenshtein(hash, $1) AS leven
            FROM images
            WHERE group_id IS NULL AND processed = FALSE
            ORDER BY leven ASC, id ASC
            LIMIT $2
            "#,
            &[&hash, &limit],
        )?;
        Ok(rows.iter().map(row_to_distance).collect())
    }

    fn get_image(&self, id: i64) -> Result<Option<ImageRecord>> {
        let mut client = self.pool.get()?;
        let row = client.query_opt(
            "SELECT id, path, bytes, hash, processed, group_id FROM images WHERE id = $1",
            &[&id],
        )?;
        Ok(row.map(|row| row_to_image(&row, 0)))
    }

    fn count_images(&self) -> Result<usize> {
        let mut client = self.pool.get()?;
        let row = client.query_one("SELECT COUNT(*) FROM images", &[])?;
        let count: i64 = row.get(0);
        Ok(count as usize)
    }

    fn create_group(&self, hash: &str) -> Result<i64> {
        let mut client = self.pool.get()?;
        let row = client.query_one(
            "INSERT INTO image_groups (hash) VALUES ($1) RETURNING id",
            &[&hash],
        )?;
        Ok(row.get(0))
    }

    fn nearest_groups(&self, hash: &str, limit: usize) -> Result<Vec<DistanceRow>> {
        let mut client = self.pool.get()?;
        let limit = limit as i64;
        let rows = client.query(
            r#"
            SELECT id, levenshtein(hash, $1) AS leven
            FROM image_groups
            ORDER BY leven ASC, id ASC
            LIMIT $2
            "#,
            &[&hash, &limit],
        )?;
        Ok(rows.iter().map(row_to_distance).collect())
    }

    fn assign_group(&self, group_id: i64, image_ids: &[i64]) -> Result<usize> {
        if image_ids.is_empty() {
            return Ok(0);
        }
        let mut client = self.pool.get()?;
        let ids = image_ids.to_vec();
        let changed = client.execute(
            "UPDATE images SET group_id = $1 WHERE group_id IS NULL AND id = ANY($2)",
            &[&group_id, &ids],
        )?;
        Ok(changed as usize)
    }

    fn groups_with_images(&self) -> Result<Vec<GroupWithImages>> {
        let mut client = self.pool.get()?;
        let rows = client.query(
            r#"
            SELECT g.id, g.hash,
                   i.id, i.path, i.bytes, i.hash, i.processed, i.group_id
            FROM image_groups g
            LEFT JOIN images i ON i.group_id = g.id
            ORDER BY g.id ASC, i.id ASC
            "#,
            &[],
        )?;

        let mut groups: Vec<GroupWithImages> = Vec::new();
        for row in &rows {
            let group_id: i64 = row.get(0);
            if groups.last().map(|g| g.group.id) != Some(group_id) {
                groups.push(GroupWithImages {
                    group: GroupRecord {
                        id: group_id,
                        hash: row.get(1),
                    },
                    images: Vec::new(),
                });
            }

            let image_id: Option<i64> = row.get(2);
            if image_id.is_some() {
                if let Some(group) = groups.last_mut() {
                    group.images.push(row_to_image(row, 2));
                }
            }
        }

        Ok(groups)
    }

    fn count_groups(&self) -> Result<usize> {
        let mut client = self.pool.get()?;
        let row = client.query_one("SELECT COUNT(*) FROM image_groups", &[])?;
        let count: i64 = row.get(0);
        Ok(count as usize)
    }
}
