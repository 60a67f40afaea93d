//! SQLite backend implementation.
//!
//! SQLite has no edit-distance function, so every connection registers a
//! `levenshtein(a, b)` scalar function and the distance queries run in SQL
//! just as they do on PostgreSQL.

use anyhow::{anyhow, Result};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::backend::DatabaseBackend;
use super::models::{DistanceRow, GroupRecord, GroupWithImages, ImageRecord, NewImage};
use super::schema::{DROP_SCHEMA, SCHEMA};

pub struct SqliteDb {
    conn: Mutex<Connection>,
}

fn register_levenshtein(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "levenshtein",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a: String = ctx.get(0)?;
            let b: String = ctx.get(1)?;
            Ok(strsim::levenshtein(&a, &b) as i64)
        },
    )
}

/// `?, ?, ?` for an `IN (...)` list.
fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn row_to_image(row: &Row, offset: usize) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get(offset)?,
        path: row.get(offset + 1)?,
        bytes: row.get::<_, i64>(offset + 2)? as u64,
        hash: row.get(offset + 3)?,
        processed: row.get(offset + 4)?,
        group_id: row.get(offset + 5)?,
    })
}

fn row_to_distance(row: &Row) -> rusqlite::Result<DistanceRow> {
    Ok(DistanceRow {
        id: row.get(0)?,
        distance: row.get::<_, i64>(1)? as u32,
    })
}

impl SqliteDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;

        conn.busy_timeout(Duration::from_secs(30))?;
        // Workers read while the controller writes.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        register_levenshtein(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection lock poisoned"))
    }
}

impl DatabaseBackend for SqliteDb {
    fn initialize(&self) -> Result<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(DROP_SCHEMA)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn insert_images(&self, images: &[NewImage]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO images (path, bytes, hash) VALUES (?, ?, ?)")?;
            for image in images {
                inserted += stmt.execute(params![image.path, image.bytes as i64, image.hash])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn fetch_unclaimed(&self, limit: usize) -> Result<Vec<ImageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, path, bytes, hash, processed, group_id
            FROM images
            WHERE processed = 0 AND group_id IS NULL
            ORDER BY id ASC
            LIMIT ?
            "#,
        )?;
        let images = stmt
            .query_map([limit as i64], |row| row_to_image(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }

    fn claim_images(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE images SET processed = 1 WHERE id IN ({})",
            placeholders(ids.len())
        );
        let changed = self.conn()?.execute(&sql, params_from_iter(ids.iter()))?;
        Ok(changed)
    }

    fn nearest_images(&self, hash: &str, limit: usize) -> Result<Vec<DistanceRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT id, levenshtein(hash, ?1) AS leven
            FROM images
            WHERE group_id IS NULL AND processed = 0
            ORDER BY leven ASC, id ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![hash, limit as i64], row_to_distance)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_image(&self, id: i64) -> Result<Option<ImageRecord>> {
        let image = self
            .conn()?
            .query_row(
                "SELECT id, path, bytes, hash, processed, group_id FROM images WHERE id = ?",
                [id],
                |row| row_to_image(row, 0),
            )
            .optional()?;
        Ok(image)
    }

    fn count_images(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn create_group(&self, hash: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute("INSERT INTO image_groups (hash) VALUES (?)", [hash])?;
        Ok(conn.last_insert_rowid())
    }

    fn nearest_groups(&self, hash: &str, limit: usize) -> Result<Vec<DistanceRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT id, levenshtein(hash, ?1) AS leven
            FROM image_groups
            ORDER BY leven ASC, id ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![hash, limit as i64], row_to_distance)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn assign_group(&self, group_id: i64, image_ids: &[i64]) -> Result<usize> {
        if image_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE images SET group_id = ? WHERE group_id IS NULL AND id IN ({})",
            placeholders(image_ids.len())
        );
        let values = std::iter::once(group_id).chain(image_ids.iter().copied());
        let changed = self.conn()?.execute(&sql, params_from_iter(values))?;
        Ok(changed)
    }

    fn groups_with_images(&self) -> Result<Vec<GroupWithImages>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT g.id, g.hash,
                   i.id, i.path, i.bytes, i.hash, i.processed, i.group_id
            FROM image_groups g
            LEFT JOIN images i ON i.group_id = g.id
            ORDER BY g.id ASC, i.id ASC
            "#,
        )?;

        let mut rows = stmt.query([])?;
        let mut groups: Vec<GroupWithImages> = Vec::new();
        while let Some(row) = rows.next()? {
            let group_id: i64 = row.get(0)?;
            if groups.last().map(|g| g.group.id) != Some(group_id) {
                groups.push(GroupWithImages {
                    group: GroupRecord {
                        id: group_id,
                        hash: row.get(1)?,
                    },
                    images: Vec::new(),
                });
            }

            let image_id: Option<i64> = row.get(2)?;
            if image_id.is_some() {
                let image = row_to_image(row, 2)?;
                if let Some(group) = groups.last_mut() {
                    group.images.push(image);
                }
            }
        }

        Ok(groups)
    }

    fn count_groups(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM image_groups", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, SqliteDb) {
        let dir = tempdir().unwrap();
        let db = SqliteDb::open(&dir.path().join("test.db")).unwrap();
        db.initialize().unwrap();
        (dir, db)
    }

    fn new_image(path: &str, hash: &str) -> NewImage {
        NewImage {
            path: path.to_string(),
            hash: hash.to_string(),
            bytes: 1000,
        }
    }

    #[test]
    fn test_levenshtein_function_registered() {
        let (_dir, db) = open_temp();
        let distance: i64 = db
            .conn()
            .unwrap()
            .query_row("SELECT levenshtein('kitten', 'sitting')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(distance, 3);
    }

    #[test]
    fn test_insert_skips_existing_paths() {
        let (_dir, db) = open_temp();
        let batch = vec![new_image("/a.jpg", "aaaa"), new_image("/b.jpg", "bbbb")];

        assert_eq!(db.insert_images(&batch).unwrap(), 2);
        let before = db.get_image(1).unwrap().unwrap();

        let again = vec![new_image("/a.jpg", "ffff"), new_image("/c.jpg", "cccc")];
        assert_eq!(db.insert_images(&again).unwrap(), 1);

        assert_eq!(db.count_images().unwrap(), 3);
        assert_eq!(db.get_image(1).unwrap().unwrap(), before);
    }

    #[test]
    fn test_nearest_images_ordered_and_limited() {
        let (_dir, db) = open_temp();
        db.insert_images(&[
            new_image("/far.jpg", "zzzz"),
            new_image("/near.jpg", "aaab"),
            new_image("/same.jpg", "aaaa"),
            new_image("/mid.jpg", "aabb"),
        ])
        .unwrap();

        let rows = db.nearest_images("aaaa", 3).unwrap();
        let distances: Vec<u32> = rows.iter().map(|r| r.distance).collect();
        assert_eq!(distances, vec![0, 1, 2]);
        assert_eq!(rows[0].id, 3);

        // Claimed and grouped images are not candidates.
        db.claim_images(&[3]).unwrap();
        let group = db.create_group("aaab").unwrap();
        db.assign_group(group, &[2]).unwrap();
        let rows = db.nearest_images("aaaa", 10).unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 1]);
    }

    #[test]
    fn test_assign_group_never_overwrites() {
        let (_dir, db) = open_temp();
        db.insert_images(&[new_image("/a.jpg", "aaaa"), new_image("/b.jpg", "aaab")])
            .unwrap();

        let first = db.create_group("aaaa").unwrap();
        let second = db.create_group("aaab").unwrap();

        assert_eq!(db.assign_group(first, &[1]).unwrap(), 1);
        assert_eq!(db.assign_group(second, &[1, 2]).unwrap(), 1);

        assert_eq!(db.get_image(1).unwrap().unwrap().group_id, Some(first));
        assert_eq!(db.get_image(2).unwrap().unwrap().group_id, Some(second));
        assert_eq!(db.assign_group(second, &[]).unwrap(), 0);
    }

    #[test]
    fn test_fetch_unclaimed_and_claim() {
        let (_dir, db) = open_temp();
        db.insert_images(&[
            new_image("/a.jpg", "a"),
            new_image("/b.jpg", "b"),
            new_image("/c.jpg", "c"),
        ])
        .unwrap();

        let batch = db.fetch_unclaimed(2).unwrap();
        let ids: Vec<i64> = batch.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(batch.iter().all(|i| !i.processed));

        assert_eq!(db.claim_images(&ids).unwrap(), 2);
        let rest = db.fetch_unclaimed(10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, 3);
        assert!(db.get_image(1).unwrap().unwrap().processed);
    }

    #[test]
    fn test_groups_with_images_and_reset() {
        let (_dir, db) = open_temp();
        db.insert_images(&[
            new_image("/a.jpg", "aaaa"),
            new_image("/b.jpg", "aaab"),
            new_image("/c.jpg", "zzzz"),
        ])
        .unwrap();
        let g1 = db.create_group("aaaa").unwrap();
        let g2 = db.create_group("zzzz").unwrap();
        db.assign_group(g1, &[1, 2]).unwrap();
        db.assign_group(g2, &[3]).unwrap();

        let groups = db.groups_with_images().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group.id, g1);
        assert_eq!(groups[0].images.len(), 2);
        assert_eq!(groups[1].images[0].path, "/c.jpg");

        let nearest = db.nearest_groups("zzzy", 1).unwrap();
        assert_eq!(nearest, vec![DistanceRow { id: g2, distance: 1 }]);

        db.reset().unwrap();
        assert_eq!(db.count_images().unwrap(), 0);
        assert_eq!(db.count_groups().unwrap(), 0);
    }
}
