mod schema;
pub mod backend;
pub mod models;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod postgres_schema;

use anyhow::Result;

pub use backend::DatabaseBackend;
pub use models::{Candidate, DistanceRow, GroupRecord, GroupWithImages, ImageRecord, NewImage};

use crate::config::DatabaseConfig;
#[cfg(feature = "postgres")]
use crate::config::DatabaseType;

/// Macro to dispatch a method call to the active backend variant.
macro_rules! dispatch {
    // No arguments beyond self
    ($self:expr, $method:ident()) => {
        match &$self.inner {
            DatabaseInner::Sqlite(db) => db.$method(),
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => db.$method(),
        }
    };
    // With arguments
    ($self:expr, $method:ident($($arg:expr),+ $(,)?)) => {
        match &$self.inner {
            DatabaseInner::Sqlite(db) => db.$method($($arg),+),
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => db.$method($($arg),+),
        }
    };
}

enum DatabaseInner {
    Sqlite(sqlite::SqliteDb),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PgDb),
}

/// Handle to the configured store. Each worker opens its own.
pub struct Database {
    inner: DatabaseInner,
}

impl Database {
    /// Open a database connection based on the provided configuration.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        #[cfg(feature = "postgres")]
        {
            if config.backend == DatabaseType::Postgresql {
                let url = config
                    .postgresql_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("PostgreSQL URL not configured"))?;
                let pool_size = config.pool_size.unwrap_or(10);
                let pg = postgres::PgDb::open(url, pool_size)?;
                return Ok(Self {
                    inner: DatabaseInner::Postgres(pg),
                });
            }
        }

        let db = sqlite::SqliteDb::open(&config.sqlite_path)?;
        Ok(Self {
            inner: DatabaseInner::Sqlite(db),
        })
    }

    /// Open and create the schema if it does not exist yet.
    pub fn open_initialized(config: &DatabaseConfig) -> Result<Self> {
        let db = Self::open(config)?;
        db.initialize()?;
        Ok(db)
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.inner {
            DatabaseInner::Sqlite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(_) => "postgresql",
        }
    }
}

impl DatabaseBackend for Database {
    fn initialize(&self) -> Result<()> {
        dispatch!(self, initialize())
    }

    fn reset(&self) -> Result<()> {
        dispatch!(self, reset())
    }

    // ========================================================================
    // Image operations
    // ========================================================================

    fn insert_images(&self, images: &[NewImage]) -> Result<usize> {
        dispatch!(self, insert_images(images))
    }

    fn fetch_unclaimed(&self, limit: usize) -> Result<Vec<ImageRecord>> {
        dispatch!(self, fetch_unclaimed(limit))
    }

    fn claim_images(&self, ids: &[i64]) -> Result<usize> {
        dispatch!(self, claim_images(ids))
    }

    fn nearest_images(&self, hash: &str, limit: usize) -> Result<Vec<DistanceRow>> {
        dispatch!(self, nearest_images(hash, limit))
    }

    fn get_image(&self, id: i64) -> Result<Option<ImageRecord>> {
        dispatch!(self, get_image(id))
    }

    fn count_images(&self) -> Result<usize> {
        dispatch!(self, count_images())
    }

    // ========================================================================
    // Group operations
    // ========================================================================

    fn create_group(&self, hash: &str) -> Result<i64> {
        dispatch!(self, create_group(hash))
    }

    fn nearest_groups(&self, hash: &str, limit: usize) -> Result<Vec<DistanceRow>> {
        dispatch!(self, nearest_groups(hash, limit))
    }

    fn assign_group(&self, group_id: i64, image_ids: &[i64]) -> Result<usize> {
        dispatch!(self, assign_group(group_id, image_ids))
    }

    fn groups_with_images(&self) -> Result<Vec<GroupWithImages>> {
        dispatch!(self, groups_with_images())
    }

    fn count_groups(&self) -> Result<usize> {
        dispatch!(self, count_groups())
    }
}
