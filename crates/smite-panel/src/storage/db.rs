//! Panel database handle.

use std::path::Path;

use sqlx::{Pool, Sqlite};
use tracing::info;

use smite_core::db::{DbLocation, open_pool};

pub use smite_core::db::DatabaseError;

/// Cloneable handle over the panel's pool. Migrations run on open.
#[derive(Clone)]
pub struct PanelDatabase {
    pool: Pool<Sqlite>,
}

impl PanelDatabase {
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::open_at(&DbLocation::file(path)).await
    }

    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::open_at(&DbLocation::Memory).await
    }

    async fn open_at(location: &DbLocation) -> Result<Self, DatabaseError> {
        let pool = open_pool(location).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(?location, "Panel database ready");
        Ok(Self { pool })
    }

    pub(crate) const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
