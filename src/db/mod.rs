pub mod repository;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::{RepoError, Result};

/// Pool sized for the scheduler plus the matching workers; no long
/// transactions span phases, so connections cycle quickly.
pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(RepoError::from_sqlx)?;
    Ok(pool)
}
