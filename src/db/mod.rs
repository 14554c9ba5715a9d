//! Database connection management.
//!
//! Every worker and the orchestrator share one connection pool; reads/writes go
//! through short transactions, never holding a connection across an external call
//! (HTTP, provider, broker) per the suspension/blocking-points design.

pub mod models;

use anyhow::{Context, Result};
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::PgConnection;
use getset::Getters;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct DbConnectionConfig {
    database_url: String,
}

impl DbConnectionConfig {
    pub fn new(database_url: String) -> Self {
        DbConnectionConfig { database_url }
    }
}

pub fn build_pool(conn_cfg: &DbConnectionConfig) -> Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(conn_cfg.database_url());
    Pool::builder()
        .build(manager)
        .context("Building the database connection pool")
}

pub fn get_conn(pool: &DbPool) -> Result<DbConn> {
    pool.get().context("Checking out a database connection")
}

/// Run a blocking Diesel closure on the blocking thread pool, since this
/// crate's connections are synchronous (no `diesel-async` in the stack) but
/// every worker loop is async. Callers never hold a connection across an
/// `.await`; this is the one seam where that boundary is crossed on purpose.
pub async fn with_conn<F, T>(pool: DbPool, f: F) -> crate::error::Result<T>
where
    F: FnOnce(&mut DbConn) -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let mut conn = get_conn(&pool).map_err(|e| crate::error::EtlError::TransientExternal(e))?;
    tokio::task::spawn_blocking(move || f(&mut conn))
        .await
        .map_err(|e| crate::error::EtlError::TransientInternal(anyhow::anyhow!(e)))?
}

pub const MIGRATIONS: diesel_migrations::EmbeddedMigrations = diesel_migrations::embed_migrations!("migrations");

/// Run all pending migrations. Called once at process start, before the
/// orchestrator or any worker begins polling.
pub fn run_pending_migrations(conn: &mut PgConnection) -> Result<()> {
    use diesel_migrations::MigrationHarness;

    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Running pending migrations: {}", e))?;
    Ok(())
}
