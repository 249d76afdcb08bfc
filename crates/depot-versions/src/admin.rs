//! Administrative access to the database servers holding version data.

use std::time::Duration;

use async_trait::async_trait;
use depot_core::DbConfig;
use sqlx::Connection;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use tracing::info;

use crate::error::{VersionError, VersionResult};

/// Drops the per-version databases.
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Drop `db.database` on `db.server` if it exists.
    ///
    /// Returns whether a database was dropped. The existence check runs on
    /// the same connection immediately before the drop.
    async fn drop_database(&self, db: &DbConfig) -> VersionResult<bool>;
}

/// PostgreSQL admin connecting to the server's maintenance database.
pub struct PostgresAdmin {
    connect_timeout: Duration,
}

impl PostgresAdmin {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn options(db: &DbConfig) -> VersionResult<PgConnectOptions> {
        let (host, port) = match db.server.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| VersionError::Database(format!("invalid server: {}", db.server)))?;
                (host, port)
            }
            None => (db.server.as_str(), 5432),
        };
        Ok(PgConnectOptions::new()
            .host(host)
            .port(port)
            .username(&db.user)
            .password(&db.password)
            .database("postgres"))
    }
}

#[async_trait]
impl DatabaseAdmin for PostgresAdmin {
    async fn drop_database(&self, db: &DbConfig) -> VersionResult<bool> {
        info!(server = %db.server, "opening connection to database server");
        let options = Self::options(db)?;
        let mut conn = tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&options))
            .await
            .map_err(|_| VersionError::Database(format!("timed out connecting to {}", db.server)))??;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(&db.database)
                .fetch_one(&mut conn)
                .await?;

        let dropped = if exists {
            sqlx::query(&format!("DROP DATABASE {}", quote_ident(&db.database)))
                .execute(&mut conn)
                .await?;
            info!(database = %db.database, "dropped database");
            true
        } else {
            info!(database = %db.database, "database not found, nothing to drop");
            false
        };

        conn.close().await?;
        info!(server = %db.server, "closed connection to database server");
        Ok(dropped)
    }
}

/// Quote a PostgreSQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
