use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tinyweb::db::{MemoryDb, UserTable};
use tinyweb::pool::ThreadPool;
use tinyweb::server::{Server, ServerConfig};

fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    if !config.close_log {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_thread_names(true)
            .init();
    }

    let db = Arc::new(
        MemoryDb::new(config.credentials(), config.sql_num)
            .context("failed to create database connection pool")?,
    );
    let users = Arc::new(UserTable::load(&*db).context("failed to load user table")?);
    tracing::info!(users = users.len(), sql_num = config.sql_num, "user table loaded");

    let pool = ThreadPool::new(config.pool_config(), Arc::clone(&db))
        .context("failed to start worker pool")?;

    let mut server = Server::bind(&config, pool, users)
        .with_context(|| format!("failed to start server on port {}", config.port))?;
    server.run().context("event loop failed")
}
