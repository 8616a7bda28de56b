use std::path::PathBuf;

use clap::Parser;

use crate::conn::ConnSettings;
use crate::core::constants;
use crate::core::epoll::TrigMode;
use crate::db::DbCredentials;
use crate::pool::{ActorModel, PoolConfig};

/// Server configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "tinyweb", about = "Small multi-threaded HTTP server")]
pub struct ServerConfig {
    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = 9006)]
    pub port: u16,

    /// Trigger mode for the listening socket
    #[arg(long, value_enum, default_value_t = TrigMode::Level)]
    pub listen_trig: TrigMode,

    /// Trigger mode for client sockets
    #[arg(long, value_enum, default_value_t = TrigMode::Level)]
    pub conn_trig: TrigMode,

    /// Linger on close so unsent data is flushed
    #[arg(short = 'o', long)]
    pub linger: bool,

    /// Number of database connections
    #[arg(short = 's', long, default_value_t = constants::DEFAULT_SQL_NUM)]
    pub sql_num: usize,

    /// Number of worker threads
    #[arg(short = 't', long, default_value_t = constants::DEFAULT_THREAD_NUMBER)]
    pub threads: usize,

    /// Maximum number of queued tasks
    #[arg(short = 'q', long, default_value_t = constants::DEFAULT_MAX_REQUESTS)]
    pub max_requests: usize,

    /// Disable logging
    #[arg(short = 'c', long)]
    pub close_log: bool,

    /// Who performs socket I/O
    #[arg(short = 'a', long, value_enum, default_value_t = ActorModel::Proactor)]
    pub actor: ActorModel,

    /// Directory pages are served from
    #[arg(long, default_value = "./root")]
    pub doc_root: PathBuf,

    #[arg(long, default_value = "root")]
    pub db_user: String,

    #[arg(long, default_value = "root")]
    pub db_password: String,

    #[arg(long, default_value = "webserver")]
    pub db_name: String,

    /// Pin worker threads to CPU cores
    #[arg(long)]
    pub pin_workers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from(["tinyweb"])
    }
}

impl ServerConfig {
    pub fn credentials(&self) -> DbCredentials {
        DbCredentials {
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            name: self.db_name.clone(),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            thread_number: self.threads,
            max_requests: self.max_requests,
            actor_model: self.actor,
            pin_workers: self.pin_workers,
        }
    }

    pub fn conn_settings(&self) -> ConnSettings {
        ConnSettings {
            doc_root: self.doc_root.clone(),
            trig_mode: self.conn_trig,
            close_log: self.close_log,
            db: self.credentials(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 9006);
        assert_eq!(cfg.actor, ActorModel::Proactor);
        assert_eq!(cfg.conn_trig, TrigMode::Level);
        assert_eq!(cfg.pool_config().thread_number, 8);
    }

    #[test]
    fn parses_short_flags() {
        let cfg = ServerConfig::parse_from([
            "tinyweb", "-p", "8080", "-t", "4", "-a", "reactor", "--conn-trig", "edge", "-c",
        ]);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.threads, 4);
        assert_eq!(cfg.actor, ActorModel::Reactor);
        assert_eq!(cfg.conn_settings().trig_mode, TrigMode::Edge);
        assert!(cfg.close_log);
    }
}
