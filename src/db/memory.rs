use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;

use crate::core::constants::DB_ACQUIRE_TIMEOUT_MS;
use crate::core::sync::{Cond, Locker};
use crate::db::{ConnectionSource, DbCredentials, UserStore};
use crate::error::{Result, ServerError};

type Rows = Arc<Locker<Vec<(String, String)>>>;

/// In-process user database with a fixed number of handles.
///
/// Handles are lent out like connections of a real SQL pool: a borrower
/// waits on a condition variable for a bounded time when all are in use.
pub struct MemoryDb {
    credentials: DbCredentials,
    free: Locker<Vec<MemoryConn>>,
    available: Cond,
    max_conn: usize,
    acquire_timeout: Duration,
}

pub struct MemoryConn {
    id: usize,
    rows: Rows,
}

impl MemoryConn {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl UserStore for MemoryConn {
    fn load_users(&mut self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(self.rows.lock().clone())
    }

    fn insert_user(&mut self, name: &str, password: &str) -> anyhow::Result<()> {
        let mut rows = self.rows.lock();
        if rows.iter().any(|(n, _)| n == name) {
            bail!("duplicate user {name}");
        }
        rows.push((name.to_string(), password.to_string()));
        Ok(())
    }
}

impl MemoryDb {
    pub fn new(credentials: DbCredentials, max_conn: usize) -> Result<Self> {
        Self::with_users(credentials, max_conn, Vec::new())
    }

    pub fn with_users(
        credentials: DbCredentials,
        max_conn: usize,
        users: Vec<(String, String)>,
    ) -> Result<Self> {
        if max_conn == 0 {
            return Err(ServerError::Config(
                "database pool needs at least one connection".to_string(),
            ));
        }
        let rows: Rows = Arc::new(Locker::new(users)?);
        let free = (0..max_conn)
            .map(|id| MemoryConn {
                id,
                rows: Arc::clone(&rows),
            })
            .collect();

        tracing::debug!(
            db = %credentials.name,
            user = %credentials.user,
            max_conn,
            "database pool ready"
        );

        Ok(Self {
            credentials,
            free: Locker::new(free)?,
            available: Cond::new()?,
            max_conn,
            acquire_timeout: Duration::from_millis(DB_ACQUIRE_TIMEOUT_MS),
        })
    }

    pub fn set_acquire_timeout(&mut self, timeout: Duration) {
        self.acquire_timeout = timeout;
    }

    pub fn credentials(&self) -> &DbCredentials {
        &self.credentials
    }

    pub fn max_conn(&self) -> usize {
        self.max_conn
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

impl ConnectionSource for MemoryDb {
    type Conn = MemoryConn;

    fn get_connection(&self) -> Option<MemoryConn> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut free = self.free.lock();
        while free.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if let Err(e) = self.available.timed_wait(&mut free, remaining) {
                tracing::error!(error = %e, "waiting for a database connection failed");
                return None;
            }
        }
        free.pop()
    }

    fn release_connection(&self, conn: MemoryConn) {
        self.free.lock().push(conn);
        if let Err(e) = self.available.signal() {
            tracing::error!(error = %e, "signal database waiters failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PooledConn, UserTable};
    use std::thread;

    fn db(max_conn: usize) -> MemoryDb {
        MemoryDb::with_users(
            DbCredentials::default(),
            max_conn,
            vec![("alice".to_string(), "secret".to_string())],
        )
        .unwrap()
    }

    #[test]
    fn pooled_conn_returns_handle_on_drop() {
        let db = db(2);
        {
            let mut a = PooledConn::acquire(&db);
            assert!(a.store().is_some());
            assert_eq!(db.free_count(), 1);
        }
        assert_eq!(db.free_count(), 2);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let mut db = db(1);
        db.set_acquire_timeout(Duration::from_millis(20));
        let held = db.get_connection().unwrap();
        assert!(db.get_connection().is_none());
        db.release_connection(held);
        assert!(db.get_connection().is_some());
    }

    #[test]
    fn waiter_gets_released_handle() {
        let db = Arc::new(db(1));
        let held = db.get_connection().unwrap();
        let waiter = {
            let db = Arc::clone(&db);
            thread::spawn(move || db.get_connection().map(|c| c.id()))
        };
        thread::sleep(Duration::from_millis(20));
        db.release_connection(held);
        assert_eq!(waiter.join().unwrap(), Some(0));
    }

    #[test]
    fn user_table_loads_and_registers() {
        let db = db(1);
        let users = UserTable::load(&db).unwrap();
        assert!(users.check("alice", "secret"));
        assert!(!users.check("alice", "wrong"));

        let mut pooled = PooledConn::acquire(&db);
        let store = pooled.store().unwrap();
        assert!(users.register(store, "bob", "pw"));
        assert!(!users.register(store, "bob", "other"));
        assert!(users.check("bob", "pw"));
        drop(pooled);

        let reloaded = UserTable::load(&db).unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn zero_connections_is_a_config_error() {
        assert!(matches!(
            MemoryDb::new(DbCredentials::default(), 0),
            Err(ServerError::Config(_))
        ));
    }
}
