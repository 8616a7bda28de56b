//! Database collaborator
//!
//! The connection core only needs two things from the database: the
//! username → password table loaded once at startup, and a borrowed handle
//! to insert a newly registered user. Both go through the traits below so
//! that any backend can stand behind them.

pub mod memory;

use std::collections::HashMap;

use crate::core::sync::Locker;
use crate::error::Result;

pub use memory::MemoryDb;

/// Credentials a connection keeps a copy of for its database work.
#[derive(Debug, Clone, Default)]
pub struct DbCredentials {
    pub user: String,
    pub password: String,
    pub name: String,
}

/// Operations a borrowed database handle supports.
pub trait UserStore {
    fn load_users(&mut self) -> anyhow::Result<Vec<(String, String)>>;
    fn insert_user(&mut self, name: &str, password: &str) -> anyhow::Result<()>;
}

/// A pool of database handles.
pub trait ConnectionSource: Send + Sync + 'static {
    type Conn: UserStore + Send + 'static;

    /// Borrow a handle. May block for a bounded time; `None` when the pool
    /// stayed exhausted.
    fn get_connection(&self) -> Option<Self::Conn>;

    fn release_connection(&self, conn: Self::Conn);
}

/// Scoped database handle, returned to its source on drop.
pub struct PooledConn<'a, S: ConnectionSource> {
    source: &'a S,
    conn: Option<S::Conn>,
}

impl<'a, S: ConnectionSource> PooledConn<'a, S> {
    pub fn acquire(source: &'a S) -> Self {
        let conn = source.get_connection();
        if conn.is_none() {
            tracing::warn!("no database connection available");
        }
        Self { source, conn }
    }

    pub fn store(&mut self) -> Option<&mut dyn UserStore> {
        self.conn.as_mut().map(|c| c as &mut dyn UserStore)
    }
}

impl<S: ConnectionSource> Drop for PooledConn<'_, S> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.source.release_connection(conn);
        }
    }
}

/// Preloaded username → password table shared by every connection.
pub struct UserTable {
    users: Locker<HashMap<String, String>>,
}

impl UserTable {
    pub fn new() -> Result<Self> {
        Ok(Self {
            users: Locker::new(HashMap::new())?,
        })
    }

    /// Build the table from every row the database holds.
    pub fn load<S: ConnectionSource>(source: &S) -> anyhow::Result<Self> {
        let table = Self::new()?;
        let mut pooled = PooledConn::acquire(source);
        let store = pooled
            .store()
            .ok_or_else(|| anyhow::anyhow!("no database connection to load users"))?;
        let rows = store.load_users()?;
        tracing::info!(users = rows.len(), "loaded user table");
        table.users.lock().extend(rows);
        Ok(table)
    }

    pub fn check(&self, name: &str, password: &str) -> bool {
        self.users.lock().get(name).is_some_and(|p| p == password)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.users.lock().contains_key(name)
    }

    /// Persist a new user through `store`, then add it to the table.
    ///
    /// The table lock is held across the insert so two concurrent
    /// registrations of one name cannot both succeed.
    pub fn register(&self, store: &mut dyn UserStore, name: &str, password: &str) -> bool {
        let mut users = self.users.lock();
        if users.contains_key(name) {
            return false;
        }
        match store.insert_user(name, password) {
            Ok(()) => {
                users.insert(name.to_string(), password.to_string());
                true
            }
            Err(e) => {
                tracing::error!(user = name, error = %e, "insert user failed");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
