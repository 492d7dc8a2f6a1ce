//! Local store connection management

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::migrations;
use super::records::{RecordTxn, WriteHook, WriteOrigin};
use crate::clock::NodeId;
use crate::error::{Error, Result};

const NODE_ID_KEY: &str = "node_id";
const SCOPE_KEY: &str = "scope";

/// Single-connection `SQLite` store shared by the outbox, resolver, and host writes
///
/// Every mutation runs as one short synchronous transaction; callers never hold
/// the connection across an await point.
pub struct Store {
    conn: Mutex<Connection>,
    hook: OnceLock<Arc<dyn WriteHook>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("hook_installed", &self.hook.get().is_some())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open a store at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        configure(&conn)?;
        migrations::run(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            hook: OnceLock::new(),
        })
    }

    /// Register the hook that observes every record write; only one may be installed
    pub fn install_hook(&self, hook: Arc<dyn WriteHook>) -> Result<()> {
        self.hook
            .set(hook)
            .map_err(|_| Error::Config("a write hook is already installed".to_string()))
    }

    /// Run `f` inside one immediate transaction
    ///
    /// The transaction commits only if `f` returns `Ok`; any error, including
    /// one raised by the write hook, rolls back every write made inside it.
    pub fn write<T>(
        &self,
        origin: WriteOrigin,
        f: impl FnOnce(&RecordTxn<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = {
            let txn = RecordTxn::new(&tx, origin, self.hook.get());
            f(&txn)?
        };
        tx.commit()?;
        Ok(value)
    }

    /// Run bookkeeping work (outbox, cursors) in one immediate transaction
    ///
    /// Record writes must go through [`Store::write`] so the hook observes them.
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run read-only work against the connection
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Stable per-installation id, generated on first use
    pub fn node_id(&self) -> Result<NodeId> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                [NODE_ID_KEY],
                |row| row.get(0),
            )
            .optional()?;

        let node_id = if let Some(value) = existing {
            NodeId::parse(value)?
        } else {
            let generated = NodeId::generate();
            tx.execute(
                "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)",
                params![NODE_ID_KEY, generated.as_str()],
            )?;
            tracing::info!(node_id = %generated, "Generated installation node id");
            generated
        };
        tx.commit()?;
        Ok(node_id)
    }

    /// Tie this store to one scope on first use; records and the outbox carry
    /// no scope column, so a second scope must use its own store
    pub fn bind_scope(&self, scope: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let bound: Option<String> = tx
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                [SCOPE_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match bound {
            Some(bound) if bound == scope => {}
            Some(bound) => {
                return Err(Error::Config(format!(
                    "local store belongs to scope `{bound}`; open a separate database for `{scope}`"
                )));
            }
            None => {
                tx.execute(
                    "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)",
                    params![SCOPE_KEY, scope],
                )?;
                tracing::info!(scope, "Bound local store to scope");
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("store connection mutex poisoned".to_string()))
    }
}

/// Configure `SQLite` for a single-writer local store
fn configure(conn: &Connection) -> Result<()> {
    // In-memory databases report "memory" for journal_mode; both are fine.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute_batch(
        "PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}
