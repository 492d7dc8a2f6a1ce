//! Per-scope pull cursors
//!
//! One persisted row per scope holding the highest server version this device
//! has durably applied. Reads always go to the store; nothing is cached.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::Store;
use crate::error::{Error, Result};
use crate::util::unix_millis_now;

pub fn read_cursor(conn: &Connection, scope: &str) -> Result<i64> {
    let version = conn
        .query_row(
            "SELECT last_seen_version FROM cursors WHERE scope_id = ?1",
            [scope],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

/// Move the cursor forward; a lower version leaves it unchanged
///
/// Returns the stored value after the update.
pub fn advance_cursor(conn: &Connection, scope: &str, version: i64) -> Result<i64> {
    if version < 0 {
        return Err(Error::InvalidInput(format!(
            "cursor version must not be negative (got {version})"
        )));
    }
    conn.execute(
        "INSERT INTO cursors (scope_id, last_seen_version, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (scope_id) DO UPDATE SET
             last_seen_version = MAX(last_seen_version, excluded.last_seen_version),
             updated_at = excluded.updated_at",
        params![scope, version, unix_millis_now()],
    )?;
    read_cursor(conn, scope)
}

#[derive(Debug, Clone)]
pub struct CursorManager {
    store: Arc<Store>,
}

impl CursorManager {
    pub const fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn get_cursor(&self, scope: &str) -> Result<i64> {
        self.store.read(|conn| read_cursor(conn, scope))
    }

    pub fn set_cursor(&self, scope: &str, version: i64) -> Result<i64> {
        let stored = self
            .store
            .transaction(|conn| advance_cursor(conn, scope, version))?;
        if stored > version {
            tracing::debug!(scope, version, stored, "Ignored backwards cursor move");
        }
        Ok(stored)
    }

    /// Explicitly rewind to zero before a full rescan
    pub fn reset(&self, scope: &str) -> Result<()> {
        self.store.transaction(|conn| {
            conn.execute("DELETE FROM cursors WHERE scope_id = ?1", [scope])?;
            Ok(())
        })?;
        tracing::info!(scope, "Cursor reset for rescan");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CursorManager {
        CursorManager::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn unknown_scope_starts_at_zero() {
        assert_eq!(manager().get_cursor("scope").unwrap(), 0);
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let cursors = manager();
        assert_eq!(cursors.set_cursor("scope", 10).unwrap(), 10);
        assert_eq!(cursors.set_cursor("scope", 4).unwrap(), 10);
        assert_eq!(cursors.get_cursor("scope").unwrap(), 10);
        assert_eq!(cursors.set_cursor("scope", 12).unwrap(), 12);
        assert!(cursors.set_cursor("scope", -1).is_err());
    }

    #[test]
    fn scopes_are_independent_and_reset_is_explicit() {
        let cursors = manager();
        cursors.set_cursor("a", 5).unwrap();
        cursors.set_cursor("b", 9).unwrap();
        cursors.reset("a").unwrap();
        assert_eq!(cursors.get_cursor("a").unwrap(), 0);
        assert_eq!(cursors.get_cursor("b").unwrap(), 9);
    }
}
