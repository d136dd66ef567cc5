//! Durable key/value half of the bus.
//!
//! Backed by a single SQLite connection behind a `Mutex`. Namespacing is by
//! key prefix: `task:<id>`, `mcp:endpoint:<id>`, `confirmation:<id>`,
//! `config:<dotted.key>`, `rl:<user_id>`, `user:<id>:summary`, …
//!
//! TTL is a per-row `expires_at` timestamp checked lazily on read plus a
//! periodic `purge_expired` sweep driven by the server binary.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use weft_core::{Result, WeftError};

pub struct Kv {
    db: Mutex<Connection>,
}

/// Initialise the kv table. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            expires_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_kv_expiry ON kv(expires_at);",
    )
    .map_err(db_err)?;
    Ok(())
}

impl Kv {
    /// Wrap an already-open connection, initialising the schema.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=3000;")
            .map_err(db_err)?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and single-shot tools.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        let row: Option<(String, Option<String>)> = db
            .query_row(
                "SELECT value, expires_at FROM kv WHERE key = ?1",
                [key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;

        match row {
            None => Ok(None),
            Some((_, Some(exp))) if is_expired(&exp) => {
                db.execute("DELETE FROM kv WHERE key = ?1", [key])
                    .map_err(db_err)?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, NULL)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = NULL",
            [key, value],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let exp = expiry(ttl_secs);
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
            [key, value, exp.as_str()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn del(&self, key: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db
            .execute("DELETE FROM kv WHERE key = ?1", [key])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// All live entries whose key starts with `prefix`, sorted by key.
    pub fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = db
            .prepare(
                "SELECT key, value FROM kv
                 WHERE key LIKE ?1 ESCAPE '\\'
                   AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY key",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([pattern.as_str(), now.as_str()], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .map_err(db_err)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Insert only when the key is absent. Returns true when the row was
    /// created. No expiry.
    pub fn insert(&self, key: &str, value: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db
            .execute(
                "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, NULL)",
                [key, value],
            )
            .map_err(db_err)?;
        Ok(n == 1)
    }

    /// Delete only when the stored value still matches (claim release).
    pub fn del_if(&self, key: &str, value: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db
            .execute("DELETE FROM kv WHERE key = ?1 AND value = ?2", [key, value])
            .map_err(db_err)?;
        Ok(n == 1)
    }

    /// SETNX-style atomic claim: inserts only when the key is absent (or its
    /// previous holder's TTL has lapsed). Returns true when this caller won.
    pub fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let exp = expiry(ttl_secs);
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        // Clear a lapsed holder first so the insert below can win.
        db.execute(
            "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            [key, now.as_str()],
        )
        .map_err(db_err)?;
        let n = db
            .execute(
                "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                [key, value, exp.as_str()],
            )
            .map_err(db_err)?;
        Ok(n == 1)
    }

    /// Compare-and-swap on the full stored value. Returns true when the swap
    /// happened. `ttl_secs = None` clears any expiry.
    pub fn cas(&self, key: &str, expected: &str, new: &str, ttl_secs: Option<u64>) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let exp = ttl_secs.map(expiry);
        let db = self.db.lock().unwrap();
        let n = db
            .execute(
                "UPDATE kv SET value = ?3, expires_at = ?4
                 WHERE key = ?1 AND value = ?2
                   AND (expires_at IS NULL OR expires_at > ?5)",
                rusqlite::params![key, expected, new, exp, now],
            )
            .map_err(db_err)?;
        Ok(n == 1)
    }

    /// Refresh the TTL of an existing key only when `value` still matches
    /// (claim refresh).
    pub fn refresh_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let exp = expiry(ttl_secs);
        let db = self.db.lock().unwrap();
        let n = db
            .execute(
                "UPDATE kv SET expires_at = ?3 WHERE key = ?1 AND value = ?2",
                [key, value, exp.as_str()],
            )
            .map_err(db_err)?;
        Ok(n == 1)
    }

    /// Drop all expired rows. Returns the number removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db
            .execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                [now.as_str()],
            )
            .map_err(db_err)?;
        if n > 0 {
            debug!(purged = n, "kv expiry sweep");
        }
        Ok(n)
    }

    // JSON document helpers.

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, &serde_json::to_string(value)?)
    }
}

fn expiry(ttl_secs: u64) -> String {
    (Utc::now() + Duration::seconds(ttl_secs as i64)).to_rfc3339()
}

fn is_expired(exp: &str) -> bool {
    match DateTime::parse_from_rfc3339(exp) {
        Ok(dt) => dt.with_timezone(&Utc) <= Utc::now(),
        Err(_) => true,
    }
}

fn db_err(e: rusqlite::Error) -> WeftError {
    WeftError::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_del_round_trip() {
        let kv = Kv::open_in_memory().unwrap();
        kv.set("config:model.name", "local").unwrap();
        assert_eq!(kv.get("config:model.name").unwrap().unwrap(), "local");
        assert!(kv.del("config:model.name").unwrap());
        assert!(kv.get("config:model.name").unwrap().is_none());
    }

    #[test]
    fn list_is_prefix_scoped_and_sorted() {
        let kv = Kv::open_in_memory().unwrap();
        kv.set("task:b", "2").unwrap();
        kv.set("task:a", "1").unwrap();
        kv.set("user:1:summary", "s").unwrap();
        let tasks = kv.list("task:").unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].0, "task:a");
        assert_eq!(tasks[1].0, "task:b");
    }

    #[test]
    fn set_nx_first_writer_wins() {
        let kv = Kv::open_in_memory().unwrap();
        assert!(kv.set_nx("claim:t1", "w1", 60).unwrap());
        assert!(!kv.set_nx("claim:t1", "w2", 60).unwrap());
        assert_eq!(kv.get("claim:t1").unwrap().unwrap(), "w1");
    }

    #[test]
    fn set_nx_reclaims_after_expiry() {
        let kv = Kv::open_in_memory().unwrap();
        // ttl 0 — already lapsed
        assert!(kv.set_nx("claim:t1", "w1", 0).unwrap());
        assert!(kv.set_nx("claim:t1", "w2", 60).unwrap());
        assert_eq!(kv.get("claim:t1").unwrap().unwrap(), "w2");
    }

    #[test]
    fn cas_swaps_only_on_match() {
        let kv = Kv::open_in_memory().unwrap();
        kv.set("rl:1", "a").unwrap();
        assert!(!kv.cas("rl:1", "stale", "b", None).unwrap());
        assert!(kv.cas("rl:1", "a", "b", None).unwrap());
        assert_eq!(kv.get("rl:1").unwrap().unwrap(), "b");
    }

    #[test]
    fn expired_rows_read_as_absent() {
        let kv = Kv::open_in_memory().unwrap();
        kv.set_with_ttl("tmp", "x", 0).unwrap();
        assert!(kv.get("tmp").unwrap().is_none());
    }

    #[test]
    fn purge_removes_expired_rows() {
        let kv = Kv::open_in_memory().unwrap();
        kv.set_with_ttl("a", "1", 0).unwrap();
        kv.set("b", "2").unwrap();
        let purged = kv.purge_expired().unwrap();
        assert_eq!(purged, 1);
        assert_eq!(kv.get("b").unwrap().unwrap(), "2");
    }

    #[test]
    fn json_helpers_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Doc {
            n: u32,
        }
        let kv = Kv::open_in_memory().unwrap();
        kv.set_json("doc", &Doc { n: 7 }).unwrap();
        assert_eq!(kv.get_json::<Doc>("doc").unwrap().unwrap(), Doc { n: 7 });
    }
}
