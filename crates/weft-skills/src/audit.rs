//! Structured audit log with secret redaction.
//!
//! One row per audited action. Arguments are passed through the redaction
//! mask before they are stored, so a bot token in a tool argument never
//! reaches disk in plaintext.

use std::sync::Mutex;

use rusqlite::Connection;
use serde_json::Value;
use tracing::info;

use weft_core::redact::{redact_text, redact_value};
use weft_core::{Result, WeftError};

use crate::registry::SkillOutcome;

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub ts: String,
    /// User or tenant id that triggered the action.
    pub actor: String,
    /// `skill.invoke`, `mcp.notify`, `confirm.request`, …
    pub action: String,
    /// Correlation handle (task id or confirmation id).
    pub correlation: String,
    /// Structured arguments with the redaction mask applied.
    pub args: Value,
    pub outcome: String,
    pub duration_ms: u64,
}

impl AuditEntry {
    pub fn new(actor: &str, action: &str, correlation: &str, args: &Value) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            actor: actor.to_string(),
            action: action.to_string(),
            correlation: correlation.to_string(),
            args: redact_value(args),
            outcome: String::new(),
            duration_ms: 0,
        }
    }

    pub fn with_outcome(mut self, outcome: &str, duration_ms: u64) -> Self {
        self.outcome = redact_text(outcome);
        self.duration_ms = duration_ms;
        self
    }

    pub fn for_skill(
        actor: &str,
        skill: &str,
        correlation: &str,
        args: &Value,
        outcome: &SkillOutcome,
        duration_ms: u64,
    ) -> Self {
        let summary = if outcome.ok {
            "ok".to_string()
        } else {
            format!("error: {}", outcome.error.as_deref().unwrap_or("unknown"))
        };
        Self::new(actor, &format!("skill.invoke:{skill}"), correlation, args)
            .with_outcome(&summary, duration_ms)
    }
}

pub struct AuditLog {
    db: Mutex<Connection>,
}

/// Initialise the audit table. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            ts          TEXT NOT NULL,
            actor       TEXT NOT NULL,
            action      TEXT NOT NULL,
            correlation TEXT NOT NULL,
            args        TEXT NOT NULL,
            outcome     TEXT NOT NULL,
            duration_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_correlation
            ON audit_log(correlation);",
    )
    .map_err(|e| WeftError::Database(e.to_string()))?;
    Ok(())
}

impl AuditLog {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory().map_err(|e| WeftError::Database(e.to_string()))?)
    }

    pub fn record(&self, entry: &AuditEntry) -> Result<()> {
        let args_json = serde_json::to_string(&entry.args)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO audit_log (ts, actor, action, correlation, args, outcome, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.ts,
                entry.actor,
                entry.action,
                entry.correlation,
                args_json,
                entry.outcome,
                entry.duration_ms as i64,
            ],
        )
        .map_err(|e| WeftError::Database(e.to_string()))?;

        info!(
            actor = %entry.actor,
            action = %entry.action,
            correlation = %entry.correlation,
            outcome = %entry.outcome,
            duration_ms = entry.duration_ms,
            "audit"
        );
        Ok(())
    }

    /// All entries for a correlation handle, oldest first.
    pub fn by_correlation(&self, correlation: &str) -> Result<Vec<AuditEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db
            .prepare(
                "SELECT ts, actor, action, correlation, args, outcome, duration_ms
                 FROM audit_log WHERE correlation = ?1 ORDER BY id",
            )
            .map_err(|e| WeftError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([correlation], |r| {
                Ok(AuditEntry {
                    ts: r.get(0)?,
                    actor: r.get(1)?,
                    action: r.get(2)?,
                    correlation: r.get(3)?,
                    args: serde_json::from_str(&r.get::<_, String>(4)?)
                        .unwrap_or(Value::Null),
                    outcome: r.get(5)?,
                    duration_ms: r.get::<_, i64>(6)? as u64,
                })
            })
            .map_err(|e| WeftError::Database(e.to_string()))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_and_read_back_by_correlation() {
        let log = AuditLog::open_in_memory().unwrap();
        let entry = AuditEntry::new("u1", "skill.invoke:fs_read", "t1", &json!({"path": "a"}))
            .with_outcome("ok", 12);
        log.record(&entry).unwrap();

        let rows = log.by_correlation("t1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "skill.invoke:fs_read");
        assert_eq!(rows[0].duration_ms, 12);
    }

    #[test]
    fn secrets_are_redacted_before_storage() {
        let log = AuditLog::open_in_memory().unwrap();
        let entry = AuditEntry::new(
            "u1",
            "skill.invoke:http",
            "t2",
            &json!({"api_key": "sk-abcdefghijklmnopqrstuvwx", "url": "https://x"}),
        );
        log.record(&entry).unwrap();

        let rows = log.by_correlation("t2").unwrap();
        let stored = serde_json::to_string(&rows[0].args).unwrap();
        assert!(!stored.contains("sk-abcdefghijklmnopqrstuvwx"));
        assert!(stored.contains("[redacted]"));
    }

    #[test]
    fn outcome_text_is_masked_too() {
        let entry = AuditEntry::new("u1", "skill.invoke:x", "t3", &json!({}))
            .with_outcome("failed with Bearer sk-abcdefghijklmnopqrstuvwx", 1);
        assert!(!entry.outcome.contains("sk-"));
    }
}
