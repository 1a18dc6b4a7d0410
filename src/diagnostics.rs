//! Operator diagnostics.
//!
//! A bounded in-memory event log every error path writes to, plus a system
//! health snapshot: pending queue depth, entries that keep failing to sync,
//! schema version, and the last successful sync time. Persistently failing
//! queue entries are never dropped automatically, so this is where an
//! operator finds them.

use rusqlite::params;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

use crate::db::{self, DbState, META_LAST_SYNC_TIME};

/// Maximum retained log entries.
const MAX_ENTRIES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Software,
    Database,
    Payment,
    Network,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub category: LogCategory,
    pub message: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Bounded event log. Oldest entries fall off the front.
pub struct DiagnosticsLog {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        DiagnosticsLog {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, category: LogCategory, message: impl Into<String>) {
        let message = message.into();
        debug!(category = ?category, message = %message, "diagnostic event");

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == MAX_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            category,
            message,
            at: chrono::Utc::now(),
        });
    }

    /// Most recent entries, newest last.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .skip(entries.len().saturating_sub(limit))
            .cloned()
            .collect()
    }
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        DiagnosticsLog::new()
    }
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

/// Queue entries that have failed at least one drain attempt.
fn failing_entries(db: &DbState) -> Result<Vec<Value>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut out = Vec::new();

    for (table, kind) in [
        ("pending_orders", "order"),
        ("pending_payments", "payment"),
    ] {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT local_id, attempts, last_error, created_at
                 FROM {table}
                 WHERE attempts > 0
                 ORDER BY created_at ASC"
            ))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![], |row| {
                Ok(json!({
                    "kind": kind,
                    "localId": row.get::<_, String>(0)?,
                    "attempts": row.get::<_, i64>(1)?,
                    "lastError": row.get::<_, Option<String>>(2)?,
                    "createdAt": row.get::<_, String>(3)?,
                }))
            })
            .map_err(|e| e.to_string())?;
        for row in rows {
            out.push(row.map_err(|e| e.to_string())?);
        }
    }
    Ok(out)
}

/// System health snapshot for the diagnostics screen.
pub fn system_health(db: &DbState, log: &DiagnosticsLog) -> Result<Value, String> {
    let (pending_orders, pending_payments) = db::pending_counts(db)?;
    let failing = failing_entries(db)?;
    let last_sync = db::get_meta(db, META_LAST_SYNC_TIME)?;

    let schema_version: i64 = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0)
    };

    Ok(json!({
        "schemaVersion": schema_version,
        "pendingOrders": pending_orders,
        "pendingPayments": pending_payments,
        "failingEntries": failing,
        "lastSyncTime": last_sync,
        "recentEvents": log.recent(20),
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
