//! Durable local queue, backed by SQLite.
//!
//! Uses rusqlite with WAL mode. Four logical tables: pending orders, pending
//! payments, a cached-transaction mirror for offline recall, and sync
//! metadata (last known transaction id, last sync time). Queue entries
//! survive process restarts and are only removed after an explicit server
//! acknowledgment during drain.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{CachedTransaction, PendingOrder, PendingPayment, Transaction};

/// Shared state holding the queue database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations. Migrations are
/// additive only: the pending tables hold unsynced sales and are never
/// dropped or rewritten destructively.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Metadata keys.
pub const META_LAST_TRANSACTION_ID: &str = "last_transaction_id";
pub const META_LAST_SYNC_TIME: &str = "last_sync_time";

/// The server's transaction counter base; first-run seed for
/// `last_transaction_id`.
pub const INITIAL_TRANSACTION_ID: &str = "110000";

/// Initialize the queue database at `{data_dir}/queue.db`.
///
/// An unreadable or unopenable file is surfaced as an error, never deleted:
/// pending entries are unsynced sales. The caller degrades to online-only
/// operation when this fails.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("queue.db");
    info!("Opening offline queue at {}", db_path.display());

    let conn = open_and_configure(&db_path)?;
    run_migrations(&conn)?;

    info!("Offline queue ready (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating queue schema from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: the four logical tables plus first-run metadata seed.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS pending_orders (
            local_id TEXT PRIMARY KEY,
            offline_transaction_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pending_payments (
            local_id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cached_transactions (
            transaction_id TEXT PRIMARY KEY,
            offline_transaction_id TEXT,
            data TEXT NOT NULL,
            cached_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_meta (
            meta_key TEXT PRIMARY KEY,
            meta_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_pending_orders_created
            ON pending_orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_pending_payments_created
            ON pending_payments(created_at);
        CREATE INDEX IF NOT EXISTS idx_cached_offline_id
            ON cached_transactions(offline_transaction_id);

        INSERT OR IGNORE INTO sync_meta (meta_key, meta_value)
            VALUES ('{META_LAST_TRANSACTION_ID}', '{INITIAL_TRANSACTION_ID}');
        INSERT OR IGNORE INTO sync_meta (meta_key, meta_value)
            VALUES ('{META_LAST_SYNC_TIME}', 'never');

        INSERT INTO schema_version (version) VALUES (1);
        "
    ))
    .map_err(|e| format!("Migration v1 failed: {e}"))
}

/// Migration v2: drain diagnostics on the pending tables.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        ALTER TABLE pending_orders ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE pending_orders ADD COLUMN last_error TEXT;
        ALTER TABLE pending_payments ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE pending_payments ADD COLUMN last_error TEXT;

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| format!("Migration v2 failed: {e}"))
}

/// Run all migrations against an arbitrary connection. Test fixtures use
/// this with in-memory databases.
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("queue migrations");
}

// ---------------------------------------------------------------------------
// Local ids
// ---------------------------------------------------------------------------

/// Process-unique key for queue entries: timestamp plus a uuid suffix.
/// Never sent to the server.
pub fn generate_local_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("local_{millis}_{}", &suffix[..8])
}

// ---------------------------------------------------------------------------
// Pending orders
// ---------------------------------------------------------------------------

/// Persist an offline order. The full payload lands in one INSERT so an
/// entry is never partially visible.
pub fn enqueue_order(db: &DbState, entry: &PendingOrder) -> Result<(), String> {
    let payload =
        serde_json::to_string(&entry.payload).map_err(|e| format!("serialize order: {e}"))?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO pending_orders
             (local_id, offline_transaction_id, payload, created_at, attempts, last_error)
         VALUES (?1, ?2, ?3, ?4, 0, NULL)",
        params![
            entry.local_id,
            entry.offline_transaction_id,
            payload,
            entry.created_at.to_rfc3339(),
        ],
    )
    .map_err(|e| format!("enqueue order: {e}"))?;
    Ok(())
}

/// Pending orders, oldest first. Entries whose payload no longer parses are
/// skipped with a warning rather than blocking the drain.
pub fn list_pending_orders(db: &DbState) -> Result<Vec<PendingOrder>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT local_id, offline_transaction_id, payload, created_at, attempts, last_error
             FROM pending_orders
             ORDER BY created_at ASC, local_id ASC",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })
        .map_err(|e| e.to_string())?;

    let mut out = Vec::new();
    for row in rows {
        let (local_id, offline_id, payload, created_at, attempts, last_error) =
            row.map_err(|e| e.to_string())?;
        let payload = match serde_json::from_str(&payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(local_id = %local_id, error = %e, "Skipping unreadable pending order");
                continue;
            }
        };
        out.push(PendingOrder {
            local_id,
            offline_transaction_id: offline_id,
            payload,
            created_at: parse_timestamp(&created_at),
            attempts,
            last_error,
        });
    }
    Ok(out)
}

pub fn remove_pending_order(db: &DbState, local_id: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "DELETE FROM pending_orders WHERE local_id = ?1",
        params![local_id],
    )
    .map_err(|e| format!("remove pending order: {e}"))?;
    Ok(())
}

/// Record a failed drain attempt so diagnostics can show persistently
/// failing entries. The entry stays queued.
pub fn record_order_failure(db: &DbState, local_id: &str, error: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE pending_orders
         SET attempts = attempts + 1, last_error = ?2
         WHERE local_id = ?1",
        params![local_id, error],
    )
    .map_err(|e| format!("record order failure: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Pending payments
// ---------------------------------------------------------------------------

pub fn enqueue_payment(db: &DbState, entry: &PendingPayment) -> Result<(), String> {
    let payload =
        serde_json::to_string(&entry.payload).map_err(|e| format!("serialize payment: {e}"))?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO pending_payments (local_id, payload, created_at, attempts, last_error)
         VALUES (?1, ?2, ?3, 0, NULL)",
        params![entry.local_id, payload, entry.created_at.to_rfc3339()],
    )
    .map_err(|e| format!("enqueue payment: {e}"))?;
    Ok(())
}

pub fn list_pending_payments(db: &DbState) -> Result<Vec<PendingPayment>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT local_id, payload, created_at, attempts, last_error
             FROM pending_payments
             ORDER BY created_at ASC, local_id ASC",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })
        .map_err(|e| e.to_string())?;

    let mut out = Vec::new();
    for row in rows {
        let (local_id, payload, created_at, attempts, last_error) =
            row.map_err(|e| e.to_string())?;
        let payload = match serde_json::from_str(&payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(local_id = %local_id, error = %e, "Skipping unreadable pending payment");
                continue;
            }
        };
        out.push(PendingPayment {
            local_id,
            payload,
            created_at: parse_timestamp(&created_at),
            attempts,
            last_error,
        });
    }
    Ok(out)
}

pub fn remove_pending_payment(db: &DbState, local_id: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "DELETE FROM pending_payments WHERE local_id = ?1",
        params![local_id],
    )
    .map_err(|e| format!("remove pending payment: {e}"))?;
    Ok(())
}

/// Rewrite a queued payment's payload in place. Used when an offline order
/// syncs and the payment must reference the server-issued id instead of the
/// provisional one.
pub fn update_payment_payload(
    db: &DbState,
    local_id: &str,
    payload: &crate::models::PaymentPayload,
) -> Result<(), String> {
    let payload = serde_json::to_string(payload).map_err(|e| format!("serialize payment: {e}"))?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE pending_payments SET payload = ?2 WHERE local_id = ?1",
        params![local_id, payload],
    )
    .map_err(|e| format!("update pending payment: {e}"))?;
    Ok(())
}

pub fn record_payment_failure(db: &DbState, local_id: &str, error: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE pending_payments
         SET attempts = attempts + 1, last_error = ?2
         WHERE local_id = ?1",
        params![local_id, error],
    )
    .map_err(|e| format!("record payment failure: {e}"))?;
    Ok(())
}

/// Pending (orders, payments) counts.
pub fn pending_counts(db: &DbState) -> Result<(i64, i64), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let orders: i64 = conn
        .query_row("SELECT COUNT(*) FROM pending_orders", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    let payments: i64 = conn
        .query_row("SELECT COUNT(*) FROM pending_payments", [], |row| {
            row.get(0)
        })
        .map_err(|e| e.to_string())?;
    Ok((orders, payments))
}

// ---------------------------------------------------------------------------
// Cached transactions (offline recall mirror)
// ---------------------------------------------------------------------------

/// Result of a cache rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRefresh {
    pub cached: usize,
    pub skipped: usize,
}

/// Rebuild the recall mirror from a server transaction list, all or nothing.
///
/// Malformed records (missing `transactionID`, unparseable shape) are
/// skipped individually; any storage error rolls the whole rebuild back so
/// the previous cache stays intact. Existing offline-id mappings are carried
/// over for rows that survive the refresh.
pub fn replace_cache(db: &DbState, records: &[Value]) -> Result<CacheRefresh, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut mappings = std::collections::HashMap::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT transaction_id, offline_transaction_id
                 FROM cached_transactions
                 WHERE offline_transaction_id IS NOT NULL",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| e.to_string())?;
        for row in rows {
            let (id, offline_id) = row.map_err(|e| e.to_string())?;
            mappings.insert(id, offline_id);
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| format!("cache rebuild begin: {e}"))?;

    tx.execute("DELETE FROM cached_transactions", [])
        .map_err(|e| format!("cache rebuild clear: {e}"))?;

    let now = Utc::now().to_rfc3339();
    let mut cached = 0usize;
    let mut skipped = 0usize;

    for record in records {
        let parsed: Transaction = match serde_json::from_value(record.clone()) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Skipping malformed transaction record during cache rebuild");
                skipped += 1;
                continue;
            }
        };
        if parsed.transaction_id.trim().is_empty() {
            skipped += 1;
            continue;
        }

        let data = serde_json::to_string(&parsed).map_err(|e| e.to_string())?;
        tx.execute(
            "INSERT OR REPLACE INTO cached_transactions
                 (transaction_id, offline_transaction_id, data, cached_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                parsed.transaction_id,
                mappings.get(&parsed.transaction_id),
                data,
                now,
            ],
        )
        .map_err(|e| format!("cache rebuild insert: {e}"))?;
        cached += 1;
    }

    tx.commit().map_err(|e| format!("cache rebuild commit: {e}"))?;

    Ok(CacheRefresh { cached, skipped })
}

/// Insert or update a single cached record, optionally linking the offline
/// provisional id it was created under.
pub fn upsert_cached_transaction(
    db: &DbState,
    transaction: &Transaction,
    offline_transaction_id: Option<&str>,
) -> Result<(), String> {
    let data = serde_json::to_string(transaction).map_err(|e| e.to_string())?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO cached_transactions (transaction_id, offline_transaction_id, data, cached_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(transaction_id) DO UPDATE SET
            offline_transaction_id = COALESCE(excluded.offline_transaction_id,
                                              cached_transactions.offline_transaction_id),
            data = excluded.data,
            cached_at = excluded.cached_at",
        params![
            transaction.transaction_id,
            offline_transaction_id,
            data,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| format!("cache upsert: {e}"))?;
    Ok(())
}

pub fn list_cached_transactions(db: &DbState) -> Result<Vec<CachedTransaction>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT data, offline_transaction_id, cached_at
             FROM cached_transactions
             ORDER BY transaction_id DESC",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(|e| e.to_string())?;

    let mut out = Vec::new();
    for row in rows {
        let (data, offline_id, cached_at) = row.map_err(|e| e.to_string())?;
        let transaction: Transaction = match serde_json::from_str(&data) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable cached transaction");
                continue;
            }
        };
        out.push(CachedTransaction {
            transaction,
            offline_transaction_id: offline_id,
            cached_at: parse_timestamp(&cached_at),
        });
    }
    Ok(out)
}

/// Look up the server id an offline provisional id was remapped to.
pub fn server_id_for_offline_id(db: &DbState, offline_id: &str) -> Result<Option<String>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        "SELECT transaction_id FROM cached_transactions WHERE offline_transaction_id = ?1",
        params![offline_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

pub fn get_meta(db: &DbState, key: &str) -> Result<Option<String>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        "SELECT meta_value FROM sync_meta WHERE meta_key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| e.to_string())
}

pub fn put_meta(db: &DbState, key: &str, value: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO sync_meta (meta_key, meta_value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(meta_key) DO UPDATE SET
            meta_value = excluded.meta_value, updated_at = excluded.updated_at",
        params![key, value],
    )
    .map_err(|e| format!("put meta: {e}"))?;
    Ok(())
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ===========================================================================
// Tests
// ===========================================================================
