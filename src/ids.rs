//! Transaction identifier allocator.
//!
//! Online, the server's counter is authoritative and the terminal only
//! tracks the latest id it has seen. Offline, the next id is derived locally
//! by incrementing the last known id and persisting it before it escapes, so
//! two offline orders in a row can never collide. The last known id is
//! monotonic: a server-confirmed id only replaces it when numerically
//! greater.

use rusqlite::OptionalExtension;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::TransactionApi;
use crate::db::{self, DbState, META_LAST_TRANSACTION_ID};
use crate::error::EngineError;

/// Re-pad a numeric id to the canonical 6-digit zero-padded form. Ids past
/// 999999 keep their natural width.
pub fn pad_id(value: i64) -> String {
    format!("{value:06}")
}

/// Parse a transaction id, stripping leading zeros.
///
/// A non-numeric id is a fatal configuration error: silently defaulting
/// risks colliding with real server records.
pub fn parse_id(raw: &str) -> Result<i64, EngineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EngineError::IdCorruption(format!(
            "not a numeric id: {raw:?}"
        )));
    }
    trimmed
        .parse::<i64>()
        .map_err(|e| EngineError::IdCorruption(format!("{raw:?}: {e}")))
}

/// The last transaction id this terminal knows about.
pub fn last_known_id(db: &DbState) -> Result<String, EngineError> {
    db::get_meta(db, META_LAST_TRANSACTION_ID)
        .map_err(EngineError::StorageUnavailable)?
        .ok_or_else(|| EngineError::IdCorruption("last transaction id missing".to_string()))
}

/// Allocate the next provisional id for an offline order.
///
/// The read-increment-persist runs as one SQLite transaction under one lock
/// acquisition; the new value is durable before the id is handed out.
pub fn next_offline_id(db: &DbState) -> Result<String, EngineError> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| EngineError::StorageUnavailable(e.to_string()))?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| EngineError::StorageUnavailable(e.to_string()))?;

    let current: Option<String> = tx
        .query_row(
            "SELECT meta_value FROM sync_meta WHERE meta_key = ?1",
            [META_LAST_TRANSACTION_ID],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| EngineError::StorageUnavailable(e.to_string()))?;

    let current =
        current.ok_or_else(|| EngineError::IdCorruption("last transaction id missing".into()))?;
    let next = pad_id(parse_id(&current)? + 1);

    tx.execute(
        "UPDATE sync_meta SET meta_value = ?2, updated_at = datetime('now')
         WHERE meta_key = ?1",
        [META_LAST_TRANSACTION_ID, next.as_str()],
    )
    .map_err(|e| EngineError::StorageUnavailable(e.to_string()))?;
    tx.commit()
        .map_err(|e| EngineError::StorageUnavailable(e.to_string()))?;

    debug!(id = %next, "Allocated provisional transaction id");
    Ok(next)
}

/// Record a server-confirmed id. Only moves the last known id forward —
/// never backward, even when the server id is numerically smaller (other
/// terminals may have synced in the interim, or the fallback listing may be
/// stale).
pub fn record_server_id(db: &DbState, server_id: &str) -> Result<bool, EngineError> {
    let incoming = parse_id(server_id)?;
    let current = parse_id(&last_known_id(db)?)?;

    if incoming <= current {
        return Ok(false);
    }

    db::put_meta(db, META_LAST_TRANSACTION_ID, &pad_id(incoming))
        .map_err(EngineError::StorageUnavailable)?;
    Ok(true)
}

/// Largest transaction id in a server transaction listing. Fallback source
/// when the dedicated latest-id endpoint is unavailable.
pub fn extract_latest_id(records: &[Value]) -> Option<String> {
    records
        .iter()
        .filter_map(|record| record.get("transactionID").and_then(Value::as_str))
        .filter_map(|id| parse_id(id).ok().map(|n| (n, id)))
        .max_by_key(|(n, _)| *n)
        .map(|(_, id)| id.to_string())
}

/// Refresh the last known id from the server, best-effort.
///
/// Tries the dedicated endpoint first; when that is absent or fails, lists
/// transactions and takes the numeric max. Network failures are logged and
/// ignored (the cached value is still safe to increment from); id corruption
/// is propagated.
pub async fn refresh_from_server(
    db: &DbState,
    api: &dyn TransactionApi,
) -> Result<Option<String>, EngineError> {
    let latest = match api.latest_transaction_id().await {
        Ok(Some(id)) => Some(id),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "Latest-id endpoint failed, falling back to transaction listing");
            None
        }
    };

    let latest = match latest {
        Some(id) => Some(id),
        None => match api.list_transactions().await {
            Ok(records) => extract_latest_id(&records),
            Err(e) => {
                warn!(error = %e, "Could not refresh last known transaction id");
                None
            }
        },
    };

    if let Some(id) = latest.as_deref() {
        record_server_id(db, id)?;
    }
    Ok(latest)
}

// ===========================================================================
// Tests
// ===========================================================================
