//! Keyboard-wedge scanner input.
//!
//! Scanners type their payload as a fast burst of key events ending in
//! Enter. The buffer accumulates characters, flushes on Enter, and resets
//! itself when the inter-key gap exceeds the scanner threshold (a human
//! typing, or a new scan starting). Pure state machine — no UI framework
//! callbacks, timestamps come in from the caller.

use crate::models::CachedTransaction;

/// Scanners send characters well under this gap; a slower cadence is manual
/// input and resets the buffer.
pub const SCAN_TIMEOUT_MS: i64 = 50;

/// Canonical id width.
const ID_WIDTH: usize = 6;

/// A flushed scan: the raw buffer plus its normalised transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedScan {
    pub raw: String,
    pub transaction_id: String,
}

pub struct ScanBuffer {
    buffer: String,
    last_key_ms: i64,
    timeout_ms: i64,
}

impl ScanBuffer {
    pub fn new() -> Self {
        ScanBuffer {
            buffer: String::new(),
            last_key_ms: 0,
            timeout_ms: SCAN_TIMEOUT_MS,
        }
    }

    pub fn with_timeout(timeout_ms: i64) -> Self {
        ScanBuffer {
            timeout_ms,
            ..ScanBuffer::new()
        }
    }

    /// Feed one key event. Returns a completed scan when Enter flushes a
    /// non-empty buffer.
    ///
    /// `key` uses keyboard-event names: single characters for printable
    /// keys, `"Enter"`, `"Shift"`, etc. Modifier keys are ignored; other
    /// named keys do not enter the buffer.
    pub fn feed(&mut self, key: &str, now_ms: i64) -> Option<CompletedScan> {
        if matches!(key, "Shift" | "Control" | "Alt") {
            return None;
        }

        if !self.buffer.is_empty() && now_ms - self.last_key_ms > self.timeout_ms {
            self.buffer.clear();
        }
        self.last_key_ms = now_ms;

        if key == "Enter" {
            if self.buffer.is_empty() {
                return None;
            }
            let raw = std::mem::take(&mut self.buffer);
            let transaction_id = normalize_scanned_id(&raw);
            return Some(CompletedScan {
                raw,
                transaction_id,
            });
        }

        let mut chars = key.chars();
        if let (Some(ch), None) = (chars.next(), chars.next()) {
            self.buffer.push(ch);
        }
        None
    }
}

impl Default for ScanBuffer {
    fn default() -> Self {
        ScanBuffer::new()
    }
}

/// Normalise a scanned id: short numeric ids gain their leading zeros back
/// (QR payloads sometimes drop them).
pub fn normalize_scanned_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.is_empty()
        && trimmed.len() < ID_WIDTH
        && trimmed.bytes().all(|b| b.is_ascii_digit())
    {
        return format!("{:0>width$}", trimmed, width = ID_WIDTH);
    }
    trimmed.to_string()
}

fn ids_match(stored: &str, scanned: &str) -> bool {
    if stored == scanned {
        return true;
    }
    // Stored without leading zeros, scanned padded.
    if stored.len() < ID_WIDTH && stored.bytes().all(|b| b.is_ascii_digit()) {
        return normalize_scanned_id(stored) == scanned;
    }
    // Stored padded, scanned without leading zeros.
    if stored.len() == ID_WIDTH && stored.starts_with('0') {
        if let Ok(numeric) = stored.parse::<i64>() {
            return numeric.to_string() == scanned;
        }
    }
    false
}

/// Find the cached transaction a scanned id refers to.
///
/// Also matches the provisional offline id: a docket printed while offline
/// keeps working after the order synced and was remapped to a server id.
pub fn match_transaction<'a>(
    scanned_id: &str,
    transactions: &'a [CachedTransaction],
) -> Option<&'a CachedTransaction> {
    transactions.iter().find(|cached| {
        ids_match(&cached.transaction.transaction_id, scanned_id)
            || cached
                .offline_transaction_id
                .as_deref()
                .is_some_and(|offline| ids_match(offline, scanned_id))
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Transaction;
    use chrono::Utc;

    fn cached(id: &str, offline_id: Option<&str>) -> CachedTransaction {
        CachedTransaction {
            transaction: Transaction {
                transaction_id: id.to_string(),
                items: vec![],
                total: 0.0,
                payment_method: "cash".into(),
                date: Utc::now(),
                order_punched: Default::default(),
                paid_status: Default::default(),
                transaction_status: Default::default(),
            },
            offline_transaction_id: offline_id.map(|s| s.to_string()),
            cached_at: Utc::now(),
        }
    }

    #[test]
    fn test_burst_then_enter_completes() {
        let mut buf = ScanBuffer::new();
        let mut t = 1_000;
        for ch in ["1", "1", "0", "0", "0", "2"] {
            assert!(buf.feed(ch, t).is_none());
            t += 10;
        }
        let scan = buf.feed("Enter", t).unwrap();
        assert_eq!(scan.transaction_id, "110002");
    }

    #[test]
    fn test_slow_typing_resets_buffer() {
        let mut buf = ScanBuffer::new();
        buf.feed("9", 1_000);
        buf.feed("9", 1_010);
        // Long pause: a new scan begins, the stale prefix is dropped.
        buf.feed("1", 2_000);
        buf.feed("1", 2_010);
        buf.feed("1", 2_020);

        let scan = buf.feed("Enter", 2_030).unwrap();
        assert_eq!(scan.raw, "111");
        assert_eq!(scan.transaction_id, "000111");
    }

    #[test]
    fn test_modifiers_and_named_keys_ignored() {
        let mut buf = ScanBuffer::new();
        buf.feed("Shift", 1_000);
        buf.feed("1", 1_005);
        buf.feed("Tab", 1_010);
        buf.feed("2", 1_015);

        let scan = buf.feed("Enter", 1_020).unwrap();
        assert_eq!(scan.raw, "12");
    }

    #[test]
    fn test_enter_on_empty_buffer_is_noop() {
        let mut buf = ScanBuffer::new();
        assert!(buf.feed("Enter", 1_000).is_none());
    }

    #[test]
    fn test_normalize_pads_short_numeric_ids() {
        assert_eq!(normalize_scanned_id("111"), "000111");
        assert_eq!(normalize_scanned_id("110002"), "110002");
        assert_eq!(normalize_scanned_id("recall-x"), "recall-x");
    }

    #[test]
    fn test_match_handles_padding_mismatches() {
        let txs = vec![cached("000205", Some("000111")), cached("892", None)];

        // Exact.
        assert!(match_transaction("000205", &txs).is_some());
        // Stored unpadded, scan padded.
        assert_eq!(
            match_transaction("000892", &txs)
                .unwrap()
                .transaction
                .transaction_id,
            "892"
        );
        // Stored padded, scan stripped.
        assert_eq!(
            match_transaction("205", &txs)
                .unwrap()
                .transaction
                .transaction_id,
            "000205"
        );
        // Provisional offline id still resolves after remap.
        assert_eq!(
            match_transaction("000111", &txs)
                .unwrap()
                .transaction
                .transaction_id,
            "000205"
        );
        assert!(match_transaction("999999", &txs).is_none());
    }
}
