//! Offline-first reconciliation engine.
//!
//! Every mutating operation checks live connectivity at the point of use:
//! online it runs directly against the server, offline it lands in the
//! durable queue with a provisional transaction id. When connectivity
//! returns, `drain` replays the queue — orders before payments, oldest
//! first — remapping provisional ids to server-issued ones and keeping the
//! recall mirror consistent. No queue entry is removed without an explicit
//! server acknowledgment.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::TransactionApi;
use crate::db::{self, DbState, META_LAST_SYNC_TIME};
use crate::diagnostics::{DiagnosticsLog, LogCategory};
use crate::error::EngineError;
use crate::events::EventSink;
use crate::ids;
use crate::inventory;
use crate::models::{
    CachedTransaction, LineItem, OrderPayload, OrderPunched, PaidStatus, PaymentPayload,
    PendingOrder, PendingPayment, SessionContext, Transaction, TransactionStatus,
};
use crate::order::compute_totals;
use crate::print::{Printer, ReceiptDocument, ReceiptKind};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub transaction_id: String,
    pub offline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentOutcome {
    pub offline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub synced: usize,
    pub remaining: i64,
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Pull the status code out of an error string's `(HTTP nnn)` suffix.
fn extract_http_status(error: &str) -> Option<u16> {
    let idx = error.find("(HTTP ")?;
    let rest = &error[idx + 6..];
    let end = rest.find(')')?;
    rest[..end].trim().parse().ok()
}

/// A permanent failure: the server understood the request and rejected it.
/// Retrying the same payload cannot succeed, so the operator must see it.
/// 408 and 429 are timing conditions, not verdicts.
pub fn is_permanent_sync_error(error: &str) -> bool {
    match extract_http_status(error) {
        Some(status) => (400..500).contains(&status) && status != 408 && status != 429,
        None => false,
    }
}

/// Everything that is not a permanent rejection retries on the next drain:
/// network failures, timeouts, 5xx, backpressure.
pub fn is_transient_sync_error(error: &str) -> bool {
    !is_permanent_sync_error(error)
}

fn classify(error: String) -> EngineError {
    if is_permanent_sync_error(&error) {
        EngineError::Permanent(error)
    } else {
        EngineError::Transient(error)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    /// `None` when the queue database failed to open: the terminal keeps
    /// working online-only and the operator has been told.
    db: Option<Arc<DbState>>,
    api: Arc<dyn TransactionApi>,
    monitor: Arc<crate::net::NetworkMonitor>,
    printer: Arc<dyn Printer>,
    events: Arc<dyn EventSink>,
    diagnostics: Arc<DiagnosticsLog>,
    session: SessionContext,
    drain_running: AtomicBool,
    loop_running: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(
        db: Option<Arc<DbState>>,
        api: Arc<dyn TransactionApi>,
        monitor: Arc<crate::net::NetworkMonitor>,
        printer: Arc<dyn Printer>,
        events: Arc<dyn EventSink>,
        diagnostics: Arc<DiagnosticsLog>,
        session: SessionContext,
    ) -> Self {
        if db.is_none() {
            warn!("Offline queue unavailable; running online-only");
            events.emit(
                "notification",
                json!({
                    "severity": "error",
                    "message": "Offline mode is disabled: local storage is unavailable. \
                                Orders can only be taken while connected.",
                }),
            );
        }
        SyncEngine {
            db,
            api,
            monitor,
            printer,
            events,
            diagnostics,
            session,
            drain_running: AtomicBool::new(false),
            loop_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Last observed connectivity, without touching the network.
    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Authoritative connectivity check: probe the server and feed the
    /// result back into the monitor. The cached flag alone cannot be
    /// trusted — transitions fire while the process is suspended.
    pub async fn check_online(&self) -> bool {
        let online = self.api.probe().await;
        self.monitor.set_online(online);
        online
    }

    /// Number of queued operations waiting for a drain.
    pub fn pending_count(&self) -> i64 {
        let Some(db) = &self.db else {
            return 0;
        };
        match db::pending_counts(db) {
            Ok((orders, payments)) => orders + payments,
            Err(e) => {
                warn!(error = %e, "Could not count pending queue entries");
                self.diagnostics.record(LogCategory::Database, e);
                0
            }
        }
    }

    // -----------------------------------------------------------------------
    // Commit order
    // -----------------------------------------------------------------------

    /// Commit a new order: directly against the server when online, into the
    /// durable queue with a provisional id when not. Either way exactly one
    /// docket goes to the printer.
    pub async fn commit_order(
        &self,
        items: &[LineItem],
        payment_method: &str,
    ) -> Result<CommitOutcome, EngineError> {
        if items.is_empty() {
            return Err(EngineError::Permanent(
                "Cannot commit an order with no items".to_string(),
            ));
        }

        let totals = compute_totals(items, Some(payment_method));

        let outcome = if self.check_online().await {
            self.commit_order_online(items, payment_method, totals.total)
                .await?
        } else {
            self.commit_order_offline(items, payment_method, totals.total)?
        };

        self.print_receipt(
            ReceiptKind::Order,
            &outcome.transaction_id,
            items,
            payment_method,
            outcome.offline,
        );
        self.emit_sync_status();
        Ok(outcome)
    }

    /// Online path: decrement raw-material stock, then submit. A failure
    /// anywhere is surfaced as an error — never a silent fallback to the
    /// queue, which would double-decrement stock during a later drain.
    async fn commit_order_online(
        &self,
        items: &[LineItem],
        payment_method: &str,
        total: f64,
    ) -> Result<CommitOutcome, EngineError> {
        inventory::decrement_for_order(self.api.as_ref(), items)
            .await
            .map_err(|e| {
                self.diagnostics
                    .record(LogCategory::Database, format!("Stock update failed: {e}"));
                classify(e)
            })?;

        let payload = OrderPayload {
            selected_items: items.to_vec(),
            total,
            selected_payment_method: payment_method.to_string(),
            date: None,
            transaction_id: None,
        };

        let server_id = self.api.submit_order(&payload).await.map_err(|e| {
            self.diagnostics
                .record(LogCategory::Software, format!("Order submit failed: {e}"));
            classify(e)
        })?;

        if let Some(db) = &self.db {
            // The server id is authoritative; remember it (monotonic) and
            // mirror the record so recall works if the link drops later.
            ids::record_server_id(db, &server_id)?;
            let record = transaction_from_payload(&payload, &server_id);
            if let Err(e) = db::upsert_cached_transaction(db, &record, None) {
                warn!(error = %e, "Could not mirror committed order locally");
                self.diagnostics.record(LogCategory::Database, e);
            }
        }

        info!(transaction_id = %server_id, cashier = %self.session.cashier, "Order sent to kitchen");
        Ok(CommitOutcome {
            transaction_id: server_id,
            offline: false,
        })
    }

    /// Offline path: allocate a provisional id and persist the order. The
    /// stock decrement is skipped — shared inventory must not be mutated
    /// without server confirmation — and the operator is told to reconcile
    /// inventory manually after sync.
    fn commit_order_offline(
        &self,
        items: &[LineItem],
        payment_method: &str,
        total: f64,
    ) -> Result<CommitOutcome, EngineError> {
        let db = self.require_queue()?;

        let offline_id = ids::next_offline_id(db)?;
        let now = Utc::now();
        let entry = PendingOrder {
            local_id: db::generate_local_id(),
            offline_transaction_id: offline_id.clone(),
            payload: OrderPayload {
                selected_items: items.to_vec(),
                total,
                selected_payment_method: payment_method.to_string(),
                date: Some(now),
                transaction_id: Some(offline_id.clone()),
            },
            created_at: now,
            attempts: 0,
            last_error: None,
        };
        db::enqueue_order(db, &entry).map_err(EngineError::StorageUnavailable)?;

        self.diagnostics.record(
            LogCategory::Software,
            format!("Offline order {offline_id} saved locally"),
        );
        self.events.emit(
            "notification",
            json!({
                "severity": "warning",
                "message": format!(
                    "Order #{offline_id} saved offline. It will sync when the connection returns; \
                     inventory was not adjusted and needs manual follow-up."
                ),
            }),
        );

        info!(transaction_id = %offline_id, "Order queued offline");
        Ok(CommitOutcome {
            transaction_id: offline_id,
            offline: true,
        })
    }

    // -----------------------------------------------------------------------
    // Commit payment
    // -----------------------------------------------------------------------

    /// Commit a payment for an existing transaction. Symmetric to
    /// `commit_order` but with no inventory step.
    pub async fn commit_payment(
        &self,
        transaction_id: &str,
        items: &[LineItem],
        total: f64,
        payment_method: &str,
    ) -> Result<PaymentOutcome, EngineError> {
        let payload = PaymentPayload {
            transaction_id: transaction_id.to_string(),
            total,
            payment_method: payment_method.to_string(),
            items: items.to_vec(),
        };

        let outcome = if self.check_online().await {
            self.api.submit_payment(&payload).await.map_err(|e| {
                self.diagnostics
                    .record(LogCategory::Payment, format!("Payment failed: {e}"));
                classify(e)
            })?;
            info!(transaction_id = %transaction_id, "Payment processed");
            PaymentOutcome { offline: false }
        } else {
            let db = self.require_queue()?;
            let entry = PendingPayment {
                local_id: db::generate_local_id(),
                payload,
                created_at: Utc::now(),
                attempts: 0,
                last_error: None,
            };
            db::enqueue_payment(db, &entry).map_err(EngineError::StorageUnavailable)?;
            self.diagnostics.record(
                LogCategory::Payment,
                format!("Offline payment for {transaction_id} saved locally"),
            );
            info!(transaction_id = %transaction_id, "Payment queued offline");
            PaymentOutcome { offline: true }
        };

        self.print_receipt(
            ReceiptKind::Paid,
            transaction_id,
            items,
            payment_method,
            outcome.offline,
        );
        self.emit_sync_status();
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Drain the queue against the server. No-op when offline or when a
    /// drain is already running. Also exposed to the UI as "Sync Now".
    pub async fn drain(&self) -> Result<DrainReport, EngineError> {
        let Some(db) = self.db.clone() else {
            return Ok(DrainReport {
                synced: 0,
                remaining: 0,
            });
        };

        if !self.check_online().await {
            debug!("Drain skipped: offline");
            return Ok(DrainReport {
                synced: 0,
                remaining: self.pending_count(),
            });
        }

        if self
            .drain_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain already in progress");
            return Ok(DrainReport {
                synced: 0,
                remaining: self.pending_count(),
            });
        }

        let result = self.drain_inner(&db).await;
        self.drain_running.store(false, Ordering::SeqCst);
        result
    }

    /// Alias for the operator-facing "Sync Now" action.
    pub async fn sync_now(&self) -> Result<DrainReport, EngineError> {
        self.drain().await
    }

    async fn drain_inner(&self, db: &DbState) -> Result<DrainReport, EngineError> {
        let mut synced = 0usize;

        // Orders before payments: a payment may reference an id that only
        // becomes valid once its paired order has synced.
        let pending_orders =
            db::list_pending_orders(db).map_err(EngineError::StorageUnavailable)?;
        if !pending_orders.is_empty() {
            info!(count = pending_orders.len(), "Syncing offline orders");
        }

        for entry in pending_orders {
            match self.api.submit_order(&entry.payload).await {
                Ok(server_id) => {
                    ids::record_server_id(db, &server_id)?;

                    let record = transaction_from_payload(&entry.payload, &server_id);
                    db::upsert_cached_transaction(
                        db,
                        &record,
                        Some(&entry.offline_transaction_id),
                    )
                    .map_err(EngineError::StorageUnavailable)?;
                    db::remove_pending_order(db, &entry.local_id)
                        .map_err(EngineError::StorageUnavailable)?;
                    db::put_meta(db, META_LAST_SYNC_TIME, &Utc::now().to_rfc3339())
                        .map_err(EngineError::StorageUnavailable)?;

                    synced += 1;
                    self.diagnostics.record(
                        LogCategory::Software,
                        format!(
                            "Synced offline order {} to server id {server_id}",
                            entry.offline_transaction_id
                        ),
                    );
                }
                Err(e) => {
                    self.note_drain_failure("order", &entry.local_id, &e);
                    if let Err(record_err) = db::record_order_failure(db, &entry.local_id, &e) {
                        warn!(error = %record_err, "Could not record order sync failure");
                    }
                    // Per-item failure: the rest of the batch continues.
                }
            }
        }

        // Provisional ids of orders that are still queued after the pass
        // above; payments referencing them must wait for the remap.
        let blocked_ids: std::collections::HashSet<String> = db::list_pending_orders(db)
            .map_err(EngineError::StorageUnavailable)?
            .into_iter()
            .map(|entry| entry.offline_transaction_id)
            .collect();

        let pending_payments =
            db::list_pending_payments(db).map_err(EngineError::StorageUnavailable)?;
        if !pending_payments.is_empty() {
            info!(count = pending_payments.len(), "Syncing offline payments");
        }

        for entry in pending_payments {
            if blocked_ids.contains(&entry.payload.transaction_id) {
                debug!(
                    transaction_id = %entry.payload.transaction_id,
                    "Payment deferred: its order has not synced yet"
                );
                continue;
            }

            let mut payload = entry.payload.clone();
            if let Some(server_id) = db::server_id_for_offline_id(db, &payload.transaction_id)
                .map_err(EngineError::StorageUnavailable)?
            {
                if server_id != payload.transaction_id {
                    payload.transaction_id = server_id;
                    db::update_payment_payload(db, &entry.local_id, &payload)
                        .map_err(EngineError::StorageUnavailable)?;
                }
            }

            match self.api.submit_payment(&payload).await {
                Ok(()) => {
                    db::remove_pending_payment(db, &entry.local_id)
                        .map_err(EngineError::StorageUnavailable)?;
                    db::put_meta(db, META_LAST_SYNC_TIME, &Utc::now().to_rfc3339())
                        .map_err(EngineError::StorageUnavailable)?;
                    synced += 1;
                    self.diagnostics.record(
                        LogCategory::Payment,
                        format!("Synced offline payment for {}", payload.transaction_id),
                    );
                }
                Err(e) => {
                    self.note_drain_failure("payment", &entry.local_id, &e);
                    if let Err(record_err) = db::record_payment_failure(db, &entry.local_id, &e) {
                        warn!(error = %record_err, "Could not record payment sync failure");
                    }
                }
            }
        }

        let (orders_left, payments_left) =
            db::pending_counts(db).map_err(EngineError::StorageUnavailable)?;
        let remaining = orders_left + payments_left;

        if remaining == 0 {
            if synced > 0 {
                self.events.emit(
                    "notification",
                    json!({
                        "severity": "success",
                        "message": "All offline transactions synced successfully!",
                    }),
                );
            }
        } else {
            self.events.emit(
                "notification",
                json!({
                    "severity": "warning",
                    "message": format!("Synced some transactions. {remaining} still pending."),
                }),
            );
        }
        self.emit_sync_status();

        if synced > 0 || remaining > 0 {
            info!(synced, remaining, "Drain finished");
        }
        Ok(DrainReport { synced, remaining })
    }

    /// Log a drain failure; permanent rejections go straight to the
    /// operator, transient ones stay quiet and retry.
    fn note_drain_failure(&self, kind: &str, local_id: &str, error: &str) {
        if is_permanent_sync_error(error) {
            warn!(kind, local_id, error, "Queued entry rejected by server");
            self.diagnostics.record(
                LogCategory::Database,
                format!("Server rejected queued {kind} {local_id}: {error}"),
            );
            self.events.emit(
                "notification",
                json!({
                    "severity": "error",
                    "message": format!(
                        "A queued {kind} was rejected by the server and needs attention: {error}"
                    ),
                    "localId": local_id,
                }),
            );
        } else {
            debug!(kind, local_id, error, "Queued entry failed, will retry");
        }
    }

    // -----------------------------------------------------------------------
    // Recall
    // -----------------------------------------------------------------------

    /// The transaction journal for the recall drawer. Online, this fetches
    /// from the server and rebuilds the local mirror; offline, it serves the
    /// mirror as-is (stale but consistent).
    pub async fn transactions_for_recall(&self) -> Result<Vec<CachedTransaction>, EngineError> {
        if self.check_online().await {
            let records = self.api.list_transactions().await.map_err(|e| {
                self.diagnostics
                    .record(LogCategory::Database, format!("Journal fetch failed: {e}"));
                classify(e)
            })?;

            if let Some(db) = &self.db {
                if let Some(latest) = ids::extract_latest_id(&records) {
                    ids::record_server_id(db, &latest)?;
                }
                match db::replace_cache(db, &records) {
                    Ok(refresh) => {
                        if refresh.skipped > 0 {
                            warn!(skipped = refresh.skipped, "Some journal records were malformed");
                        }
                        debug!(cached = refresh.cached, "Recall mirror rebuilt");
                    }
                    Err(e) => {
                        // Stale-but-consistent beats half-written; the old
                        // mirror is still intact.
                        warn!(error = %e, "Recall mirror rebuild failed");
                        self.diagnostics.record(LogCategory::Database, e);
                    }
                }
                return db::list_cached_transactions(db).map_err(EngineError::StorageUnavailable);
            }

            let now = Utc::now();
            return Ok(records
                .iter()
                .filter_map(|record| serde_json::from_value::<Transaction>(record.clone()).ok())
                .map(|transaction| CachedTransaction {
                    transaction,
                    offline_transaction_id: None,
                    cached_at: now,
                })
                .collect());
        }

        let db = self.require_queue()?;
        self.diagnostics
            .record(LogCategory::Software, "Loaded transactions from offline cache");
        db::list_cached_transactions(db).map_err(EngineError::StorageUnavailable)
    }

    /// Flag processed transactions as suspended. Online-only.
    pub async fn suspend_transactions(&self, ids: &[String]) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Err(EngineError::Permanent(
                "At least one transaction id is required".to_string(),
            ));
        }
        if !self.check_online().await {
            return Err(EngineError::Transient(
                "Suspending transactions requires connectivity".to_string(),
            ));
        }
        self.api.suspend_transactions(ids).await.map_err(classify)
    }

    /// Best-effort refresh of the last known transaction id from the
    /// server. Called at startup and whenever connectivity returns.
    pub async fn refresh_latest_id(&self) -> Result<(), EngineError> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        if let Some(latest) = ids::refresh_from_server(db, self.api.as_ref()).await? {
            debug!(latest = %latest, "Refreshed last known transaction id");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn require_queue(&self) -> Result<&Arc<DbState>, EngineError> {
        self.db.as_ref().ok_or_else(|| {
            EngineError::StorageUnavailable(
                "Offline mode is disabled: local storage is unavailable".to_string(),
            )
        })
    }

    /// Best-effort printing; a failed docket never rolls back the sale.
    fn print_receipt(
        &self,
        kind: ReceiptKind,
        transaction_id: &str,
        items: &[LineItem],
        payment_method: &str,
        offline: bool,
    ) {
        let totals = compute_totals(items, Some(payment_method));
        let document = ReceiptDocument::new(
            kind,
            transaction_id,
            items,
            totals.subtotal,
            totals.tax,
            totals.total,
            payment_method,
            offline,
            &self.session,
        );
        if let Err(e) = self.printer.print(&document) {
            warn!(transaction_id, error = %e, "Docket failed to print");
            self.diagnostics.record(
                LogCategory::Software,
                format!("Docket for {transaction_id} failed to print: {e}"),
            );
            self.events.emit(
                "notification",
                json!({
                    "severity": "warning",
                    "message": format!(
                        "Transaction #{transaction_id} is committed but the docket did not print: {e}"
                    ),
                }),
            );
        }
    }

    fn sync_status_payload(&self) -> Value {
        let (orders, payments) = match &self.db {
            Some(db) => db::pending_counts(db).unwrap_or((0, 0)),
            None => (0, 0),
        };
        let last_sync = self
            .db
            .as_ref()
            .and_then(|db| db::get_meta(db, META_LAST_SYNC_TIME).ok().flatten());
        json!({
            "isOnline": self.monitor.is_online(),
            "pendingOrders": orders,
            "pendingPayments": payments,
            "pending": orders + payments,
            "lastSyncTime": last_sync,
            "offlineCapable": self.db.is_some(),
        })
    }

    fn emit_sync_status(&self) {
        self.events.emit("sync_status", self.sync_status_payload());
    }

    /// Diagnostics snapshot for the operator's system health screen.
    pub fn system_health(&self) -> Result<Value, String> {
        match &self.db {
            Some(db) => crate::diagnostics::system_health(db, &self.diagnostics),
            None => Ok(json!({
                "offlineCapable": false,
                "recentEvents": self.diagnostics.recent(20),
            })),
        }
    }
}

/// The transaction record a successfully submitted order payload becomes.
/// The order endpoint acknowledges with just the id, so the mirror entry is
/// reconstructed from what was sent.
fn transaction_from_payload(payload: &OrderPayload, transaction_id: &str) -> Transaction {
    Transaction {
        transaction_id: transaction_id.to_string(),
        items: payload.selected_items.iter().map(Into::into).collect(),
        total: payload.total,
        payment_method: payload.selected_payment_method.clone(),
        date: payload.date.unwrap_or_else(Utc::now),
        order_punched: OrderPunched::Yes,
        paid_status: PaidStatus::NotPaid,
        transaction_status: TransactionStatus::Processed,
    }
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Start the background loop: re-probe on an interval and on every monitor
/// transition, and drain whenever the terminal is online with work queued.
pub fn start_sync_loop(engine: Arc<SyncEngine>, interval: Duration) {
    let running = engine.loop_running.clone();
    if running.swap(true, Ordering::SeqCst) {
        debug!("Sync loop already running");
        return;
    }

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Sync loop started");
        let mut transitions = engine.monitor.subscribe();
        let mut previously_online: Option<bool> = None;

        loop {
            if !running.load(Ordering::SeqCst) {
                info!("Sync loop stopped");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = transitions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if !running.load(Ordering::SeqCst) {
                break;
            }

            let online = engine.check_online().await;
            engine
                .events
                .emit("network_status", json!({ "isOnline": online }));

            if online && previously_online == Some(false) {
                info!("Network restored; resuming queued sync");
                if let Err(e) = engine.refresh_latest_id().await {
                    warn!(error = %e, "Latest-id refresh failed after reconnect");
                }
            }
            previously_online = Some(online);

            if online && engine.pending_count() > 0 {
                match engine.drain().await {
                    Ok(report) if report.synced > 0 => {
                        info!(synced = report.synced, "Background drain complete");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Background drain failed");
                        engine.events.emit(
                            "notification",
                            json!({
                                "severity": "error",
                                "message": format!("Sync failed: {e}"),
                                "kind": e.kind(),
                            }),
                        );
                    }
                }
            }

            engine.emit_sync_status();
        }
    });
}

/// Ask the background loop to stop after its current iteration.
pub fn stop_sync_loop(engine: &SyncEngine) {
    engine.loop_running.store(false, Ordering::SeqCst);
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BufferedEventSink;
    use crate::net::NetworkMonitor;
    use crate::print::NullPrinter;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use std::collections::{HashMap, VecDeque};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    // -- fixtures ----------------------------------------------------------

    fn test_db() -> Arc<DbState> {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        Arc::new(DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    fn item(id: &str, quantity: u32, price: f64) -> LineItem {
        LineItem {
            id: id.into(),
            name: id.into(),
            quantity,
            price,
        }
    }

    /// Scriptable in-memory server.
    struct FakeApi {
        online: AtomicBool,
        /// Server ids handed out to successful order submissions, in order.
        next_ids: Mutex<VecDeque<String>>,
        /// Failures keyed by the payload's provisional id ("" for online
        /// submissions, which carry no id).
        order_failures: Mutex<HashMap<String, String>>,
        payment_failures: Mutex<HashMap<String, String>>,
        submitted_orders: Mutex<Vec<OrderPayload>>,
        submitted_payments: Mutex<Vec<PaymentPayload>>,
        transactions: Mutex<Vec<Value>>,
        latest_id: Mutex<Option<String>>,
        bom_updates: AtomicUsize,
        issued: AtomicUsize,
    }

    impl FakeApi {
        fn new(online: bool) -> Self {
            FakeApi {
                online: AtomicBool::new(online),
                next_ids: Mutex::new(VecDeque::new()),
                order_failures: Mutex::new(HashMap::new()),
                payment_failures: Mutex::new(HashMap::new()),
                submitted_orders: Mutex::new(Vec::new()),
                submitted_payments: Mutex::new(Vec::new()),
                transactions: Mutex::new(Vec::new()),
                latest_id: Mutex::new(None),
                bom_updates: AtomicUsize::new(0),
                issued: AtomicUsize::new(0),
            }
        }

        fn queue_server_id(&self, id: &str) {
            self.next_ids.lock().unwrap().push_back(id.to_string());
        }

        fn fail_order(&self, offline_id: &str, error: &str) {
            self.order_failures
                .lock()
                .unwrap()
                .insert(offline_id.to_string(), error.to_string());
        }

        fn clear_order_failures(&self) {
            self.order_failures.lock().unwrap().clear();
        }

        fn order_count(&self) -> usize {
            self.submitted_orders.lock().unwrap().len()
        }

        fn payment_count(&self) -> usize {
            self.submitted_payments.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TransactionApi for FakeApi {
        async fn probe(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        async fn latest_transaction_id(&self) -> Result<Option<String>, String> {
            if !self.online.load(Ordering::SeqCst) {
                return Err("Cannot reach transaction server".to_string());
            }
            Ok(self.latest_id.lock().unwrap().clone())
        }

        async fn submit_order(&self, payload: &OrderPayload) -> Result<String, String> {
            if !self.online.load(Ordering::SeqCst) {
                return Err("Cannot reach transaction server".to_string());
            }
            let key = payload.transaction_id.clone().unwrap_or_default();
            if let Some(error) = self.order_failures.lock().unwrap().get(&key) {
                return Err(error.clone());
            }
            self.submitted_orders.lock().unwrap().push(payload.clone());
            let id = self.next_ids.lock().unwrap().pop_front().unwrap_or_else(|| {
                let n = 110_001 + self.issued.fetch_add(1, Ordering::SeqCst);
                format!("{n:06}")
            });
            Ok(id)
        }

        async fn submit_payment(&self, payload: &PaymentPayload) -> Result<(), String> {
            if !self.online.load(Ordering::SeqCst) {
                return Err("Cannot reach transaction server".to_string());
            }
            if let Some(error) = self
                .payment_failures
                .lock()
                .unwrap()
                .get(&payload.transaction_id)
            {
                return Err(error.clone());
            }
            self.submitted_payments.lock().unwrap().push(payload.clone());
            Ok(())
        }

        async fn list_transactions(&self) -> Result<Vec<Value>, String> {
            if !self.online.load(Ordering::SeqCst) {
                return Err("Cannot reach transaction server".to_string());
            }
            Ok(self.transactions.lock().unwrap().clone())
        }

        async fn suspend_transactions(&self, _ids: &[String]) -> Result<(), String> {
            Ok(())
        }

        async fn fetch_finished_goods(&self) -> Result<Vec<inventory::FinishedGood>, String> {
            Ok(vec![inventory::FinishedGood {
                id: "fg-1".into(),
                raw_ingredients: vec![inventory::RawIngredient {
                    raw_id: "raw-1".into(),
                    consume: 0.5,
                }],
            }])
        }

        async fn fetch_bom(&self) -> Result<Vec<inventory::BomEntry>, String> {
            Ok(vec![inventory::BomEntry {
                raw_id: "raw-1".into(),
                quantity: 10.0,
            }])
        }

        async fn update_bom(&self, _entries: &[inventory::BomEntry]) -> Result<(), String> {
            self.bom_updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        engine: SyncEngine,
        api: Arc<FakeApi>,
        db: Option<Arc<DbState>>,
        events: Arc<BufferedEventSink>,
    }

    fn harness(online: bool, with_db: bool) -> Harness {
        let api = Arc::new(FakeApi::new(online));
        let db = if with_db { Some(test_db()) } else { None };
        let events = Arc::new(BufferedEventSink::new());
        let engine = SyncEngine::new(
            db.clone(),
            api.clone(),
            Arc::new(NetworkMonitor::new(online)),
            Arc::new(NullPrinter),
            events.clone(),
            Arc::new(DiagnosticsLog::new()),
            SessionContext {
                cashier: "dora".into(),
                terminal: None,
            },
        );
        Harness {
            engine,
            api,
            db,
            events,
        }
    }

    fn seed_last_id(db: &DbState, id: &str) {
        db::put_meta(db, db::META_LAST_TRANSACTION_ID, id).unwrap();
    }

    // -- classification ----------------------------------------------------

    #[test]
    fn test_error_classification() {
        assert!(is_permanent_sync_error(
            "Transaction not found (HTTP 404)"
        ));
        assert!(is_permanent_sync_error(
            "At least one transaction ID is required (HTTP 400)"
        ));
        assert!(is_transient_sync_error(
            "Transaction server error (HTTP 503)"
        ));
        assert!(is_transient_sync_error(
            "Unexpected response from transaction server (HTTP 429)"
        ));
        assert!(is_transient_sync_error("Connection to x timed out"));
    }

    // -- commit paths ------------------------------------------------------

    #[tokio::test]
    async fn test_offline_orders_get_sequential_provisional_ids() {
        let h = harness(false, true);
        seed_last_id(h.db.as_ref().unwrap(), "000110");

        let first = h
            .engine
            .commit_order(&[item("fg-1", 1, 10.0)], "cash")
            .await
            .unwrap();
        let second = h
            .engine
            .commit_order(&[item("fg-1", 2, 10.0)], "card")
            .await
            .unwrap();

        assert_eq!(first.transaction_id, "000111");
        assert!(first.offline);
        assert_eq!(second.transaction_id, "000112");
        assert_eq!(h.engine.pending_count(), 2);
        // No server traffic, no inventory mutation.
        assert_eq!(h.api.order_count(), 0);
        assert_eq!(h.api.bom_updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_online_order_decrements_stock_and_mirrors() {
        let h = harness(true, true);
        let db = h.db.as_ref().unwrap();
        seed_last_id(db, "000110");
        h.api.queue_server_id("110002");

        let outcome = h
            .engine
            .commit_order(&[item("fg-1", 1, 10.0)], "cash")
            .await
            .unwrap();

        assert_eq!(outcome.transaction_id, "110002");
        assert!(!outcome.offline);
        assert_eq!(h.api.bom_updates.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.pending_count(), 0);
        assert_eq!(ids::last_known_id(db).unwrap(), "110002");
        // Mirrored for recall.
        assert_eq!(db::list_cached_transactions(db).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_online_failure_is_surfaced_not_queued() {
        let h = harness(true, true);
        h.api
            .fail_order("", "Transaction server error (HTTP 503)");

        let err = h
            .engine
            .commit_order(&[item("fg-1", 1, 10.0)], "cash")
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Transient(_)));
        // A partial online failure is a reportable error, not an offline
        // event: nothing may be queued or the drain would double-decrement.
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_without_storage_is_fatal_for_offline_mode() {
        let h = harness(false, false);
        let err = h
            .engine
            .commit_order(&[item("fg-1", 1, 10.0)], "cash")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_offline_payment_queues() {
        let h = harness(false, true);
        let outcome = h
            .engine
            .commit_payment("000111", &[item("fg-1", 1, 10.0)], 11.5, "card")
            .await
            .unwrap();
        assert!(outcome.offline);
        assert_eq!(h.engine.pending_count(), 1);
        assert_eq!(h.api.payment_count(), 0);
    }

    // -- drain -------------------------------------------------------------

    #[tokio::test]
    async fn test_drain_single_order_remaps_and_clears() {
        let h = harness(false, true);
        let db = h.db.as_ref().unwrap();
        seed_last_id(db, "000110");
        h.engine
            .commit_order(&[item("fg-1", 1, 10.0)], "cash")
            .await
            .unwrap();

        h.api.online.store(true, Ordering::SeqCst);
        h.api.queue_server_id("000205");

        let report = h.engine.drain().await.unwrap();
        assert_eq!(report, DrainReport { synced: 1, remaining: 0 });

        assert!(db::list_pending_orders(db).unwrap().is_empty());
        let cached = db::list_cached_transactions(db).unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].transaction.transaction_id, "000205");
        assert_eq!(cached[0].offline_transaction_id.as_deref(), Some("000111"));
        assert_ne!(
            db::get_meta(db, META_LAST_SYNC_TIME).unwrap().as_deref(),
            Some("never")
        );
    }

    #[tokio::test]
    async fn test_drain_interleaved_with_other_terminals() {
        // lastKnownId "000110"; two offline orders get 000111/000112; the
        // server has moved on to 000205 by the time the queue drains.
        let h = harness(false, true);
        let db = h.db.as_ref().unwrap();
        seed_last_id(db, "000110");

        let first = h
            .engine
            .commit_order(&[item("fg-1", 1, 10.0)], "cash")
            .await
            .unwrap();
        let second = h
            .engine
            .commit_order(&[item("fg-1", 2, 10.0)], "cash")
            .await
            .unwrap();
        assert_eq!(first.transaction_id, "000111");
        assert_eq!(second.transaction_id, "000112");

        h.api.online.store(true, Ordering::SeqCst);
        h.api.queue_server_id("000205");
        h.api.queue_server_id("000206");

        let report = h.engine.drain().await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.remaining, 0);

        // Monotonic, never regressing, and no provisional id reused.
        assert_eq!(ids::last_known_id(db).unwrap(), "000206");
        let cached = db::list_cached_transactions(db).unwrap();
        let ids: Vec<_> = cached
            .iter()
            .map(|c| c.transaction.transaction_id.clone())
            .collect();
        assert!(ids.contains(&"000205".to_string()));
        assert!(ids.contains(&"000206".to_string()));
        assert_eq!(
            db::server_id_for_offline_id(db, "000112").unwrap().as_deref(),
            Some("000206")
        );
    }

    #[tokio::test]
    async fn test_drain_partial_failure_isolation() {
        let h = harness(false, true);
        let db = h.db.as_ref().unwrap();
        seed_last_id(db, "000110");

        for _ in 0..3 {
            h.engine
                .commit_order(&[item("fg-1", 1, 10.0)], "cash")
                .await
                .unwrap();
        }

        h.api.online.store(true, Ordering::SeqCst);
        h.api
            .fail_order("000112", "Transaction server error (HTTP 503)");

        let report = h.engine.drain().await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.remaining, 1);

        let left = db::list_pending_orders(db).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].offline_transaction_id, "000112");
        assert_eq!(left[0].attempts, 1);
        assert!(left[0].last_error.as_deref().unwrap().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_drain_twice_is_idempotent() {
        let h = harness(false, true);
        seed_last_id(h.db.as_ref().unwrap(), "000110");
        h.engine
            .commit_order(&[item("fg-1", 1, 10.0)], "cash")
            .await
            .unwrap();

        h.api.online.store(true, Ordering::SeqCst);
        let first = h.engine.drain().await.unwrap();
        assert_eq!(first.synced, 1);
        let submissions_after_first = h.api.order_count();

        let second = h.engine.drain().await.unwrap();
        assert_eq!(second, DrainReport { synced: 0, remaining: 0 });
        assert_eq!(h.api.order_count(), submissions_after_first);
    }

    #[tokio::test]
    async fn test_drain_while_offline_is_noop() {
        let h = harness(false, true);
        seed_last_id(h.db.as_ref().unwrap(), "000110");
        h.engine
            .commit_order(&[item("fg-1", 1, 10.0)], "cash")
            .await
            .unwrap();

        let report = h.engine.drain().await.unwrap();
        assert_eq!(report, DrainReport { synced: 0, remaining: 1 });
        assert_eq!(h.api.order_count(), 0);
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_surfaced_and_stays_queued() {
        let h = harness(false, true);
        let db = h.db.as_ref().unwrap();
        seed_last_id(db, "000110");
        h.engine
            .commit_order(&[item("fg-1", 1, 10.0)], "cash")
            .await
            .unwrap();

        h.api.online.store(true, Ordering::SeqCst);
        h.api
            .fail_order("000111", "Invalid order payload (HTTP 400)");

        let report = h.engine.drain().await.unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.remaining, 1);

        // Visible to the operator, not silently retried forever.
        let notifications = h.events.named("notification");
        assert!(notifications.iter().any(|n| {
            n["severity"] == "error"
                && n["message"]
                    .as_str()
                    .unwrap()
                    .contains("rejected by the server")
        }));
        let left = db::list_pending_orders(db).unwrap();
        assert!(left[0].last_error.as_deref().unwrap().contains("HTTP 400"));
    }

    #[tokio::test]
    async fn test_payment_waits_for_its_order_and_remaps() {
        let h = harness(false, true);
        let db = h.db.as_ref().unwrap();
        seed_last_id(db, "000110");

        // Offline order, then an offline payment against its provisional id.
        let order = h
            .engine
            .commit_order(&[item("fg-1", 1, 10.0)], "cash")
            .await
            .unwrap();
        h.engine
            .commit_payment(&order.transaction_id, &[item("fg-1", 1, 10.0)], 11.5, "cash")
            .await
            .unwrap();

        // First drain: the order is rejected transiently, so the payment
        // must be deferred — not submitted with a dangling provisional id.
        h.api.online.store(true, Ordering::SeqCst);
        h.api
            .fail_order("000111", "Transaction server error (HTTP 503)");
        let report = h.engine.drain().await.unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.remaining, 2);
        assert_eq!(h.api.payment_count(), 0);
        // Deferred, not failed: no attempt recorded against the payment.
        assert_eq!(db::list_pending_payments(db).unwrap()[0].attempts, 0);

        // Second drain: order syncs to a new server id, and the payment
        // follows with the remapped id.
        h.api.clear_order_failures();
        h.api.queue_server_id("000205");
        let report = h.engine.drain().await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.remaining, 0);

        let payments = h.api.submitted_payments.lock().unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].transaction_id, "000205");
    }

    // -- recall ------------------------------------------------------------

    #[tokio::test]
    async fn test_recall_offline_serves_cache() {
        let h = harness(false, true);
        let db = h.db.as_ref().unwrap();
        let record: Transaction = serde_json::from_value(serde_json::json!({
            "transactionID": "110001",
            "items": [],
            "total": 4.0,
            "paymentMethod": "cash",
            "date": "2026-08-01T09:00:00Z"
        }))
        .unwrap();
        db::upsert_cached_transaction(db, &record, None).unwrap();

        let transactions = h.engine.transactions_for_recall().await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].transaction.transaction_id, "110001");
        assert_eq!(h.api.order_count(), 0);
    }

    #[tokio::test]
    async fn test_recall_online_rebuilds_mirror_and_tracks_latest_id() {
        let h = harness(true, true);
        let db = h.db.as_ref().unwrap();
        seed_last_id(db, "000110");
        *h.api.transactions.lock().unwrap() = vec![
            serde_json::json!({
                "transactionID": "110005",
                "items": [],
                "total": 4.0,
                "paymentMethod": "cash",
                "date": "2026-08-01T09:00:00Z"
            }),
            // Malformed: no transactionID. Skipped, not fatal.
            serde_json::json!({ "total": 9.0 }),
        ];

        let transactions = h.engine.transactions_for_recall().await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(ids::last_known_id(db).unwrap(), "110005");
    }

    #[tokio::test]
    async fn test_empty_order_is_rejected() {
        let h = harness(true, true);
        let err = h.engine.commit_order(&[], "cash").await.unwrap_err();
        assert!(matches!(err, EngineError::Permanent(_)));
    }
}
