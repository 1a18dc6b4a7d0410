//! Loop POS — offline-first order and payment engine.
//!
//! The terminal core behind the register UI: it commits orders and payments
//! directly against the transaction server while connected, queues them in a
//! durable local store with provisional transaction ids while not, and
//! reconciles the queue (with id remapping) once connectivity returns. The
//! UI, receipt rendering, and the HTTP API itself live outside this crate,
//! behind the `Printer`, `EventSink`, and `TransactionApi` boundaries.

use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod ids;
pub mod inventory;
pub mod models;
pub mod net;
pub mod order;
pub mod print;
pub mod scan;
pub mod sync;

pub use config::Config;
pub use error::EngineError;
pub use models::SessionContext;
pub use sync::{CommitOutcome, DrainReport, PaymentOutcome, SyncEngine};

/// Initialize structured logging (console + daily rolling file).
///
/// Call once at process start. The file layer is skipped when the log
/// directory cannot be created.
pub fn init_logging(log_dir: &std::path::Path) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,loop_pos=debug"));

    let console_layer = fmt::layer().with_target(true);

    if std::fs::create_dir_all(log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::daily(log_dir, "pos");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
        // The guard flushes on drop; the engine runs until process exit.
        std::mem::forget(guard);
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
    }
}

/// Wire up and start the engine: open the local queue (degrading to
/// online-only if that fails), build the HTTP client, run the initial
/// connectivity probe and id refresh, and start the background sync loop.
pub async fn start(
    config: Config,
    session: SessionContext,
    printer: Arc<dyn print::Printer>,
    events: Arc<dyn events::EventSink>,
) -> Result<Arc<SyncEngine>, String> {
    let diagnostics = Arc::new(diagnostics::DiagnosticsLog::new());

    let queue = match db::init(&config.data_dir) {
        Ok(state) => Some(Arc::new(state)),
        Err(e) => {
            warn!(error = %e, "Offline queue unavailable");
            diagnostics.record(
                diagnostics::LogCategory::Database,
                format!("Failed to initialize offline database: {e}"),
            );
            None
        }
    };

    let http = api::HttpTransactionApi::new(&config)?;
    let monitor = Arc::new(net::NetworkMonitor::new(false));

    let engine = Arc::new(SyncEngine::new(
        queue,
        Arc::new(http),
        monitor,
        printer,
        events,
        diagnostics,
        session,
    ));

    if engine.check_online().await {
        if let Err(e) = engine.refresh_latest_id().await {
            warn!(error = %e, "Initial transaction id refresh failed");
        }
    }

    sync::start_sync_loop(engine.clone(), config.sync_interval);
    info!("Engine started");

    Ok(engine)
}
