//! Transaction API client.
//!
//! The engine talks to the server through the [`TransactionApi`] trait so
//! reconciliation logic is testable against in-memory fakes;
//! [`HttpTransactionApi`] is the reqwest implementation used in production.
//! Error strings carry an `(HTTP nnn)` suffix which the sync layer uses to
//! classify failures as transient or permanent.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::config::{normalize_base_url, Config};
use crate::inventory::{BomEntry, FinishedGood};
use crate::models::{OrderPayload, PaymentPayload};

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Everything the reconciliation core needs from the server.
#[async_trait]
pub trait TransactionApi: Send + Sync {
    /// Lightweight connectivity probe. Any HTTP response proves the server
    /// is reachable; only a network-level failure counts as offline.
    async fn probe(&self) -> bool;

    /// Latest server-issued transaction id. `Ok(None)` when the dedicated
    /// endpoint is absent — callers fall back to the transaction listing.
    async fn latest_transaction_id(&self) -> Result<Option<String>, String>;

    /// Submit an order; returns the authoritative transaction id. A 2xx
    /// response without a parseable id is an error, not an acknowledgment.
    async fn submit_order(&self, payload: &OrderPayload) -> Result<String, String>;

    async fn submit_payment(&self, payload: &PaymentPayload) -> Result<(), String>;

    /// Full transaction journal. An empty journal is `Ok(vec![])`.
    async fn list_transactions(&self) -> Result<Vec<Value>, String>;

    /// Flag processed transactions as suspended.
    async fn suspend_transactions(&self, ids: &[String]) -> Result<(), String>;

    async fn fetch_finished_goods(&self) -> Result<Vec<FinishedGood>, String>;
    async fn fetch_bom(&self) -> Result<Vec<BomEntry>, String>;
    async fn update_bom(&self, entries: &[BomEntry]) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach transaction server at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid transaction server URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        404 => "Transaction server endpoint not found".to_string(),
        s if s >= 500 => format!("Transaction server error (HTTP {s})"),
        s => format!("Unexpected response from transaction server (HTTP {s})"),
    }
}

/// Build the error detail for a non-success response, preserving the
/// server's own `message`/`error` field when the body is JSON.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        let message = json
            .get("message")
            .or_else(|| json.get("error"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| status_error(status));
        return format!("{message} (HTTP {})", status.as_u16());
    }
    if !body_text.trim().is_empty() {
        return format!(
            "{} (HTTP {}): {}",
            status_error(status),
            status.as_u16(),
            body_text.trim()
        );
    }
    format!("{} (HTTP {})", status_error(status), status.as_u16())
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpTransactionApi {
    base_url: String,
    client: Client,
    probe_client: Client,
}

impl HttpTransactionApi {
    pub fn new(config: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        let probe_client = Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

        Ok(HttpTransactionApi {
            base_url: normalize_base_url(&config.api_base_url),
            client,
            probe_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json(&self, path: &str) -> Result<(StatusCode, Value), String> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            // 404 is meaningful to some callers; hand the status back.
            return Ok((status, Value::Null));
        }
        if body_text.is_empty() {
            return Ok((status, Value::Null));
        }
        let json = serde_json::from_str(&body_text)
            .map_err(|e| format!("Invalid JSON from transaction server: {e}"))?;
        Ok((status, json))
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &Value,
    ) -> Result<Value, String> {
        let url = self.url(path);
        let resp = self
            .client
            .request(method, &url)
            .json(body)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(error_detail(status, &body_text));
        }
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| format!("Invalid JSON from transaction server: {e}"))
    }
}

#[async_trait]
impl TransactionApi for HttpTransactionApi {
    async fn probe(&self) -> bool {
        let url = self.url("/api/health");
        match self.probe_client.head(&url).send().await {
            Ok(resp) => {
                debug!(status = %resp.status(), "Connectivity probe answered");
                true
            }
            Err(_) => false,
        }
    }

    async fn latest_transaction_id(&self) -> Result<Option<String>, String> {
        let (status, json) = self
            .get_json("/api/transactions/latest-transaction-id")
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status));
        }
        Ok(json
            .get("latestTransactionID")
            .and_then(Value::as_str)
            .map(|s| s.to_string()))
    }

    async fn submit_order(&self, payload: &OrderPayload) -> Result<String, String> {
        let body = serde_json::to_value(payload).map_err(|e| e.to_string())?;
        let json = self
            .send_json(reqwest::Method::POST, "/api/transactions/order", &body)
            .await?;
        json.get("transactionID")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| "Order accepted but response had no transactionID".to_string())
    }

    async fn submit_payment(&self, payload: &PaymentPayload) -> Result<(), String> {
        let body = serde_json::to_value(payload).map_err(|e| e.to_string())?;
        self.send_json(reqwest::Method::POST, "/api/transactions/pay", &body)
            .await?;
        Ok(())
    }

    async fn list_transactions(&self) -> Result<Vec<Value>, String> {
        let (status, json) = self.get_json("/api/transactions/orders").await?;
        // The server answers 404 when the journal is empty.
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(status_error(status));
        }
        match json {
            Value::Array(records) => Ok(records),
            other => Err(format!(
                "Expected a transaction array, got {}",
                match other {
                    Value::Null => "null",
                    Value::Object(_) => "an object",
                    _ => "a non-array value",
                }
            )),
        }
    }

    async fn suspend_transactions(&self, ids: &[String]) -> Result<(), String> {
        let body = serde_json::json!({ "transactionIDs": ids });
        self.send_json(reqwest::Method::PUT, "/api/transactions/suspend", &body)
            .await?;
        Ok(())
    }

    async fn fetch_finished_goods(&self) -> Result<Vec<FinishedGood>, String> {
        let (status, json) = self.get_json("/api/menu/finishedgoods").await?;
        if !status.is_success() {
            return Err(status_error(status));
        }
        serde_json::from_value(json).map_err(|e| format!("Invalid finished goods data: {e}"))
    }

    async fn fetch_bom(&self) -> Result<Vec<BomEntry>, String> {
        let (status, json) = self.get_json("/api/menu/bom").await?;
        if !status.is_success() {
            return Err(status_error(status));
        }
        serde_json::from_value(json).map_err(|e| format!("Invalid BOM data: {e}"))
    }

    async fn update_bom(&self, entries: &[BomEntry]) -> Result<(), String> {
        let body = serde_json::to_value(entries).map_err(|e| e.to_string())?;
        self.send_json(reqwest::Method::PUT, "/api/menu/bom", &body)
            .await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
