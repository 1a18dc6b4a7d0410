//! Domain and wire types for the transaction pipeline.
//!
//! Wire payloads keep the server's exact field names (`selectedItems`,
//! `selectedPaymentMethod`, `transactionID`, …) so serialized JSON matches
//! what the transaction routes expect byte-for-byte.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Whether the order has been punched to the kitchen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OrderPunched {
    #[serde(rename = "yes")]
    Yes,
    #[serde(rename = "no")]
    #[default]
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PaidStatus {
    #[serde(rename = "paid")]
    Paid,
    #[serde(rename = "not paid")]
    #[default]
    NotPaid,
}

/// Transactions are never deleted, only flagged `suspended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransactionStatus {
    #[serde(rename = "processed")]
    #[default]
    Processed,
    #[serde(rename = "suspended")]
    Suspended,
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// A line item as the order session and the order/payment payloads carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub name: String,
    pub quantity: u32,
    pub price: f64,
}

/// A line item as stored on a server transaction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionItem {
    #[serde(rename = "itemId")]
    pub item_id: String,
    #[serde(rename = "itemName")]
    pub item_name: String,
    #[serde(rename = "itemQuantity")]
    pub quantity: u32,
    #[serde(default)]
    pub price: f64,
}

impl From<&LineItem> for TransactionItem {
    fn from(item: &LineItem) -> Self {
        TransactionItem {
            item_id: item.id.clone(),
            item_name: item.name.clone(),
            quantity: item.quantity,
            price: item.price,
        }
    }
}

impl From<&TransactionItem> for LineItem {
    fn from(item: &TransactionItem) -> Self {
        LineItem {
            id: item.item_id.clone(),
            name: item.item_name.clone(),
            quantity: item.quantity,
            price: item.price,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction record
// ---------------------------------------------------------------------------

/// A server-side transaction record (the unit of business record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "transactionID")]
    pub transaction_id: String,
    #[serde(default)]
    pub items: Vec<TransactionItem>,
    #[serde(default)]
    pub total: f64,
    #[serde(rename = "paymentMethod", default)]
    pub payment_method: String,
    pub date: DateTime<Utc>,
    #[serde(rename = "orderPunched", default)]
    pub order_punched: OrderPunched,
    #[serde(rename = "paidStatus", default)]
    pub paid_status: PaidStatus,
    #[serde(rename = "transactionStatus", default)]
    pub transaction_status: TransactionStatus,
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// Body of `POST /api/transactions/order`.
///
/// `date` and `transaction_id` are only set on offline-created orders: the
/// provisional id rides along so the operator can cross-reference the
/// provisional receipt after the queue drains.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
    pub selected_items: Vec<LineItem>,
    pub total: f64,
    pub selected_payment_method: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(
        rename = "transactionID",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub transaction_id: Option<String>,
}

/// Body of `POST /api/transactions/pay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    #[serde(rename = "transactionID")]
    pub transaction_id: String,
    pub total: f64,
    pub payment_method: String,
    pub items: Vec<LineItem>,
}

// ---------------------------------------------------------------------------
// Queue entries
// ---------------------------------------------------------------------------

/// An order committed while offline, waiting for the next drain.
///
/// `local_id` is the queue's primary key and never leaves the terminal;
/// `offline_transaction_id` is the provisional id printed on the docket.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub local_id: String,
    pub offline_transaction_id: String,
    pub payload: OrderPayload,
    pub created_at: DateTime<Utc>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// A payment taken while offline, waiting for the next drain.
#[derive(Debug, Clone)]
pub struct PendingPayment {
    pub local_id: String,
    pub payload: PaymentPayload,
    pub created_at: DateTime<Utc>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// Local read-only mirror of a server transaction, used for recall while
/// offline. `offline_transaction_id` survives cache rebuilds so a docket
/// printed with a provisional id can still be reconciled by a human.
#[derive(Debug, Clone)]
pub struct CachedTransaction {
    pub transaction: Transaction,
    pub offline_transaction_id: Option<String>,
    pub cached_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Session context
// ---------------------------------------------------------------------------

/// Who is operating the terminal. Passed explicitly into the engine
/// constructor; there is no ambient global.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub cashier: String,
    pub terminal: Option<String>,
}
