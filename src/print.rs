//! Receipt documents and the printer boundary.
//!
//! Document rendering and transport are outside this crate; the engine only
//! builds the document for each completed action and needs a success/error
//! result to decide whether to warn the operator. Exactly one document is
//! produced per committed action, online or offline.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{LineItem, SessionContext};

/// What kind of docket this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    Order,
    Paid,
}

/// A docket slip ready for the print pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptDocument {
    #[serde(rename = "type")]
    pub kind: ReceiptKind,
    #[serde(rename = "transactionID")]
    pub transaction_id: String,
    pub selected_items: Vec<LineItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    pub payment_method: String,
    /// True when the docket carries a provisional id; flagged on the slip so
    /// staff know the number may be remapped after sync.
    pub is_offline: bool,
    pub cashier: String,
    pub date: DateTime<Utc>,
}

impl ReceiptDocument {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: ReceiptKind,
        transaction_id: &str,
        items: &[LineItem],
        subtotal: f64,
        tax: f64,
        total: f64,
        payment_method: &str,
        is_offline: bool,
        session: &SessionContext,
    ) -> Self {
        ReceiptDocument {
            kind,
            transaction_id: transaction_id.to_string(),
            selected_items: items.to_vec(),
            subtotal,
            tax,
            total,
            payment_method: payment_method.to_string(),
            is_offline,
            cashier: session.cashier.clone(),
            date: Utc::now(),
        }
    }
}

/// Opaque print pipeline. A failure is reported to the operator but never
/// rolls back the committed transaction — the sale is real even if the
/// docket didn't print.
pub trait Printer: Send + Sync {
    fn print(&self, document: &ReceiptDocument) -> Result<(), String>;
}

/// Accepts and discards every document. For headless embedding.
pub struct NullPrinter;

impl Printer for NullPrinter {
    fn print(&self, _document: &ReceiptDocument) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_wire_shape() {
        let session = SessionContext {
            cashier: "dora".into(),
            terminal: Some("front".into()),
        };
        let doc = ReceiptDocument::new(
            ReceiptKind::Paid,
            "000111",
            &[],
            10.0,
            0.5,
            10.5,
            "card",
            true,
            &session,
        );

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["type"], "paid");
        assert_eq!(json["transactionID"], "000111");
        assert_eq!(json["isOffline"], true);
        assert_eq!(json["cashier"], "dora");
    }
}
