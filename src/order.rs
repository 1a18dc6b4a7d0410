//! The order currently being built or paid at the terminal.
//!
//! Pure in-memory state: line items, the selected payment method, and the
//! recalled transaction being paid, if any. Totals are computed, never
//! stored. The session feeds the reconciliation engine exactly two mutating
//! operations: commit a new order, commit a payment.

use crate::models::{CachedTransaction, LineItem, Transaction};

/// Cash sales carry the higher tax band.
pub const CASH_TAX_RATE: f64 = 0.15;
pub const DEFAULT_TAX_RATE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Totals {
    pub subtotal: f64,
    pub tax_rate: f64,
    pub tax: f64,
    pub total: f64,
}

/// Tax rate for a payment method (possibly not yet chosen).
pub fn tax_rate_for(payment_method: Option<&str>) -> f64 {
    if payment_method == Some("cash") {
        CASH_TAX_RATE
    } else {
        DEFAULT_TAX_RATE
    }
}

/// Compute totals for a set of line items under the given payment method.
pub fn compute_totals(items: &[LineItem], payment_method: Option<&str>) -> Totals {
    let subtotal: f64 = items
        .iter()
        .map(|item| item.price * f64::from(item.quantity))
        .sum();
    let tax_rate = tax_rate_for(payment_method);
    let tax = subtotal * tax_rate;
    Totals {
        subtotal,
        tax_rate,
        tax,
        total: subtotal + tax,
    }
}

/// A previously committed transaction pulled back onto the terminal for
/// payment or review.
#[derive(Debug, Clone)]
pub struct RecalledTransaction {
    pub transaction: Transaction,
    pub items: Vec<LineItem>,
}

#[derive(Debug, Default)]
pub struct OrderSession {
    items: Vec<LineItem>,
    payment_method: Option<String>,
    recalled: Option<RecalledTransaction>,
}

impl OrderSession {
    pub fn new() -> Self {
        OrderSession::default()
    }

    /// Add an item; a second add of the same item id bumps the quantity.
    pub fn add_item(&mut self, item: LineItem) {
        if let Some(existing) = self.items.iter_mut().find(|i| i.id == item.id) {
            existing.quantity += item.quantity;
            return;
        }
        self.items.push(item);
    }

    pub fn remove_item(&mut self, item_id: &str) {
        self.items.retain(|item| item.id != item_id);
    }

    pub fn clear_items(&mut self) {
        self.items.clear();
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn set_payment_method(&mut self, method: Option<String>) {
        self.payment_method = method;
    }

    pub fn payment_method(&self) -> Option<&str> {
        self.payment_method.as_deref()
    }

    pub fn totals(&self) -> Totals {
        compute_totals(&self.items, self.payment_method())
    }

    /// Load a cached transaction into the session for payment: its items
    /// replace the current ones and its payment method is preselected.
    pub fn recall(&mut self, cached: &CachedTransaction) {
        self.items = cached.transaction.items.iter().map(LineItem::from).collect();
        self.payment_method = Some(cached.transaction.payment_method.clone());
        self.recalled = Some(RecalledTransaction {
            transaction: cached.transaction.clone(),
            items: self.items.clone(),
        });
    }

    pub fn recalled(&self) -> Option<&RecalledTransaction> {
        self.recalled.as_ref()
    }

    /// Drop all state, including any recalled transaction.
    pub fn reset(&mut self) {
        self.items.clear();
        self.payment_method = None;
        self.recalled = None;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaidStatus, TransactionItem};
    use chrono::Utc;

    fn item(id: &str, quantity: u32, price: f64) -> LineItem {
        LineItem {
            id: id.into(),
            name: id.into(),
            quantity,
            price,
        }
    }

    #[test]
    fn test_cash_and_card_tax_bands() {
        let items = vec![item("fg-1", 2, 10.0)];

        let cash = compute_totals(&items, Some("cash"));
        assert_eq!(cash.subtotal, 20.0);
        assert_eq!(cash.tax, 3.0);
        assert_eq!(cash.total, 23.0);

        let card = compute_totals(&items, Some("card"));
        assert_eq!(card.tax, 1.0);
        assert_eq!(card.total, 21.0);

        // No method chosen yet: default band.
        assert_eq!(compute_totals(&items, None).tax_rate, DEFAULT_TAX_RATE);
    }

    #[test]
    fn test_add_item_merges_quantities() {
        let mut session = OrderSession::new();
        session.add_item(item("fg-1", 1, 10.0));
        session.add_item(item("fg-1", 2, 10.0));
        session.add_item(item("fg-2", 1, 4.0));

        assert_eq!(session.items().len(), 2);
        assert_eq!(session.items()[0].quantity, 3);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut session = OrderSession::new();
        session.add_item(item("fg-1", 1, 10.0));
        session.add_item(item("fg-2", 1, 4.0));

        session.remove_item("fg-1");
        assert_eq!(session.items().len(), 1);

        session.clear_items();
        assert!(session.is_empty());
    }

    #[test]
    fn test_recall_loads_items_and_method() {
        let cached = CachedTransaction {
            transaction: Transaction {
                transaction_id: "000205".into(),
                items: vec![TransactionItem {
                    item_id: "fg-1".into(),
                    item_name: "Margherita".into(),
                    quantity: 2,
                    price: 9.5,
                }],
                total: 21.85,
                payment_method: "cash".into(),
                date: Utc::now(),
                order_punched: Default::default(),
                paid_status: PaidStatus::NotPaid,
                transaction_status: Default::default(),
            },
            offline_transaction_id: None,
            cached_at: Utc::now(),
        };

        let mut session = OrderSession::new();
        session.recall(&cached);

        assert_eq!(session.items().len(), 1);
        assert_eq!(session.items()[0].name, "Margherita");
        assert_eq!(session.payment_method(), Some("cash"));
        assert_eq!(
            session.recalled().unwrap().transaction.transaction_id,
            "000205"
        );

        session.reset();
        assert!(session.recalled().is_none());
        assert!(session.is_empty());
    }
}
