//! Raw-material stock decrement for online orders.
//!
//! When an order is committed online, the ingredients its finished goods
//! consume are deducted from the bill-of-materials before the order is
//! submitted. Wire shapes (`RawID`, `RawConsume`, `Quantity`) match the menu
//! routes. Offline orders never touch this: mutating shared inventory
//! without server confirmation is unsafe, so inventory for queued orders is
//! a flagged manual follow-up.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::api::TransactionApi;
use crate::models::LineItem;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawIngredient {
    #[serde(rename = "RawID")]
    pub raw_id: String,
    #[serde(rename = "RawConsume")]
    pub consume: f64,
}

/// A sellable menu item and the raw materials one unit consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishedGood {
    pub id: String,
    #[serde(rename = "rawIngredients", default)]
    pub raw_ingredients: Vec<RawIngredient>,
}

/// One raw material's stock level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BomEntry {
    #[serde(rename = "RawID")]
    pub raw_id: String,
    #[serde(rename = "Quantity")]
    pub quantity: f64,
}

/// Total consumption per raw material for the given line items. Items with
/// no finished-good record contribute nothing.
pub fn stock_reductions(items: &[LineItem], goods: &[FinishedGood]) -> HashMap<String, f64> {
    let mut reductions: HashMap<String, f64> = HashMap::new();
    for item in items {
        let Some(good) = goods.iter().find(|g| g.id == item.id) else {
            continue;
        };
        for ingredient in &good.raw_ingredients {
            *reductions.entry(ingredient.raw_id.clone()).or_default() +=
                ingredient.consume * f64::from(item.quantity);
        }
    }
    reductions
}

/// Apply reductions to the BOM, clamped at a floor of zero.
pub fn apply_reductions(bom: &mut [BomEntry], reductions: &HashMap<String, f64>) {
    for entry in bom.iter_mut() {
        if let Some(reduction) = reductions.get(&entry.raw_id) {
            entry.quantity = (entry.quantity - reduction).max(0.0);
        }
    }
}

/// Full read-compute-write stock decrement for an online order.
///
/// Any failing step is surfaced to the caller; none of this runs for
/// offline orders (a later drain must not decrement again).
pub async fn decrement_for_order(
    api: &dyn TransactionApi,
    items: &[LineItem],
) -> Result<(), String> {
    let goods = api.fetch_finished_goods().await?;
    let mut bom = api.fetch_bom().await?;

    let reductions = stock_reductions(items, &goods);
    if reductions.is_empty() {
        return Ok(());
    }

    apply_reductions(&mut bom, &reductions);
    api.update_bom(&bom).await?;

    info!(
        materials = reductions.len(),
        "Raw material stock decremented for order"
    );
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
