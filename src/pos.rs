//! Point-of-sale: a cart and the checkout that turns it into a paid sale.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::db::{self, DbState};
use crate::entities;
use crate::error::{AppError, AppResult};
use crate::invoices;
use crate::models::{EntityType, Invoice, InvoiceStatus, Product};
use crate::products;
use crate::validation::{existing_id, round_money};

/// Number prefix for invoices issued at the till.
pub const POS_PREFIX: &str = "POS";

const CHECKOUT_REJECTED: &str = "Select a client and add products before checkout.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: String,
    pub product_name: String,
    pub quantity: i64,
    pub unit_price: f64,
}

impl CartLine {
    pub fn total(&self) -> f64 {
        round_money(self.unit_price * self.quantity as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Cart {
    lines: Vec<CartLine>,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    /// Add one unit of `product`, bumping its line when already in the cart.
    pub fn add_product(&mut self, product: &Product) {
        match self.lines.iter().position(|l| l.product_id == product.id) {
            Some(idx) => {
                let next = self.lines[idx].quantity + 1;
                self.set_quantity(idx, next);
            }
            None => self.lines.push(CartLine {
                product_id: product.id.clone(),
                product_name: product.name.clone(),
                quantity: 1,
                unit_price: product.price,
            }),
        }
    }

    /// A quantity of zero or less drops the line.
    pub fn set_quantity(&mut self, idx: usize, quantity: i64) {
        if quantity <= 0 {
            self.remove(idx);
            return;
        }
        if let Some(line) = self.lines.get_mut(idx) {
            line.quantity = quantity;
        }
    }

    pub fn remove(&mut self, idx: usize) {
        if idx < self.lines.len() {
            self.lines.remove(idx);
        }
    }

    pub fn subtotal(&self) -> f64 {
        round_money(self.lines.iter().map(CartLine::total).sum())
    }

    pub fn total(&self) -> f64 {
        self.subtotal()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn checkout_lines(&self) -> Vec<CheckoutLine> {
        self.lines
            .iter()
            .map(|l| CheckoutLine {
                product_id: l.product_id.clone(),
                quantity: l.quantity,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutLine {
    pub product_id: String,
    pub quantity: i64,
}

/// Issue a paid sale for the cart. Prices are read from the store, not
/// trusted from the caller, and the whole sale commits in one transaction.
pub fn checkout(db: &DbState, entity_id: Option<&str>, lines: &[CheckoutLine]) -> AppResult<Invoice> {
    let entity_id = entity_id.map(str::trim).filter(|s| !s.is_empty());
    let entity_id = match entity_id {
        Some(id) if !lines.is_empty() => existing_id(Some(id))?,
        _ => return Err(AppError::Validation(CHECKOUT_REJECTED.into())),
    };

    let conn = db.lock()?;
    let invoice = db::with_transaction(&conn, |tx| {
        let client = entities::find(tx, &entity_id)?
            .ok_or_else(|| AppError::NotFound("Client not found".into()))?;
        if client.entity_type != EntityType::Client {
            return Err(AppError::Validation("Checkout requires a client".into()));
        }

        let mut items = Vec::with_capacity(lines.len());
        let mut total = 0.0;
        for line in lines {
            let product_id = existing_id(Some(line.product_id.as_str()))?;
            let product = products::find(tx, &product_id)?
                .ok_or_else(|| AppError::NotFound("Product not found".into()))?;
            total += round_money(product.price * line.quantity as f64);
            items.push(json!({
                "productId": product.id,
                "quantity": line.quantity,
                "unitPrice": product.price,
            }));
        }

        let payload = json!({
            "type": "sale",
            "entityId": client.id,
            "entityName": client.name,
            "items": items,
            "paidAmount": round_money(total),
            "status": InvoiceStatus::Paid.as_str(),
        });
        invoices::create_in(tx, &payload, POS_PREFIX)
    })?;

    info!(
        invoice_id = %invoice.id,
        number = %invoice.number,
        lines = invoice.items.len(),
        total = invoice.total,
        "POS sale completed"
    );
    Ok(invoice)
}

/// Resolve a scanned code to its product.
pub fn scan(db: &DbState, sku: &str) -> AppResult<Product> {
    products::find_by_sku(db, sku)?
        .ok_or_else(|| AppError::NotFound("No product matches the scanned SKU.".into()))
}
