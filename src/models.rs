//! Records exchanged with the browser client and stored in SQLite.
//!
//! Field names serialize in camelCase, matching the shapes the client
//! already consumes.

use serde::{Deserialize, Serialize};

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw.trim().to_ascii_lowercase().as_str() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(EntityType { Client => "client", Supplier => "supplier" });
string_enum!(InvoiceType { Sale => "sale", Purchase => "purchase" });
string_enum!(InvoiceStatus { Draft => "draft", Paid => "paid", Pending => "pending" });
string_enum!(CashType { Income => "income", Expense => "expense" });

impl InvoiceType {
    /// The directory side an invoice of this type is issued to.
    pub fn counterpart(self) -> EntityType {
        match self {
            InvoiceType::Sale => EntityType::Client,
            InvoiceType::Purchase => EntityType::Supplier,
        }
    }

    /// Sign applied to line quantities when the invoice is posted.
    pub fn stock_sign(self) -> i64 {
        match self {
            InvoiceType::Sale => -1,
            InvoiceType::Purchase => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub sku: String,
    pub category: String,
    /// Selling price.
    pub price: f64,
    /// Purchase price.
    pub cost: f64,
    pub stock: i64,
    pub min_stock: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<String>,
}

impl Product {
    pub fn is_low_stock(&self) -> bool {
        self.stock <= self.min_stock
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceItem {
    pub id: String,
    pub product_id: Option<String>,
    pub product_name: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub cost: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    pub number: String,
    pub date: String,
    #[serde(rename = "type")]
    pub invoice_type: InvoiceType,
    pub entity_id: Option<String>,
    pub entity_name: String,
    pub items: Vec<InvoiceItem>,
    pub subtotal: f64,
    pub total: f64,
    pub paid_amount: f64,
    pub status: InvoiceStatus,
}

impl Invoice {
    pub fn balance_due(&self) -> f64 {
        (self.total - self.paid_amount).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashTransaction {
    pub id: String,
    pub date: String,
    pub description: String,
    pub amount: f64,
    #[serde(rename = "type")]
    pub transaction_type: CashType,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockMovement {
    pub id: i64,
    pub product_id: String,
    pub invoice_id: Option<String>,
    pub delta: i64,
    pub stock_after: i64,
    pub reason: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: i64,
    pub page: i64,
    pub limit: Option<i64>,
    pub total_pages: i64,
}

impl Pagination {
    /// Normalise raw paging input: page is at least 1, a given limit is at
    /// least 1, and without a limit everything fits on one page.
    pub fn new(total: i64, page: Option<i64>, limit: Option<i64>) -> Self {
        let page = page.unwrap_or(1).max(1);
        let limit = limit.map(|l| l.max(1));
        let total_pages = match limit {
            Some(_) if total <= 0 => 0,
            Some(l) => (total - 1) / l + 1,
            None => 1,
        };
        Self {
            total,
            page,
            limit,
            total_pages,
        }
    }

    pub fn offset(&self) -> i64 {
        match self.limit {
            Some(l) => (self.page - 1).saturating_mul(l),
            None => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}
