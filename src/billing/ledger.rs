//! Subscription-billing ledger seam.
//!
//! The wire shapes are the subset of Stripe objects reconciliation reads; the production
//! ledger decodes them through the Stripe client and fakes in tests construct them directly.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger returned {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    /// Transport, serialization and decoding failures of the Stripe client.
    #[error("ledger client error: {0}")]
    Client(stripe::StripeError),
    #[error("ledger request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("invalid ledger base url {0}")]
    InvalidBaseUrl(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            has_more: false,
        }
    }
}

impl<T> From<Vec<T>> for List<T> {
    fn from(data: Vec<T>) -> Self {
        Self {
            data,
            has_more: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub subscriptions: List<Subscription>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    Incomplete,
    IncompleteExpired,
    PastDue,
    Unpaid,
    Canceled,
    Paused,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInvoiceItemInterval {
    pub interval: String,
    #[serde(default)]
    pub interval_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub items: List<SubscriptionItem>,
    #[serde(default)]
    pub discount: Option<Discount>,
    #[serde(default)]
    pub pending_invoice_item_interval: Option<PendingInvoiceItemInterval>,
    /// Unix seconds of the next invoice for pending items.
    #[serde(default)]
    pub next_pending_invoice_item_invoice: Option<i64>,
}

impl Subscription {
    pub fn invoices_pending_items_monthly(&self) -> bool {
        self.pending_invoice_item_interval
            .as_ref()
            .map(|pending| pending.interval == "month")
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub price: Price,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recurring {
    pub interval: String,
    #[serde(default = "licensed")]
    pub usage_type: String,
}

fn licensed() -> String {
    "licensed".to_string()
}

/// Prices reference their product by id until the product is fetched separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProductRef {
    Id(String),
    Object(Product),
}

impl ProductRef {
    pub fn id(&self) -> &str {
        match self {
            ProductRef::Id(id) => id,
            ProductRef::Object(product) => &product.id,
        }
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        match self {
            ProductRef::Id(_) => None,
            ProductRef::Object(product) => product.metadata.get(key).map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
    #[serde(default)]
    pub lookup_key: Option<String>,
    #[serde(default)]
    pub recurring: Option<Recurring>,
    pub product: ProductRef,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Price {
    pub fn is_metered(&self) -> bool {
        self.recurring
            .as_ref()
            .map(|recurring| recurring.usage_type == "metered")
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    #[serde(default)]
    pub percent_off: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discount {
    #[serde(default)]
    pub coupon: Option<Coupon>,
    /// Unix seconds; absent for discounts that never end.
    #[serde(default)]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<InvoiceStatus>,
    #[serde(default)]
    pub attempt_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub id: String,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub subscription_item: Option<String>,
    #[serde(default)]
    pub invoice_item: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardChecks {
    #[serde(default)]
    pub cvc_check: Option<String>,
    #[serde(default)]
    pub address_postal_code_check: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    #[serde(default)]
    pub checks: Option<CardChecks>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    #[serde(default)]
    pub card: Option<Card>,
}

impl PaymentMethod {
    /// True only when the card failed both the CVC and postal code checks.
    pub fn failed_card_checks(&self) -> bool {
        let Some(checks) = self.card.as_ref().and_then(|card| card.checks.as_ref()) else {
            return false;
        };
        checks.cvc_check.as_deref() == Some("fail")
            && checks.address_postal_code_check.as_deref() == Some("fail")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvoiceItem<'a> {
    pub customer_id: &'a str,
    pub subscription_id: &'a str,
    pub price_id: &'a str,
    pub quantity: i64,
}

/// key: billing-ledger -> remote subscription-billing object store
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Customer with subscriptions, discounts and coupons expanded.
    async fn get_customer(&self, customer_id: &str) -> Result<Customer, LedgerError>;
    async fn list_products(&self, product_ids: &[String]) -> Result<Vec<Product>, LedgerError>;
    async fn list_prices_by_lookup_keys(
        &self,
        lookup_keys: &[String],
    ) -> Result<Vec<Price>, LedgerError>;
    async fn get_price(&self, price_id: &str) -> Result<Price, LedgerError>;
    /// Invoices pending items monthly regardless of the subscription interval.
    async fn set_monthly_pending_invoice_interval(
        &self,
        subscription_id: &str,
    ) -> Result<Subscription, LedgerError>;
    /// `None` when nothing is scheduled, e.g. after cancellation.
    async fn upcoming_invoice(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<Option<Invoice>, LedgerError>;
    /// Every line of the upcoming invoice with prices and products expanded.
    async fn upcoming_invoice_lines(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<Vec<InvoiceLine>, LedgerError>;
    async fn create_subscription_item(
        &self,
        subscription_id: &str,
        price_id: &str,
        idempotency_key: &str,
    ) -> Result<SubscriptionItem, LedgerError>;
    /// Replaces the current period's quantity instead of incrementing it.
    async fn set_usage_record(
        &self,
        subscription_item_id: &str,
        quantity: i64,
    ) -> Result<(), LedgerError>;
    async fn create_invoice_item(
        &self,
        item: NewInvoiceItem<'_>,
        idempotency_key: &str,
    ) -> Result<String, LedgerError>;
    async fn update_invoice_item(
        &self,
        invoice_item_id: &str,
        price_id: &str,
        quantity: i64,
    ) -> Result<(), LedgerError>;
    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentMethod>, LedgerError>;
}
