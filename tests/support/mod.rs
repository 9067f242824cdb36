#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use usage_billing::billing::health::WarningStore;
use usage_billing::billing::ledger::{
    Card, CardChecks, Customer, Invoice, InvoiceLine, InvoiceStatus, Ledger, LedgerError, List,
    NewInvoiceItem, PaymentMethod, PendingInvoiceItemInterval, Price, Product, ProductRef,
    Recurring, Subscription, SubscriptionItem, SubscriptionStatus,
};
use usage_billing::billing::lookup::{
    price_lookup_keys, PRODUCT_TIER_METADATA, PRODUCT_TYPE_METADATA,
};
use usage_billing::billing::marketplace::{MarketplaceMetering, UsageRecord};
use usage_billing::billing::models::{
    PlanType, ProductType, RetentionPeriod, SubscriptionInterval, Workspace,
};
use usage_billing::billing::notifications::{NotificationSender, NotificationType};
use usage_billing::billing::store::WorkspaceStore;
use usage_billing::billing::usage::{BillingWindow, DailyCount, MeterSource};

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap()
}

/// A paying workspace inside its billing period, opted into overage.
pub fn paying_workspace(id: i32, tier: PlanType) -> Workspace {
    let mut workspace = Workspace::new(id, tier);
    workspace.allow_meter_overage = true;
    workspace.billing_period_start = Some(now() - Duration::days(14));
    workspace.billing_period_end = Some(now() + Duration::days(16));
    workspace.stripe_customer_id = Some(customer_id(id));
    workspace
}

pub fn customer_id(workspace_id: i32) -> String {
    format!("cus_{workspace_id}")
}

pub fn subscription_id(workspace_id: i32) -> String {
    format!("sub_{workspace_id}")
}

pub fn price_id(product: ProductType) -> String {
    format!("price_{}", product.as_str().to_lowercase())
}

fn product_id(product: ProductType) -> String {
    format!("prod_{}", product.as_str().to_lowercase())
}

fn not_found(what: &str) -> LedgerError {
    LedgerError::Api {
        status: 404,
        code: Some("resource_missing".into()),
        message: format!("no such {what}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeInvoiceItem {
    pub id: String,
    pub customer_id: String,
    pub subscription_id: String,
    pub price_id: String,
    pub quantity: i64,
}

#[derive(Default)]
pub struct LedgerState {
    pub customers: HashMap<String, Customer>,
    pub products: HashMap<String, Product>,
    pub prices: Vec<Price>,
    pub upcoming: HashMap<String, Invoice>,
    pub payment_methods: HashMap<String, Vec<PaymentMethod>>,
    pub usage_records: HashMap<String, i64>,
    pub invoice_items: Vec<FakeInvoiceItem>,
    pub extra_lines: Vec<InvoiceLine>,
    pub idempotency_keys: Vec<String>,
    pub pending_interval_updates: Vec<String>,
    pub next_pending_invoice: Option<i64>,
    pub unavailable_customers: HashSet<String>,
    pub payment_method_calls: usize,
    next_id: usize,
}

impl LedgerState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{}", self.next_id)
    }

    fn expand(&self, price: &Price) -> Price {
        let mut price = price.clone();
        if let Some(product) = self.products.get(price.product.id()) {
            price.product = ProductRef::Object(product.clone());
        }
        price
    }

    fn subscription_mut(&mut self, subscription_id: &str) -> Option<&mut Subscription> {
        self.customers
            .values_mut()
            .flat_map(|customer| customer.subscriptions.data.iter_mut())
            .find(|subscription| subscription.id == subscription_id)
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<&Subscription> {
        self.customers
            .values()
            .flat_map(|customer| customer.subscriptions.data.iter())
            .find(|subscription| subscription.id == subscription_id)
    }

    pub fn price(&self, product: ProductType) -> Option<&Price> {
        let id = price_id(product);
        self.prices.iter().find(|price| price.id == id)
    }

    pub fn metered_item(&self, subscription_id: &str, price_id: &str) -> Option<String> {
        self.subscription(subscription_id)?
            .items
            .data
            .iter()
            .find(|item| item.price.id == price_id)
            .map(|item| item.id.clone())
    }
}

/// In-memory ledger that derives upcoming invoice lines from the items it holds.
#[derive(Default)]
pub struct FakeLedger {
    pub state: Mutex<LedgerState>,
}

impl FakeLedger {
    /// Sessions bill through a metered subscription item; the other overage products through
    /// invoice items.
    pub fn with_workspace(workspace_id: i32, tier: PlanType, interval: SubscriptionInterval) -> Self {
        let ledger = FakeLedger::default();
        ledger.add_workspace(workspace_id, tier, interval);
        ledger
    }

    pub fn add_workspace(&self, workspace_id: i32, tier: PlanType, interval: SubscriptionInterval) {
        let mut state = self.state.lock().unwrap();
        let keys = price_lookup_keys(
            tier,
            interval,
            false,
            RetentionPeriod::ThreeMonths,
            RetentionPeriod::ThreeMonths,
        );
        let recurring_interval = match interval {
            SubscriptionInterval::Monthly => "month",
            SubscriptionInterval::Annual => "year",
        };

        for (product, lookup_key) in keys {
            let mut metadata = HashMap::from([(
                PRODUCT_TYPE_METADATA.to_string(),
                product.as_str().to_string(),
            )]);
            if product == ProductType::Base {
                metadata.insert(PRODUCT_TIER_METADATA.to_string(), tier.as_str().to_string());
            }
            state
                .products
                .entry(product_id(product))
                .or_insert_with(|| Product {
                    id: product_id(product),
                    metadata,
                });
            let recurring = match product {
                ProductType::Base => Some(Recurring {
                    interval: recurring_interval.into(),
                    usage_type: "licensed".into(),
                }),
                ProductType::Sessions => Some(Recurring {
                    interval: "month".into(),
                    usage_type: "metered".into(),
                }),
                _ => None,
            };
            if state.price(product).is_none() {
                state.prices.push(Price {
                    id: price_id(product),
                    lookup_key: Some(lookup_key),
                    recurring,
                    product: ProductRef::Id(product_id(product)),
                    metadata: HashMap::new(),
                });
            }
        }

        let base_price = state.price(ProductType::Base).cloned().unwrap();
        let subscription = Subscription {
            id: subscription_id(workspace_id),
            status: SubscriptionStatus::Active,
            items: List::from(vec![SubscriptionItem {
                id: format!("si_base_{workspace_id}"),
                price: base_price,
            }]),
            discount: None,
            pending_invoice_item_interval: None,
            next_pending_invoice_item_invoice: None,
        };
        state.customers.insert(
            customer_id(workspace_id),
            Customer {
                id: customer_id(workspace_id),
                subscriptions: List::from(vec![subscription]),
            },
        );
        state.upcoming.insert(
            subscription_id(workspace_id),
            Invoice {
                id: Some(format!("in_upcoming_{workspace_id}")),
                status: Some(InvoiceStatus::Draft),
                attempt_count: 0,
            },
        );
        state
            .payment_methods
            .insert(customer_id(workspace_id), vec![valid_card()]);
    }
}

pub fn valid_card() -> PaymentMethod {
    PaymentMethod {
        id: "pm_valid".into(),
        card: Some(Card {
            checks: Some(CardChecks {
                cvc_check: Some("pass".into()),
                address_postal_code_check: Some("pass".into()),
            }),
        }),
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn get_customer(&self, customer_id: &str) -> Result<Customer, LedgerError> {
        let state = self.state.lock().unwrap();
        if state.unavailable_customers.contains(customer_id) {
            return Err(LedgerError::Api {
                status: 503,
                code: None,
                message: "ledger unavailable".into(),
            });
        }
        state
            .customers
            .get(customer_id)
            .cloned()
            .ok_or_else(|| not_found("customer"))
    }

    async fn list_products(&self, product_ids: &[String]) -> Result<Vec<Product>, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(product_ids
            .iter()
            .filter_map(|id| state.products.get(id).cloned())
            .collect())
    }

    async fn list_prices_by_lookup_keys(
        &self,
        lookup_keys: &[String],
    ) -> Result<Vec<Price>, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .prices
            .iter()
            .filter(|price| {
                price
                    .lookup_key
                    .as_ref()
                    .map(|key| lookup_keys.contains(key))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn get_price(&self, price_id: &str) -> Result<Price, LedgerError> {
        let state = self.state.lock().unwrap();
        state
            .prices
            .iter()
            .find(|price| price.id == price_id)
            .cloned()
            .ok_or_else(|| not_found("price"))
    }

    async fn set_monthly_pending_invoice_interval(
        &self,
        subscription_id: &str,
    ) -> Result<Subscription, LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.pending_interval_updates.push(subscription_id.to_string());
        let next = state.next_pending_invoice;
        let subscription = state
            .subscription_mut(subscription_id)
            .ok_or_else(|| not_found("subscription"))?;
        subscription.pending_invoice_item_interval = Some(PendingInvoiceItemInterval {
            interval: "month".into(),
            interval_count: Some(1),
        });
        subscription.next_pending_invoice_item_invoice = next;
        Ok(subscription.clone())
    }

    async fn upcoming_invoice(
        &self,
        _customer_id: &str,
        subscription_id: &str,
    ) -> Result<Option<Invoice>, LedgerError> {
        Ok(self.state.lock().unwrap().upcoming.get(subscription_id).cloned())
    }

    async fn upcoming_invoice_lines(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<Vec<InvoiceLine>, LedgerError> {
        let state = self.state.lock().unwrap();
        let mut lines = Vec::new();
        if let Some(subscription) = state.subscription(subscription_id) {
            for item in &subscription.items.data {
                lines.push(InvoiceLine {
                    id: format!("il_{}", item.id),
                    price: Some(state.expand(&item.price)),
                    subscription_item: Some(item.id.clone()),
                    invoice_item: None,
                    quantity: state.usage_records.get(&item.id).copied(),
                });
            }
        }
        for item in state.invoice_items.iter().filter(|item| {
            item.customer_id == customer_id && item.subscription_id == subscription_id
        }) {
            let price = state
                .prices
                .iter()
                .find(|price| price.id == item.price_id)
                .map(|price| state.expand(price));
            lines.push(InvoiceLine {
                id: format!("il_{}", item.id),
                price,
                subscription_item: None,
                invoice_item: Some(item.id.clone()),
                quantity: Some(item.quantity),
            });
        }
        lines.extend(state.extra_lines.iter().cloned());
        Ok(lines)
    }

    async fn create_subscription_item(
        &self,
        subscription_id: &str,
        price_id: &str,
        idempotency_key: &str,
    ) -> Result<SubscriptionItem, LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.idempotency_keys.push(idempotency_key.to_string());
        let price = state
            .prices
            .iter()
            .find(|price| price.id == price_id)
            .cloned()
            .ok_or_else(|| not_found("price"))?;
        let item = SubscriptionItem {
            id: state.next_id("si"),
            price,
        };
        state
            .subscription_mut(subscription_id)
            .ok_or_else(|| not_found("subscription"))?
            .items
            .data
            .push(item.clone());
        Ok(item)
    }

    async fn set_usage_record(
        &self,
        subscription_item_id: &str,
        quantity: i64,
    ) -> Result<(), LedgerError> {
        self.state
            .lock()
            .unwrap()
            .usage_records
            .insert(subscription_item_id.to_string(), quantity);
        Ok(())
    }

    async fn create_invoice_item(
        &self,
        item: NewInvoiceItem<'_>,
        idempotency_key: &str,
    ) -> Result<String, LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.idempotency_keys.push(idempotency_key.to_string());
        let id = state.next_id("ii");
        state.invoice_items.push(FakeInvoiceItem {
            id: id.clone(),
            customer_id: item.customer_id.to_string(),
            subscription_id: item.subscription_id.to_string(),
            price_id: item.price_id.to_string(),
            quantity: item.quantity,
        });
        Ok(id)
    }

    async fn update_invoice_item(
        &self,
        invoice_item_id: &str,
        price_id: &str,
        quantity: i64,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        let item = state
            .invoice_items
            .iter_mut()
            .find(|item| item.id == invoice_item_id)
            .ok_or_else(|| not_found("invoice item"))?;
        item.price_id = price_id.to_string();
        item.quantity = quantity;
        Ok(())
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentMethod>, LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.payment_method_calls += 1;
        Ok(state
            .payment_methods
            .get(customer_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeStore {
    pub workspaces: Mutex<Vec<Workspace>>,
    pub admins: Mutex<HashMap<i32, i64>>,
    pub next_invoice_dates: Mutex<Vec<(i32, DateTime<Utc>)>>,
    pub unavailable: AtomicBool,
}

impl FakeStore {
    pub fn with(workspaces: Vec<Workspace>) -> Self {
        Self {
            workspaces: Mutex::new(workspaces),
            ..Default::default()
        }
    }
}

#[async_trait]
impl WorkspaceStore for FakeStore {
    async fn get_workspace(&self, workspace_id: i32) -> Result<Option<Workspace>> {
        Ok(self
            .workspaces
            .lock()
            .unwrap()
            .iter()
            .find(|workspace| workspace.id == workspace_id)
            .cloned())
    }

    async fn list_billable_workspaces(&self) -> Result<Vec<Workspace>> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("workspace store unavailable");
        }
        Ok(self.workspaces.lock().unwrap().clone())
    }

    async fn admin_count(&self, workspace_id: i32) -> Result<i64> {
        Ok(self
            .admins
            .lock()
            .unwrap()
            .get(&workspace_id)
            .copied()
            .unwrap_or(1))
    }

    async fn set_next_invoice_date(&self, workspace_id: i32, next: DateTime<Utc>) -> Result<()> {
        self.next_invoice_dates
            .lock()
            .unwrap()
            .push((workspace_id, next));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(NotificationType, i32, Option<String>)>>,
    pub failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<NotificationType> {
        self.sent.lock().unwrap().iter().map(|(kind, _, _)| *kind).collect()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn send(
        &self,
        kind: NotificationType,
        workspace: &Workspace,
        detail: Option<&str>,
    ) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("notification service unavailable");
        }
        self.sent
            .lock()
            .unwrap()
            .push((kind, workspace.id, detail.map(str::to_string)));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryWarningStore {
    pub warnings: Mutex<HashMap<String, DateTime<Utc>>>,
    pub invalid: Mutex<HashMap<String, bool>>,
    pub failing_reads: AtomicBool,
}

#[async_trait]
impl WarningStore for MemoryWarningStore {
    async fn get_warning(&self, customer_id: &str) -> Result<Option<DateTime<Utc>>> {
        if self.failing_reads.load(Ordering::SeqCst) {
            bail!("warning store unavailable");
        }
        Ok(self.warnings.lock().unwrap().get(customer_id).copied())
    }

    async fn set_warning(&self, customer_id: &str, started_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut warnings = self.warnings.lock().unwrap();
        match started_at {
            Some(started_at) => warnings.insert(customer_id.to_string(), started_at),
            None => warnings.remove(customer_id),
        };
        Ok(())
    }

    async fn is_invalid(&self, customer_id: &str) -> Result<bool> {
        Ok(self
            .invalid
            .lock()
            .unwrap()
            .get(customer_id)
            .copied()
            .unwrap_or(false))
    }

    async fn set_invalid(&self, customer_id: &str, invalid: bool) -> Result<()> {
        self.invalid
            .lock()
            .unwrap()
            .insert(customer_id.to_string(), invalid);
        Ok(())
    }
}

/// Live counts per (workspace, product); no daily aggregates.
#[derive(Default)]
pub struct FixedMeter {
    pub counts: Mutex<BTreeMap<(i32, ProductType), i64>>,
    pub failing_workspaces: Mutex<HashSet<i32>>,
}

impl FixedMeter {
    pub fn set(&self, workspace_id: i32, product: ProductType, count: i64) {
        self.counts
            .lock()
            .unwrap()
            .insert((workspace_id, product), count);
    }
}

#[async_trait]
impl MeterSource for FixedMeter {
    async fn daily_counts(
        &self,
        _workspace_id: i32,
        _product: ProductType,
        _window: BillingWindow,
    ) -> Result<Vec<DailyCount>> {
        Ok(Vec::new())
    }

    async fn live_count(
        &self,
        workspace_id: i32,
        product: ProductType,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<i64> {
        if self.failing_workspaces.lock().unwrap().contains(&workspace_id) {
            return Err(anyhow!("meter source timed out"));
        }
        Ok(self
            .counts
            .lock()
            .unwrap()
            .get(&(workspace_id, product))
            .copied()
            .unwrap_or(0))
    }

    async fn daily_average(
        &self,
        _workspace_id: i32,
        _product: ProductType,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<f64> {
        Ok(0.)
    }
}

/// Records every batch; batches whose call index is listed fail.
#[derive(Default)]
pub struct RecordingMetering {
    pub batches: Mutex<Vec<(String, Vec<UsageRecord>)>>,
    pub failing_calls: Mutex<HashSet<usize>>,
    calls: AtomicUsize,
}

#[async_trait]
impl MarketplaceMetering for RecordingMetering {
    async fn batch_meter_usage(&self, product_code: &str, records: &[UsageRecord]) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_calls.lock().unwrap().contains(&call) {
            bail!("throttled");
        }
        self.batches
            .lock()
            .unwrap()
            .push((product_code.to_string(), records.to_vec()));
        Ok(())
    }
}
