use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

use super::ledger::{
    Invoice, InvoiceLine, Ledger, NewInvoiceItem, Price, ProductRef, Subscription,
};
use super::lookup::{price_lookup_keys, product_metadata, LegacyPriceIds};
use super::models::{PlanType, ProductType, SubscriptionInterval, Workspace, WorkspaceOverages};
use super::notifications::{send_logged, NotificationSender, NotificationType};
use super::store::WorkspaceStore;

/// Ledger state read for one workspace before any mutation.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pub customer_id: String,
    pub subscription: Subscription,
    pub tier: PlanType,
    pub interval: SubscriptionInterval,
    pub prices: BTreeMap<ProductType, Price>,
    pub invoice: Invoice,
    /// Canonical upcoming invoice line per product whose price matches the resolved price.
    pub lines: BTreeMap<ProductType, InvoiceLine>,
}

/// Mutations issued by one `apply`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerChanges {
    pub subscription_items_created: usize,
    pub usage_records_set: usize,
    pub invoice_items_created: usize,
    pub invoice_items_updated: usize,
}

/// key: billing-ledger-reconciler -> converge ledger overage artifacts onto computed overage
pub struct LedgerReconciler {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn WorkspaceStore>,
    notifier: Arc<dyn NotificationSender>,
    legacy: LegacyPriceIds,
}

impl LedgerReconciler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn WorkspaceStore>,
        notifier: Arc<dyn NotificationSender>,
        legacy: LegacyPriceIds,
    ) -> Self {
        Self {
            ledger,
            store,
            notifier,
            legacy,
        }
    }

    /// Validates preconditions and reads everything `apply` needs.
    ///
    /// `Ok(None)` means there is nothing to reconcile: free plans and subscriptions without an
    /// upcoming invoice.
    pub async fn prepare(
        &self,
        workspace: &Workspace,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<ReconcileContext>> {
        if workspace.is_free() {
            debug!(workspace_id = workspace.id, "free plan, skipping ledger reconciliation");
            return Ok(None);
        }

        match (workspace.billing_period_start, workspace.billing_period_end) {
            (Some(start), Some(end)) if start <= now && now < end => {}
            _ => {
                return Err(BillingError::validation(
                    "workspace billing period is not valid",
                ))
            }
        }

        let customer_id = workspace
            .stripe_customer_id
            .clone()
            .ok_or_else(|| BillingError::validation("workspace has no ledger customer"))?;
        let customer = self.ledger.get_customer(&customer_id).await?;

        let mut subscriptions = customer.subscriptions.data;
        let mut subscription = match subscriptions.len() {
            1 => subscriptions.remove(0),
            0 => {
                return Err(BillingError::validation(
                    "cannot report usage - customer has no subscriptions",
                ))
            }
            _ => {
                return Err(BillingError::validation(
                    "cannot report usage - customer has multiple subscriptions",
                ))
            }
        };
        self.fill_products(&mut subscription).await?;

        let licensed = subscription
            .items
            .data
            .iter()
            .filter(|item| !item.price.is_metered())
            .count();
        if licensed != 1 {
            return Err(BillingError::validation(
                "cannot report usage - subscription has multiple products",
            ));
        }

        let mut base_items = subscription.items.data.iter().filter(|item| {
            product_metadata(&item.price, &self.legacy).product == Some(ProductType::Base)
        });
        let (Some(base_item), None) = (base_items.next(), base_items.next()) else {
            return Err(BillingError::validation(
                "cannot report usage - cannot find a single base product",
            ));
        };
        let base = product_metadata(&base_item.price, &self.legacy);
        let tier = base
            .tier
            .ok_or_else(|| BillingError::validation("cannot report usage - product has no tier"))?;
        let interval = base.interval;

        self.notify_discount_trial(workspace, &subscription, now).await;

        if interval != SubscriptionInterval::Monthly
            && !subscription.invoices_pending_items_monthly()
        {
            info!(
                workspace_id = workspace.id,
                subscription = %subscription.id,
                "configuring monthly invoices for non-monthly subscription"
            );
            let updated = self
                .ledger
                .set_monthly_pending_invoice_interval(&subscription.id)
                .await?;
            if let Some(next) = updated
                .next_pending_invoice_item_invoice
                .filter(|seconds| *seconds > 0)
                .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
            {
                self.store
                    .set_next_invoice_date(workspace.id, next)
                    .await
                    .map_err(BillingError::Store)?;
            }
            subscription.pending_invoice_item_interval = updated.pending_invoice_item_interval;
        }

        let prices = self.resolve_prices(workspace, tier, interval).await?;

        let Some(invoice) = self
            .ledger
            .upcoming_invoice(&customer_id, &subscription.id)
            .await?
        else {
            warn!(
                workspace_id = workspace.id,
                customer = %customer_id,
                "workspace has no invoice upcoming, will not report overage"
            );
            return Ok(None);
        };

        let lines = self
            .ledger
            .upcoming_invoice_lines(&customer_id, &subscription.id)
            .await?;
        let lines = self.canonical_lines(&customer_id, lines, &prices);
        info!(
            workspace_id = workspace.id,
            customer = %customer_id,
            lines = lines.len(),
            "LEDGER_INTEGRATION_INFO found invoice lines"
        );

        Ok(Some(ReconcileContext {
            customer_id,
            subscription,
            tier,
            interval,
            prices,
            invoice,
            lines,
        }))
    }

    /// Writes overage for every product in reconciliation order. Re-running with unchanged
    /// overage reuses the items found by `prepare` and only re-sets quantities.
    pub async fn apply(
        &self,
        context: &ReconcileContext,
        overages: &WorkspaceOverages,
    ) -> BillingResult<LedgerChanges> {
        let mut changes = LedgerChanges::default();
        for product in ProductType::OVERAGE_ORDER {
            let price = context.prices.get(&product).ok_or_else(|| {
                BillingError::validation(format!("no resolved price for {product}"))
            })?;
            let overage = overages.get(&product).copied().unwrap_or(0);
            if let Err(err) = self
                .reconcile_product(context, price, context.lines.get(&product), overage, &mut changes)
                .await
            {
                error!(
                    ?err,
                    customer = %context.customer_id,
                    product = %product,
                    "BILLING_ERROR error updating overage item"
                );
                return Err(err);
            }
        }
        Ok(changes)
    }

    async fn reconcile_product(
        &self,
        context: &ReconcileContext,
        price: &Price,
        line: Option<&InvoiceLine>,
        overage: i64,
        changes: &mut LedgerChanges,
    ) -> BillingResult<()> {
        let subscription_id = context.subscription.id.as_str();

        if price.recurring.is_some() {
            let existing = line
                .and_then(|line| line.subscription_item.clone())
                .filter(|id| !id.is_empty());
            let item_id = match existing {
                Some(id) => id,
                None => {
                    let key = format!("{subscription_id}:{}:item:{}", price.id, Uuid::new_v4());
                    let item = self
                        .ledger
                        .create_subscription_item(subscription_id, &price.id, &key)
                        .await?;
                    changes.subscription_items_created += 1;
                    item.id
                }
            };
            self.ledger.set_usage_record(&item_id, overage).await?;
            changes.usage_records_set += 1;
            return Ok(());
        }

        match line.and_then(|line| line.invoice_item.as_deref()) {
            Some(invoice_item_id) => {
                self.ledger
                    .update_invoice_item(invoice_item_id, &price.id, overage)
                    .await?;
                changes.invoice_items_updated += 1;
            }
            None => {
                let key = format!(
                    "{}:{subscription_id}:{}:{}",
                    context.customer_id,
                    price.id,
                    Uuid::new_v4()
                );
                self.ledger
                    .create_invoice_item(
                        NewInvoiceItem {
                            customer_id: &context.customer_id,
                            subscription_id,
                            price_id: &price.id,
                            quantity: overage,
                        },
                        &key,
                    )
                    .await?;
                changes.invoice_items_created += 1;
            }
        }
        Ok(())
    }

    /// Prices only reference products by id; swap in the product objects for their metadata.
    async fn fill_products(&self, subscription: &mut Subscription) -> BillingResult<()> {
        let ids: Vec<String> = subscription
            .items
            .data
            .iter()
            .filter_map(|item| match &item.price.product {
                ProductRef::Id(id) => Some(id.clone()),
                ProductRef::Object(_) => None,
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let products = self.ledger.list_products(&ids).await?;
        for item in &mut subscription.items.data {
            if let Some(product) = products
                .iter()
                .find(|product| product.id == item.price.product.id())
            {
                item.price.product = ProductRef::Object(product.clone());
            }
        }
        Ok(())
    }

    async fn resolve_prices(
        &self,
        workspace: &Workspace,
        tier: PlanType,
        interval: SubscriptionInterval,
    ) -> BillingResult<BTreeMap<ProductType, Price>> {
        let keys = price_lookup_keys(
            tier,
            interval,
            workspace.unlimited_members,
            workspace.retention(ProductType::Sessions),
            workspace.retention(ProductType::Errors),
        );
        let lookup_keys: Vec<String> = keys.values().cloned().collect();
        let found = self.ledger.list_prices_by_lookup_keys(&lookup_keys).await?;

        let mut prices = BTreeMap::new();
        for price in found {
            let Some(lookup_key) = price.lookup_key.as_deref() else {
                continue;
            };
            if let Some((product, _)) = keys.iter().find(|(_, key)| key.as_str() == lookup_key) {
                prices.insert(*product, price);
            }
        }

        for product in ProductType::METERED {
            if let Some(price_id) = workspace.settings(product).overage_price_id {
                let price = self.ledger.get_price(&price_id).await?;
                prices.insert(product, price);
            }
        }

        if prices.len() != keys.len() {
            let missing: Vec<&str> = keys
                .iter()
                .filter(|(product, _)| !prices.contains_key(*product))
                .map(|(_, key)| key.as_str())
                .collect();
            return Err(BillingError::validation(format!(
                "cannot report usage - expected {} prices, received {}; missing {missing:?}",
                keys.len(),
                prices.len()
            )));
        }
        Ok(prices)
    }

    /// Graduated prices split one subscription item into a line per tier bucket; only the first
    /// line of each item is kept. Lines without a subscription item are all kept.
    fn canonical_lines(
        &self,
        customer_id: &str,
        lines: Vec<InvoiceLine>,
        prices: &BTreeMap<ProductType, Price>,
    ) -> BTreeMap<ProductType, InvoiceLine> {
        let mut grouped: BTreeMap<String, Vec<InvoiceLine>> = BTreeMap::new();
        for line in lines {
            grouped
                .entry(line.subscription_item.clone().unwrap_or_default())
                .or_default()
                .push(line);
        }

        let mut canonical = BTreeMap::new();
        for (subscription_item, mut group) in grouped {
            if !subscription_item.is_empty() {
                group.truncate(1);
            }
            for line in group {
                let Some(line_price) = line.price.as_ref() else {
                    continue;
                };
                let Some(product) = product_metadata(line_price, &self.legacy).product else {
                    continue;
                };
                let Some(expected) = prices.get(&product) else {
                    continue;
                };
                if line_price.id != expected.id {
                    let err = BillingError::LineMismatch {
                        line: line.id.clone(),
                        existing: line_price.id.clone(),
                        expected: expected.id.clone(),
                    };
                    warn!(
                        %err,
                        customer = %customer_id,
                        product = %product,
                        kind = err.kind().as_str(),
                        "LEDGER_INTEGRATION_WARN mismatched invoice line item"
                    );
                } else {
                    canonical.insert(product, line);
                }
            }
        }
        canonical
    }

    async fn notify_discount_trial(
        &self,
        workspace: &Workspace,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) {
        let Some(discount) = subscription.discount.as_ref() else {
            return;
        };
        let full = discount
            .coupon
            .as_ref()
            .and_then(|coupon| coupon.percent_off)
            .map(|percent| percent >= 100.)
            .unwrap_or(false);
        let Some(end) = discount
            .end
            .filter(|seconds| *seconds != 0)
            .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
        else {
            return;
        };
        if !full {
            return;
        }
        let notification = if end < now + Duration::days(3) {
            NotificationType::LedgerTrialEnding3Days
        } else if end < now + Duration::days(7) {
            NotificationType::LedgerTrialEnding7Days
        } else {
            return;
        };
        send_logged(self.notifier.as_ref(), notification, workspace, None).await;
    }
}
