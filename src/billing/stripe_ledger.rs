use std::future::Future;
use std::time::Duration;

use ::stripe::{Client, RequestStrategy, StripeError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ledger::{
    Customer, Invoice, InvoiceLine, Ledger, LedgerError, List, NewInvoiceItem, PaymentMethod,
    Price, Product, Subscription, SubscriptionItem,
};

const PAGE_SIZE: u64 = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const NO_UPCOMING_INVOICE: &str = "invoice_upcoming_none";

#[derive(Debug, Serialize)]
struct Expand<'a> {
    expand: &'a [&'a str],
}

#[derive(Debug, Serialize)]
struct ListByIds<'a> {
    ids: &'a [String],
    limit: u64,
}

#[derive(Debug, Serialize)]
struct ListByLookupKeys<'a> {
    lookup_keys: &'a [String],
    limit: u64,
}

#[derive(Debug, Serialize)]
struct PendingInterval {
    interval: &'static str,
}

#[derive(Debug, Serialize)]
struct UpdateSubscription {
    pending_invoice_item_interval: PendingInterval,
}

#[derive(Debug, Serialize)]
struct UpcomingInvoiceParams<'a> {
    customer: &'a str,
    subscription: &'a str,
}

#[derive(Debug, Serialize)]
struct UpcomingLinesParams<'a> {
    customer: &'a str,
    subscription: &'a str,
    expand: &'a [&'a str],
    limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    starting_after: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CreateSubscriptionItem<'a> {
    subscription: &'a str,
    price: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateUsageRecord {
    quantity: i64,
    action: &'static str,
}

#[derive(Debug, Serialize)]
struct CreateInvoiceItem<'a> {
    customer: &'a str,
    subscription: &'a str,
    price: &'a str,
    quantity: i64,
}

#[derive(Debug, Serialize)]
struct UpdateInvoiceItem<'a> {
    price: &'a str,
    quantity: i64,
}

#[derive(Debug, Serialize)]
struct ListPaymentMethods<'a> {
    customer: &'a str,
    limit: u64,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

impl From<StripeError> for LedgerError {
    fn from(err: StripeError) -> Self {
        match err {
            StripeError::Stripe(request) => LedgerError::Api {
                status: request.http_status,
                code: request.code.map(|code| code.to_string()),
                message: request
                    .message
                    .unwrap_or_else(|| format!("{:?}", request.error_type)),
            },
            other => LedgerError::Client(other),
        }
    }
}

/// key: billing-ledger-http -> Stripe client behind the ledger seam
pub struct HttpLedger {
    client: Client,
}

impl HttpLedger {
    /// `base_url` is the API host without the version prefix, e.g. `https://api.stripe.com`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, LedgerError> {
        let base_url = base_url.into();
        reqwest::Url::parse(&base_url)
            .map_err(|err| LedgerError::InvalidBaseUrl(format!("{base_url}: {err}")))?;
        Ok(Self {
            client: Client::from_url(base_url.as_str(), api_key),
        })
    }

    fn idempotent(&self, key: &str) -> Client {
        self.client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(key.to_string()))
    }
}

async fn send<T, F>(request: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, StripeError>>,
{
    match tokio::time::timeout(REQUEST_TIMEOUT, request).await {
        Ok(result) => result.map_err(LedgerError::from),
        Err(_) => Err(LedgerError::Timeout(REQUEST_TIMEOUT)),
    }
}

fn get<T, P>(client: &Client, path: &str, params: P) -> impl Future<Output = Result<T, LedgerError>>
where
    T: DeserializeOwned + Send + 'static,
    P: Serialize,
{
    send(client.get_query::<T, P>(path, params))
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn get_customer(&self, customer_id: &str) -> Result<Customer, LedgerError> {
        get(
            &self.client,
            &format!("/customers/{customer_id}"),
            Expand {
                expand: &[
                    "subscriptions",
                    "subscriptions.data.discount",
                    "subscriptions.data.discount.coupon",
                ],
            },
        )
        .await
    }

    async fn list_products(&self, product_ids: &[String]) -> Result<Vec<Product>, LedgerError> {
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }
        let products: List<Product> = get(
            &self.client,
            "/products",
            ListByIds {
                ids: product_ids,
                limit: PAGE_SIZE,
            },
        )
        .await?;
        Ok(products.data)
    }

    async fn list_prices_by_lookup_keys(
        &self,
        lookup_keys: &[String],
    ) -> Result<Vec<Price>, LedgerError> {
        let prices: List<Price> = get(
            &self.client,
            "/prices",
            ListByLookupKeys {
                lookup_keys,
                limit: PAGE_SIZE,
            },
        )
        .await?;
        Ok(prices.data)
    }

    async fn get_price(&self, price_id: &str) -> Result<Price, LedgerError> {
        send(self.client.get::<Price>(&format!("/prices/{price_id}"))).await
    }

    async fn set_monthly_pending_invoice_interval(
        &self,
        subscription_id: &str,
    ) -> Result<Subscription, LedgerError> {
        send(self.client.post_form::<Subscription, _>(
            &format!("/subscriptions/{subscription_id}"),
            UpdateSubscription {
                pending_invoice_item_interval: PendingInterval { interval: "month" },
            },
        ))
        .await
    }

    async fn upcoming_invoice(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<Option<Invoice>, LedgerError> {
        let result = get(
            &self.client,
            "/invoices/upcoming",
            UpcomingInvoiceParams {
                customer: customer_id,
                subscription: subscription_id,
            },
        )
        .await;
        match result {
            Ok(invoice) => Ok(Some(invoice)),
            Err(LedgerError::Api {
                status: 404,
                code: Some(code),
                ..
            }) if code == NO_UPCOMING_INVOICE => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn upcoming_invoice_lines(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<Vec<InvoiceLine>, LedgerError> {
        let mut lines: Vec<InvoiceLine> = Vec::new();
        loop {
            let page: List<InvoiceLine> = get(
                &self.client,
                "/invoices/upcoming/lines",
                UpcomingLinesParams {
                    customer: customer_id,
                    subscription: subscription_id,
                    expand: &["data.price.product"],
                    limit: PAGE_SIZE,
                    starting_after: lines.last().map(|line| line.id.as_str()),
                },
            )
            .await?;
            let has_more = page.has_more && !page.data.is_empty();
            lines.extend(page.data);
            if !has_more {
                break;
            }
        }
        debug!(lines = lines.len(), customer = %customer_id, "fetched upcoming invoice lines");
        Ok(lines)
    }

    async fn create_subscription_item(
        &self,
        subscription_id: &str,
        price_id: &str,
        idempotency_key: &str,
    ) -> Result<SubscriptionItem, LedgerError> {
        send(self.idempotent(idempotency_key).post_form::<SubscriptionItem, _>(
            "/subscription_items",
            CreateSubscriptionItem {
                subscription: subscription_id,
                price: price_id,
            },
        ))
        .await
    }

    async fn set_usage_record(
        &self,
        subscription_item_id: &str,
        quantity: i64,
    ) -> Result<(), LedgerError> {
        let _: Created = send(self.client.post_form::<Created, _>(
            &format!("/subscription_items/{subscription_item_id}/usage_records"),
            CreateUsageRecord {
                quantity,
                action: "set",
            },
        ))
        .await?;
        Ok(())
    }

    async fn create_invoice_item(
        &self,
        item: NewInvoiceItem<'_>,
        idempotency_key: &str,
    ) -> Result<String, LedgerError> {
        let created: Created = send(self.idempotent(idempotency_key).post_form::<Created, _>(
            "/invoiceitems",
            CreateInvoiceItem {
                customer: item.customer_id,
                subscription: item.subscription_id,
                price: item.price_id,
                quantity: item.quantity,
            },
        ))
        .await?;
        Ok(created.id)
    }

    async fn update_invoice_item(
        &self,
        invoice_item_id: &str,
        price_id: &str,
        quantity: i64,
    ) -> Result<(), LedgerError> {
        let _: Created = send(self.client.post_form::<Created, _>(
            &format!("/invoiceitems/{invoice_item_id}"),
            UpdateInvoiceItem {
                price: price_id,
                quantity,
            },
        ))
        .await?;
        Ok(())
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentMethod>, LedgerError> {
        let methods: List<PaymentMethod> = get(
            &self.client,
            "/payment_methods",
            ListPaymentMethods {
                customer: customer_id,
                limit: PAGE_SIZE,
            },
        )
        .await?;
        Ok(methods.data)
    }
}
