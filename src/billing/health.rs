use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use redis::{aio::ConnectionManager, Client};
use serde::Serialize;
use tracing::{error, info};

use crate::error::BillingResult;

use super::ledger::{Invoice, InvoiceStatus, Ledger, PaymentMethod, Subscription, SubscriptionStatus};
use super::models::Workspace;
use super::notifications::{NotificationSender, NotificationType};

/// key: billing-health -> payment issue kinds in classifier priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentIssue {
    SubscriptionDue,
    InvoiceUncollectible,
    InvoiceOpenAttempted,
    NoPaymentMethod,
    PaymentMethodCheckFailed,
}

impl PaymentIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentIssue::SubscriptionDue => "subscription_due",
            PaymentIssue::InvoiceUncollectible => "invoice_uncollectible",
            PaymentIssue::InvoiceOpenAttempted => "invoice_open_attempted",
            PaymentIssue::NoPaymentMethod => "no_payment_method",
            PaymentIssue::PaymentMethodCheckFailed => "payment_method_check_failed",
        }
    }
}

/// Subscription and invoice checks; these never need the payment methods.
pub fn classify_billing_state(
    status: SubscriptionStatus,
    invoice: Option<&Invoice>,
) -> Option<PaymentIssue> {
    if matches!(
        status,
        SubscriptionStatus::Incomplete | SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid
    ) {
        return Some(PaymentIssue::SubscriptionDue);
    }
    let invoice = invoice?;
    match invoice.status {
        Some(InvoiceStatus::Uncollectible) => Some(PaymentIssue::InvoiceUncollectible),
        Some(InvoiceStatus::Open) if invoice.attempt_count > 0 => {
            Some(PaymentIssue::InvoiceOpenAttempted)
        }
        _ => None,
    }
}

pub fn classify_payment_methods(methods: &[PaymentMethod]) -> Option<PaymentIssue> {
    if methods.is_empty() {
        return Some(PaymentIssue::NoPaymentMethod);
    }
    if methods.iter().all(PaymentMethod::failed_card_checks) {
        return Some(PaymentIssue::PaymentMethodCheckFailed);
    }
    None
}

/// key: billing-warning-store -> per-customer escalation state
#[async_trait]
pub trait WarningStore: Send + Sync {
    async fn get_warning(&self, customer_id: &str) -> Result<Option<DateTime<Utc>>>;
    async fn set_warning(&self, customer_id: &str, started_at: Option<DateTime<Utc>>)
        -> Result<()>;
    async fn is_invalid(&self, customer_id: &str) -> Result<bool>;
    async fn set_invalid(&self, customer_id: &str, invalid: bool) -> Result<()>;
}

/// key: billing-warning-store-redis -> warning timestamps as unix milliseconds, zero when clear
#[derive(Clone)]
pub struct RedisWarningStore {
    manager: ConnectionManager,
}

impl RedisWarningStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).context("invalid redis url")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Ok(Self { manager })
    }

    fn warning_key(customer_id: &str) -> String {
        format!("billing-warning-{customer_id}")
    }

    fn invalid_key(customer_id: &str) -> String {
        format!("billing-invalid-{customer_id}")
    }
}

fn encode_warning(started_at: Option<DateTime<Utc>>) -> i64 {
    started_at.map(|at| at.timestamp_millis()).unwrap_or(0)
}

fn decode_warning(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis
        .filter(|millis| *millis > 0)
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}

#[async_trait]
impl WarningStore for RedisWarningStore {
    async fn get_warning(&self, customer_id: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.manager.clone();
        let millis: Option<i64> = redis::cmd("GET")
            .arg(Self::warning_key(customer_id))
            .query_async(&mut conn)
            .await
            .map_err(|err| anyhow!("failed to read billing warning: {err}"))?;
        Ok(decode_warning(millis))
    }

    async fn set_warning(
        &self,
        customer_id: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(Self::warning_key(customer_id))
            .arg(encode_warning(started_at))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| anyhow!("failed to write billing warning: {err}"))
    }

    async fn is_invalid(&self, customer_id: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(Self::invalid_key(customer_id))
            .query_async(&mut conn)
            .await
            .map_err(|err| anyhow!("failed to read billing invalid flag: {err}"))?;
        Ok(value.as_deref() == Some("true"))
    }

    async fn set_invalid(&self, customer_id: &str, invalid: bool) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(Self::invalid_key(customer_id))
            .arg(if invalid { "true" } else { "false" })
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| anyhow!("failed to write billing invalid flag: {err}"))
    }
}

/// What one evaluation did to a customer's escalation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Cleared,
    Warned,
    Heartbeat,
    Invalidated,
    /// State could not be read or the first warning could not be delivered; retried next pass.
    Deferred,
}

/// key: billing-health-monitor -> classification plus warning escalation
pub struct BillingHealthMonitor {
    ledger: Arc<dyn Ledger>,
    warnings: Arc<dyn WarningStore>,
    notifier: Arc<dyn NotificationSender>,
    warning_period: Duration,
}

impl BillingHealthMonitor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        warnings: Arc<dyn WarningStore>,
        notifier: Arc<dyn NotificationSender>,
        warning_period: Duration,
    ) -> Self {
        Self {
            ledger,
            warnings,
            notifier,
            warning_period,
        }
    }

    /// Payment methods are only listed when the subscription and invoice look healthy.
    pub async fn classify(
        &self,
        workspace: &Workspace,
        customer_id: &str,
        subscription: &Subscription,
        invoice: Option<&Invoice>,
    ) -> BillingResult<Option<PaymentIssue>> {
        if !workspace.can_show_billing_issue_banner {
            return Ok(None);
        }
        if let Some(issue) = classify_billing_state(subscription.status, invoice) {
            info!(
                customer = %customer_id,
                issue = issue.as_str(),
                status = ?subscription.status,
                "ledger billing issue detected"
            );
            return Ok(Some(issue));
        }
        let methods = self.ledger.list_payment_methods(customer_id).await?;
        let issue = classify_payment_methods(&methods);
        if let Some(issue) = issue {
            info!(
                customer = %customer_id,
                issue = issue.as_str(),
                methods = methods.len(),
                "payment method issue detected"
            );
        }
        Ok(issue)
    }

    pub async fn process(
        &self,
        workspace: &Workspace,
        customer_id: &str,
        issue: Option<PaymentIssue>,
        now: DateTime<Utc>,
    ) -> HealthTransition {
        let Some(issue) = issue else {
            if let Err(err) = self.warnings.set_warning(customer_id, None).await {
                error!(?err, customer = %customer_id, "BILLING_ERROR failed to clear billing warning");
            }
            if let Err(err) = self.warnings.set_invalid(customer_id, false).await {
                error!(?err, customer = %customer_id, "BILLING_ERROR failed to clear invalid billing flag");
            }
            return HealthTransition::Cleared;
        };

        let started_at = match self.warnings.get_warning(customer_id).await {
            Ok(started_at) => started_at,
            Err(err) => {
                error!(?err, customer = %customer_id, "BILLING_ERROR failed to read billing warning");
                return HealthTransition::Deferred;
            }
        };

        let (started_at, newly_warned) = match started_at {
            Some(started_at) => (started_at, false),
            None => {
                if let Err(err) = self
                    .notifier
                    .send(NotificationType::PaymentIssue, workspace, Some(issue.as_str()))
                    .await
                {
                    error!(
                        ?err,
                        customer = %customer_id,
                        "BILLING_ERROR failed to send billing issue notification"
                    );
                    return HealthTransition::Deferred;
                }
                (now, true)
            }
        };

        if let Err(err) = self.warnings.set_warning(customer_id, Some(started_at)).await {
            error!(?err, customer = %customer_id, "BILLING_ERROR failed to persist billing warning");
        }

        if now - started_at > self.warning_period {
            if !matches!(self.warnings.is_invalid(customer_id).await, Ok(true)) {
                info!(
                    customer = %customer_id,
                    started_at = %started_at,
                    "billing issue outlasted warning period, marking invalid"
                );
                if let Err(err) = self.warnings.set_invalid(customer_id, true).await {
                    error!(?err, customer = %customer_id, "BILLING_ERROR failed to set invalid billing flag");
                }
            }
            return HealthTransition::Invalidated;
        }

        if newly_warned {
            HealthTransition::Warned
        } else {
            HealthTransition::Heartbeat
        }
    }

    /// Classification failures are logged and leave the stored state untouched.
    pub async fn check(
        &self,
        workspace: &Workspace,
        customer_id: &str,
        subscription: &Subscription,
        invoice: Option<&Invoice>,
        now: DateTime<Utc>,
    ) -> Option<HealthTransition> {
        match self
            .classify(workspace, customer_id, subscription, invoice)
            .await
        {
            Ok(issue) => Some(self.process(workspace, customer_id, issue, now).await),
            Err(err) => {
                error!(
                    ?err,
                    customer = %customer_id,
                    "BILLING_ERROR failed to classify billing issue"
                );
                None
            }
        }
    }
}
