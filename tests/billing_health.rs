mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Duration;
use usage_billing::billing::health::{BillingHealthMonitor, HealthTransition, PaymentIssue};
use usage_billing::billing::ledger::{
    Invoice, InvoiceStatus, List, Subscription, SubscriptionStatus,
};
use usage_billing::billing::models::PlanType;
use usage_billing::billing::notifications::NotificationType;

use support::{
    customer_id, now, paying_workspace, FakeLedger, MemoryWarningStore, RecordingNotifier,
};

struct Harness {
    ledger: Arc<FakeLedger>,
    warnings: Arc<MemoryWarningStore>,
    notifier: Arc<RecordingNotifier>,
    monitor: BillingHealthMonitor,
}

fn harness() -> Harness {
    let ledger = Arc::new(FakeLedger::default());
    let warnings = Arc::new(MemoryWarningStore::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = BillingHealthMonitor::new(
        ledger.clone(),
        warnings.clone(),
        notifier.clone(),
        Duration::days(7),
    );
    Harness {
        ledger,
        warnings,
        notifier,
        monitor,
    }
}

fn subscription(status: SubscriptionStatus) -> Subscription {
    Subscription {
        id: "sub_health".into(),
        status,
        items: List::default(),
        discount: None,
        pending_invoice_item_interval: None,
        next_pending_invoice_item_invoice: None,
    }
}

// key: billing-health-tests -> warning escalation window
#[tokio::test]
async fn issue_escalates_after_the_warning_period() {
    let h = harness();
    let workspace = paying_workspace(1, PlanType::Startup);
    let customer = customer_id(1);
    let issue = Some(PaymentIssue::NoPaymentMethod);
    let start = now();

    let first = h.monitor.process(&workspace, &customer, issue, start).await;
    assert_eq!(first, HealthTransition::Warned);
    assert_eq!(h.warnings.warnings.lock().unwrap()[&customer], start);

    let day_three = h
        .monitor
        .process(&workspace, &customer, issue, start + Duration::days(3))
        .await;
    assert_eq!(day_three, HealthTransition::Heartbeat);
    assert_eq!(h.warnings.warnings.lock().unwrap()[&customer], start);

    let boundary = h
        .monitor
        .process(&workspace, &customer, issue, start + Duration::days(7))
        .await;
    assert_eq!(boundary, HealthTransition::Heartbeat);
    assert!(h.warnings.invalid.lock().unwrap().get(&customer).is_none());

    let past = h
        .monitor
        .process(
            &workspace,
            &customer,
            issue,
            start + Duration::days(7) + Duration::seconds(1),
        )
        .await;
    assert_eq!(past, HealthTransition::Invalidated);
    assert_eq!(h.warnings.invalid.lock().unwrap()[&customer], true);

    let sent = h.notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0],
        (
            NotificationType::PaymentIssue,
            1,
            Some("no_payment_method".to_string())
        )
    );
}

#[tokio::test]
async fn resolved_issue_clears_state_and_restarts_the_clock() {
    let h = harness();
    let workspace = paying_workspace(2, PlanType::Startup);
    let customer = customer_id(2);
    let issue = Some(PaymentIssue::InvoiceUncollectible);

    h.monitor.process(&workspace, &customer, issue, now()).await;
    h.monitor
        .process(&workspace, &customer, issue, now() + Duration::days(8))
        .await;
    assert_eq!(h.warnings.invalid.lock().unwrap()[&customer], true);

    let cleared = h
        .monitor
        .process(&workspace, &customer, None, now() + Duration::days(9))
        .await;
    assert_eq!(cleared, HealthTransition::Cleared);
    assert!(h.warnings.warnings.lock().unwrap().is_empty());
    assert_eq!(h.warnings.invalid.lock().unwrap()[&customer], false);

    let again = h
        .monitor
        .process(&workspace, &customer, issue, now() + Duration::days(10))
        .await;
    assert_eq!(again, HealthTransition::Warned);
    assert_eq!(h.notifier.kinds().len(), 2);
}

#[tokio::test]
async fn failed_first_notification_is_retried_next_pass() {
    let h = harness();
    let workspace = paying_workspace(3, PlanType::Basic);
    let customer = customer_id(3);
    let issue = Some(PaymentIssue::SubscriptionDue);

    h.notifier.failing.store(true, Ordering::SeqCst);
    let deferred = h.monitor.process(&workspace, &customer, issue, now()).await;
    assert_eq!(deferred, HealthTransition::Deferred);
    assert!(h.warnings.warnings.lock().unwrap().is_empty());

    h.notifier.failing.store(false, Ordering::SeqCst);
    let warned = h
        .monitor
        .process(&workspace, &customer, issue, now() + Duration::hours(1))
        .await;
    assert_eq!(warned, HealthTransition::Warned);
}

#[tokio::test]
async fn unreadable_warning_state_defers() {
    let h = harness();
    h.warnings.failing_reads.store(true, Ordering::SeqCst);
    let transition = h
        .monitor
        .process(
            &paying_workspace(4, PlanType::Basic),
            &customer_id(4),
            Some(PaymentIssue::NoPaymentMethod),
            now(),
        )
        .await;
    assert_eq!(transition, HealthTransition::Deferred);
    assert!(h.notifier.kinds().is_empty());
}

#[tokio::test]
async fn subscription_state_is_checked_before_payment_methods() {
    let h = harness();
    let workspace = paying_workspace(5, PlanType::Startup);
    let transition = h
        .monitor
        .check(
            &workspace,
            &customer_id(5),
            &subscription(SubscriptionStatus::PastDue),
            None,
            now(),
        )
        .await;
    assert_eq!(transition, Some(HealthTransition::Warned));
    assert_eq!(h.ledger.state.lock().unwrap().payment_method_calls, 0);
    assert_eq!(
        h.notifier.sent.lock().unwrap()[0].2.as_deref(),
        Some("subscription_due")
    );
}

#[tokio::test]
async fn attempted_open_invoice_and_missing_payment_method_are_issues() {
    let h = harness();
    let workspace = paying_workspace(6, PlanType::Startup);
    let open = Invoice {
        id: Some("in_open".into()),
        status: Some(InvoiceStatus::Open),
        attempt_count: 2,
    };
    let issue = h
        .monitor
        .classify(
            &workspace,
            &customer_id(6),
            &subscription(SubscriptionStatus::Active),
            Some(&open),
        )
        .await
        .unwrap();
    assert_eq!(issue, Some(PaymentIssue::InvoiceOpenAttempted));

    let issue = h
        .monitor
        .classify(
            &workspace,
            &customer_id(6),
            &subscription(SubscriptionStatus::Active),
            None,
        )
        .await
        .unwrap();
    assert_eq!(issue, Some(PaymentIssue::NoPaymentMethod));
    assert_eq!(h.ledger.state.lock().unwrap().payment_method_calls, 1);
}

#[tokio::test]
async fn workspaces_without_the_banner_are_never_flagged() {
    let h = harness();
    let mut workspace = paying_workspace(7, PlanType::Startup);
    workspace.can_show_billing_issue_banner = false;
    let transition = h
        .monitor
        .check(
            &workspace,
            &customer_id(7),
            &subscription(SubscriptionStatus::Unpaid),
            None,
            now(),
        )
        .await;
    assert_eq!(transition, Some(HealthTransition::Cleared));
    assert!(h.notifier.kinds().is_empty());
}
