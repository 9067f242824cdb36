use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::models::Workspace;

/// key: billing-notifications -> every message the engine can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
    SessionsOverage,
    ErrorsOverage,
    LogsOverage,
    TracesOverage,
    MetricsOverage,
    TrialEnded,
    TrialEnding7Days,
    LedgerTrialEnding3Days,
    LedgerTrialEnding7Days,
    PaymentIssue,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::SessionsOverage => "sessions_overage",
            NotificationType::ErrorsOverage => "errors_overage",
            NotificationType::LogsOverage => "logs_overage",
            NotificationType::TracesOverage => "traces_overage",
            NotificationType::MetricsOverage => "metrics_overage",
            NotificationType::TrialEnded => "trial_ended",
            NotificationType::TrialEnding7Days => "trial_ending_7_days",
            NotificationType::LedgerTrialEnding3Days => "ledger_trial_ending_3_days",
            NotificationType::LedgerTrialEnding7Days => "ledger_trial_ending_7_days",
            NotificationType::PaymentIssue => "payment_issue",
        }
    }
}

/// key: billing-notification-sender -> outbound customer messaging
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        kind: NotificationType,
        workspace: &Workspace,
        detail: Option<&str>,
    ) -> Result<()>;
}

/// Sends and swallows the failure; callers never abort on notification errors.
pub async fn send_logged(
    sender: &dyn NotificationSender,
    kind: NotificationType,
    workspace: &Workspace,
    detail: Option<&str>,
) -> bool {
    match sender.send(kind, workspace, detail).await {
        Ok(()) => {
            info!(
                workspace_id = workspace.id,
                notification = kind.as_str(),
                "billing notification sent"
            );
            true
        }
        Err(err) => {
            warn!(
                ?err,
                workspace_id = workspace.id,
                notification = kind.as_str(),
                "failed to send billing notification"
            );
            false
        }
    }
}

/// Used when no webhook is configured.
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(
        &self,
        kind: NotificationType,
        workspace: &Workspace,
        detail: Option<&str>,
    ) -> Result<()> {
        info!(
            workspace_id = workspace.id,
            notification = kind.as_str(),
            detail,
            "billing notification (no webhook configured)"
        );
        Ok(())
    }
}

/// key: billing-notification-webhook -> JSON POST per notification
pub struct WebhookNotificationSender {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotificationSender {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build notification client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSender for WebhookNotificationSender {
    async fn send(
        &self,
        kind: NotificationType,
        workspace: &Workspace,
        detail: Option<&str>,
    ) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&json!({
                "type": kind.as_str(),
                "workspace_id": workspace.id,
                "workspace_name": workspace.name,
                "detail": detail,
            }))
            .send()
            .await
            .context("failed to reach notification webhook")?
            .error_for_status()
            .context("notification webhook rejected request")?;
        Ok(())
    }
}
