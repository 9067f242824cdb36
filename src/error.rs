use thiserror::Error;

use crate::billing::ledger::LedgerError;
use crate::billing::models::ProductType;

/// How a failure should be treated by operators and by the next scheduled pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed billing state; needs manual intervention.
    Validation,
    /// A collaborator request failed; the workspace is retried next pass.
    Upstream,
    /// Ledger drift that is logged but does not abort reconciliation.
    Inconsistency,
    /// A quantity does not fit the receiving service's numeric range.
    Overflow,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Inconsistency => "inconsistency",
            ErrorKind::Overflow => "overflow",
        }
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("BILLING_ERROR {0}")]
    Validation(String),
    #[error("workspace {0} not found")]
    WorkspaceNotFound(i32),
    #[error("workspace store error: {0:#}")]
    Store(anyhow::Error),
    #[error("failed to read {product} meter: {source:#}")]
    Meter {
        product: ProductType,
        source: anyhow::Error,
    },
    #[error("ledger request failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("invoice line {line} bills {existing}, expected {expected}")]
    LineMismatch {
        line: String,
        existing: String,
        expected: String,
    },
    #[error("{product} quantity {quantity} overflows the marketplace range")]
    Overflow { product: ProductType, quantity: i64 },
}

impl BillingError {
    pub fn validation(message: impl Into<String>) -> Self {
        BillingError::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::Validation(_) | BillingError::WorkspaceNotFound(_) => {
                ErrorKind::Validation
            }
            BillingError::Store(_) | BillingError::Meter { .. } | BillingError::Ledger(_) => {
                ErrorKind::Upstream
            }
            BillingError::LineMismatch { .. } => ErrorKind::Inconsistency,
            BillingError::Overflow { .. } => ErrorKind::Overflow,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Upstream
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
