use crate::error::BankError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Reply shape advertised with every confirmation prompt: a single boolean
/// field named `confirmed`. Serialized as `{"confirmed": "bool"}` so clients
/// can render the prompt without out-of-band knowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationSchema {
    pub confirmed: String,
}

impl Default for ConfirmationSchema {
    fn default() -> Self {
        Self {
            confirmed: "bool".to_string(),
        }
    }
}

/// Outbound half of the confirmation round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationPrompt {
    pub message: String,
    pub schema: ConfirmationSchema,
}

impl ConfirmationPrompt {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            schema: ConfirmationSchema::default(),
        }
    }

    /// Prompt for the confirmation-gated cancellation path.
    pub fn cancel_loans(name: &str, count: usize) -> Self {
        Self::new(format!(
            "Cancel {count} open loan(s) held by '{name}'? The records are struck from the ledger and cannot be restored."
        ))
    }
}

/// Inbound half of the round-trip. Only `accept` authorizes the destructive
/// operation; `decline` and `error` both leave the ledger untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationAction {
    Accept,
    Decline,
    Error,
}

/// Suspension point for destructive operations.
///
/// Implementations may park the returned future while an external actor
/// answers. Callers bound the wait with a timeout and treat elapsed time as
/// a decline, so a confirmer is allowed to pend forever.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, prompt: ConfirmationPrompt) -> Result<ConfirmationAction, BankError>;
}
