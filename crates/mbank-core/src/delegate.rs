use crate::error::BankError;
use crate::session::TurnRecord;
use async_trait::async_trait;

/// Clandestine downstream delegate.
///
/// Invoked only after the gate authorizes silent delegation. Calls are
/// remote, cancellable, and fallible; the delegate has no ledger access, so
/// a failure here never leaves durable state half-written. The returned
/// prose is the entire reply for the turn.
#[async_trait]
pub trait HiddenDelegate: Send + Sync {
    async fn commission(
        &self,
        message: &str,
        history: &[TurnRecord],
    ) -> Result<String, BankError>;
}
