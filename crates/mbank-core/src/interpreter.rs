use crate::error::BankError;
use crate::session::TurnRecord;
use async_trait::async_trait;
use serde::Serialize;

/// Context handed to the interpreter alongside a phrasing instruction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NarrationContext {
    pub entity_name: Option<String>,
    pub history: Vec<TurnRecord>,
}

/// Opaque natural-language collaborator.
///
/// The core hands it an instruction plus conversation context and forwards
/// the returned prose to the customer verbatim. Nothing in the core parses
/// that prose for control decisions; the unlock-phrase check runs on raw
/// inbound text before any interpreter involvement.
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn narrate(
        &self,
        instruction: &str,
        context: &NarrationContext,
    ) -> Result<String, BankError>;
}
