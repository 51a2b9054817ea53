use crate::session::SessionState;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Fixed unlock phrase, matched case-insensitively as a substring of the raw
/// inbound message. Interpreter output is never consulted for this check.
pub const UNLOCK_PHRASE: &str = "valar morghulis";

/// What the customer is asking the standard workflow to do.
#[derive(Debug, Clone, PartialEq)]
pub enum BankingCommand {
    RequestQuote,
    OpenLoan { amount: f64 },
    ShowLoans,
    Repay { amount: f64 },
}

/// Three-way intent classification consumed by the gate.
///
/// How the classification is produced (keywords locally, a model remotely)
/// is the classifier's business; the gate branches on the variant alone and
/// never inspects the classifier's phrasing.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentClass {
    Banking(BankingCommand),
    ClandestineInquiry,
    Unrelated,
}

/// Lightweight intent classification boundary.
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, message: &str) -> IntentClass;

    /// Best-effort entity-name extraction from the raw message; `None` when
    /// no name is mentioned. Normalization happens in the workflow, not here.
    fn extract_entity(&self, message: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    GenericDenial,
    OutOfDomain,
}

/// Routing decision for one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Delegate to the hidden service. Hard contract: the caller must emit
    /// no other generated text for this turn, or the secrecy of the service
    /// leaks through the acknowledgment.
    Silent,
    /// Standard banking workflow, carrying the parsed command.
    Standard(BankingCommand),
    Refuse(RefusalReason),
}

/// The routing gate: decides the path for each turn and is the sole writer
/// of the session's secret-discovery flag.
pub struct Gate {
    classifier: Arc<dyn IntentClassifier>,
}

impl Gate {
    pub fn new(classifier: Arc<dyn IntentClassifier>) -> Self {
        Self { classifier }
    }

    /// Decide the path for one inbound message.
    ///
    /// Priority order, first match wins: persisted discovery flag, unlock
    /// phrase in the raw text, then the three-way classification. Never
    /// fails: empty or unparseable input lands on out-of-domain refusal.
    pub fn route(&self, message: &str, session: &mut SessionState) -> Decision {
        if session.secret_discovered() {
            return Decision::Silent;
        }

        if message.to_lowercase().contains(UNLOCK_PHRASE) {
            session.mark_secret_discovered();
            info!("unlock phrase observed; session delegates silently from now on");
            return Decision::Silent;
        }

        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Decision::Refuse(RefusalReason::OutOfDomain);
        }

        match self.classifier.classify(trimmed) {
            IntentClass::Banking(command) => {
                debug!(?command, "routed to standard workflow");
                Decision::Standard(command)
            }
            IntentClass::ClandestineInquiry => Decision::Refuse(RefusalReason::GenericDenial),
            IntentClass::Unrelated => Decision::Refuse(RefusalReason::OutOfDomain),
        }
    }
}
