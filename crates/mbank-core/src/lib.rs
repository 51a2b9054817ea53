//! Metal Bank core: conversational routing over a persistent loan ledger.
//!
//! One engine serves every session. The routing gate decides, per turn,
//! between silent delegation, the standard banking workflow, and refusal;
//! the ledger gates its destructive path behind an explicit confirmation
//! round-trip.

#![deny(unsafe_code)]

pub mod delegate;
pub mod error;
pub mod interpreter;
pub mod ledger;
pub mod pricing;
pub mod protocol;
pub mod risk;
pub mod router;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod workflow;

pub use delegate::HiddenDelegate;
pub use error::BankError;
pub use interpreter::{Interpreter, NarrationContext};
pub use ledger::{normalize_name, LoanBook, LoanRecord};
pub use pricing::interest_rate;
pub use protocol::{ConfirmationAction, ConfirmationPrompt, ConfirmationSchema, Confirmer};
pub use risk::{RiskLookup, RiskProfile};
pub use router::{
    BankingCommand, Decision, Gate, IntentClass, IntentClassifier, RefusalReason, UNLOCK_PHRASE,
};
pub use runtime::{
    BankEngine, TurnDisposition, TurnRequest, TurnResponse, CANCELLATION_NOT_COMPLETED_REPLY,
};
pub use session::{SessionHandle, SessionKey, SessionState, SessionStore, TurnRecord, TurnRole};
pub use storage::{CancelOutcome, LedgerStorageConfig, LoanLedger};
pub use workflow::{normalize_entity, WorkflowCoordinator, WorkflowReply};
