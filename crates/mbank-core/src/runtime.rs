use crate::delegate::HiddenDelegate;
use crate::error::BankError;
use crate::interpreter::{Interpreter, NarrationContext};
use crate::risk::RiskLookup;
use crate::router::{Decision, Gate, IntentClassifier, RefusalReason};
use crate::session::{SessionKey, SessionStore, TurnRole};
use crate::storage::LoanLedger;
use crate::workflow::{normalize_entity, WorkflowCoordinator, WorkflowReply};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Shown when the hidden delegate cannot be reached. Deliberately terse:
/// a Silent turn carries no banker prose, not even in failure.
const DELEGATE_UNREACHABLE_REPLY: &str =
    "The one you seek cannot be reached at this hour. Return later.";

/// Soft failure for the standard path when a collaborator is down.
const ARCHIVES_UNREACHABLE_REPLY: &str =
    "The Bank's records are momentarily beyond reach. Present your request again shortly.";

/// Shown when a gated cancellation was not completed, for any reason.
pub const CANCELLATION_NOT_COMPLETED_REPLY: &str =
    "The cancellation was not completed. The ledger stands as written.";

/// One inbound conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub app: String,
    pub user_id: String,
    pub session_id: String,
    pub message: String,
}

impl TurnRequest {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.app, &self.user_id, &self.session_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDisposition {
    Delegated,
    Standard,
    Refused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub turn_id: String,
    pub disposition: TurnDisposition,
    pub reply: String,
}

/// Front-line dispatcher: one engine serves every session.
///
/// Turns for the same session serialize on the session handle; turns for
/// different sessions share nothing but the ledger.
pub struct BankEngine {
    sessions: SessionStore,
    gate: Gate,
    classifier: Arc<dyn IntentClassifier>,
    workflow: WorkflowCoordinator,
    delegate: Arc<dyn HiddenDelegate>,
    interpreter: Arc<dyn Interpreter>,
    ledger: Arc<LoanLedger>,
}

impl BankEngine {
    pub fn new(
        ledger: Arc<LoanLedger>,
        risk: Arc<dyn RiskLookup>,
        classifier: Arc<dyn IntentClassifier>,
        delegate: Arc<dyn HiddenDelegate>,
        interpreter: Arc<dyn Interpreter>,
    ) -> Self {
        Self {
            sessions: SessionStore::new(),
            gate: Gate::new(classifier.clone()),
            classifier,
            workflow: WorkflowCoordinator::new(risk, ledger.clone()),
            delegate,
            interpreter,
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<LoanLedger> {
        &self.ledger
    }

    /// Handle one conversational turn end to end.
    ///
    /// Only storage failures surface as errors; every other condition maps
    /// to a reply, so the dispatcher always has something to say (or, on the
    /// silent path, exactly one thing).
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnResponse, BankError> {
        let key = request.session_key();
        let handle = self.sessions.get_or_create(&key).await;
        let mut session = handle.lock().await;

        let decision = self.gate.route(&request.message, &mut session);
        session.record_turn(TurnRole::Customer, &request.message);

        let (disposition, reply) = match decision {
            Decision::Silent => {
                // Hard contract: the delegate's words are the only output of
                // this turn. No greeting, no acknowledgment, no narration.
                let reply = match self
                    .delegate
                    .commission(&request.message, session.history())
                    .await
                {
                    Ok(text) => text,
                    Err(err) if err.is_remote_unavailable() => {
                        warn!(error = %err, "hidden delegate unreachable");
                        DELEGATE_UNREACHABLE_REPLY.to_string()
                    }
                    Err(err) => return Err(err),
                };
                session.record_turn(TurnRole::Delegate, &reply);
                (TurnDisposition::Delegated, reply)
            }
            Decision::Standard(command) => {
                if let Some(raw) = self.classifier.extract_entity(&request.message) {
                    session.entity_name = Some(normalize_entity(&raw));
                }

                let reply = match self.workflow.execute(&command, &mut session).await {
                    Ok(outcome) => {
                        let (instruction, fallback) = narration_for(&outcome);
                        self.narrate(&instruction, &fallback, &session_context(&session))
                            .await
                    }
                    Err(BankError::Validation(reason)) => {
                        // Recovered locally: ask for what is missing rather
                        // than surfacing a raw failure.
                        info!(%reason, "validation recovered by asking the customer");
                        let instruction = format!(
                            "Politely ask the customer to restate the request: {reason}."
                        );
                        self.narrate(
                            &instruction,
                            "The Bank requires the request to be stated precisely. Kindly state it again.",
                            &session_context(&session),
                        )
                        .await
                    }
                    Err(err) if err.is_remote_unavailable() => {
                        warn!(error = %err, "collaborator unreachable mid-workflow");
                        ARCHIVES_UNREACHABLE_REPLY.to_string()
                    }
                    Err(err) => return Err(err),
                };
                session.record_turn(TurnRole::Bank, &reply);
                (TurnDisposition::Standard, reply)
            }
            Decision::Refuse(reason) => {
                let (instruction, fallback) = refusal_narration(reason);
                let reply = self
                    .narrate(instruction, fallback, &session_context(&session))
                    .await;
                session.record_turn(TurnRole::Bank, &reply);
                (TurnDisposition::Refused, reply)
            }
        };

        Ok(TurnResponse {
            turn_id: Uuid::new_v4().to_string(),
            disposition,
            reply,
        })
    }

    /// Permanently remove one session's state.
    pub async fn delete_session(&self, key: &SessionKey) -> bool {
        self.sessions.delete(key).await
    }

    async fn narrate(
        &self,
        instruction: &str,
        fallback: &str,
        context: &NarrationContext,
    ) -> String {
        match self.interpreter.narrate(instruction, context).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "interpreter unavailable; using fallback phrasing");
                fallback.to_string()
            }
        }
    }
}

fn session_context(session: &crate::session::SessionState) -> NarrationContext {
    NarrationContext {
        entity_name: session.entity_name.clone(),
        history: session.history().to_vec(),
    }
}

/// Phrasing instruction plus deterministic fallback for a workflow outcome.
///
/// The instruction carries the offered rate and record facts, never the raw
/// war-risk or reputation scores; those stay behind this boundary.
fn narration_for(reply: &WorkflowReply) -> (String, String) {
    match reply {
        WorkflowReply::NeedEntityName => (
            "Ask which lord, house, or city the Bank has the honor of addressing.".to_string(),
            "The Bank must know with whom it deals. Which lord, house, or city do you speak for?"
                .to_string(),
        ),
        WorkflowReply::Quoted {
            entity_name,
            rate_percent,
        } => (
            format!(
                "Present the Bank's offer to {entity_name}: an interest rate of \
                 {rate_percent}% on the requested principal. State the rate plainly \
                 and invite acceptance."
            ),
            format!(
                "The Bank has weighed the matter. It offers {entity_name} terms at \
                 {rate_percent}% interest. Does this suffice?"
            ),
        ),
        WorkflowReply::NeedQuoteFirst => (
            "Explain that terms must be quoted before a loan is written, and offer to assess one now."
                .to_string(),
            "No terms have been quoted. The Bank must first assess the rate; shall it do so?"
                .to_string(),
        ),
        WorkflowReply::LoanOpened { record } => (
            format!(
                "Confirm that a loan of {} dragons at {}% interest has been entered \
                 into the ledger under '{}'.",
                record.amount, record.interest_rate_percent, record.name
            ),
            format!(
                "It is written. {} dragons at {}% interest, recorded against '{}'.",
                record.amount, record.interest_rate_percent, record.name
            ),
        ),
        WorkflowReply::Loans { records } => {
            if records.is_empty() {
                (
                    "State that the ledger holds no records for this entity.".to_string(),
                    "The ledger holds no record of debt in that name.".to_string(),
                )
            } else {
                let lines = records
                    .iter()
                    .map(|r| {
                        format!(
                            "loan {}: {} dragons at {}%, repaid {}, {}",
                            r.id,
                            r.amount,
                            r.interest_rate_percent,
                            r.repaid_amount,
                            if r.loan_open { "open" } else { "settled" }
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                (
                    format!("Recite the customer's ledger entries: {lines}."),
                    format!("The ledger records: {lines}."),
                )
            }
        }
        WorkflowReply::RepaymentRecorded { record } => (
            format!(
                "Acknowledge the repayment on loan {}: {} of {} dragons now repaid{}.",
                record.id,
                record.repaid_amount,
                record.amount,
                if record.loan_open {
                    ""
                } else {
                    "; the loan is settled"
                }
            ),
            format!(
                "The payment is entered. Loan {} stands at {} of {} dragons repaid.",
                record.id, record.repaid_amount, record.amount
            ),
        ),
        WorkflowReply::NothingOutstanding => (
            "State that no open loan exists to repay.".to_string(),
            "The ledger shows no open loan in that name; there is nothing to repay.".to_string(),
        ),
    }
}

fn refusal_narration(reason: RefusalReason) -> (&'static str, &'static str) {
    match reason {
        RefusalReason::GenericDenial => (
            "Politely and absolutely deny knowledge of any such services; the Bank deals only in coin and contracts.",
            "The Metal Bank deals in coin and contracts, nothing besides. The Bank knows nothing of such matters.",
        ),
        RefusalReason::OutOfDomain => (
            "Politely state that the Bank concerns itself only with the management of assets and the servicing of debt.",
            "The Metal Bank concerns itself with the management of assets and the servicing of debt. It cannot help with this.",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{BankingCommand, IntentClass};
    use crate::session::TurnRecord;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct KeywordStub;

    impl IntentClassifier for KeywordStub {
        fn classify(&self, message: &str) -> IntentClass {
            let lowered = message.to_lowercase();
            if lowered.contains("loan") {
                IntentClass::Banking(BankingCommand::RequestQuote)
            } else if lowered.contains("enemy") {
                IntentClass::ClandestineInquiry
            } else {
                IntentClass::Unrelated
            }
        }

        fn extract_entity(&self, message: &str) -> Option<String> {
            message
                .split_whitespace()
                .skip_while(|word| !word.eq_ignore_ascii_case("house"))
                .nth(1)
                .map(|name| format!("house {name}"))
        }
    }

    struct CountingDelegate {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HiddenDelegate for CountingDelegate {
        async fn commission(
            &self,
            _message: &str,
            _history: &[TurnRecord],
        ) -> Result<String, BankError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("A man hears. Name the work and the price shall be named.".to_string())
        }
    }

    struct DownDelegate;

    #[async_trait]
    impl HiddenDelegate for DownDelegate {
        async fn commission(
            &self,
            _message: &str,
            _history: &[TurnRecord],
        ) -> Result<String, BankError> {
            Err(BankError::remote("hidden-delegate", "no route to host"))
        }
    }

    struct EchoInterpreter;

    #[async_trait]
    impl Interpreter for EchoInterpreter {
        async fn narrate(
            &self,
            instruction: &str,
            _context: &NarrationContext,
        ) -> Result<String, BankError> {
            Ok(instruction.to_string())
        }
    }

    struct DownInterpreter;

    #[async_trait]
    impl Interpreter for DownInterpreter {
        async fn narrate(
            &self,
            _instruction: &str,
            _context: &NarrationContext,
        ) -> Result<String, BankError> {
            Err(BankError::remote("interpreter", "model offline"))
        }
    }

    struct StubRisk;

    #[async_trait]
    impl RiskLookup for StubRisk {
        async fn lookup(&self, entity_name: &str) -> Result<crate::risk::RiskProfile, BankError> {
            Ok(crate::risk::RiskProfile::new(entity_name, 0.2, 0.8))
        }
    }

    async fn engine_with(
        delegate: Arc<dyn HiddenDelegate>,
        interpreter: Arc<dyn Interpreter>,
    ) -> BankEngine {
        BankEngine::new(
            Arc::new(LoanLedger::in_memory().await),
            Arc::new(StubRisk),
            Arc::new(KeywordStub),
            delegate,
            interpreter,
        )
    }

    fn turn(message: &str) -> TurnRequest {
        TurnRequest {
            app: "mbank".to_string(),
            user_id: "arya".to_string(),
            session_id: "s-1".to_string(),
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn silent_turns_carry_only_the_delegates_words() {
        let delegate = Arc::new(CountingDelegate {
            calls: AtomicUsize::new(0),
        });
        let engine = engine_with(delegate.clone(), Arc::new(EchoInterpreter)).await;

        let response = engine.handle_turn(turn("valar morghulis")).await.unwrap();
        assert_eq!(response.disposition, TurnDisposition::Delegated);
        assert_eq!(
            response.reply,
            "A man hears. Name the work and the price shall be named."
        );

        // Every later turn stays silent, whatever the content.
        let response = engine.handle_turn(turn("I need a loan")).await.unwrap();
        assert_eq!(response.disposition, TurnDisposition::Delegated);
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clandestine_inquiry_without_phrase_never_reaches_the_delegate() {
        let delegate = Arc::new(CountingDelegate {
            calls: AtomicUsize::new(0),
        });
        let engine = engine_with(delegate.clone(), Arc::new(EchoInterpreter)).await;

        let response = engine
            .handle_turn(turn("I have an enemy that needs attention"))
            .await
            .unwrap();

        assert_eq!(response.disposition, TurnDisposition::Refused);
        assert!(response.reply.contains("coin and contracts"));
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn standard_turn_quotes_through_the_interpreter() {
        let engine = engine_with(
            Arc::new(CountingDelegate {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(EchoInterpreter),
        )
        .await;

        let response = engine
            .handle_turn(turn("House Stark requests a loan"))
            .await
            .unwrap();

        assert_eq!(response.disposition, TurnDisposition::Standard);
        assert!(response.reply.contains("stark"));
        assert!(response.reply.contains("28%"));
    }

    #[tokio::test]
    async fn delegate_outage_yields_a_soft_reply_not_an_error() {
        let engine = engine_with(Arc::new(DownDelegate), Arc::new(EchoInterpreter)).await;

        engine.handle_turn(turn("valar morghulis")).await.unwrap();
        let response = engine.handle_turn(turn("anything")).await.unwrap();

        assert_eq!(response.disposition, TurnDisposition::Delegated);
        assert_eq!(response.reply, DELEGATE_UNREACHABLE_REPLY);
    }

    #[tokio::test]
    async fn interpreter_outage_falls_back_to_fixed_phrasing() {
        let engine = engine_with(
            Arc::new(CountingDelegate {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(DownInterpreter),
        )
        .await;

        let response = engine
            .handle_turn(turn("House Stark requests a loan"))
            .await
            .unwrap();

        assert_eq!(response.disposition, TurnDisposition::Standard);
        assert!(response.reply.contains("28%"));
    }

    #[tokio::test]
    async fn unrelated_chatter_is_out_of_domain() {
        let engine = engine_with(
            Arc::new(CountingDelegate {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(EchoInterpreter),
        )
        .await;

        let response = engine
            .handle_turn(turn("tell me a story about dragons of old"))
            .await
            .unwrap();
        assert_eq!(response.disposition, TurnDisposition::Refused);
    }

    #[tokio::test]
    async fn deleting_a_session_resets_discovery() {
        let engine = engine_with(
            Arc::new(CountingDelegate {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(EchoInterpreter),
        )
        .await;

        engine.handle_turn(turn("valar morghulis")).await.unwrap();
        let request = turn("I need a loan");
        assert!(engine.delete_session(&request.session_key()).await);

        let response = engine.handle_turn(request).await.unwrap();
        assert_eq!(response.disposition, TurnDisposition::Standard);
    }
}
