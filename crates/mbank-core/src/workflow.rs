use crate::error::BankError;
use crate::ledger::LoanRecord;
use crate::pricing;
use crate::risk::RiskLookup;
use crate::router::BankingCommand;
use crate::session::SessionState;
use crate::storage::LoanLedger;
use std::sync::Arc;
use tracing::debug;

/// Strip honorifics and place prefixes from a mentioned entity name, then
/// lower-case it: "House Stark" and "the city of Pentos" become "stark" and
/// "pentos" before touching the risk service or the ledger.
pub fn normalize_entity(raw: &str) -> String {
    let name = raw.trim().to_lowercase();
    let name = name.trim_matches(|c: char| ".,:;!?'\"".contains(c));
    for prefix in ["the city of ", "city of ", "house ", "lord ", "lady ", "ser "] {
        if let Some(rest) = name.strip_prefix(prefix) {
            return rest.trim().to_string();
        }
    }
    name.trim().to_string()
}

/// Typed result of one standard-path step.
///
/// These are internal facts; the engine narrates them into customer-facing
/// prose. Raw risk scores never appear here, so they cannot leak across the
/// presentation boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowReply {
    /// No entity name on file; ask rather than guess.
    NeedEntityName,
    Quoted {
        entity_name: String,
        rate_percent: f64,
    },
    /// Loan requested with no quoted rate in the session.
    NeedQuoteFirst,
    LoanOpened {
        record: LoanRecord,
    },
    Loans {
        records: Vec<LoanRecord>,
    },
    RepaymentRecorded {
        record: LoanRecord,
    },
    /// Repayment requested but no open loan exists.
    NothingOutstanding,
}

/// Drives the standard multi-step banking sequence: risk lookup, pricing,
/// ledger reads and writes, accumulating results into session state.
pub struct WorkflowCoordinator {
    risk: Arc<dyn RiskLookup>,
    ledger: Arc<LoanLedger>,
}

impl WorkflowCoordinator {
    pub fn new(risk: Arc<dyn RiskLookup>, ledger: Arc<LoanLedger>) -> Self {
        Self { risk, ledger }
    }

    pub async fn execute(
        &self,
        command: &BankingCommand,
        session: &mut SessionState,
    ) -> Result<WorkflowReply, BankError> {
        match command {
            BankingCommand::RequestQuote => self.quote(session).await,
            BankingCommand::OpenLoan { amount } => self.open_loan(session, *amount).await,
            BankingCommand::ShowLoans => self.show_loans(session).await,
            BankingCommand::Repay { amount } => self.repay(session, *amount).await,
        }
    }

    /// Risk lookup, loan-history counts, pricing; the rate lands in session
    /// state for the follow-up loan request.
    async fn quote(&self, session: &mut SessionState) -> Result<WorkflowReply, BankError> {
        let Some(entity) = session.entity_name.clone() else {
            return Ok(WorkflowReply::NeedEntityName);
        };

        // The profile is cached only for the span of one quote-then-open run.
        let profile = match session.risk_profile.as_ref() {
            Some(profile) if profile.entity_name == entity => profile.clone(),
            _ => {
                let profile = self.risk.lookup(&entity).await?;
                session.risk_profile = Some(profile.clone());
                profile
            }
        };

        let records = self.ledger.get_by_name(&entity).await?;
        let open_loans = records.iter().filter(|r| r.loan_open).count() as u32;
        let closed_loans = records.iter().filter(|r| r.is_closed()).count() as u32;

        let rate = pricing::interest_rate(
            profile.war_risk,
            profile.reputation,
            open_loans,
            closed_loans,
        );
        session.quoted_rate = Some(rate);
        debug!(entity = %entity, rate, open_loans, closed_loans, "quote computed");

        Ok(WorkflowReply::Quoted {
            entity_name: entity,
            rate_percent: rate,
        })
    }

    /// Open a loan at the previously quoted rate. The rate is copied into
    /// the record at creation and never revisited.
    async fn open_loan(
        &self,
        session: &mut SessionState,
        amount: f64,
    ) -> Result<WorkflowReply, BankError> {
        let Some(entity) = session.entity_name.clone() else {
            return Ok(WorkflowReply::NeedEntityName);
        };
        let Some(rate) = session.quoted_rate else {
            return Ok(WorkflowReply::NeedQuoteFirst);
        };

        let record = self.ledger.create(&entity, amount, rate).await?;
        session.risk_profile = None;
        Ok(WorkflowReply::LoanOpened { record })
    }

    async fn show_loans(&self, session: &mut SessionState) -> Result<WorkflowReply, BankError> {
        let Some(entity) = session.entity_name.clone() else {
            return Ok(WorkflowReply::NeedEntityName);
        };
        let records = self.ledger.get_by_name(&entity).await?;
        Ok(WorkflowReply::Loans { records })
    }

    /// Repayments land on the oldest open loan.
    async fn repay(
        &self,
        session: &mut SessionState,
        amount: f64,
    ) -> Result<WorkflowReply, BankError> {
        let Some(entity) = session.entity_name.clone() else {
            return Ok(WorkflowReply::NeedEntityName);
        };

        let records = self.ledger.get_by_name(&entity).await?;
        let Some(oldest_open) = records.iter().find(|r| r.loan_open) else {
            return Ok(WorkflowReply::NothingOutstanding);
        };

        let record = self.ledger.record_repayment(oldest_open.id, amount).await?;
        Ok(WorkflowReply::RepaymentRecorded { record })
    }
}
