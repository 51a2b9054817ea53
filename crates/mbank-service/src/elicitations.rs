use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mbank_core::{BankError, CancelOutcome, ConfirmationAction, ConfirmationPrompt, Confirmer};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// A prompt awaiting an external answer. The sender half wakes the
/// suspended cancellation task.
#[derive(Debug)]
struct OpenElicitation {
    prompt: ConfirmationPrompt,
    opened_at: DateTime<Utc>,
    sender: oneshot::Sender<ConfirmationAction>,
}

/// Serializable view of an open elicitation.
#[derive(Debug, Clone, Serialize)]
pub struct PendingElicitation {
    pub id: String,
    pub message: String,
    pub opened_at: DateTime<Utc>,
}

/// Lifecycle of one gated cancellation request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CancellationStatus {
    Pending,
    Resolved { outcome: CancelOutcome },
    Failed { error: String },
}

/// Answer delivery result for an elicitation response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespondResult {
    Delivered,
    /// The cancellation already resolved (for example by timeout) before the
    /// answer arrived; the ledger was not touched by this response.
    NoLongerAwaited,
    Unknown,
}

/// In-memory board of confirmation round-trips in flight.
///
/// A suspended cancellation holds the receiving half of a oneshot channel;
/// answering the matching elicitation sends the action through and lets the
/// ledger proceed. The board never outlives the process: a round-trip that
/// cannot be resumed is one that must be re-requested.
#[derive(Debug, Default)]
pub struct ElicitationBoard {
    open: HashMap<String, OpenElicitation>,
    statuses: HashMap<String, CancellationStatus>,
}

impl ElicitationBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a cancellation as started.
    pub fn open_request(&mut self, id: &str) {
        self.statuses
            .insert(id.to_string(), CancellationStatus::Pending);
    }

    fn register(
        &mut self,
        id: String,
        prompt: ConfirmationPrompt,
    ) -> oneshot::Receiver<ConfirmationAction> {
        let (sender, receiver) = oneshot::channel();
        self.open.insert(
            id,
            OpenElicitation {
                prompt,
                opened_at: Utc::now(),
                sender,
            },
        );
        receiver
    }

    pub fn pending(&self) -> Vec<PendingElicitation> {
        let mut items: Vec<PendingElicitation> = self
            .open
            .iter()
            .map(|(id, open)| PendingElicitation {
                id: id.clone(),
                message: open.prompt.message.clone(),
                opened_at: open.opened_at,
            })
            .collect();
        items.sort_by_key(|item| item.opened_at);
        items
    }

    /// Deliver an answer to an open elicitation.
    pub fn respond(&mut self, id: &str, action: ConfirmationAction) -> RespondResult {
        match self.open.remove(id) {
            Some(open) => {
                if open.sender.send(action).is_err() {
                    // The awaiting task resolved (timed out) between listing
                    // and answering.
                    RespondResult::NoLongerAwaited
                } else {
                    RespondResult::Delivered
                }
            }
            None if self.statuses.contains_key(id) => RespondResult::NoLongerAwaited,
            None => RespondResult::Unknown,
        }
    }

    /// Record the final outcome and drop any still-open prompt for `id`.
    pub fn resolve(&mut self, id: &str, status: CancellationStatus) {
        self.open.remove(id);
        self.statuses.insert(id.to_string(), status);
    }

    pub fn status(&self, id: &str) -> Option<CancellationStatus> {
        self.statuses.get(id).cloned()
    }
}

/// Confirmer wired to the board: registers the prompt under a fixed id and
/// parks until the matching elicitation is answered. The ledger's own
/// timeout bounds the wait.
pub struct BoardConfirmer {
    board: Arc<Mutex<ElicitationBoard>>,
    id: String,
}

impl BoardConfirmer {
    pub fn new(board: Arc<Mutex<ElicitationBoard>>, id: impl Into<String>) -> Self {
        Self {
            board,
            id: id.into(),
        }
    }
}

#[async_trait]
impl Confirmer for BoardConfirmer {
    async fn confirm(&self, prompt: ConfirmationPrompt) -> Result<ConfirmationAction, BankError> {
        let receiver = {
            let mut board = self.board.lock().await;
            board.register(self.id.clone(), prompt)
        };
        debug!(id = %self.id, "confirmation prompt posted; awaiting answer");

        receiver
            .await
            .map_err(|_| BankError::remote("elicitation", "channel closed before an answer arrived"))
    }
}
