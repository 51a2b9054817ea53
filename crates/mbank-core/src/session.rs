use crate::risk::RiskProfile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Identifies one continuous conversation with the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub app: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        app: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app: app.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    Customer,
    Bank,
    Delegate,
}

/// One utterance in the running conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub role: TurnRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// How many turns of history are kept and forwarded on delegation.
const HISTORY_WINDOW: usize = 12;

/// Conversation state for a single session.
///
/// `secret_discovered` is one-way by construction: there is a marker and no
/// clearing method, so once set it survives until the whole session is
/// deleted.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SessionState {
    secret_discovered: bool,
    pub entity_name: Option<String>,
    pub quoted_rate: Option<f64>,
    pub risk_profile: Option<RiskProfile>,
    history: Vec<TurnRecord>,
}

impl SessionState {
    pub fn secret_discovered(&self) -> bool {
        self.secret_discovered
    }

    /// Sole mutation path for the discovery flag; the routing gate is its
    /// only caller. Idempotent.
    pub fn mark_secret_discovered(&mut self) {
        self.secret_discovered = true;
    }

    pub fn record_turn(&mut self, role: TurnRole, text: impl Into<String>) {
        self.history.push(TurnRecord {
            role,
            text: text.into(),
            at: Utc::now(),
        });
        if self.history.len() > HISTORY_WINDOW {
            let excess = self.history.len() - HISTORY_WINDOW;
            self.history.drain(..excess);
        }
    }

    pub fn history(&self) -> &[TurnRecord] {
        &self.history
    }
}

/// Shared handle to one session's state.
///
/// The mutex doubles as the per-session turn serializer: the engine holds it
/// for the whole turn, so turns within a session never interleave while
/// unrelated sessions proceed in parallel.
pub type SessionHandle = Arc<Mutex<SessionState>>;

/// In-process session registry keyed by (app, user, session).
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionKey, SessionHandle>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing handle or atomically creates an empty one.
    pub async fn get_or_create(&self, key: &SessionKey) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::default())))
            .clone()
    }

    /// Permanently removes all state for the session. Used when a
    /// conversation is cancelled or times out upstream.
    pub async fn delete(&self, key: &SessionKey) -> bool {
        self.sessions.lock().await.remove(key).is_some()
    }
}
