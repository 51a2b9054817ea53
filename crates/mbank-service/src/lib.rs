#![deny(unsafe_code)]

pub mod elicitations;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use elicitations::{BoardConfirmer, CancellationStatus, ElicitationBoard, RespondResult};
use mbank_adapters::{
    FixtureRiskLookup, HttpHiddenDelegate, HttpRiskLookup, KeywordIntentClassifier,
    ScriptedHiddenDelegate, TemplateInterpreter,
};
use mbank_core::{
    BankEngine, BankError, CancelOutcome, ConfirmationAction, HiddenDelegate, LedgerStorageConfig,
    LoanLedger, LoanRecord, RiskLookup, SessionKey, TurnRequest, TurnResponse,
    CANCELLATION_NOT_COMPLETED_REPLY,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub ledger_storage: LedgerStorageConfig,
    pub confirmation_timeout: Duration,
    pub risk_service_url: Option<String>,
    pub hidden_service_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ledger_storage: LedgerStorageConfig::Memory,
            confirmation_timeout: Duration::from_secs(120),
            risk_service_url: None,
            hidden_service_url: None,
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<BankEngine>,
    pub board: Arc<Mutex<ElicitationBoard>>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, BankError> {
        let ledger = Arc::new(
            LoanLedger::bootstrap(config.ledger_storage, config.confirmation_timeout).await?,
        );

        let risk: Arc<dyn RiskLookup> = match &config.risk_service_url {
            Some(url) => {
                info!(url = %url, "using remote risk service");
                Arc::new(HttpRiskLookup::new(url.clone()))
            }
            None => Arc::new(FixtureRiskLookup::default()),
        };

        let delegate: Arc<dyn HiddenDelegate> = match &config.hidden_service_url {
            Some(url) => {
                info!(url = %url, "using remote hidden delegate");
                Arc::new(HttpHiddenDelegate::new(url.clone()))
            }
            None => Arc::new(ScriptedHiddenDelegate),
        };

        let engine = BankEngine::new(
            ledger,
            risk,
            Arc::new(KeywordIntentClassifier),
            delegate,
            Arc::new(TemplateInterpreter),
        );

        Ok(Self {
            engine: Arc::new(engine),
            board: Arc::new(Mutex::new(ElicitationBoard::new())),
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/turns", post(handle_turn))
        .route("/v1/loans", get(list_loans))
        .route("/v1/loans/:name", delete(cancel_immediately))
        .route("/v1/loans/:name/repayments", post(repay))
        .route("/v1/loans/:name/cancellations", post(start_cancellation))
        .route("/v1/cancellations/:id", get(cancellation_status))
        .route("/v1/elicitations", get(list_elicitations))
        .route("/v1/elicitations/:id", post(answer_elicitation))
        .route(
            "/v1/sessions/:app/:user_id/:session_id",
            delete(delete_session),
        )
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] BankError),
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn gone(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::GONE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Http { status, message } => (status, message),
            ApiError::Core(err) => {
                let status = match &err {
                    BankError::Validation(_) => StatusCode::BAD_REQUEST,
                    BankError::RemoteUnavailable { .. } => StatusCode::BAD_GATEWAY,
                    BankError::Storage(_) | BankError::Serialization(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    ledger_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "mbank-service",
        ledger_backend: state.engine.ledger().backend_label().await,
    })
}

async fn handle_turn(
    State(state): State<ServiceState>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    Ok(Json(state.engine.handle_turn(request).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct LoansQuery {
    name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct LoansResponse {
    items: Vec<LoanRecord>,
}

async fn list_loans(
    State(state): State<ServiceState>,
    Query(query): Query<LoansQuery>,
) -> Result<Json<LoansResponse>, ApiError> {
    let ledger = state.engine.ledger();
    let items = match query.name.as_deref() {
        Some(name) => ledger.get_by_name(name).await?,
        None => ledger.get_all().await?,
    };
    Ok(Json(LoansResponse { items }))
}

#[derive(Debug, Clone, Deserialize)]
struct RepaymentRequest {
    amount: f64,
}

/// Repayments land on the entity's oldest open loan, matching the
/// conversational workflow.
async fn repay(
    Path(name): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<RepaymentRequest>,
) -> Result<Json<LoanRecord>, ApiError> {
    let ledger = state.engine.ledger();
    let records = ledger.get_by_name(&name).await?;
    let oldest_open = records
        .iter()
        .find(|record| record.loan_open)
        .ok_or_else(|| ApiError::not_found(format!("no open loan for '{name}'")))?;

    Ok(Json(
        ledger.record_repayment(oldest_open.id, request.amount).await?,
    ))
}

/// The immediate cancellation variant: no confirmation round-trip.
async fn cancel_immediately(
    Path(name): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<CancelOutcome>, ApiError> {
    Ok(Json(
        state
            .engine
            .ledger()
            .cancel_without_confirmation(&name)
            .await?,
    ))
}

#[derive(Debug, Clone, Serialize)]
struct StartedCancellation {
    cancellation_id: String,
}

/// The gated cancellation variant. The request returns immediately; the
/// cancellation itself suspends on the elicitation board until answered or
/// timed out, and its outcome is read back from `/v1/cancellations/{id}`.
async fn start_cancellation(
    Path(name): Path<String>,
    State(state): State<ServiceState>,
) -> (StatusCode, Json<StartedCancellation>) {
    let id = Uuid::new_v4().to_string();
    state.board.lock().await.open_request(&id);

    let confirmer = BoardConfirmer::new(state.board.clone(), id.clone());
    let engine = state.engine.clone();
    let board = state.board.clone();
    let task_id = id.clone();

    tokio::spawn(async move {
        let result = engine
            .ledger()
            .cancel_with_confirmation(&name, &confirmer)
            .await;

        let status = match result {
            Ok(outcome) => CancellationStatus::Resolved { outcome },
            Err(err) => CancellationStatus::Failed {
                error: err.to_string(),
            },
        };
        board.lock().await.resolve(&task_id, status);
    });

    (
        StatusCode::ACCEPTED,
        Json(StartedCancellation { cancellation_id: id }),
    )
}

#[derive(Debug, Clone, Serialize)]
struct CancellationStatusResponse {
    #[serde(flatten)]
    status: CancellationStatus,
    /// User-facing phrasing. Decline and timeout share one message; the
    /// difference lives in the logs, not here.
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

async fn cancellation_status(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<CancellationStatusResponse>, ApiError> {
    let status = state
        .board
        .lock()
        .await
        .status(&id)
        .ok_or_else(|| ApiError::not_found(format!("no cancellation '{id}'")))?;

    let message = match &status {
        CancellationStatus::Resolved { outcome } if !outcome.completed() => {
            Some(CANCELLATION_NOT_COMPLETED_REPLY)
        }
        _ => None,
    };

    Ok(Json(CancellationStatusResponse { status, message }))
}

#[derive(Debug, Clone, Serialize)]
struct ElicitationsResponse {
    items: Vec<elicitations::PendingElicitation>,
}

async fn list_elicitations(State(state): State<ServiceState>) -> Json<ElicitationsResponse> {
    Json(ElicitationsResponse {
        items: state.board.lock().await.pending(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct ElicitationAnswer {
    action: ConfirmationAction,
}

async fn answer_elicitation(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(answer): Json<ElicitationAnswer>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.board.lock().await.respond(&id, answer.action) {
        RespondResult::Delivered => Ok(Json(serde_json::json!({ "status": "delivered" }))),
        RespondResult::NoLongerAwaited => Err(ApiError::gone(format!(
            "elicitation '{id}' is no longer awaiting an answer"
        ))),
        RespondResult::Unknown => Err(ApiError::not_found(format!("no elicitation '{id}'"))),
    }
}

async fn delete_session(
    Path((app, user_id, session_id)): Path<(String, String, String)>,
    State(state): State<ServiceState>,
) -> Result<StatusCode, ApiError> {
    let key = SessionKey::new(app, user_id, session_id);
    if state.engine.delete_session(&key).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("no such session"))
    }
}
