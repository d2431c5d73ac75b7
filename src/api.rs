//! REST API server for the valuation engine
//!
//! Exposes the valuation session workflow via HTTP endpoints
//! Integrates with the frontend calculator and question form

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::error::ValuationError;
use crate::models::{RawManualFigures, ValuationInput};
use crate::progress::ProgressStore;
use crate::remote::AnalysisBackend;
use crate::session::ValuationSession;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateValuationRequest {
    pub company_name: String,
    pub company_id: Option<String>,
    /// Existing session id to restore previously saved answers.
    pub session_id: Option<String>,
    pub manual_figures: Option<RawManualFigures>,
    /// Base64-encoded financial statement.
    pub file_blob: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    pub question_id: String,
    pub category: String,
    pub answer: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

/// Sessions are individually locked so one in-flight remote call never
/// blocks requests for other sessions. The registry lock is only ever held
/// long enough to look up or insert a handle, never across an await into
/// session work.
type SessionHandle = Arc<Mutex<ValuationSession>>;

#[derive(Clone)]
pub struct ApiState {
    pub backend: Arc<dyn AnalysisBackend>,
    pub progress: Arc<dyn ProgressStore>,
    sessions: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
}

impl ApiState {
    pub fn new(backend: Arc<dyn AnalysisBackend>, progress: Arc<dyn ProgressStore>) -> Self {
        Self {
            backend,
            progress,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn session_handle(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.read().await.get(&id).cloned()
    }
}

/// =============================
/// Helpers — String → UUID Parsing
/// =============================

fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

fn parse_or_stable_uuid(value: &str) -> Uuid {
    Uuid::parse_str(value).unwrap_or_else(|_| stable_uuid_from_string(value))
}

fn error_status(error: &ValuationError) -> StatusCode {
    match error {
        ValuationError::InputValidation(_)
        | ValuationError::ClarificationIncomplete(_)
        | ValuationError::InvalidTransition(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn session_view(session: &ValuationSession) -> serde_json::Value {
    serde_json::json!({
        "sessionId": session.session_id(),
        "state": session.state(),
        "questions": session.questions(),
        "outcome": session.outcome(),
        "error": session.error(),
    })
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Valuation Endpoints
/// =============================

async fn create_valuation(
    State(state): State<ApiState>,
    Json(req): Json<CreateValuationRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    info!("Received valuation request for '{}'", req.company_name);

    let input = match build_input(&req) {
        Ok(input) => input,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(ApiResponse::error(message)));
        }
    };

    let mut session = ValuationSession::new(
        req.company_name.clone(),
        state.backend.clone(),
        state.progress.clone(),
    );
    if let Some(company_id) = req.company_id.as_deref() {
        session = session.with_company_id(parse_or_stable_uuid(company_id));
    }
    if let Some(session_id) = req.session_id.as_deref() {
        session = session.with_session_id(parse_or_stable_uuid(session_id));
    }

    let submit_result = match input {
        SubmittedInput::Manual(raw) => session.submit_manual(&raw).await,
        SubmittedInput::Prepared(input) => session.submit(input).await,
    };

    let session_id = session.session_id();
    let view = session_view(&session);
    state
        .sessions
        .write()
        .await
        .insert(session_id, Arc::new(Mutex::new(session)));

    match submit_result {
        Ok(_) => (StatusCode::OK, Json(ApiResponse::success(view))),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

enum SubmittedInput {
    Manual(RawManualFigures),
    Prepared(ValuationInput),
}

fn build_input(req: &CreateValuationRequest) -> Result<SubmittedInput, String> {
    if let Some(figures) = &req.manual_figures {
        return Ok(SubmittedInput::Manual(figures.clone()));
    }

    if let (Some(blob), Some(mime_type)) = (&req.file_blob, &req.mime_type) {
        let data = STANDARD
            .decode(blob)
            .map_err(|e| format!("fileBlob is not valid base64: {}", e))?;
        return Ok(SubmittedInput::Prepared(ValuationInput::Document {
            data,
            mime_type: mime_type.clone(),
        }));
    }

    Err("Either manualFigures or fileBlob with mimeType is required".to_string())
}

async fn get_valuation(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(handle) = state.session_handle(id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("No session {}", id))),
        );
    };

    let session = handle.lock().await;
    (
        StatusCode::OK,
        Json(ApiResponse::success(session_view(&session))),
    )
}

async fn post_answer(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AnswerRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(handle) = state.session_handle(id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("No session {}", id))),
        );
    };

    let mut session = handle.lock().await;
    match session
        .answer(&req.question_id, &req.category, &req.answer)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(session_view(&session))),
        ),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

async fn skip_all(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(handle) = state.session_handle(id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("No session {}", id))),
        );
    };

    let mut session = handle.lock().await;
    match session.skip_all().await {
        Ok(synthesized) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "synthesized": synthesized,
                "session": session_view(&session),
            }))),
        ),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

async fn finalize_valuation(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(handle) = state.session_handle(id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("No session {}", id))),
        );
    };

    let mut session = handle.lock().await;
    match session.finalize().await {
        Ok(_) => (
            StatusCode::OK,
            Json(ApiResponse::success(session_view(&session))),
        ),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/valuations", post(create_valuation))
        .route("/api/valuations/:id", get(get_valuation))
        .route("/api/valuations/:id/answers", post(post_answer))
        .route("/api/valuations/:id/skip", post(skip_all))
        .route("/api/valuations/:id/finalize", post(finalize_valuation))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("Valuation API listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, ValuationError};
    use crate::models::ManualFigures;
    use crate::progress::InMemoryProgressStore;
    use crate::remote::{MockAnalysisBackend, RetryPolicy, FN_EXTRACT};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    /// Answers the extraction call instantly, then hangs on finalization.
    struct StallingBackend {
        extraction: Value,
    }

    #[async_trait]
    impl AnalysisBackend for StallingBackend {
        async fn call(&self, function: &str, _payload: Value) -> Result<Value> {
            if function == FN_EXTRACT {
                return Ok(self.extraction.clone());
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(ValuationError::RemoteCall("stalled".to_string()))
        }
    }

    fn manual_input() -> ValuationInput {
        ValuationInput::Manual {
            figures: ManualFigures {
                revenue: 350_000.0,
                profit: 45_000.0,
                assets: 120_000.0,
                liabilities: 70_000.0,
            },
        }
    }

    #[tokio::test]
    async fn test_in_flight_remote_call_does_not_block_other_sessions() {
        let stalling = Arc::new(StallingBackend {
            extraction: json!({
                "requiresUserInput": true,
                "financialQuestions": [
                    {"id": "q1", "category": "rent", "questionText": "Rent?"}
                ]
            }),
        });
        let state = ApiState::new(
            stalling.clone(),
            Arc::new(InMemoryProgressStore::new()),
        );

        // Session A: answered and ready, but its finalization call hangs.
        let mut blocked = ValuationSession::new(
            "Blocked GmbH",
            stalling.clone() as Arc<dyn AnalysisBackend>,
            state.progress.clone(),
        )
        .with_retry_policy(RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
        });
        blocked.submit(manual_input()).await.unwrap();
        blocked.answer("q1", "rent", "market rate").await.unwrap();
        let blocked_id = blocked.session_id();

        // Session B: already complete, served from the registry only.
        let mock = Arc::new(MockAnalysisBackend::new());
        mock.push_ok(json!({
            "financialAnalysis": {
                "periods": [
                    {
                        "periodEnd": "2023-12-31",
                        "methodResults": [
                            {"method": "book_value", "equityValue": 90_000.0}
                        ]
                    }
                ],
                "businessPattern": "stable"
            }
        }))
        .await;
        let mut other = ValuationSession::new(
            "Other GmbH",
            mock as Arc<dyn AnalysisBackend>,
            state.progress.clone(),
        );
        other.submit(manual_input()).await.unwrap();
        let other_id = other.session_id();

        {
            let mut sessions = state.sessions.write().await;
            sessions.insert(blocked_id, Arc::new(Mutex::new(blocked)));
            sessions.insert(other_id, Arc::new(Mutex::new(other)));
        }

        // Kick off the hanging finalization, then read the other session.
        let finalize_state = state.clone();
        let finalize_task = tokio::spawn(async move {
            finalize_valuation(State(finalize_state), Path(blocked_id)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (status, body) = tokio::time::timeout(
            Duration::from_millis(200),
            get_valuation(State(state.clone()), Path(other_id)),
        )
        .await
        .expect("registry lookup must not wait on another session's remote call");

        assert_eq!(status, StatusCode::OK);
        assert!(body.0.success);
        finalize_task.abort();
    }

    #[test]
    fn test_stable_uuid_is_deterministic() {
        let a = stable_uuid_from_string("company-42");
        let b = stable_uuid_from_string("company-42");
        let c = stable_uuid_from_string("company-43");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get_version_num(), 4);
    }

    #[test]
    fn test_parse_or_stable_uuid_accepts_real_uuids() {
        let id = Uuid::new_v4();
        assert_eq!(parse_or_stable_uuid(&id.to_string()), id);
    }

    #[test]
    fn test_build_input_requires_figures_or_file() {
        let req = CreateValuationRequest {
            company_name: "Acme".to_string(),
            company_id: None,
            session_id: None,
            manual_figures: None,
            file_blob: None,
            mime_type: None,
        };

        assert!(build_input(&req).is_err());
    }

    #[test]
    fn test_build_input_rejects_bad_base64() {
        let req = CreateValuationRequest {
            company_name: "Acme".to_string(),
            company_id: None,
            session_id: None,
            manual_figures: None,
            file_blob: Some("not base64 !!!".to_string()),
            mime_type: Some("application/pdf".to_string()),
        };

        assert!(build_input(&req).is_err());
    }
}
