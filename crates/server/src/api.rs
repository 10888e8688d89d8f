//! Request API and realtime event stream.
//!
//! - `POST /api/v1/requests`              accept a job, answer `202` with the queued ack
//! - `GET  /api/v1/requests/{id}`         request record plus progress meta
//! - `GET  /api/v1/requests/{id}/logs`    durable log lines in insertion order
//! - `GET  /api/v1/requests/{id}/results` persisted result rows
//! - `GET  /api/v1/events`                websocket carrying every lifecycle event
//! - `GET  /api/v1/requests/{id}/events`  websocket filtered to one request

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use dbi_agent::{AgentError, Orchestrator, StartAck};
use dbi_core::domain::event::LifecycleEvent;
use dbi_core::domain::payload::JobPayload;
use dbi_core::domain::request::{RequestId, RequestLog, RequestResult, RequestStatus};
use dbi_core::errors::{ApplicationError, InterfaceError};

#[derive(Clone)]
pub struct ApiState {
    orchestrator: Orchestrator,
}

impl ApiState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub request_id: Option<String>,
    #[serde(default)]
    pub payload: JobPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestView {
    pub request_id: RequestId,
    pub kind: String,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub progress: f64,
    pub stats: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogView {
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultView {
    pub entity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub row: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub correlation_id: String,
}

type Rejection = (StatusCode, Json<ApiError>);

pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/api/v1/requests", post(start_request))
        .route("/api/v1/requests/{id}", get(get_request))
        .route("/api/v1/requests/{id}/logs", get(get_logs))
        .route("/api/v1/requests/{id}/results", get(get_results))
        .route("/api/v1/requests/{id}/events", get(request_events))
        .route("/api/v1/events", get(all_events))
        .with_state(ApiState::new(orchestrator))
}

fn reject(error: AgentError, correlation_id: &str) -> Rejection {
    let application = match error {
        AgentError::Validation(domain) => ApplicationError::Domain(domain),
        AgentError::Persistence(repository) => ApplicationError::Persistence(repository.to_string()),
        other => ApplicationError::Integration(other.to_string()),
    };
    interface_rejection(application.into_interface(correlation_id))
}

fn interface_rejection(error: InterfaceError) -> Rejection {
    let (status, detail) = match &error {
        InterfaceError::BadRequest { message, .. } => (StatusCode::BAD_REQUEST, Some(message.clone())),
        InterfaceError::NotFound { message, .. } => (StatusCode::NOT_FOUND, Some(message.clone())),
        InterfaceError::ServiceUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, None),
        InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, None),
    };
    if detail.is_none() {
        warn!(
            event_name = "api.request.failed",
            correlation_id = %error.correlation_id(),
            error = %error,
            "request failed"
        );
    }
    let body =
        ApiError { error: error.user_message(), detail, correlation_id: error.correlation_id().to_string() };
    (status, Json(body))
}

fn not_found(request_id: &RequestId) -> Rejection {
    interface_rejection(InterfaceError::NotFound {
        message: format!("request `{request_id}` does not exist"),
        correlation_id: request_id.to_string(),
    })
}

fn parse_id(raw: &str) -> Result<RequestId, Rejection> {
    RequestId::parse(raw).map_err(|error| reject(AgentError::Validation(error), "unassigned"))
}

pub async fn start_request(
    State(state): State<ApiState>,
    Json(body): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartAck>), Rejection> {
    let request_id = body.request_id.as_deref().map(parse_id).transpose()?;
    let correlation = request_id.as_ref().map_or_else(|| "unassigned".to_string(), ToString::to_string);

    let ack = state.orchestrator.start(request_id, body.payload).await.map_err(|error| reject(error, &correlation))?;
    info!(
        event_name = "api.request.accepted",
        request_id = %ack.request_id,
        "request accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

pub async fn get_request(
    Path(raw_id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<RequestView>, Rejection> {
    let request_id = parse_id(&raw_id)?;
    let journal = state.orchestrator.journal();
    let request = journal
        .find(&request_id)
        .await
        .map_err(|error| reject(error, request_id.as_str()))?
        .ok_or_else(|| not_found(&request_id))?;
    let meta = journal
        .repository()
        .find_meta(&request_id)
        .await
        .map_err(|error| reject(AgentError::Persistence(error), request_id.as_str()))?;

    let (progress, stats) = meta.map_or((0.0, Value::Null), |meta| (meta.progress, meta.stats));
    Ok(Json(RequestView {
        request_id: request.id,
        kind: request.kind,
        status: request.status,
        error_text: request.error_text,
        created_at: request.created_at,
        progress,
        stats,
    }))
}

async fn ensure_exists(state: &ApiState, request_id: &RequestId) -> Result<(), Rejection> {
    match state.orchestrator.journal().find(request_id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(not_found(request_id)),
        Err(error) => Err(reject(error, request_id.as_str())),
    }
}

pub async fn get_logs(
    Path(raw_id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<Vec<LogView>>, Rejection> {
    let request_id = parse_id(&raw_id)?;
    ensure_exists(&state, &request_id).await?;

    let logs: Vec<RequestLog> = state
        .orchestrator
        .journal()
        .repository()
        .list_logs(&request_id)
        .await
        .map_err(|error| reject(AgentError::Persistence(error), request_id.as_str()))?;
    Ok(Json(
        logs.into_iter()
            .map(|log| LogView {
                level: log.level.as_str().to_string(),
                message: log.message,
                data: log.data,
                ts: log.created_at,
            })
            .collect(),
    ))
}

pub async fn get_results(
    Path(raw_id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<Vec<ResultView>>, Rejection> {
    let request_id = parse_id(&raw_id)?;
    ensure_exists(&state, &request_id).await?;

    let results: Vec<RequestResult> =
        state.orchestrator.journal().results(&request_id).await.map_err(|error| reject(error, request_id.as_str()))?;
    Ok(Json(
        results
            .into_iter()
            .map(|result| ResultView {
                entity: result.entity,
                canonical_key: result.canonical_key,
                source: result.source,
                row: result.row,
            })
            .collect(),
    ))
}

pub async fn all_events(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| relay(socket, state.orchestrator, None))
}

pub async fn request_events(
    Path(raw_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> Result<Response, Rejection> {
    let request_id = parse_id(&raw_id)?;
    Ok(ws.on_upgrade(move |socket| relay(socket, state.orchestrator, Some(request_id))))
}

pub(crate) fn wanted(filter: Option<&RequestId>, event: &LifecycleEvent) -> bool {
    filter.map_or(true, |request_id| event.request_id() == request_id)
}

/// Pushes lifecycle events to one observer and answers its inbound frames.
async fn relay(mut socket: WebSocket, orchestrator: Orchestrator, filter: Option<RequestId>) {
    let mut events = orchestrator.subscribe();
    let scope = filter.as_ref().map_or_else(|| "*".to_string(), ToString::to_string);
    info!(event_name = "api.events.connected", scope = %scope, "observer connected");

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    if !wanted(filter.as_ref(), &event) {
                        continue;
                    }
                    if socket.send(Message::Text(event.to_json().into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event_name = "api.events.lagged", scope = %scope, skipped, "observer fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let reply = orchestrator.handle_inbound(text.as_str());
                    if socket.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!(event_name = "api.events.disconnected", scope = %scope, "observer disconnected");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        extract::{Path, State},
        http::{Request as HttpRequest, StatusCode},
        Json,
    };
    use chrono::Utc;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use dbi_agent::llm::{Bindings, ProviderKind, ProviderRegistry};
    use dbi_agent::{ActorDirectory, AgentDeps, EventHub, LlmIntentClassifier, Orchestrator, RequestJournal};
    use dbi_core::domain::event::LifecycleEvent;
    use dbi_core::domain::request::{LogLevel, Request, RequestId, RequestResult, RequestStatus};
    use dbi_db::{InMemoryActorStateRepository, InMemoryRequestRepository};

    use super::{get_request, get_results, router, wanted, ApiState};

    fn orchestrator() -> Orchestrator {
        let journal = RequestJournal::new(Arc::new(InMemoryRequestRepository::default()), EventHub::default());
        let bindings =
            Bindings { text: ProviderKind::OpenAi, vision: ProviderKind::OpenAi, embedding: ProviderKind::OpenAi };
        let deps = AgentDeps {
            providers: Arc::new(ProviderRegistry::new(bindings, 3)),
            state: Arc::new(InMemoryActorStateRepository::default()),
            journal: journal.clone(),
        };
        let classifier = Arc::new(LlmIntentClassifier::new(deps));
        Orchestrator::new(journal, ActorDirectory::default(), classifier)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn post(body: Value) -> HttpRequest<Body> {
        HttpRequest::post("/api/v1/requests")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn start_answers_accepted_with_the_queued_ack() {
        let response = router(orchestrator())
            .oneshot(post(json!({"requestId": "req-42", "payload": {"mode": "data_pull"}})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body, json!({"requestId": "req-42", "status": "queued"}));
    }

    #[tokio::test]
    async fn invalid_payload_is_a_bad_request() {
        let response = router(orchestrator())
            .oneshot(post(json!({"payload": {"mode": "telepathy"}})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["detail"], "unknown mode `telepathy`");
    }

    #[tokio::test]
    async fn malformed_request_id_is_a_bad_request() {
        let response = router(orchestrator())
            .oneshot(post(json!({"requestId": "has spaces", "payload": {}})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_request_is_not_found() {
        let response = router(orchestrator())
            .oneshot(HttpRequest::get("/api/v1/requests/missing").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["correlationId"], "missing");
    }

    #[tokio::test]
    async fn request_view_carries_meta_progress() {
        let orchestrator = orchestrator();
        let journal = orchestrator.journal().clone();
        let id = RequestId("view-1".to_string());
        journal.create(Request::queued(id.clone(), "data_pull")).await.expect("create");
        journal.status(&id, RequestStatus::Running, None).await.expect("running");
        journal.progress(&id, 0.4, Some(json!({"rows": 12}))).await;

        let Json(view) =
            get_request(Path("view-1".to_string()), State(ApiState::new(orchestrator))).await.expect("view");

        assert_eq!(view.status, RequestStatus::Running);
        assert_eq!(view.progress, 0.4);
        assert_eq!(view.stats, json!({"rows": 12}));
    }

    #[tokio::test]
    async fn results_and_logs_are_listed_in_order() {
        let orchestrator = orchestrator();
        let journal = orchestrator.journal().clone();
        let id = RequestId("rows-1".to_string());
        journal.create(Request::queued(id.clone(), "data_pull")).await.expect("create");
        for n in 0..3 {
            let result = RequestResult::new(id.clone(), "permit_building", json!({"permit_number": n}))
                .with_source("soda");
            journal.record_result(result).await.expect("record");
        }
        journal.log(&id, LogLevel::Info, "fetching building", None).await;

        let Json(results) =
            get_results(Path("rows-1".to_string()), State(ApiState::new(orchestrator.clone()))).await.expect("rows");
        assert_eq!(results.len(), 3);
        assert_eq!(results[2].row["permit_number"], 2);

        let response = router(orchestrator)
            .oneshot(HttpRequest::get("/api/v1/requests/rows-1/logs").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let logs = body_json(response).await;
        assert_eq!(logs[0]["message"], "fetching building");
        assert_eq!(logs[0]["level"], "info");
    }

    #[test]
    fn per_request_streams_drop_other_requests() {
        let event = LifecycleEvent::Progress {
            request_id: RequestId("a".to_string()),
            progress: 0.5,
            stats: None,
            ts: Utc::now(),
        };
        let other = RequestId("b".to_string());

        assert!(wanted(None, &event));
        assert!(wanted(Some(&RequestId("a".to_string())), &event));
        assert!(!wanted(Some(&other), &event));
    }
}
