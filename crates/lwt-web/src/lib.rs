//! Axum JSON API over the prospect ledger.
//!
//! The webhook receiver always acknowledges with HTTP 200, even when
//! processing fails; surfacing an error status would trigger the provider's
//! redelivery storm. That policy lives here, in the transport adapter, not
//! in the pipeline.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use lwt_adapters::ValidationError;
use lwt_core::{Event, Prospect, ProspectStatus};
use lwt_ingest::{IngestSource, PipelineError};
use lwt_storage::{Store, StoreError, DEFAULT_DATABASE_URL};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "lwt-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/webhooks/heyreach", post(webhook_handler))
        .route("/stats", get(stats_handler))
        .route("/prospects", get(list_prospects_handler))
        .route("/prospects/{id}", get(prospect_detail_handler))
        .route("/events", get(list_events_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let store = Store::connect(&database_url).await?;
    store.init_schema().await?;

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for webhooks");
    axum::serve(listener, app(AppState { store })).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ProspectBody {
    id: i64,
    linkedin_url: String,
    first_name: Option<String>,
    last_name: Option<String>,
    company: Option<String>,
    title: Option<String>,
    email: Option<String>,
    heyreach_lead_id: Option<String>,
    status: ProspectStatus,
    connection_sent_at: Option<DateTime<Utc>>,
    connection_accepted_at: Option<DateTime<Utc>>,
    blacklisted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<Prospect> for ProspectBody {
    fn from(p: Prospect) -> Self {
        Self {
            id: p.id,
            linkedin_url: p.linkedin_url,
            first_name: p.first_name,
            last_name: p.last_name,
            company: p.company,
            title: p.title,
            email: p.email,
            heyreach_lead_id: p.heyreach_lead_id,
            status: p.status,
            connection_sent_at: p.connection_sent_at,
            connection_accepted_at: p.connection_accepted_at,
            blacklisted: p.blacklisted,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

// The raw payload stays out of listings; it is audit data, not API surface.
#[derive(Debug, Serialize)]
struct EventBody {
    id: i64,
    prospect_id: Option<i64>,
    event_type: String,
    heyreach_lead_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<Event> for EventBody {
    fn from(e: Event) -> Self {
        Self {
            id: e.id,
            prospect_id: e.prospect_id,
            event_type: e.event_type,
            heyreach_lead_id: e.heyreach_lead_id,
            created_at: e.created_at,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ProspectsQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    event_type: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({
        "message": "LinkedIn Webhook Tracker API",
        "health": "/health",
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let database = match state.store.ping().await {
        Ok(()) => "connected",
        Err(err) => {
            error!(%err, "database health check failed");
            "error"
        }
    };
    Json(json!({
        "status": "ok",
        "database": database,
        "timestamp": Utc::now(),
    }))
}

async fn webhook_handler(State(state): State<Arc<AppState>>, body: String) -> Json<serde_json::Value> {
    info!(raw = %body, "received webhook");
    match lwt_ingest::process(&state.store, &body, IngestSource::Webhook).await {
        Ok(outcome) => {
            info!(
                prospect_id = ?outcome.prospect_id,
                created = outcome.created,
                status_changed = outcome.status_changed,
                "processed webhook"
            );
            Json(json!({"status": "success", "message": "Webhook processed"}))
        }
        Err(PipelineError::Validation(ValidationError::InvalidJson(err))) => {
            warn!(%err, "webhook body is not valid JSON");
            Json(json!({"status": "error", "message": "Invalid JSON"}))
        }
        Err(PipelineError::Validation(err)) => {
            warn!(%err, "webhook payload failed validation");
            Json(json!({
                "status": "error",
                "message": "Validation failed",
                "details": err.to_string(),
            }))
        }
        Err(PipelineError::Store(err)) => {
            error!(%err, "failed to process webhook");
            Json(json!({"status": "error", "message": "Webhook logged with error"}))
        }
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.stats().await {
        Ok(stats) => Json(json!({
            "total_prospects": stats.total_prospects,
            "by_status": stats.by_status,
            "total_events": stats.total_events,
            "acceptance_rate": stats.acceptance_rate,
            "last_webhook_received": stats.last_event_at,
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn list_prospects_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProspectsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(50).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => match ProspectStatus::parse(raw) {
            Some(status) => Some(status),
            // Unknown status names match nothing rather than erroring.
            None => {
                return Json(json!({"prospects": [], "total": 0})).into_response();
            }
        },
        None => None,
    };
    match state.store.list_prospects(status, limit, offset).await {
        Ok((prospects, total)) => {
            let prospects: Vec<ProspectBody> = prospects.into_iter().map(Into::into).collect();
            Json(json!({"prospects": prospects, "total": total})).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn prospect_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    let prospect = match state.store.get_prospect(id).await {
        Ok(prospect) => prospect,
        Err(StoreError::NotFound(_)) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"detail": "Prospect not found"})),
            )
                .into_response();
        }
        Err(err) => return server_error(err),
    };
    match state.store.events_for_prospect(id).await {
        Ok(events) => {
            let events: Vec<EventBody> = events.into_iter().map(Into::into).collect();
            Json(json!({
                "prospect": ProspectBody::from(prospect),
                "events": events,
            }))
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn list_events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    let event_type = query.event_type.as_deref().filter(|s| !s.is_empty());
    match state.store.list_events(event_type, limit, offset).await {
        Ok((events, total)) => {
            let events: Vec<EventBody> = events.into_iter().map(Into::into).collect();
            Json(json!({"events": events, "total": total})).into_response()
        }
        Err(err) => server_error(err),
    }
}

fn server_error(err: StoreError) -> Response {
    error!(%err, "query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"detail": "internal error"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let store = Store::in_memory().await.unwrap();
        app(AppState { store })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_webhook(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks/heyreach")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn root_and_health() {
        let app = test_app().await;
        let response = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["message"], "LinkedIn Webhook Tracker API");

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], "connected");
    }

    #[tokio::test]
    async fn webhook_creates_prospect_and_event() {
        let app = test_app().await;
        let response = app
            .clone()
            .oneshot(post_webhook(
                r#"{"event_type": "connection_request_sent",
                    "lead": {"id": "L1", "profile_url": "https://li/x", "firstName": "Ada"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "success");

        let response = app.clone().oneshot(get("/prospects")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["prospects"][0]["status"], "connection_sent");
        assert_eq!(body["prospects"][0]["first_name"], "Ada");

        let response = app.oneshot(get("/stats")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["by_status"]["connection_sent"], 1);
        assert_eq!(body["total_events"], 1);
    }

    #[tokio::test]
    async fn malformed_webhook_still_acknowledged_and_writes_nothing() {
        let app = test_app().await;
        let response = app.clone().oneshot(post_webhook("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "Invalid JSON");

        let response = app
            .clone()
            .oneshot(post_webhook(r#"{"event_type": "x", "lead": {}}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "Validation failed");

        let response = app.oneshot(get("/prospects")).await.unwrap();
        assert_eq!(body_json(response).await["total"], 0);
    }

    #[tokio::test]
    async fn prospect_detail_includes_events_and_404s_when_missing() {
        let app = test_app().await;
        app.clone()
            .oneshot(post_webhook(
                r#"{"event_type": "connection_request_sent",
                    "lead": {"id": "L1", "profile_url": "https://li/x"}}"#,
            ))
            .await
            .unwrap();
        app.clone()
            .oneshot(post_webhook(
                r#"{"event_type": "connection_request_accepted",
                    "lead": {"id": "L1", "profile_url": "https://li/x"}}"#,
            ))
            .await
            .unwrap();

        let response = app.clone().oneshot(get("/prospects/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["prospect"]["status"], "connected");
        assert_eq!(body["events"].as_array().unwrap().len(), 2);
        assert_eq!(body["events"][0]["event_type"], "connection_request_sent");

        let response = app.oneshot(get("/prospects/999")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn event_listing_filters_by_type() {
        let app = test_app().await;
        app.clone()
            .oneshot(post_webhook(
                r#"{"event_type": "connection_request_sent", "lead": {"id": "L1"}}"#,
            ))
            .await
            .unwrap();
        app.clone()
            .oneshot(post_webhook(
                r#"{"event_type": "connection_request_accepted", "lead": {"id": "L1"}}"#,
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(get("/events?event_type=connection_request_accepted"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["events"][0]["event_type"], "connection_request_accepted");

        let response = app.oneshot(get("/events?limit=1")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["events"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_status_filter_matches_nothing() {
        let app = test_app().await;
        let response = app.oneshot(get("/prospects?status=imaginary")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["total"], 0);
    }
}
