// REST API endpoints for the query service

use axum::{
    Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::clock::Clock;
use crate::core::QueryService;
use crate::datasources::DatasourceRegistry;
use crate::error::QueryError;
use crate::model::QueryDataResponse;
use crate::request::{QueryRequest, parse_query_request};

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QueryService>,
    pub registry: Arc<DatasourceRegistry>,
    pub clock: Arc<dyn Clock>,
    /// Cancelled on shutdown; every query context is a child of it.
    pub shutdown: CancellationToken,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/query", post(handle_query))
        .route("/apis/query/v0alpha1/query", post(handle_query))
        .route("/apis/query/v0alpha1/datasources", get(list_datasources))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        if self.is_client_error() {
            tracing::debug!(code = self.code(), error = %self, "rejected query request");
        } else {
            tracing::warn!(code = self.code(), error = %self, "query request failed");
        }

        let status = match &self {
            QueryError::Bind(_) | QueryError::InvalidQuery(_) | QueryError::InvalidExpression(_) => {
                StatusCode::BAD_REQUEST
            }
            QueryError::ExpressionsNotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            QueryError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            QueryError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::Coordination(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "status": "error",
            "code": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn handle_query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryDataResponse>, QueryError> {
    let Json(req) = payload.map_err(|rejection| QueryError::Bind(rejection.body_text()))?;
    let parsed = parse_query_request(req, state.clock.as_ref())?;

    // a dropped connection drops this future, which aborts running batches;
    // the guard also cancels backends watching the token
    let ctx = state.service.new_context(&state.shutdown);
    let _guard = ctx.cancellation_token().clone().drop_guard();

    let rsp = state.service.process_request(&ctx, parsed).await?;
    Ok(Json(rsp))
}

/// List the datasources queries can be routed to.
async fn list_datasources(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let datasources = state.registry.list();
    Ok(Json(serde_json::json!({
        "datasources": datasources,
        "count": datasources.len(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::core::QuerySettings;
    use crate::core::testing::{Behavior, FakeExecutor};
    use crate::datasources::{TESTDATA_TYPE, TestDataBackend};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::TimeZone;
    use serde_json::json;
    use tower::ServiceExt;

    fn app() -> Router {
        let registry = Arc::new(
            DatasourceRegistry::new()
                .register("td", TESTDATA_TYPE, Arc::new(TestDataBackend::new()))
                .register(
                    "broken",
                    "fake",
                    Arc::new(FakeExecutor::new().with_behavior("broken", Behavior::Panic("kaboom"))),
                ),
        );
        let service = Arc::new(QueryService::new(registry.clone(), QuerySettings::default()));
        create_router(AppState {
            service,
            registry,
            clock: Arc::new(FixedClock(
                chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            )),
            shutdown: CancellationToken::new(),
        })
    }

    async fn post_json(router: Router, uri: &str, body: String) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_query_across_datasources() {
        let body = json!({
            "from": "now-1h",
            "to": "now",
            "queries": [
                { "refId": "A", "datasource": { "uid": "td", "type": "testdata" },
                  "scenarioId": "csv_metric_values", "stringInput": "1,2" },
                { "refId": "B", "datasource": { "uid": "broken", "type": "fake" } },
                { "refId": "C", "datasource": { "uid": "missing", "type": "loki" } }
            ]
        });

        let (status, value) = post_json(app(), "/apis/query/v0alpha1/query", body.to_string()).await;
        assert_eq!(status, StatusCode::OK);

        let results = &value["results"];
        assert_eq!(results["A"]["data"][0]["fields"][1]["values"], json!([1.0, 2.0]));
        assert_eq!(results["B"]["error"], json!("kaboom"));
        assert!(results["C"]["error"].as_str().unwrap().contains("datasource not found"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_structured_error() {
        let (status, value) = post_json(app(), "/query", "{ not json".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["status"], json!("error"));
        assert_eq!(value["code"], json!("bind_error"));
        assert!(value["message"].as_str().unwrap().starts_with("unable to bind query"));
    }

    #[tokio::test]
    async fn test_invalid_query() {
        let body = json!({ "queries": [ { "refId": "A" } ] });
        let (status, value) = post_json(app(), "/query", body.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["code"], json!("invalid_query"));
    }

    #[tokio::test]
    async fn test_expressions_are_not_implemented() {
        let body = json!({
            "queries": [
                { "refId": "A", "datasource": { "uid": "td", "type": "testdata" } },
                { "refId": "B", "datasource": { "uid": "__expr__", "type": "__expr__" },
                  "type": "math", "expression": "$A + 1" }
            ]
        });
        let (status, value) = post_json(app(), "/query", body.to_string()).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(value["code"], json!("expressions_not_implemented"));
        assert!(value.get("results").is_none());
    }

    #[tokio::test]
    async fn test_unrecognised_expression_kind_is_not_implemented() {
        let body = json!({
            "queries": [
                { "refId": "A", "datasource": { "uid": "td", "type": "testdata" } },
                { "refId": "B", "datasource": { "uid": "__expr__", "type": "__expr__" },
                  "type": "sql", "expression": "SELECT * FROM A" }
            ]
        });
        let (status, value) = post_json(app(), "/query", body.to_string()).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(value["code"], json!("expressions_not_implemented"));
    }

    #[tokio::test]
    async fn test_expression_cycle_is_bad_request() {
        let body = json!({
            "queries": [
                { "refId": "A", "datasource": { "uid": "td", "type": "testdata" } },
                { "refId": "X", "datasource": { "uid": "__expr__" }, "type": "math", "expression": "$Y" },
                { "refId": "Y", "datasource": { "uid": "__expr__" }, "type": "math", "expression": "$X" }
            ]
        });
        let (status, value) = post_json(app(), "/query", body.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["code"], json!("invalid_expression"));
    }

    #[tokio::test]
    async fn test_list_datasources() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/apis/query/v0alpha1/datasources")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["count"], json!(2));
        assert_eq!(value["datasources"][0]["uid"], json!("broken"));
    }
}
