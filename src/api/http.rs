//! HTTP API Server
//!
//! REST API for cluster status, manual activation and deactivation, sweeps
//! and writes fanned out to the active members.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::cluster::{ClusterStatus, DriverRegistry, SweepReport, WriteOutcome};
use crate::config::ApiConfig;
use crate::database::{RowChange, Value};
use crate::error::{ConfigError, Error, Result, RoutingError, SyncError};
use crate::sync::{SyncReport, SynchronizationStrategy};

/// Shared application state
pub struct AppState {
    pub registry: Arc<DriverRegistry>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, registry: Arc<DriverRegistry>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { registry }),
        }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Self::create_router(Arc::clone(&self.state))
    }

    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/strategies", get(handle_strategies))
            .route("/clusters", get(handle_clusters))
            .route("/clusters/:name", get(handle_cluster))
            .route("/clusters/:name/sweep", post(handle_sweep))
            .route("/clusters/:name/metadata/invalidate", post(handle_invalidate_metadata))
            .route("/clusters/:name/databases/:id/activate", post(handle_activate))
            .route("/clusters/:name/databases/:id/deactivate", post(handle_deactivate))
            .route("/clusters/:name/tables/:table/write", post(handle_write))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `shutdown` completes
    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Activation request
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ActivateRequest {
    /// Strategy id; the cluster default when absent
    pub strategy: Option<String>,
}

/// Activation response
#[derive(Debug, Serialize)]
pub struct ActivateResponse {
    pub database: String,
    /// False if the member was already active
    pub activated: bool,
    pub report: Option<SyncReport>,
}

/// Deactivation response
#[derive(Debug, Serialize)]
pub struct DeactivateResponse {
    pub database: String,
    pub deactivated: bool,
}

/// Write request. Rows are arrays in column order, keys are arrays in
/// primary key order.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WriteRequest {
    #[serde(default)]
    pub insert: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub update: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub delete: Vec<Vec<serde_json::Value>>,
}

/// Metadata reload response
#[derive(Debug, Serialize)]
pub struct MetadataResponse {
    /// Entries cached after the reload; lazy caches fill on next use
    pub cached: usize,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub clusters: usize,
}

/// Strategy catalog entry
#[derive(Debug, Serialize)]
pub struct StrategyInfo {
    pub id: &'static str,
    pub description: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error wrapper mapping driver errors onto HTTP statuses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<RoutingError> for ApiError {
    fn from(e: RoutingError) -> Self {
        Self(e.into())
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::Routing(RoutingError::UnknownCluster(_)) => (StatusCode::NOT_FOUND, "UNKNOWN_CLUSTER"),
            Error::Routing(RoutingError::NoActiveMembers(_)) => (StatusCode::SERVICE_UNAVAILABLE, "NO_ACTIVE_MEMBERS"),
            Error::Sync(SyncError::UnknownMember(_)) => (StatusCode::NOT_FOUND, "UNKNOWN_MEMBER"),
            Error::Sync(SyncError::InProgress(_)) => (StatusCode::CONFLICT, "SYNC_IN_PROGRESS"),
            Error::Sync(_) => (StatusCode::BAD_GATEWAY, "SYNC_FAILED"),
            Error::Config(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            Error::TableNotFound(_) => (StatusCode::NOT_FOUND, "TABLE_NOT_FOUND"),
            Error::DuplicateKey { .. } => (StatusCode::CONFLICT, "DUPLICATE_KEY"),
            Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        clusters: state.registry.clusters().await.len(),
    })
}

async fn handle_strategies() -> impl IntoResponse {
    let strategies: Vec<StrategyInfo> = SynchronizationStrategy::catalog()
        .iter()
        .map(|s| StrategyInfo {
            id: s.id(),
            description: s.description(),
        })
        .collect();
    Json(strategies)
}

async fn handle_clusters(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ClusterStatus>> {
    let mut statuses = Vec::new();
    for cluster in state.registry.clusters().await {
        statuses.push(cluster.status().await?);
    }
    Ok(Json(statuses))
}

async fn handle_cluster(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<ClusterStatus> {
    let cluster = state.registry.cluster(&name).await?;
    Ok(Json(cluster.status().await?))
}

async fn handle_sweep(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<SweepReport> {
    let cluster = state.registry.cluster(&name).await?;
    Ok(Json(cluster.sweep().await))
}

async fn handle_invalidate_metadata(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<MetadataResponse> {
    let cluster = state.registry.cluster(&name).await?;
    let cached = cluster.reload_metadata().await?;
    Ok(Json(MetadataResponse { cached }))
}

async fn handle_activate(
    State(state): State<Arc<AppState>>,
    Path((name, id)): Path<(String, String)>,
    body: Option<Json<ActivateRequest>>,
) -> ApiResult<ActivateResponse> {
    let cluster = state.registry.cluster(&name).await?;
    let strategy = match body.and_then(|Json(req)| req.strategy) {
        Some(id) => Some(SynchronizationStrategy::resolve(&id)?),
        None => None,
    };

    let report = cluster.activate(&id, strategy).await?;
    Ok(Json(ActivateResponse {
        database: id,
        activated: report.is_some(),
        report,
    }))
}

async fn handle_deactivate(
    State(state): State<Arc<AppState>>,
    Path((name, id)): Path<(String, String)>,
) -> ApiResult<DeactivateResponse> {
    let cluster = state.registry.cluster(&name).await?;
    let deactivated = cluster.deactivate(&id).await?;
    Ok(Json(DeactivateResponse {
        database: id,
        deactivated,
    }))
}

async fn handle_write(
    State(state): State<Arc<AppState>>,
    Path((name, table)): Path<(String, String)>,
    Json(req): Json<WriteRequest>,
) -> ApiResult<WriteOutcome> {
    let cluster = state.registry.cluster(&name).await?;

    let row = |values: &Vec<serde_json::Value>| values.iter().map(json_to_value).collect::<Vec<_>>();
    let mut changes = Vec::with_capacity(req.delete.len() + req.update.len() + req.insert.len());
    changes.extend(req.delete.iter().map(|key| RowChange::Delete(row(key))));
    changes.extend(req.update.iter().map(|r| RowChange::Update(row(r))));
    changes.extend(req.insert.iter().map(|r| RowChange::Insert(row(r))));

    Ok(Json(cluster.write(&table, &changes).await?))
}

/// Convert JSON value to a row value
fn json_to_value(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::cluster::tests::{connector, settings};
    use crate::config::StateConfig;
    use crate::database::{ColumnSchema, MemoryDatabase, TableSchema};

    async fn app(n: usize) -> (Router, Arc<DriverRegistry>, Vec<Arc<MemoryDatabase>>) {
        let (connector, dbs) = connector(n).await;
        let registry = Arc::new(DriverRegistry::new(connector));
        registry
            .register_settings(&settings(n), &StateConfig::default())
            .await
            .unwrap();
        let server = HttpServer::new(ApiConfig::default(), Arc::clone(&registry));
        (server.router(), registry, dbs)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[test]
    fn test_json_to_value() {
        assert!(matches!(json_to_value(&serde_json::json!(null)), Value::Null));
        assert!(matches!(json_to_value(&serde_json::json!(true)), Value::Bool(true)));
        assert!(matches!(json_to_value(&serde_json::json!(42)), Value::Int(42)));
        assert!(matches!(json_to_value(&serde_json::json!(u64::MAX)), Value::UInt(u64::MAX)));
        assert!(matches!(json_to_value(&serde_json::json!(1.5)), Value::Float(_)));
        assert!(matches!(json_to_value(&serde_json::json!("test")), Value::String(_)));
    }

    #[tokio::test]
    async fn test_health_and_strategies() {
        let (app, registry, _) = app(1).await;
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["clusters"], 1);

        let (status, body) = call(&app, "GET", "/strategies", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), SynchronizationStrategy::catalog().len());
        assert_eq!(body[0]["id"], "full");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_cluster_status() {
        let (app, registry, _) = app(2).await;
        let (status, body) = call(&app, "GET", "/clusters/default", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "default");
        assert_eq!(body["members"][0]["active"], true);
        assert_eq!(body["members"][1]["active"], false);

        let (status, body) = call(&app, "GET", "/clusters/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_CLUSTER");

        let (_, body) = call(&app, "GET", "/clusters", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_activate_and_deactivate() {
        let (app, registry, dbs) = app(2).await;
        let (status, body) = call(
            &app,
            "POST",
            "/clusters/default/databases/db2/activate",
            Some(serde_json::json!({ "strategy": "differential" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activated"], true);
        assert_eq!(body["report"]["strategy"], "differential");
        assert_eq!(dbs[1].rows("orders").await.unwrap().len(), 3);

        let (_, body) = call(&app, "POST", "/clusters/default/databases/db2/activate", None).await;
        assert_eq!(body["activated"], false);

        let (status, body) = call(&app, "POST", "/clusters/default/databases/db2/deactivate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deactivated"], true);

        let (status, body) = call(
            &app,
            "POST",
            "/clusters/default/databases/db2/activate",
            Some(serde_json::json!({ "strategy": "magic" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");

        let (status, _) = call(&app, "POST", "/clusters/default/databases/db9/deactivate", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_and_write() {
        let (app, registry, dbs) = app(2).await;
        let (status, body) = call(&app, "POST", "/clusters/default/sweep", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activated"], serde_json::json!(["db2"]));

        let (status, body) = call(
            &app,
            "POST",
            "/clusters/default/tables/orders/write",
            Some(serde_json::json!({ "insert": [[4, "item-4"]], "delete": [[1]] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["applied"], serde_json::json!(["db1", "db2"]));
        for db in &dbs {
            assert_eq!(db.rows("orders").await.unwrap().len(), 3);
        }

        let (status, body) = call(
            &app,
            "POST",
            "/clusters/default/tables/missing/write",
            Some(serde_json::json!({ "insert": [[1]] })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "TABLE_NOT_FOUND");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalidate_metadata() {
        let (app, registry, dbs) = app(1).await;
        dbs[0]
            .create_table(TableSchema::new("customers", vec![ColumnSchema::new("id", "int")], &["id"]))
            .await;

        let write = serde_json::json!({ "insert": [[1]] });
        let (status, _) = call(&app, "POST", "/clusters/default/tables/customers/write", Some(write.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "POST", "/clusters/default/metadata/invalidate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cached"], 1);

        let (status, body) = call(&app, "POST", "/clusters/default/tables/customers/write", Some(write)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["applied"], serde_json::json!(["db1"]));

        let (status, _) = call(&app, "POST", "/clusters/missing/metadata/invalidate", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        registry.shutdown().await;
    }
}
