// Core modules
mod clock;
mod config;
mod error;
mod expressions;
mod model;
mod request;
mod types;

pub mod api;
pub mod core;
pub mod datasources;

// Re-export key types and functions
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{DatasourceConfig, DatasourceSettings, ServiceConfig, load_service_config};
pub use error::{QueryError, QueryResult};
pub use expressions::{Expression, ExpressionEvaluator, ExpressionKind, UnsupportedExpressions};
pub use model::{
    DataResponse, DatasourceRef, Field, FieldType, Frame, FrameMeta, Query, QueryBatchRequest,
    QueryDataResponse, TimeRange,
};
pub use request::{ParsedQueryRequest, QueryRequest, parse_query_request};
pub use types::{DatasourceType, DatasourceUid, RefId};

pub use crate::core::{DatasourceExecutor, QueryContext, QueryService, QuerySettings};
pub use datasources::DatasourceRegistry;

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Convenience function to build the shared API state from configuration.
///
/// This creates the datasource registry, wraps it in a `QueryService` and
/// returns the state the HTTP router and the CLI both use.
pub fn create_app_state(config: &ServiceConfig) -> Result<api::AppState> {
    let registry = Arc::new(config.build_registry()?);
    tracing::info!(
        datasources = registry.len(),
        limit = config.concurrent_query_limit,
        "datasource registry ready"
    );

    let service = QueryService::new(registry.clone(), config.query_settings());

    Ok(api::AppState {
        service: Arc::new(service),
        registry,
        clock: Arc::new(SystemClock),
        shutdown: CancellationToken::new(),
    })
}
