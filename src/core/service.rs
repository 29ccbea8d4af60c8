//! Top-level query processing: single-datasource shortcut, concurrent
//! fan-out, then the expression stage.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::{BatchRunner, DatasourceExecutor, QueryContext, TaskScheduler};
use crate::error::QueryResult;
use crate::expressions::{Expression, ExpressionEvaluator, UnsupportedExpressions, dependency_order};
use crate::model::{QueryBatchRequest, QueryDataResponse};
use crate::request::ParsedQueryRequest;
use crate::types::RefId;

pub const DEFAULT_CONCURRENT_QUERY_LIMIT: usize = 4;
pub const DEFAULT_USER_FACING_ERROR: &str = "please inspect the server logs";

/// Tunables fixed at construction time.
#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub concurrent_query_limit: usize,
    pub user_facing_default_error: String,
    pub query_timeout: Option<Duration>,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            concurrent_query_limit: DEFAULT_CONCURRENT_QUERY_LIMIT,
            user_facing_default_error: DEFAULT_USER_FACING_ERROR.to_string(),
            query_timeout: None,
        }
    }
}

pub struct QueryService {
    runner: BatchRunner,
    scheduler: TaskScheduler,
    evaluator: Arc<dyn ExpressionEvaluator>,
    settings: QuerySettings,
}

impl QueryService {
    pub fn new(executor: Arc<dyn DatasourceExecutor>, settings: QuerySettings) -> Self {
        let runner = BatchRunner::new(executor, settings.user_facing_default_error.as_str());
        let scheduler = TaskScheduler::new(runner.clone(), settings.concurrent_query_limit);
        Self {
            runner,
            scheduler,
            evaluator: Arc::new(UnsupportedExpressions),
            settings,
        }
    }

    /// Replace the expression evaluator.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// Context for one call, cancelled along with `parent` and bounded by
    /// the configured timeout.
    pub fn new_context(&self, parent: &CancellationToken) -> QueryContext {
        let ctx = QueryContext::child_of(parent);
        match self.settings.query_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    /// Run every datasource batch, merge the results and apply expressions.
    ///
    /// Per-datasource failures are reported inside the response. The call
    /// itself fails on cancellation, on coordination failures and whenever
    /// expressions are present but cannot be evaluated.
    pub async fn process_request(
        &self,
        ctx: &QueryContext,
        req: ParsedQueryRequest,
    ) -> QueryResult<QueryDataResponse> {
        let span = tracing::info_span!(
            "query",
            request_id = %ctx.request_id(),
            datasources = req.requests.len(),
            expressions = req.expressions.len(),
        );
        ctx.run(self.process(ctx, req)).instrument(span).await
    }

    async fn process(
        &self,
        ctx: &QueryContext,
        req: ParsedQueryRequest,
    ) -> QueryResult<QueryDataResponse> {
        let start = Instant::now();
        let primary: HashSet<RefId> = req.ref_ids().cloned().collect();
        let ParsedQueryRequest {
            mut requests,
            expressions,
        } = req;

        // an invalid expression graph fails the call before any batch runs
        let expressions = if expressions.is_empty() {
            expressions
        } else {
            dependency_order(&expressions, &primary)?
        };

        let qdr = match requests.len() {
            0 => QueryDataResponse::new(),
            1 => {
                let batch = requests.remove(0);
                self.handle_query_single_datasource(ctx, &batch).await
            }
            _ => self.scheduler.execute_concurrent_queries(ctx, requests).await?,
        };

        if !expressions.is_empty() {
            return self.handle_expressions(ctx, qdr, &expressions).await;
        }

        tracing::info!(
            entries = qdr.len(),
            errors = qdr.error_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "query completed"
        );
        Ok(qdr)
    }

    /// One datasource: direct call, no admission control.
    async fn handle_query_single_datasource(
        &self,
        ctx: &QueryContext,
        req: &QueryBatchRequest,
    ) -> QueryDataResponse {
        self.runner.run(ctx, req).await
    }

    // primary queries have all completed and `expressions` is ordered
    async fn handle_expressions(
        &self,
        ctx: &QueryContext,
        qdr: QueryDataResponse,
        expressions: &[Expression],
    ) -> QueryResult<QueryDataResponse> {
        tracing::debug!(count = expressions.len(), "evaluating expressions");
        self.evaluator.evaluate(ctx, qdr, expressions).await
    }
}
