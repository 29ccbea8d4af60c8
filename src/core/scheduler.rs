// Concurrent fan-out of datasource batches

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::core::merge::{build_error_response, drop_unrequested, fill_missing, merge_into};
use crate::core::{DatasourceExecutor, QueryContext};
use crate::error::{QueryError, QueryResult};
use crate::model::{QueryBatchRequest, QueryDataResponse};

/// Runs one batch through the executor and always produces a response
/// covering every reference ID of the batch.
///
/// Executor errors and panics become error entries; they never escape.
#[derive(Clone)]
pub struct BatchRunner {
    executor: Arc<dyn DatasourceExecutor>,
    user_facing_default_error: Arc<str>,
}

impl BatchRunner {
    pub fn new(
        executor: Arc<dyn DatasourceExecutor>,
        user_facing_default_error: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            executor,
            user_facing_default_error: user_facing_default_error.into(),
        }
    }

    pub async fn run(&self, ctx: &QueryContext, req: &QueryBatchRequest) -> QueryDataResponse {
        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.executor.execute(ctx, req))
            .catch_unwind()
            .await;

        let rsp = match outcome {
            Ok(Ok(mut rsp)) => {
                let extra = drop_unrequested(&mut rsp, req);
                if !extra.is_empty() {
                    let extra: Vec<&str> = extra.iter().map(|r| r.as_str()).collect();
                    tracing::warn!(
                        datasource = %req.datasource,
                        ref_ids = ?extra,
                        "datasource answered queries it was not sent, discarding"
                    );
                }
                let filled = fill_missing(&mut rsp, req);
                if filled > 0 {
                    tracing::warn!(
                        datasource = %req.datasource,
                        missing = filled,
                        "datasource left queries without a response"
                    );
                }
                rsp
            }
            Ok(Err(err)) => {
                let message = format!("{:#}", err);
                tracing::warn!(datasource = %req.datasource, error = %message, "datasource query failed");
                build_error_response(message, req)
            }
            Err(payload) => {
                let message = self.panic_message(payload.as_ref());
                let ref_ids: Vec<&str> = req.ref_ids().map(|r| r.as_str()).collect();
                tracing::error!(
                    datasource = %req.datasource,
                    ref_ids = ?ref_ids,
                    panic = %message,
                    "query datasource panic"
                );
                // no valid response exists for any query of this datasource
                build_error_response(message, req)
            }
        };

        tracing::debug!(
            datasource = %req.datasource,
            entries = rsp.len(),
            errors = rsp.error_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "datasource batch finished"
        );

        rsp
    }

    fn panic_message(&self, payload: &(dyn Any + Send)) -> String {
        if let Some(msg) = payload.downcast_ref::<&'static str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else if let Some(err) = payload.downcast_ref::<anyhow::Error>() {
            format!("{:#}", err)
        } else {
            format!("unexpected error - {}", self.user_facing_default_error)
        }
    }
}

/// Fans batches out over tokio tasks with at most `concurrent_query_limit`
/// executor calls in flight.
#[derive(Clone)]
pub struct TaskScheduler {
    runner: BatchRunner,
    concurrent_query_limit: usize,
}

impl TaskScheduler {
    pub fn new(runner: BatchRunner, concurrent_query_limit: usize) -> Self {
        Self {
            runner,
            concurrent_query_limit: concurrent_query_limit.max(1),
        }
    }

    pub fn concurrent_query_limit(&self) -> usize {
        self.concurrent_query_limit
    }

    /// Execute every batch and merge the outcomes in completion order.
    ///
    /// Failed or panicking batches show up as error entries. Only a failure
    /// of the task machinery itself is returned as `Err`. Dropping the
    /// returned future aborts all batches still running.
    pub async fn execute_concurrent_queries(
        &self,
        ctx: &QueryContext,
        requests: Vec<QueryBatchRequest>,
    ) -> QueryResult<QueryDataResponse> {
        let expected = requests.len();
        let slots = Arc::new(Semaphore::new(self.concurrent_query_limit));
        let (tx, mut rx) = mpsc::channel::<QueryDataResponse>(expected.max(1));
        let mut tasks = JoinSet::new();

        tracing::debug!(
            batches = expected,
            limit = self.concurrent_query_limit,
            "dispatching datasource batches"
        );

        for (index, req) in requests.into_iter().enumerate() {
            // blocks until a slot frees up
            let permit = slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|err| QueryError::Coordination(format!("admission closed: {}", err)))?;

            let runner = self.runner.clone();
            let ctx = ctx.clone();
            let tx = tx.clone();
            let span = tracing::debug_span!("datasource_batch", index, datasource = %req.datasource);

            tasks.spawn(
                async move {
                    let rsp = runner.run(&ctx, &req).await;
                    if tx.send(rsp).await.is_err() {
                        tracing::debug!("coordinator stopped listening, dropping batch result");
                    }
                    drop(permit);
                }
                .instrument(span),
            );
        }
        drop(tx);

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                return Err(QueryError::Coordination(format!(
                    "datasource task did not complete: {}",
                    err
                )));
            }
        }

        let mut merged = QueryDataResponse::new();
        let mut received = 0;
        while let Some(fragment) = rx.recv().await {
            received += 1;
            merge_into(&mut merged, fragment);
        }

        if received != expected {
            return Err(QueryError::Coordination(format!(
                "expected {} batch results, received {}",
                expected, received
            )));
        }

        Ok(merged)
    }
}
