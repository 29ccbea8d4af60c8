// Single-datasource execution contract

use anyhow::Result;
use async_trait::async_trait;

use crate::core::QueryContext;
use crate::model::{QueryBatchRequest, QueryDataResponse};

/// Executes one batch of queries against one datasource.
///
/// Implementations return one entry per reference ID of the batch. An `Err`
/// means the whole batch failed; the coordinator turns it into an error
/// entry for each reference ID.
#[async_trait]
pub trait DatasourceExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &QueryContext,
        req: &QueryBatchRequest,
    ) -> Result<QueryDataResponse>;
}
