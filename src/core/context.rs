//! Per-call context: request id, cancellation and deadline.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{QueryError, QueryResult};

/// Context handed to every executor call of one top-level query.
///
/// Cloning is cheap; all clones share the same cancellation token.
#[derive(Debug, Clone)]
pub struct QueryContext {
    request_id: Uuid,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Context cancelled whenever `parent` is (e.g. on server shutdown).
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            ..Self::new()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the call is cancelled. Backends select on this to
    /// stop early.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Drive `fut` until it completes, the context is cancelled or the
    /// deadline passes. On early exit `fut` is dropped, which aborts any
    /// tasks it owns.
    pub async fn run<T, F>(&self, fut: F) -> QueryResult<T>
    where
        F: Future<Output = QueryResult<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(QueryError::Cancelled),
            _ = deadline => {
                // let backends watching the token stop as well
                self.cancel.cancel();
                Err(QueryError::DeadlineExceeded)
            }
            result = fut => result,
        }
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}
