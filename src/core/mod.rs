// Query execution core: executor contract, fan-out and merge

pub mod context;
pub mod executor;
pub mod merge;
pub mod scheduler;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use context::QueryContext;
pub use executor::DatasourceExecutor;
pub use merge::{build_error_response, merge_into, merge_responses};
pub use scheduler::{BatchRunner, TaskScheduler};
pub use service::{QueryService, QuerySettings};
