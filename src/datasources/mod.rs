//! Datasource backends and the registry that routes batches to them.

mod http;
mod registry;
mod testdata;

pub use http::{HTTP_TYPE, HttpBackend};
pub use registry::{DatasourceInfo, DatasourceRegistry};
pub use testdata::{TESTDATA_PLUGIN_ID, TESTDATA_TYPE, TestDataBackend};
