//! Registry routing each batch to the backend of its datasource.
//!
//! Instances are looked up by uid first, then by plugin type, so a query
//! naming only `{"type": "testdata"}` still reaches the testdata backend.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{DatasourceExecutor, QueryContext};
use crate::model::{DatasourceRef, QueryBatchRequest, QueryDataResponse};
use crate::types::{DatasourceType, DatasourceUid};

/// Public description of a registered datasource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasourceInfo {
    pub uid: Option<DatasourceUid>,
    #[serde(rename = "type")]
    pub kind: DatasourceType,
}

struct Registered {
    kind: DatasourceType,
    backend: Arc<dyn DatasourceExecutor>,
}

#[derive(Default)]
pub struct DatasourceRegistry {
    instances: HashMap<DatasourceUid, Registered>,
    plugins: HashMap<DatasourceType, Arc<dyn DatasourceExecutor>>,
}

impl DatasourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a configured instance under its uid.
    pub fn register(
        mut self,
        uid: impl Into<DatasourceUid>,
        kind: impl Into<DatasourceType>,
        backend: Arc<dyn DatasourceExecutor>,
    ) -> Self {
        self.instances.insert(
            uid.into(),
            Registered {
                kind: kind.into(),
                backend,
            },
        );
        self
    }

    /// Register a backend for every query of a plugin type that names no
    /// known instance.
    pub fn register_plugin(
        mut self,
        kind: impl Into<DatasourceType>,
        backend: Arc<dyn DatasourceExecutor>,
    ) -> Self {
        self.plugins.insert(kind.into(), backend);
        self
    }

    pub fn resolve(&self, ds: &DatasourceRef) -> Option<Arc<dyn DatasourceExecutor>> {
        if let Some(found) = ds.uid.as_ref().and_then(|uid| self.instances.get(uid)) {
            return Some(found.backend.clone());
        }
        ds.kind
            .as_ref()
            .and_then(|kind| self.plugins.get(kind))
            .cloned()
    }

    /// Registered instances followed by type-level plugins, sorted.
    pub fn list(&self) -> Vec<DatasourceInfo> {
        let mut instances: Vec<DatasourceInfo> = self
            .instances
            .iter()
            .map(|(uid, reg)| DatasourceInfo {
                uid: Some(uid.clone()),
                kind: reg.kind.clone(),
            })
            .collect();
        instances.sort_by(|a, b| a.uid.cmp(&b.uid));

        let mut plugins: Vec<DatasourceInfo> = self
            .plugins
            .keys()
            .map(|kind| DatasourceInfo {
                uid: None,
                kind: kind.clone(),
            })
            .collect();
        plugins.sort_by(|a, b| a.kind.cmp(&b.kind));

        instances.extend(plugins);
        instances
    }

    pub fn len(&self) -> usize {
        self.instances.len() + self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.plugins.is_empty()
    }
}

#[async_trait]
impl DatasourceExecutor for DatasourceRegistry {
    async fn execute(
        &self,
        ctx: &QueryContext,
        req: &QueryBatchRequest,
    ) -> Result<QueryDataResponse> {
        let backend = self
            .resolve(&req.datasource)
            .ok_or_else(|| anyhow!("datasource not found: {}", req.datasource))?;
        backend.execute(ctx, req).await
    }
}
