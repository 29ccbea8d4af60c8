//! Datasource backend that forwards each batch to a remote query endpoint.
//!
//! The batch is POSTed as JSON to `<url>/query`; the endpoint answers with
//! a `QueryDataResponse` body.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use url::Url;

use crate::core::{DatasourceExecutor, QueryContext};
use crate::model::{QueryBatchRequest, QueryDataResponse};

pub const HTTP_TYPE: &str = "http";

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    endpoint: Url,
    headers: BTreeMap<String, String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, headers: BTreeMap<String, String>) -> Result<Self> {
        let mut base = Url::parse(base_url).with_context(|| format!("invalid datasource url {}", base_url))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("query")?;

        Ok(Self {
            client: Client::new(),
            endpoint,
            headers,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn send(&self, req: &QueryBatchRequest) -> Result<QueryDataResponse> {
        let mut builder = self.client.post(self.endpoint.clone()).json(req);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "datasource responded with {}: {}",
                status,
                body.trim()
            ));
        }

        response
            .json::<QueryDataResponse>()
            .await
            .context("datasource returned an invalid response body")
    }
}

#[async_trait]
impl DatasourceExecutor for HttpBackend {
    async fn execute(
        &self,
        ctx: &QueryContext,
        req: &QueryBatchRequest,
    ) -> Result<QueryDataResponse> {
        tracing::debug!(endpoint = %self.endpoint, queries = req.queries.len(), "forwarding batch");
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(anyhow!("request to {} cancelled", self.endpoint)),
            result = self.send(req) => result,
        }
    }
}
