use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{collections::BTreeMap, env, fs};

use crate::core::QuerySettings;
use crate::core::service::{DEFAULT_CONCURRENT_QUERY_LIMIT, DEFAULT_USER_FACING_ERROR};
use crate::datasources::{
    DatasourceRegistry, HTTP_TYPE, HttpBackend, TESTDATA_PLUGIN_ID, TESTDATA_TYPE, TestDataBackend,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default = "default_concurrent_query_limit")]
    pub concurrent_query_limit: usize,
    #[serde(default = "default_user_facing_error")]
    pub user_facing_default_error: String,
    #[serde(default)]
    pub query_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub datasources: BTreeMap<String, DatasourceConfig>,
}

fn default_concurrent_query_limit() -> usize {
    DEFAULT_CONCURRENT_QUERY_LIMIT
}

fn default_user_facing_error() -> String {
    DEFAULT_USER_FACING_ERROR.to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            concurrent_query_limit: default_concurrent_query_limit(),
            user_facing_default_error: default_user_facing_error(),
            query_timeout_seconds: None,
            datasources: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasourceConfig {
    #[serde(rename = "type")]
    pub kind: String,

    // http datasource
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasourceSettings {
    TestData {
        uid: String,
    },
    Http {
        uid: String,
        url: String,
        headers: BTreeMap<String, String>,
    },
}

impl DatasourceSettings {
    pub fn from_json(uid: String, cfg: DatasourceConfig) -> anyhow::Result<Self> {
        match cfg.kind.as_str() {
            TESTDATA_TYPE | TESTDATA_PLUGIN_ID => Ok(DatasourceSettings::TestData { uid }),
            HTTP_TYPE => {
                let url = cfg.url.ok_or_else(|| {
                    anyhow::anyhow!("Datasource `{}` of type `http` must have a `url`", uid)
                })?;
                Ok(DatasourceSettings::Http {
                    uid,
                    url,
                    headers: cfg.headers,
                })
            }
            other => Err(anyhow::anyhow!(
                "Datasource `{}` has unsupported type `{}`",
                uid,
                other
            )),
        }
    }
}

impl ServiceConfig {
    pub fn query_settings(&self) -> QuerySettings {
        QuerySettings {
            concurrent_query_limit: self.concurrent_query_limit.max(1),
            user_facing_default_error: self.user_facing_default_error.clone(),
            query_timeout: self.query_timeout_seconds.map(Duration::from_secs),
        }
    }

    /// Enabled datasources, validated.
    pub fn datasource_settings(&self) -> anyhow::Result<Vec<DatasourceSettings>> {
        let mut out = Vec::new();
        for (uid, cfg) in &self.datasources {
            if cfg.disabled {
                tracing::debug!(uid = %uid, "skipping disabled datasource");
                continue;
            }
            out.push(DatasourceSettings::from_json(
                uid.clone(),
                expand_datasource(cfg.clone()),
            )?);
        }
        Ok(out)
    }

    /// Registry with every configured datasource plus the built-in
    /// testdata plugin.
    pub fn build_registry(&self) -> anyhow::Result<DatasourceRegistry> {
        let testdata = Arc::new(TestDataBackend::new());
        let mut registry = DatasourceRegistry::new()
            .register_plugin(TESTDATA_TYPE, testdata.clone())
            .register_plugin(TESTDATA_PLUGIN_ID, testdata.clone());

        for settings in self.datasource_settings()? {
            registry = match settings {
                DatasourceSettings::TestData { uid } => {
                    registry.register(uid, TESTDATA_TYPE, testdata.clone())
                }
                DatasourceSettings::Http { uid, url, headers } => {
                    let backend = HttpBackend::new(&url, headers)?;
                    registry.register(uid, HTTP_TYPE, Arc::new(backend))
                }
            };
        }

        Ok(registry)
    }
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("QUERY_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("query-fanout").join("config.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("query-fanout.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

/// Substitute `${NAME}` with its environment value. Unset names and an
/// unterminated `${` are kept as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        match env::var(&after[..close]) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&rest[open..open + close + 3]),
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

fn expand_datasource(cfg: DatasourceConfig) -> DatasourceConfig {
    let mut cfg = cfg;

    for val in cfg.headers.values_mut() {
        *val = expand_env_vars(val);
    }
    if let Some(url) = cfg.url.as_mut() {
        *url = expand_env_vars(url);
    }

    cfg
}

pub fn load_config_from(path: &Path) -> anyhow::Result<ServiceConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
    let cfg: ServiceConfig = serde_json::from_str(&raw)?;
    Ok(cfg)
}

/// Load the explicit path, else the resolved default path, else defaults.
pub fn load_service_config(explicit: Option<&Path>) -> anyhow::Result<ServiceConfig> {
    match explicit.map(Path::to_path_buf).or_else(resolve_config_path) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading configuration");
            load_config_from(&path)
        }
        None => {
            tracing::info!("no configuration file found, using defaults");
            Ok(ServiceConfig::default())
        }
    }
}
