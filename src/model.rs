//! Request and response data model shared by the parser, the fan-out
//! coordinator and the datasource backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;

use crate::types::{DatasourceType, DatasourceUid, RefId};

/// Reference to a datasource as it appears on each query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasourceRef {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<DatasourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<DatasourceUid>,
}

impl DatasourceRef {
    pub fn new(uid: impl Into<DatasourceUid>, kind: impl Into<DatasourceType>) -> Self {
        Self {
            kind: Some(kind.into()),
            uid: Some(uid.into()),
        }
    }

    /// Key used to group queries into batches: the uid, or the type when
    /// the query names no instance.
    pub fn group_key(&self) -> Option<&str> {
        self.uid
            .as_ref()
            .filter(|uid| !uid.is_blank())
            .map(|uid| uid.as_str())
            .or_else(|| {
                self.kind
                    .as_ref()
                    .filter(|kind| !kind.is_blank())
                    .map(|kind| kind.as_str())
            })
    }
}

impl fmt::Display for DatasourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uid = self.uid.as_ref().map(|u| u.as_str()).unwrap_or("-");
        let kind = self.kind.as_ref().map(|k| k.as_str()).unwrap_or("-");
        write!(f, "{} ({})", uid, kind)
    }
}

/// One logical sub-request. Backend specific parameters are kept verbatim
/// in `params`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(rename = "refId", default)]
    pub ref_id: RefId,
    #[serde(default)]
    pub datasource: DatasourceRef,
    #[serde(
        rename = "maxDataPoints",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_data_points: Option<i64>,
    #[serde(rename = "intervalMs", default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<f64>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Query {
    pub fn new(ref_id: impl Into<RefId>, datasource: DatasourceRef) -> Self {
        Self {
            ref_id: ref_id.into(),
            datasource,
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// Absolute time range a batch is evaluated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// All queries of one top-level call that target the same datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryBatchRequest {
    pub datasource: DatasourceRef,
    #[serde(rename = "timeRange")]
    pub time_range: TimeRange,
    pub queries: Vec<Query>,
    #[serde(default)]
    pub debug: bool,
}

impl QueryBatchRequest {
    pub fn ref_ids(&self) -> impl Iterator<Item = &RefId> {
        self.queries.iter().map(|q| &q.ref_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Time,
    Number,
    String,
    Boolean,
}

/// One column of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            field_type,
            values,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    #[serde(
        rename = "executedQueryString",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub executed_query_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

/// Tabular payload returned for one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<FrameMeta>,
}

impl Frame {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_meta(mut self, meta: FrameMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Number of rows, taken from the first field.
    pub fn rows(&self) -> usize {
        self.fields.first().map(|f| f.values.len()).unwrap_or(0)
    }
}

/// Outcome of one query: frames or an error message, never both.
///
/// Serializes as `{"data": [...]}` or `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataResponse {
    Data(Vec<Frame>),
    Error(String),
}

impl DataResponse {
    pub fn frames(frames: Vec<Frame>) -> Self {
        Self::Data(frames)
    }

    pub fn error(message: impl fmt::Display) -> Self {
        Self::Error(message.to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(msg) => Some(msg),
            Self::Data(_) => None,
        }
    }

    pub fn data(&self) -> Option<&[Frame]> {
        match self {
            Self::Data(frames) => Some(frames),
            Self::Error(_) => None,
        }
    }
}

/// Aggregate response: reference ID to outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDataResponse {
    #[serde(default)]
    pub results: BTreeMap<RefId, DataResponse>,
}

impl QueryDataResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a response, returning the entry it replaced, if any.
    pub fn insert(&mut self, ref_id: RefId, response: DataResponse) -> Option<DataResponse> {
        self.results.insert(ref_id, response)
    }

    pub fn get(&self, ref_id: &str) -> Option<&DataResponse> {
        self.results.get(ref_id)
    }

    pub fn contains(&self, ref_id: &str) -> bool {
        self.results.contains_key(ref_id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn ref_ids(&self) -> impl Iterator<Item = &RefId> {
        self.results.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, RefId, DataResponse> {
        self.results.iter()
    }

    pub fn error_count(&self) -> usize {
        self.results.values().filter(|r| r.is_error()).count()
    }
}

impl IntoIterator for QueryDataResponse {
    type Item = (RefId, DataResponse);
    type IntoIter = btree_map::IntoIter<RefId, DataResponse>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl FromIterator<(RefId, DataResponse)> for QueryDataResponse {
    fn from_iter<T: IntoIterator<Item = (RefId, DataResponse)>>(iter: T) -> Self {
        Self {
            results: iter.into_iter().collect(),
        }
    }
}
