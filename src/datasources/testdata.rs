//! Built-in deterministic datasource, useful for demos and smoke tests.
//!
//! The scenario is picked with the `scenarioId` query field:
//! - `csv_metric_values`: the comma separated `stringInput` spread evenly
//!   over the time range
//! - `constant`: `constant` repeated `maxDataPoints` times
//! - `no_data_points`: an empty frame
//! - `server_error_500`: fails the whole batch

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::core::{DatasourceExecutor, QueryContext};
use crate::model::{
    DataResponse, Field, FieldType, Frame, FrameMeta, Query, QueryBatchRequest,
    QueryDataResponse, TimeRange,
};

pub const TESTDATA_TYPE: &str = "testdata";
pub const TESTDATA_PLUGIN_ID: &str = "grafana-testdata-datasource";

const DEFAULT_SCENARIO: &str = "csv_metric_values";
const DEFAULT_CSV: &str = "1,20,90,30,5,0";
const DEFAULT_POINTS: i64 = 10;
const MAX_POINTS: i64 = 10_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct TestDataBackend;

impl TestDataBackend {
    pub fn new() -> Self {
        Self
    }

    fn run_query(&self, query: &Query, range: &TimeRange) -> Result<Frame> {
        let scenario = query.param_str("scenarioId").unwrap_or(DEFAULT_SCENARIO);
        let values = match scenario {
            "csv_metric_values" => {
                let input = query.param_str("stringInput").unwrap_or(DEFAULT_CSV);
                parse_csv(input)?
            }
            "constant" => {
                let value = query
                    .params
                    .get("constant")
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0);
                let points = query
                    .max_data_points
                    .unwrap_or(DEFAULT_POINTS)
                    .clamp(1, MAX_POINTS) as usize;
                vec![value; points]
            }
            "no_data_points" => Vec::new(),
            other => bail!("unknown scenario {:?}", other),
        };

        let times = spread(range, values.len());
        Ok(Frame::new(query.ref_id.as_str())
            .with_field(Field::new(
                "time",
                FieldType::Time,
                times.into_iter().map(|t| json!(t.timestamp_millis())).collect(),
            ))
            .with_field(Field::new(
                "value",
                FieldType::Number,
                values.into_iter().map(|v| json!(v)).collect(),
            ))
            .with_meta(FrameMeta {
                executed_query_string: Some(format!("scenario={}", scenario)),
                custom: None,
            }))
    }
}

fn parse_csv(input: &str) -> Result<Vec<f64>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .map_err(|_| anyhow!("invalid number {:?} in stringInput", s))
        })
        .collect()
}

/// `n` timestamps evenly spaced from `range.from` to `range.to`.
fn spread(range: &TimeRange, n: usize) -> Vec<DateTime<Utc>> {
    match n {
        0 => Vec::new(),
        1 => vec![range.from],
        _ => {
            let span = (range.to - range.from).num_milliseconds();
            let step = span / (n as i64 - 1);
            (0..n as i64)
                .map(|i| range.from + chrono::Duration::milliseconds(step * i))
                .collect()
        }
    }
}

#[async_trait]
impl DatasourceExecutor for TestDataBackend {
    async fn execute(
        &self,
        _ctx: &QueryContext,
        req: &QueryBatchRequest,
    ) -> Result<QueryDataResponse> {
        if req
            .queries
            .iter()
            .any(|q| q.param_str("scenarioId") == Some("server_error_500"))
        {
            bail!("testdata: internal server error (500)");
        }

        Ok(req
            .queries
            .iter()
            .map(|query| {
                let response = match self.run_query(query, &req.time_range) {
                    Ok(frame) => DataResponse::frames(vec![frame]),
                    Err(err) => DataResponse::error(err),
                };
                (query.ref_id.clone(), response)
            })
            .collect())
    }
}
