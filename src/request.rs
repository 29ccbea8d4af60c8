//! Inbound query request and its translation into per-datasource batches.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::clock::Clock;
use crate::error::{QueryError, QueryResult};
use crate::expressions::{Expression, dependency_order, is_expression_datasource};
use crate::model::{Query, QueryBatchRequest, TimeRange};
use crate::types::RefId;

pub const DEFAULT_FROM: &str = "now-6h";
pub const DEFAULT_TO: &str = "now";

/// Request body of the query endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub queries: Vec<Query>,
    #[serde(default)]
    pub debug: bool,
}

impl QueryRequest {
    /// Decode a request body.
    pub fn from_json(raw: &str) -> QueryResult<Self> {
        serde_json::from_str(raw).map_err(|e| QueryError::Bind(e.to_string()))
    }
}

/// A request split into datasource batches and expressions, the latter in
/// dependency order.
#[derive(Debug, Clone, Default)]
pub struct ParsedQueryRequest {
    pub requests: Vec<QueryBatchRequest>,
    pub expressions: Vec<Expression>,
}

impl ParsedQueryRequest {
    /// Reference IDs of the primary (non-expression) queries.
    pub fn ref_ids(&self) -> impl Iterator<Item = &RefId> {
        self.requests.iter().flat_map(|r| r.ref_ids())
    }
}

pub fn parse_query_request(req: QueryRequest, clock: &dyn Clock) -> QueryResult<ParsedQueryRequest> {
    if req.queries.is_empty() {
        return Err(QueryError::InvalidQuery("request contains no queries".into()));
    }

    let now = clock.now();
    let from = parse_time(req.from.as_deref().unwrap_or(DEFAULT_FROM), now)?;
    let to = parse_time(req.to.as_deref().unwrap_or(DEFAULT_TO), now)?;
    if from > to {
        return Err(QueryError::InvalidQuery(format!(
            "time range starts after it ends ({} > {})",
            from.to_rfc3339(),
            to.to_rfc3339()
        )));
    }
    let time_range = TimeRange { from, to };

    let mut requests: Vec<QueryBatchRequest> = Vec::new();
    let mut batch_index: HashMap<String, usize> = HashMap::new();
    let mut seen: Vec<HashSet<RefId>> = Vec::new();
    let mut expressions = Vec::new();

    for query in req.queries {
        if query.ref_id.is_blank() {
            return Err(QueryError::InvalidQuery("query is missing a refId".into()));
        }

        if is_expression_datasource(&query.datasource) {
            expressions.push(Expression::from_query(query)?);
            continue;
        }

        let key = query
            .datasource
            .group_key()
            .ok_or_else(|| {
                QueryError::InvalidQuery(format!("query {} is missing a datasource", query.ref_id))
            })?
            .to_string();

        let index = *batch_index.entry(key).or_insert_with(|| {
            requests.push(QueryBatchRequest {
                datasource: query.datasource.clone(),
                time_range,
                queries: Vec::new(),
                debug: req.debug,
            });
            seen.push(HashSet::new());
            requests.len() - 1
        });

        if !seen[index].insert(query.ref_id.clone()) {
            return Err(QueryError::InvalidQuery(format!(
                "duplicate refId {} for datasource {}",
                query.ref_id, requests[index].datasource
            )));
        }
        requests[index].queries.push(query);
    }

    // reject broken expression graphs before anything is executed
    if !expressions.is_empty() {
        let primary: HashSet<RefId> = requests
            .iter()
            .flat_map(|r| r.ref_ids())
            .cloned()
            .collect();
        expressions = dependency_order(&expressions, &primary)?;
    }

    Ok(ParsedQueryRequest {
        requests,
        expressions,
    })
}

/// Resolve `now`, `now-6h`, `now+15m`, epoch milliseconds or RFC 3339.
pub fn parse_time(raw: &str, now: DateTime<Utc>) -> QueryResult<DateTime<Utc>> {
    let raw = raw.trim();
    let invalid = || QueryError::InvalidQuery(format!("invalid time {:?}", raw));

    if let Some(rest) = raw.strip_prefix("now") {
        if rest.is_empty() {
            return Ok(now);
        }
        let mut chars = rest.chars();
        let sign = match chars.next() {
            Some('-') => -1,
            Some('+') => 1,
            _ => return Err(invalid()),
        };
        let offset = parse_offset(chars.as_str()).ok_or_else(invalid)?;
        let resolved = if sign < 0 {
            now.checked_sub_signed(offset)
        } else {
            now.checked_add_signed(offset)
        };
        return resolved.ok_or_else(invalid);
    }

    if let Ok(millis) = raw.parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single().ok_or_else(invalid);
    }

    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| invalid())
}

fn parse_offset(amount: &str) -> Option<Duration> {
    let unit_at = amount.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = amount.split_at(unit_at);
    let n: i64 = digits.parse().ok()?;
    match unit {
        "s" => Duration::try_seconds(n),
        "m" => Duration::try_minutes(n),
        "h" => Duration::try_hours(n),
        "d" => Duration::try_days(n),
        "w" => Duration::try_weeks(n),
        _ => None,
    }
}
