//! Server-side expressions: derived computations over already executed
//! query results.
//!
//! Expressions are recognised by their datasource (`__expr__`), ordered by
//! their declared dependencies and handed to an `ExpressionEvaluator` once
//! every primary query has completed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::QueryContext;
use crate::error::{QueryError, QueryResult};
use crate::model::{DatasourceRef, Query, QueryDataResponse};
use crate::types::RefId;

/// Uid (and type) of the built-in expression datasource.
pub const EXPRESSION_DATASOURCE_UID: &str = "__expr__";

/// Uid older dashboards use for the expression datasource.
pub const LEGACY_EXPRESSION_DATASOURCE_UID: &str = "-100";

pub fn is_expression_datasource(ds: &DatasourceRef) -> bool {
    let uid_matches = ds.uid.as_ref().is_some_and(|uid| {
        uid.as_str() == EXPRESSION_DATASOURCE_UID || uid.as_str() == LEGACY_EXPRESSION_DATASOURCE_UID
    });
    let type_matches = ds
        .kind
        .as_ref()
        .is_some_and(|kind| kind.as_str() == EXPRESSION_DATASOURCE_UID);
    uid_matches || type_matches
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionKind {
    Math,
    Reduce,
    Resample,
    Threshold,
    ClassicConditions,
    /// A kind without dependency rules here (`sql`, plugin-defined kinds).
    Other(String),
}

impl ExpressionKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "math" => Self::Math,
            "reduce" => Self::Reduce,
            "resample" => Self::Resample,
            "threshold" => Self::Threshold,
            "classic_conditions" => Self::ClassicConditions,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A derived computation with its own reference ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    #[serde(rename = "refId")]
    pub ref_id: RefId,
    pub kind: ExpressionKind,
    pub expression: Option<String>,
    /// Reference IDs (queries or other expressions) this one reads.
    pub dependencies: Vec<RefId>,
    /// The query the expression was declared as, kept for the evaluator.
    pub query: Query,
}

impl Expression {
    /// Build an expression from a query that targets the expression
    /// datasource.
    ///
    /// Only structural problems are rejected here. Kinds this module has no
    /// dependency rules for are accepted with no dependencies, as are math
    /// expressions over constants.
    pub fn from_query(query: Query) -> QueryResult<Self> {
        let kind_name = query.param_str("type").ok_or_else(|| {
            QueryError::InvalidExpression(format!("expression {} is missing a type", query.ref_id))
        })?;
        let kind = ExpressionKind::from_name(kind_name);

        let expression = query.param_str("expression").map(str::to_string);

        let dependencies = match &kind {
            ExpressionKind::Math => {
                let expr = require_expression(&query, expression.as_deref())?;
                math_variables(expr)
            }
            ExpressionKind::ClassicConditions => classic_condition_refs(&query),
            ExpressionKind::Reduce | ExpressionKind::Resample | ExpressionKind::Threshold => {
                let expr = require_expression(&query, expression.as_deref())?;
                vec![RefId::new(expr.trim().trim_start_matches('$'))]
            }
            ExpressionKind::Other(_) => Vec::new(),
        };

        Ok(Self {
            ref_id: query.ref_id.clone(),
            kind,
            expression,
            dependencies,
            query,
        })
    }
}

fn require_expression<'a>(query: &Query, expression: Option<&'a str>) -> QueryResult<&'a str> {
    match expression {
        Some(expr) if !expr.trim().is_empty() => Ok(expr),
        _ => Err(QueryError::InvalidExpression(format!(
            "expression {} is missing its expression",
            query.ref_id
        ))),
    }
}

/// Variables referenced by a math expression: `$A` or `${A name}`.
fn math_variables(expr: &str) -> Vec<RefId> {
    let mut vars: Vec<RefId> = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            continue;
        }
        let mut name = String::new();
        if matches!(chars.peek(), Some('{')) {
            chars.next();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
        }
        if !name.is_empty() && !vars.iter().any(|v| v.as_str() == name) {
            vars.push(RefId::new(name));
        }
    }

    vars
}

/// Classic conditions name their inputs in `conditions[].query.params[0]`.
fn classic_condition_refs(query: &Query) -> Vec<RefId> {
    let mut refs: Vec<RefId> = Vec::new();
    let conditions = query
        .params
        .get("conditions")
        .and_then(|c| c.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();

    for condition in conditions {
        let Some(ref_id) = condition
            .pointer("/query/params/0")
            .and_then(|v| v.as_str())
        else {
            continue;
        };
        if !refs.iter().any(|r| r.as_str() == ref_id) {
            refs.push(RefId::new(ref_id));
        }
    }

    refs
}

/// Order expressions so that each one comes after every expression it
/// depends on. Ties keep the declaration order.
pub fn dependency_order(
    expressions: &[Expression],
    primary: &HashSet<RefId>,
) -> QueryResult<Vec<Expression>> {
    let mut index: HashMap<&RefId, usize> = HashMap::new();
    for (i, expr) in expressions.iter().enumerate() {
        if primary.contains(&expr.ref_id) {
            return Err(QueryError::InvalidExpression(format!(
                "expression {} reuses the reference ID of a query",
                expr.ref_id
            )));
        }
        if index.insert(&expr.ref_id, i).is_some() {
            return Err(QueryError::InvalidExpression(format!(
                "duplicate expression reference ID {}",
                expr.ref_id
            )));
        }
    }

    let mut indegree = vec![0usize; expressions.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); expressions.len()];

    for (i, expr) in expressions.iter().enumerate() {
        for dep in &expr.dependencies {
            if let Some(&j) = index.get(dep) {
                indegree[i] += 1;
                dependents[j].push(i);
            } else if !primary.contains(dep) {
                return Err(QueryError::InvalidExpression(format!(
                    "expression {} references unknown query {}",
                    expr.ref_id, dep
                )));
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..expressions.len())
        .filter(|&i| indegree[i] == 0)
        .collect();
    let mut ordered = Vec::with_capacity(expressions.len());

    while let Some(i) = ready.pop_front() {
        ordered.push(expressions[i].clone());
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if ordered.len() != expressions.len() {
        let stuck: Vec<&str> = expressions
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] > 0)
            .map(|(_, e)| e.ref_id.as_str())
            .collect();
        return Err(QueryError::InvalidExpression(format!(
            "dependency cycle between expressions: {}",
            stuck.join(", ")
        )));
    }

    Ok(ordered)
}

/// Second-pass stage run over the merged primary results.
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    /// `expressions` are already in dependency order.
    async fn evaluate(
        &self,
        ctx: &QueryContext,
        primary: QueryDataResponse,
        expressions: &[Expression],
    ) -> QueryResult<QueryDataResponse>;
}

/// Evaluator used until server-side expressions are supported: it always
/// refuses rather than returning the primary results unmodified.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedExpressions;

#[async_trait]
impl ExpressionEvaluator for UnsupportedExpressions {
    async fn evaluate(
        &self,
        _ctx: &QueryContext,
        _primary: QueryDataResponse,
        expressions: &[Expression],
    ) -> QueryResult<QueryDataResponse> {
        Err(QueryError::ExpressionsNotImplemented {
            count: expressions.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expr_query(ref_id: &str, kind: &str, expression: &str) -> Query {
        Query::new(ref_id, DatasourceRef::new(EXPRESSION_DATASOURCE_UID, EXPRESSION_DATASOURCE_UID))
            .with_param("type", json!(kind))
            .with_param("expression", json!(expression))
    }

    fn expr(ref_id: &str, kind: &str, expression: &str) -> Expression {
        Expression::from_query(expr_query(ref_id, kind, expression)).unwrap()
    }

    fn primary(ids: &[&str]) -> HashSet<RefId> {
        ids.iter().map(|id| RefId::new(*id)).collect()
    }

    fn order_of(exprs: &[Expression]) -> Vec<&str> {
        exprs.iter().map(|e| e.ref_id.as_str()).collect()
    }

    #[test]
    fn test_expression_datasource_detection() {
        assert!(is_expression_datasource(&DatasourceRef::new("__expr__", "__expr__")));
        assert!(is_expression_datasource(&DatasourceRef {
            kind: None,
            uid: Some("-100".into()),
        }));
        assert!(!is_expression_datasource(&DatasourceRef::new("td", "testdata")));
    }

    #[test]
    fn test_math_dependencies() {
        let e = expr("C", "math", "$A + ${B value} * $A / 2");
        assert_eq!(e.kind, ExpressionKind::Math);
        assert_eq!(e.dependencies, vec![RefId::new("A"), RefId::new("B value")]);
    }

    #[test]
    fn test_reduce_dependency() {
        let e = expr("R", "reduce", "$A");
        assert_eq!(e.dependencies, vec![RefId::new("A")]);
    }

    #[test]
    fn test_classic_conditions_dependencies() {
        let query = Query::new("CC", DatasourceRef::new("__expr__", "__expr__"))
            .with_param("type", json!("classic_conditions"))
            .with_param(
                "conditions",
                json!([
                    { "query": { "params": ["A"] } },
                    { "query": { "params": ["B"] } },
                    { "query": { "params": ["A"] } }
                ]),
            );
        let e = Expression::from_query(query).unwrap();
        assert_eq!(e.dependencies, vec![RefId::new("A"), RefId::new("B")]);
    }

    #[test]
    fn test_missing_type_is_rejected() {
        let query = Query::new("C", DatasourceRef::new("__expr__", "__expr__"))
            .with_param("expression", json!("$A"));
        let err = Expression::from_query(query).unwrap_err();
        assert!(matches!(err, QueryError::InvalidExpression(_)));
    }

    #[test]
    fn test_math_over_constants_has_no_dependencies() {
        let e = expr("C", "math", "1 + 1");
        assert_eq!(e.kind, ExpressionKind::Math);
        assert!(e.dependencies.is_empty());
    }

    #[test]
    fn test_unrecognised_kind_is_kept() {
        let e = expr("B", "sql", "SELECT * FROM A");
        assert_eq!(e.kind, ExpressionKind::Other("sql".into()));
        assert!(e.dependencies.is_empty());

        let ordered = dependency_order(&[e], &primary(&["A"])).unwrap();
        assert_eq!(order_of(&ordered), vec!["B"]);
    }

    #[test]
    fn test_reduce_without_input_is_rejected() {
        let query = Query::new("R", DatasourceRef::new("__expr__", "__expr__"))
            .with_param("type", json!("reduce"));
        let err = Expression::from_query(query).unwrap_err();
        assert!(err.to_string().contains("missing its expression"));
    }

    #[test]
    fn test_dependency_order_respects_chain() {
        // D reads C, C reads B (an expression), B reads A (a query)
        let exprs = vec![
            expr("D", "math", "$C * 2"),
            expr("C", "reduce", "B"),
            expr("B", "math", "$A + 1"),
        ];
        let ordered = dependency_order(&exprs, &primary(&["A"])).unwrap();
        assert_eq!(order_of(&ordered), vec!["B", "C", "D"]);
    }

    #[test]
    fn test_independent_expressions_keep_declaration_order() {
        let exprs = vec![
            expr("X", "math", "$A"),
            expr("Y", "math", "$B"),
            expr("Z", "math", "$A + $B"),
        ];
        let ordered = dependency_order(&exprs, &primary(&["A", "B"])).unwrap();
        assert_eq!(order_of(&ordered), vec!["X", "Y", "Z"]);
    }

    #[test]
    fn test_unknown_reference() {
        let exprs = vec![expr("C", "math", "$A + $Q")];
        let err = dependency_order(&exprs, &primary(&["A"])).unwrap_err();
        assert!(err.to_string().contains("unknown query Q"));
    }

    #[test]
    fn test_cycle_detection() {
        let exprs = vec![
            expr("X", "math", "$Y"),
            expr("Y", "math", "$X"),
            expr("Z", "math", "$A"),
        ];
        let err = dependency_order(&exprs, &primary(&["A"])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"));
        assert!(msg.contains('X') && msg.contains('Y'));
    }

    #[test]
    fn test_expression_reusing_query_ref_id() {
        let exprs = vec![expr("A", "math", "$B")];
        let err = dependency_order(&exprs, &primary(&["A", "B"])).unwrap_err();
        assert!(err.to_string().contains("reuses"));
    }

    #[tokio::test]
    async fn test_unsupported_evaluator_refuses() {
        let ctx = QueryContext::new();
        let exprs = vec![expr("C", "math", "$A")];
        let err = UnsupportedExpressions
            .evaluate(&ctx, QueryDataResponse::new(), &exprs)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::ExpressionsNotImplemented { count: 1 }));
    }
}
