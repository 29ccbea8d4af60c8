// Building and merging per-datasource response fragments

use std::collections::HashSet;
use std::fmt::Display;

use crate::model::{DataResponse, QueryBatchRequest, QueryDataResponse};
use crate::types::RefId;

/// Apply `err` to every query of the batch. All entries belong to the same
/// datasource.
pub fn build_error_response(err: impl Display, req: &QueryBatchRequest) -> QueryDataResponse {
    let message = err.to_string();
    req.ref_ids()
        .map(|ref_id| (ref_id.clone(), DataResponse::error(&message)))
        .collect()
}

/// Fill in an error entry for every reference ID of `req` the backend left
/// out, so no query is silently dropped.
pub fn fill_missing(rsp: &mut QueryDataResponse, req: &QueryBatchRequest) -> usize {
    let mut filled = 0;
    for ref_id in req.ref_ids() {
        if !rsp.contains(ref_id.as_str()) {
            rsp.insert(
                ref_id.clone(),
                DataResponse::error("datasource returned no response for this query"),
            );
            filled += 1;
        }
    }
    filled
}

/// Remove entries for reference IDs that were not part of `req` and return
/// them. A batch may only answer for its own queries.
pub fn drop_unrequested(rsp: &mut QueryDataResponse, req: &QueryBatchRequest) -> Vec<RefId> {
    let requested: HashSet<&RefId> = req.ref_ids().collect();
    let mut dropped = Vec::new();
    rsp.results.retain(|ref_id, _| {
        let keep = requested.contains(ref_id);
        if !keep {
            dropped.push(ref_id.clone());
        }
        keep
    });
    dropped
}

/// Merge `fragment` into `target`. Entries already present are replaced
/// (last write wins); each replacement is logged since batches are expected
/// to use disjoint reference IDs.
pub fn merge_into(target: &mut QueryDataResponse, fragment: QueryDataResponse) -> usize {
    let mut collisions = 0;
    for (ref_id, response) in fragment {
        let key = ref_id.clone();
        if target.insert(ref_id, response).is_some() {
            collisions += 1;
            tracing::warn!(ref_id = %key, "reference ID returned by more than one datasource, keeping the latest");
        }
    }
    collisions
}

/// Fold fragments in the given order.
pub fn merge_responses<I>(fragments: I) -> QueryDataResponse
where
    I: IntoIterator<Item = QueryDataResponse>,
{
    let mut merged = QueryDataResponse::new();
    for fragment in fragments {
        merge_into(&mut merged, fragment);
    }
    merged
}
