//! Scripted executor and fixtures shared by the coordinator tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::{DatasourceExecutor, QueryContext};
use crate::model::{
    DataResponse, DatasourceRef, Frame, Query, QueryBatchRequest, QueryDataResponse, TimeRange,
};
use crate::types::RefId;

/// What the fake does for batches of a given datasource uid.
#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Respond,
    RespondAfter(Duration),
    Fail(&'static str),
    Panic(&'static str),
    PanicOpaque,
    Hang,
    /// Answer only the first query of the batch.
    Partial,
    /// Answer the batch plus an entry for a reference ID it was not sent.
    AnswerAlso(&'static str),
}

pub(crate) struct FakeExecutor {
    behaviors: HashMap<String, Behavior>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeExecutor {
    pub(crate) fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_behavior(mut self, uid: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(uid.to_string(), behavior);
        self
    }

    /// Delay applied to every `Respond` batch.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Frames are named `<uid>:<refId>` so tests can tell which batch produced
/// an entry.
fn respond(uid: &str, req: &QueryBatchRequest) -> QueryDataResponse {
    req.ref_ids()
        .map(|ref_id| {
            let frame = Frame::new(format!("{}:{}", uid, ref_id));
            (ref_id.clone(), DataResponse::frames(vec![frame]))
        })
        .collect()
}

#[async_trait]
impl DatasourceExecutor for FakeExecutor {
    async fn execute(
        &self,
        _ctx: &QueryContext,
        req: &QueryBatchRequest,
    ) -> Result<QueryDataResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let uid = req.datasource.group_key().unwrap_or_default().to_string();
        let behavior = self.behaviors.get(&uid).cloned().unwrap_or(Behavior::Respond);

        match behavior {
            Behavior::Respond => {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                Ok(respond(&uid, req))
            }
            Behavior::RespondAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(respond(&uid, req))
            }
            Behavior::Fail(msg) => Err(anyhow!(msg)),
            Behavior::Panic(msg) => std::panic::panic_any(msg),
            Behavior::PanicOpaque => std::panic::panic_any(42u32),
            Behavior::Hang => std::future::pending().await,
            Behavior::Partial => {
                let mut rsp = respond(&uid, req);
                let first = req.queries.first().map(|q| q.ref_id.clone());
                rsp.results.retain(|ref_id, _| Some(ref_id) == first.as_ref());
                Ok(rsp)
            }
            Behavior::AnswerAlso(extra) => {
                let mut rsp = respond(&uid, req);
                let frame = Frame::new(format!("{}:{}", uid, extra));
                rsp.insert(RefId::new(extra), DataResponse::frames(vec![frame]));
                Ok(rsp)
            }
        }
    }
}

pub(crate) fn batch(uid: &str, refs: &[&str]) -> QueryBatchRequest {
    let datasource = DatasourceRef::new(uid, "fake");
    QueryBatchRequest {
        datasource: datasource.clone(),
        time_range: TimeRange {
            from: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            to: Utc.timestamp_opt(1_700_003_600, 0).unwrap(),
        },
        queries: refs
            .iter()
            .map(|r| Query::new(*r, datasource.clone()))
            .collect(),
        debug: false,
    }
}

/// Name of the first frame stored under `ref_id`.
pub(crate) fn frame_name<'a>(rsp: &'a QueryDataResponse, ref_id: &str) -> Option<&'a str> {
    rsp.get(ref_id)?
        .data()?
        .first()?
        .name
        .as_deref()
}
