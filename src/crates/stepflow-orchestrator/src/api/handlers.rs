//! Request handlers: thin translation between axum extractors and
//! [`crate::Runtime`] methods, grounded on the teacher's `api/handlers/*`
//! shape of one small function per route.

use super::error::{ApiError, ApiResult};
use super::models::*;
use super::response::{created, ok, paginated};
use super::routes::AppState;
use axum::extract::{Path, Query, State};
use axum::response::{sse::Event as SseEvent, IntoResponse, Sse};
use axum::Json;
use futures::stream::{self, Stream};
use futures::StreamExt;
use std::convert::Infallible;
use std::time::Duration;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    ok(HealthResponse {
        status: "ok",
        active_runs: state.runtime.active_run_count(),
    })
}

pub async fn create_run(State(state): State<AppState>, Json(req): Json<CreateRunRequest>) -> ApiResult<impl IntoResponse> {
    let (run_id, etag) = state.runtime.create_run(&req.flow_id, req.params).await?;
    Ok(created(RunHandle { run_id, etag }))
}

pub async fn get_state(State(state): State<AppState>, Path(run_id): Path<String>) -> ApiResult<impl IntoResponse> {
    let loaded = state.runtime.get_state(&run_id).await?;
    Ok(ok(RunStateView {
        run_id: loaded.state.run_id,
        flow_id: loaded.state.flow_id,
        status: loaded.state.status,
        current_node_id: loaded.state.current_node_id,
        step_count: loaded.state.step_count,
        stack_depth: loaded.state.interruption_stack.len(),
        needs_human: loaded.state.needs_human,
        etag: loaded.etag,
    }))
}

pub async fn pause(State(state): State<AppState>, Path(run_id): Path<String>, Json(req): Json<EtagRequest>) -> ApiResult<impl IntoResponse> {
    let etag = state.runtime.pause(&run_id, &req.etag).await?;
    Ok(ok(EtagResponse { etag }))
}

pub async fn resume(State(state): State<AppState>, Path(run_id): Path<String>, Json(req): Json<EtagRequest>) -> ApiResult<impl IntoResponse> {
    let etag = state.runtime.resume(&run_id, &req.etag).await?;
    Ok(ok(EtagResponse { etag }))
}

pub async fn cancel(State(state): State<AppState>, Path(run_id): Path<String>, Json(req): Json<EtagRequest>) -> ApiResult<impl IntoResponse> {
    let etag = state.runtime.cancel(&run_id, &req.etag).await?;
    Ok(ok(EtagResponse { etag }))
}

pub async fn inject_node(State(state): State<AppState>, Path(run_id): Path<String>, Json(req): Json<InjectNodeRequest>) -> ApiResult<impl IntoResponse> {
    let etag = state.runtime.inject_node(&run_id, &req.etag, &req.node_id, req.position).await?;
    Ok(ok(EtagResponse { etag }))
}

pub async fn interrupt(State(state): State<AppState>, Path(run_id): Path<String>, Json(req): Json<InterruptRequest>) -> ApiResult<impl IntoResponse> {
    let etag = state.runtime.interrupt(&run_id, &req.etag, &req.detour_flow_id, req.resume_after).await?;
    Ok(ok(EtagResponse { etag }))
}

pub async fn list_runs(State(state): State<AppState>, Query(q): Query<ListRunsQuery>) -> ApiResult<impl IntoResponse> {
    let runs = state.runtime.list_runs(q.status, q.flow_id_prefix.as_deref()).await?;
    let total = runs.len();
    let summaries: Vec<RunSummary> = runs
        .into_iter()
        .map(|loaded| RunSummary {
            run_id: loaded.state.run_id,
            flow_id: loaded.state.flow_id,
            status: loaded.state.status,
            step_count: loaded.state.step_count,
            updated_at: loaded.state.updated_at,
        })
        .collect();
    Ok(paginated(summaries, total))
}

/// SSE stream of a run's events from `from_seq` onward (spec §11.3). Each
/// frame is a JSON-encoded `Event`; a `stream_gap` kind (spec §4.8) tells the
/// subscriber it missed events rather than leaving a silent hole.
///
/// A reconnecting client's `from_seq` is usually behind the live broadcast
/// channel's buffer, so the persisted log is replayed first: subscribe to
/// the live channel before reading the backlog (so nothing published in
/// between is lost), then yield everything recovered from the store with
/// `seq > from_seq`, then continue with the live channel, skipping any
/// event the backlog already covered.
pub async fn subscribe_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(q): Query<SubscribeQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    // Confirm the run exists before opening a long-lived stream.
    state.runtime.get_state(&run_id).await.map_err(ApiError::from)?;

    let from_seq = q.from_seq.unwrap_or(0);
    let receiver = state.runtime.event_bus().subscribe(&run_id);

    let mut backlog = state.runtime.recover_events(&run_id).await.map_err(ApiError::from)?;
    backlog.retain(|e| e.seq > from_seq);
    backlog.sort_by_key(|e| e.seq);
    let last_backfilled_seq = backlog.last().map(|e| e.seq).unwrap_or(from_seq);

    let backlog_stream = stream::iter(backlog.into_iter().map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().data(payload))
    }));

    let live_stream = stream::unfold((receiver, run_id, last_backfilled_seq), move |(mut rx, run_id, mut seq)| async move {
        loop {
            match crate::events::next_event(&run_id, &mut rx, &mut seq).await {
                Some(event) => {
                    if event.seq <= last_backfilled_seq {
                        continue;
                    }
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok(SseEvent::default().data(payload)), (rx, run_id, seq)));
                }
                None => return None,
            }
        }
    });

    Ok(Sse::new(backlog_stream.chain(live_stream)).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}
