//! OpenAI-compatible API routes.
//!
//! These routes let existing OpenAI clients and SDKs talk to the local
//! runtime through the gateway. Chat completions are the only calls that
//! go through admission; the model list is a plain passthrough.

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use futures::{channel::mpsc, StreamExt};
use tollgate_core::{AdmissionError, Admitted, Slot, Ticket, TokenUsage, UsageRecord};
use tracing::{debug, info, warn};

use super::parse_json;
use crate::auth::AuthUser;
use crate::error::ProxyError;
use crate::forward::{ByteStream, ForwardRequest, Forwarded};
use crate::metrics::{self, RequestTimer};
use crate::state::AppState;
use crate::tap::tap;
use crate::types::openai::{ChatCompletionRequest, UsageEnvelope};

/// Header reporting the rank a request took in the wait queue
pub const QUEUE_POSITION_HEADER: &str = "x-queue-position";

/// Chat completions endpoint
///
/// POST /v1/chat/completions
///
/// The request waits for an execution slot (by the caller's priority),
/// is forwarded to the runtime, and its token usage is written to the
/// ledger once known. Streaming responses are relayed chunk by chunk.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let mut request: ChatCompletionRequest = parse_json(&body)?;
    request
        .validate()
        .map_err(|msg| ProxyError::InvalidRequest(msg.to_string()))?;

    info!(
        user_id = %user.id,
        model = %request.model,
        messages = request.messages.len(),
        stream = request.is_streaming(),
        "Handling POST /v1/chat/completions"
    );

    let stream = request.is_streaming();
    if stream {
        request.request_stream_usage();
    }

    let model = request.model.clone();
    let payload = serde_json::to_value(&request)?;
    let priority = state.limiter.priority_for(&user.id).await?;

    state.stats.lock().await.requests_total += 1;
    let timer = RequestTimer::new(&model);

    let forwarder = state.forwarder.clone();
    let submitted = state
        .queue
        .submit(priority, move || async move {
            forwarder
                .forward(ForwardRequest::post("/v1/chat/completions", payload, stream))
                .await
        })
        .await;

    let Admitted { output, slot, ticket } = match submitted {
        Ok(admitted) => admitted,
        Err(err) => {
            {
                let mut stats = state.stats.lock().await;
                if let ProxyError::Admission(AdmissionError::QueueFull(full)) = &err {
                    warn!(user_id = %user.id, depth = full.depth, "Queue full, rejecting request");
                    metrics::record_rejected();
                    stats.requests_rejected += 1;
                } else {
                    stats.requests_failed += 1;
                }
            }
            metrics::observe_queue(&state.queue.status());
            timer.record_failure();
            return Err(err);
        }
    };

    if ticket.was_queued() {
        debug!(
            user_id = %user.id,
            position = ?ticket.position,
            waited_ms = ticket.waited.as_millis() as u64,
            "Request admitted after queueing"
        );
        metrics::record_queue_wait(ticket.waited);
        state.stats.lock().await.requests_queued += 1;
    }
    metrics::observe_queue(&state.queue.status());

    match output {
        Forwarded::Json { status, body } => {
            slot.release();
            metrics::observe_queue(&state.queue.status());

            match UsageEnvelope::from_value(&body) {
                Some(usage) => record_usage(&state, &user.id, &model, usage).await,
                None => debug!(model = %model, "Completion carried no usage"),
            }

            state.stats.lock().await.requests_success += 1;
            timer.record_success();

            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            let mut response = (status, Json(body)).into_response();
            set_queue_position(&mut response, &ticket);
            Ok(response)
        }
        Forwarded::Stream { status, body } => {
            let rx = relay_stream(state.clone(), user.id, model, body, slot, timer);

            let mut response = Response::new(Body::from_stream(rx));
            *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            set_queue_position(&mut response, &ticket);
            Ok(response)
        }
    }
}

/// Drive the upstream stream from a detached task so the slot frees when
/// the runtime finishes, however slowly the client reads. Returns the
/// receiving half that backs the client body.
fn relay_stream(
    state: Arc<AppState>,
    user_id: String,
    model: String,
    upstream: ByteStream,
    slot: Slot,
    timer: RequestTimer,
) -> mpsc::UnboundedReceiver<Result<Bytes, io::Error>> {
    let (tx, rx) = mpsc::unbounded();

    tokio::spawn(async move {
        let (mut tapped, completion) = tap(upstream);
        let mut client_gone = false;
        let mut upstream_failed = false;

        while let Some(chunk) = tapped.next().await {
            if let Err(e) = &chunk {
                warn!(user_id = %user_id, error = %e, "Upstream stream failed");
                upstream_failed = true;
            }
            if !client_gone && tx.unbounded_send(chunk).is_err() {
                debug!(user_id = %user_id, "Client disconnected, draining upstream");
                client_gone = true;
            }
        }
        drop(tx);
        drop(tapped);

        let usage = completion.await;
        slot.release();
        metrics::observe_queue(&state.queue.status());

        match usage {
            Some(usage) => record_usage(&state, &user_id, &model, usage).await,
            None => warn!(user_id = %user_id, model = %model, "Stream ended without usage"),
        }

        let mut stats = state.stats.lock().await;
        if upstream_failed {
            stats.requests_failed += 1;
            timer.record_failure();
        } else {
            stats.requests_success += 1;
            timer.record_success();
        }
    });

    rx
}

fn set_queue_position(response: &mut Response, ticket: &Ticket) {
    if let Some(position) = ticket.position {
        response
            .headers_mut()
            .insert(QUEUE_POSITION_HEADER, HeaderValue::from(position as u64));
    }
}

/// Append a usage record; failures are logged and never reach the caller
async fn record_usage(state: &AppState, user_id: &str, model: &str, usage: TokenUsage) {
    match state.ledger.append(UsageRecord::new(user_id, model, usage)).await {
        Ok(()) => {
            debug!(
                user_id,
                model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Usage recorded"
            );
            metrics::record_usage(model, &usage);
            state.stats.lock().await.tokens_recorded += usage.total_tokens;
        }
        Err(e) => {
            warn!(user_id, model, error = %e, "Failed to record usage");
            metrics::record_usage_failure();
        }
    }
}

/// List models
///
/// GET /v1/models
pub async fn list_models(State(state): State<Arc<AppState>>) -> Result<Response, ProxyError> {
    debug!("Handling GET /v1/models");

    match state.forwarder.forward(ForwardRequest::get("/v1/models")).await? {
        Forwarded::Json { status, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            Ok((status, Json(body)).into_response())
        }
        Forwarded::Stream { .. } => {
            Err(ProxyError::Internal("model list arrived as a stream".to_string()))
        }
    }
}
