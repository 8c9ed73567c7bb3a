//! HTTP handlers for `/api/stream/:stream_id`, `/api/streams` and `/health`.

use std::sync::Arc;

use appkit_stream::{OperationKind, StreamOptions, StreamStatus};
use appkit_types::AppKitError;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::transport::{client_stream, evicted_response, restart_warning, sse_response, Subscription};
use crate::AppState;

pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Body of `POST /api/stream/:stream_id`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub last_event_id: Option<String>,
    pub payload: Option<Value>,
    /// Abort the stream once its last client disconnects.
    #[serde(default)]
    pub single_consumer: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeQuery {
    pub last_event_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StreamSummary {
    pub id: String,
    pub status: StreamStatus,
    pub clients: usize,
}

/// The header wins over an explicit parameter; blank values count as absent.
fn resume_point(headers: &HeaderMap, explicit: Option<String>) -> Option<String> {
    headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(explicit)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

/// `POST /api/stream/:stream_id`: attach to the stream, starting it first
/// if it does not exist.
pub async fn start_or_resume(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: StartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppKitError::InvalidRequest(format!("invalid request body: {e}")))?
    };
    let resume = resume_point(&headers, request.last_event_id);

    if state.manager.status(&stream_id).is_none() {
        if resume.is_some() {
            return Ok(evicted_response(&stream_id, state.heartbeat()));
        }
        let source = state.source.require()?;
        let generator = source.open(&stream_id, request.payload)?;
        let mut options = StreamOptions::with_id(stream_id.clone());
        if request.single_consumer {
            options = options.single_consumer();
        }
        match state.manager.start_stream(options, generator) {
            // Started concurrently by another request: just attach.
            Ok(_) | Err(AppKitError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    attach(&state, &stream_id, resume)
}

/// `GET /api/stream/:stream_id`: attach to an existing stream.
pub async fn resume(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Query(query): Query<ResumeQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let resume = resume_point(&headers, query.last_event_id);
    if state.manager.status(&stream_id).is_none() {
        return match resume {
            Some(_) => Ok(evicted_response(&stream_id, state.heartbeat())),
            None => Err(AppKitError::NotFound { stream_id }.into()),
        };
    }
    attach(&state, &stream_id, resume)
}

fn attach(state: &AppState, stream_id: &str, resume: Option<String>) -> Result<Response, ApiError> {
    let (client, feed) = state.manager.client_channel(stream_id);
    let client_id = client.id();
    let operation = state.operations.register(
        format!("{stream_id}/{client_id}"),
        OperationKind::Stream,
        None,
    )?;

    let attachment = match state.manager.attach_client(stream_id, client, resume.as_deref()) {
        Ok(attachment) => attachment,
        Err(AppKitError::NotFound { .. }) if resume.is_some() => {
            return Ok(evicted_response(stream_id, state.heartbeat()));
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(
        %stream_id,
        client = client_id,
        last_event_id = resume.as_deref().unwrap_or_default(),
        replayed = attachment.replayed,
        restart_required = attachment.restart_required,
        "SSE client attached"
    );

    if attachment.live {
        let manager = Arc::downgrade(&state.manager);
        let id = stream_id.to_string();
        operation.start_heartbeat(state.heartbeat(), move || {
            if let Some(manager) = manager.upgrade() {
                manager.touch(&id);
            }
        });
    }

    let mut prelude = Vec::new();
    if attachment.restart_required {
        prelude.push(restart_warning());
    }
    let subscription = Subscription {
        manager: state.manager.clone(),
        stream_id: stream_id.to_string(),
        client: client_id,
        live: attachment.live,
        operation,
    };
    Ok(sse_response(
        client_stream(prelude, feed, subscription),
        state.heartbeat(),
    ))
}

/// `DELETE /api/stream/:stream_id`
pub async fn abort(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.abort_stream(&stream_id)?;
    tracing::info!(%stream_id, "Stream aborted by request");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/streams`
pub async fn list(State(state): State<AppState>) -> Json<Vec<StreamSummary>> {
    let streams = state
        .manager
        .stream_ids()
        .into_iter()
        .filter_map(|id| {
            let status = state.manager.status(&id)?;
            let clients = state.manager.client_count(&id).unwrap_or(0);
            Some(StreamSummary { id, status, clients })
        })
        .collect();
    Json(streams)
}

pub async fn health() -> &'static str {
    "ok"
}
