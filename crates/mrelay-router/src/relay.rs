use std::collections::VecDeque;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Extension, Multipart, Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};

use mrelay_adapter::{ClaudeStreamAdapter, RelayRequest, chat_response_to_claude, claude_request_to_chat};
use mrelay_core::{Caller, FileInput, RelayError, RelayOutcome, RelayPipeline};
use mrelay_protocol::openai::{ChatCompletionResponse, ModelList, ModelObject};
use mrelay_protocol::sse::SseDecoder;
use mrelay_protocol::{claude, mj, openai, suno};
use mrelay_storage::{TaskRow, TaskStatus};

#[derive(Clone)]
struct RouterState {
    pipeline: Arc<RelayPipeline>,
}

pub fn relay_router(pipeline: Arc<RelayPipeline>) -> Router {
    let state = RouterState { pipeline };

    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(images_generations))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/audio/transcriptions", post(audio_transcriptions))
        .route("/v1/audio/translations", post(audio_translations))
        .route("/v1/moderations", post(moderations))
        .route("/v1/messages", post(claude_messages))
        .route("/v1/models", get(models_list))
        .route("/mj/submit/{action}", post(mj_submit))
        .route("/mj/task/{task_id}/fetch", get(mj_task_fetch))
        .route("/mj/task/list", get(mj_task_list))
        .route("/suno/submit/{action}", post(suno_submit))
        .route("/suno/fetch/{task_id}", get(suno_fetch))
        .route("/v1/files", post(files_upload))
        .route("/api/file/upload", post(files_upload))
        .route("/v1/files/batch-upload", post(files_batch_upload))
        .route("/v1/files/batch-status", post(files_batch_status))
        .layer(middleware::from_fn_with_state(state.clone(), relay_auth))
        .with_state(state)
}

/// Bearer auth for every relay endpoint; the resolved caller rides as an
/// extension.
async fn relay_auth(
    State(state): State<RouterState>,
    mut request: axum::extract::Request,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .unwrap_or_default()
        .to_string();

    match state.pipeline.authenticate(&bearer).await {
        Ok(caller) => {
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &RelayError) -> Response {
    tracing::debug!(event = "relay_error", kind = ?err.kind, message = %err.message);
    let mut response = Response::new(Body::from(err.body()));
    *response.status_mut() = err.status_code();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn json_response(status: StatusCode, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn sse_response<S>(status: StatusCode, stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

fn outcome_response(outcome: RelayOutcome) -> Response {
    match outcome {
        RelayOutcome::Json { status, body } => json_response(status, body),
        RelayOutcome::Stream { status, frames } => sse_response(status, frames),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, RelayError> {
    serde_json::from_slice(body)
        .map_err(|err| RelayError::invalid_request(format!("invalid json body: {err}")))
}

async fn relay_canonical(
    state: &RouterState,
    caller: &Caller,
    request: RelayRequest,
) -> Response {
    match state.pipeline.relay(caller, request).await {
        Ok(outcome) => outcome_response(outcome),
        Err(err) => error_response(&err),
    }
}

// ---- OpenAI dialect ---------------------------------------------------------

async fn chat_completions(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    match parse_body::<openai::ChatCompletionRequest>(&body) {
        Ok(request) => relay_canonical(&state, &caller, RelayRequest::Chat(request)).await,
        Err(err) => error_response(&err),
    }
}

async fn completions(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    match parse_body::<openai::CompletionRequest>(&body) {
        Ok(request) => relay_canonical(&state, &caller, RelayRequest::Completion(request)).await,
        Err(err) => error_response(&err),
    }
}

async fn embeddings(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    match parse_body::<openai::EmbeddingRequest>(&body) {
        Ok(request) => relay_canonical(&state, &caller, RelayRequest::Embedding(request)).await,
        Err(err) => error_response(&err),
    }
}

async fn images_generations(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    match parse_body::<openai::ImageRequest>(&body) {
        Ok(request) => relay_canonical(&state, &caller, RelayRequest::Image(request)).await,
        Err(err) => error_response(&err),
    }
}

async fn audio_speech(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    match parse_body::<openai::SpeechRequest>(&body) {
        Ok(request) => relay_canonical(&state, &caller, RelayRequest::Speech(request)).await,
        Err(err) => error_response(&err),
    }
}

async fn moderations(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    match parse_body::<openai::ModerationRequest>(&body) {
        Ok(request) => relay_canonical(&state, &caller, RelayRequest::Moderation(request)).await,
        Err(err) => error_response(&err),
    }
}

async fn audio_transcriptions(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    multipart: Multipart,
) -> Response {
    transcribe(state, caller, multipart, false).await
}

async fn audio_translations(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    multipart: Multipart,
) -> Response {
    transcribe(state, caller, multipart, true).await
}

async fn transcribe(
    state: RouterState,
    caller: Caller,
    mut multipart: Multipart,
    translate: bool,
) -> Response {
    let mut model = None;
    let mut file: Option<(String, Bytes)> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => match field.name() {
                Some("model") => model = field.text().await.ok(),
                Some("file") => {
                    let name = field
                        .file_name()
                        .unwrap_or("audio")
                        .to_string();
                    match field.bytes().await {
                        Ok(data) => file = Some((name, data)),
                        Err(err) => {
                            return error_response(&RelayError::invalid_request(format!(
                                "unreadable file part: {err}"
                            )));
                        }
                    }
                }
                _ => {}
            },
            Ok(None) => break,
            Err(err) => {
                return error_response(&RelayError::invalid_request(format!(
                    "invalid multipart body: {err}"
                )));
            }
        }
    }

    let Some(model) = model else {
        return error_response(&RelayError::invalid_request("missing model field"));
    };
    let Some((file_name, data)) = file else {
        return error_response(&RelayError::invalid_request("missing file part"));
    };
    relay_canonical(
        &state,
        &caller,
        RelayRequest::Transcription {
            model,
            file_name,
            data,
            translate,
        },
    )
    .await
}

async fn models_list(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
) -> Response {
    let models = state.pipeline.cache().models_for_group(&caller.group);
    let list = ModelList {
        object: "list".to_string(),
        data: models
            .into_iter()
            .map(|id| ModelObject {
                id,
                object: "model".to_string(),
                created: 0,
                owned_by: "mrelay".to_string(),
            })
            .collect(),
    };
    match serde_json::to_vec(&list) {
        Ok(body) => json_response(StatusCode::OK, Bytes::from(body)),
        Err(err) => error_response(&RelayError::internal(err.to_string())),
    }
}

// ---- Anthropic dialect ------------------------------------------------------

async fn claude_messages(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    let request = match parse_body::<claude::MessagesRequest>(&body) {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };
    let chat = claude_request_to_chat(&request);

    match state.pipeline.relay(&caller, RelayRequest::Chat(chat)).await {
        Ok(RelayOutcome::Json { status, body }) => {
            match serde_json::from_slice::<ChatCompletionResponse>(&body) {
                Ok(canonical) => {
                    let claude_response = chat_response_to_claude(&canonical);
                    match serde_json::to_vec(&claude_response) {
                        Ok(body) => json_response(status, Bytes::from(body)),
                        Err(err) => error_response(&RelayError::internal(err.to_string())),
                    }
                }
                Err(err) => error_response(&RelayError::internal(format!(
                    "canonical response unreadable: {err}"
                ))),
            }
        }
        Ok(RelayOutcome::Stream { status, frames }) => {
            sse_response(status, claude_dialect_stream(frames))
        }
        Err(err) => error_response(&err),
    }
}

/// Replays canonical chunk frames as Anthropic named events, preserving
/// order. The wrapped stream keeps the billing guard alive.
fn claude_dialect_stream(
    frames: mrelay_core::GuardedStream,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    struct DialectState {
        frames: mrelay_core::GuardedStream,
        decoder: SseDecoder,
        adapter: ClaudeStreamAdapter,
        pending: VecDeque<Bytes>,
        done: bool,
    }

    futures_util::stream::unfold(
        DialectState {
            frames,
            decoder: SseDecoder::new(),
            adapter: ClaudeStreamAdapter::new(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(frame) = state.pending.pop_front() {
                    return Some((Ok(frame), state));
                }
                if state.done {
                    return None;
                }
                match state.frames.next().await {
                    Some(Ok(chunk)) => {
                        for frame in state.decoder.push_bytes(&chunk) {
                            state
                                .pending
                                .extend(state.adapter.on_canonical_data(&frame.data));
                        }
                    }
                    Some(Err(err)) => {
                        state.done = true;
                        state.pending.extend(state.adapter.finish());
                        tracing::warn!(event = "claude_dialect_stream_error", error = %err);
                    }
                    None => {
                        state.done = true;
                        state.pending.extend(state.adapter.finish());
                    }
                }
            }
        },
    )
}

// ---- Midjourney / Suno dialects --------------------------------------------

async fn mj_submit(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    Path(action): Path<String>,
    body: Bytes,
) -> Response {
    let request = match parse_body::<mj::SubmitRequest>(&body) {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };
    match state
        .pipeline
        .relay_task_submit(&caller, RelayRequest::MjSubmit {
            action,
            body: request,
        })
        .await
    {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => error_response(&err),
    }
}

async fn mj_task_fetch(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    Path(task_id): Path<String>,
) -> Response {
    match state.pipeline.task_fetch(&caller, &task_id).await {
        Ok(task) => match serde_json::to_vec(&mj_task_view(&task)) {
            Ok(body) => json_response(StatusCode::OK, Bytes::from(body)),
            Err(err) => error_response(&RelayError::internal(err.to_string())),
        },
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    limit: Option<usize>,
}

async fn mj_task_list(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<TaskListQuery>,
) -> Response {
    match state.pipeline.task_list(&caller, query.limit).await {
        Ok(tasks) => {
            let views: Vec<Value> = tasks.iter().map(mj_task_view).collect();
            match serde_json::to_vec(&views) {
                Ok(body) => json_response(StatusCode::OK, Bytes::from(body)),
                Err(err) => error_response(&RelayError::internal(err.to_string())),
            }
        }
        Err(err) => error_response(&err),
    }
}

async fn suno_submit(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    Path(action): Path<String>,
    body: Bytes,
) -> Response {
    let request = match parse_body::<suno::SubmitRequest>(&body) {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };
    match state
        .pipeline
        .relay_task_submit(&caller, RelayRequest::SunoSubmit {
            action,
            body: request,
        })
        .await
    {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => error_response(&err),
    }
}

async fn suno_fetch(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    Path(task_id): Path<String>,
) -> Response {
    match state.pipeline.task_fetch(&caller, &task_id).await {
        Ok(task) => {
            let view = json!({
                "code": "success",
                "data": {
                    "task_id": task.task_id,
                    "status": dialect_status(task.status),
                    "fail_reason": task.fail_reason,
                    "data": task.result_data,
                },
            });
            json_response(StatusCode::OK, Bytes::from(view.to_string()))
        }
        Err(err) => error_response(&err),
    }
}

/// Upstream task views were stored verbatim; overlay the relay's own status
/// fields so clients see progress even before the first poll lands.
fn mj_task_view(task: &TaskRow) -> Value {
    let mut view = task
        .result_data
        .clone()
        .unwrap_or_else(|| json!({}));
    if let Some(object) = view.as_object_mut() {
        object.insert("id".to_string(), json!(task.task_id));
        object.insert("action".to_string(), json!(task.action.to_ascii_uppercase()));
        object.insert("status".to_string(), json!(dialect_status(task.status)));
        object.insert("progress".to_string(), json!(format!("{}%", task.progress)));
        if let Some(reason) = &task.fail_reason {
            object.insert("failReason".to_string(), json!(reason));
        }
        object.insert(
            "submitTime".to_string(),
            json!(task.submit_at.unix_timestamp()),
        );
        if let Some(start) = task.start_at {
            object.insert("startTime".to_string(), json!(start.unix_timestamp()));
        }
        if let Some(finish) = task.finish_at {
            object.insert("finishTime".to_string(), json!(finish.unix_timestamp()));
        }
    }
    view
}

fn dialect_status(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Submitted => "SUBMITTED",
        TaskStatus::InProgress => "IN_PROGRESS",
        TaskStatus::Success => "SUCCESS",
        TaskStatus::Failure => "FAILURE",
    }
}

// ---- File relay -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UploadQuery {
    model: Option<String>,
}

const DEFAULT_FILE_MODEL: &str = "gemini-2.0-flash";

async fn files_upload(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<UploadQuery>,
    multipart: Multipart,
) -> Response {
    upload_multipart(state, caller, query, multipart).await
}

async fn files_batch_upload(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<UploadQuery>,
    multipart: Multipart,
) -> Response {
    upload_multipart(state, caller, query, multipart).await
}

async fn upload_multipart(
    state: RouterState,
    caller: Caller,
    query: UploadQuery,
    mut multipart: Multipart,
) -> Response {
    let model = query
        .model
        .unwrap_or_else(|| DEFAULT_FILE_MODEL.to_string());
    let mut inputs = Vec::new();
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() == Some("path") {
                    match field.text().await {
                        Ok(path) => inputs.push(FileInput::LocalPath { path }),
                        Err(err) => {
                            return error_response(&RelayError::invalid_request(format!(
                                "unreadable path field: {err}"
                            )));
                        }
                    }
                    continue;
                }
                let name = field
                    .file_name()
                    .unwrap_or("file")
                    .to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                match field.bytes().await {
                    Ok(data) => inputs.push(FileInput::Bytes {
                        name,
                        mime_type,
                        data,
                    }),
                    Err(err) => {
                        return error_response(&RelayError::invalid_request(format!(
                            "unreadable file part: {err}"
                        )));
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                return error_response(&RelayError::invalid_request(format!(
                    "invalid multipart body: {err}"
                )));
            }
        }
    }

    match state
        .pipeline
        .relay_file_upload(&caller, &model, inputs)
        .await
    {
        Ok(uploaded) => {
            let body = json!({"files": uploaded});
            json_response(StatusCode::OK, Bytes::from(body.to_string()))
        }
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct BatchStatusRequest {
    files: Vec<String>,
    model: Option<String>,
}

async fn files_batch_status(
    State(state): State<RouterState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    let request = match parse_body::<BatchStatusRequest>(&body) {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };
    let model = request
        .model
        .unwrap_or_else(|| DEFAULT_FILE_MODEL.to_string());
    match state
        .pipeline
        .relay_file_status(&caller, &model, request.files)
        .await
    {
        Ok(statuses) => {
            let body = json!({"files": statuses});
            json_response(StatusCode::OK, Bytes::from(body.to_string()))
        }
        Err(err) => error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    #[test]
    fn mj_view_overlays_relay_state() {
        let task = TaskRow {
            id: 1,
            task_id: "mj-174".to_string(),
            platform: "mj".to_string(),
            user_id: 1,
            token_id: 1,
            channel_id: 1,
            action: "imagine".to_string(),
            status: TaskStatus::InProgress,
            progress: 45,
            submit_at: OffsetDateTime::UNIX_EPOCH,
            start_at: None,
            finish_at: None,
            quota: 50,
            quota_settled: false,
            fail_reason: None,
            result_data: Some(json!({"imageUrl": "https://cdn/img.png"})),
        };
        let view = mj_task_view(&task);
        assert_eq!(view["status"], "IN_PROGRESS");
        assert_eq!(view["progress"], "45%");
        assert_eq!(view["imageUrl"], "https://cdn/img.png");
        assert_eq!(view["action"], "IMAGINE");
    }
}
