use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    body::StreamBody,
    extract::{Extension, Multipart, Path, Query, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chat_api::{
    CreateConversationRequest, DeleteMessageQuery, EditMessageRequest, ErrorBody,
    ResolveRecipientsRequest, ResolveRecipientsResponse, SendMessageRequest, UploadResponse,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::store::{Store, StoreError};

/// Audio objects are streamed in pieces of this size.
const AUDIO_CHUNK: usize = 4096;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Mutex<Store>>,
    /// Stream audio without Content-Length, like services that do not know it upfront.
    pub omit_audio_length: bool,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            omit_audio_length: false,
        }
    }
}

/// Id of the user the bearer token belongs to.
#[derive(Clone, Debug)]
pub struct CurrentUser(pub String);

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorBody>)>;

fn err(status: StatusCode, msg: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error: msg.to_string(),
        }),
    )
}

fn store_err(e: StoreError) -> (StatusCode, Json<ErrorBody>) {
    let status = match e {
        StoreError::NotFound => StatusCode::NOT_FOUND,
        StoreError::Forbidden => StatusCode::FORBIDDEN,
        StoreError::EditWindowExpired => StatusCode::CONFLICT,
        StoreError::EmptyMessage
        | StoreError::InvalidBroadcast
        | StoreError::UnknownParticipant => StatusCode::BAD_REQUEST,
    };
    err(status, &e.to_string())
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/api/conversations/:id/messages",
            get(list_messages)
                .post(send_message)
                .patch(edit_message)
                .delete(delete_message),
        )
        .route("/api/conversations/:id/read", post(mark_read))
        .route("/api/audio-objects", post(upload_audio))
        .route("/api/audio-objects/:id", get(download_audio))
        .route("/api/broadcast/filter-options", get(filter_options))
        .route("/api/broadcast/resolve-recipients", post(resolve_recipients))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    let user = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| {
            let store = state.store.lock();
            store.user_by_token(token).map(|u| u.participant.id.clone())
        });
    match user {
        Some(id) => {
            req.extensions_mut().insert(CurrentUser(id));
            Ok(next.run(req).await)
        }
        None => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> impl IntoResponse {
    Json(state.store.lock().list_conversations(&user))
}

async fn create_conversation(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<impl IntoResponse> {
    let created = state
        .store
        .lock()
        .create_conversation(&user, &req.participant_ids, req.name)
        .map_err(store_err)?;
    info!(conversation = %created.id, "conversation created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let messages = state
        .store
        .lock()
        .list_messages(&user, &id)
        .map_err(store_err)?;
    Ok(Json(messages))
}

async fn send_message(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .store
        .lock()
        .send_message(&user, &id, &req)
        .map_err(store_err)?;
    debug!(conversation = %id, message = %message.id, "message stored");
    Ok(Json(message))
}

async fn edit_message(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .store
        .lock()
        .edit_message(&user, &id, &req.message_id, &req.text)
        .map_err(store_err)?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    Query(query): Query<DeleteMessageQuery>,
) -> ApiResult<StatusCode> {
    state
        .store
        .lock()
        .delete_message(&user, &id, &query.message_id)
        .map_err(store_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_read(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .store
        .lock()
        .mark_read(&user, &id)
        .map_err(store_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_audio(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let mut data = None;
    let mut duration = 0u32;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| err(StatusCode::BAD_REQUEST, "invalid_multipart"))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|_| err(StatusCode::BAD_REQUEST, "invalid_multipart"))?;
                data = Some(bytes);
            }
            Some("duration_seconds") => {
                let text = field
                    .text()
                    .await
                    .map_err(|_| err(StatusCode::BAD_REQUEST, "invalid_multipart"))?;
                duration = text
                    .trim()
                    .parse()
                    .map_err(|_| err(StatusCode::BAD_REQUEST, "invalid_duration"))?;
            }
            _ => {}
        }
    }
    let data = data.ok_or_else(|| err(StatusCode::BAD_REQUEST, "missing_file"))?;
    let size = data.len();
    let url = state.store.lock().put_audio(data, duration);
    info!(bytes = size, duration, %url, "audio object stored");
    Ok(Json(UploadResponse { url }))
}

async fn download_audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let object = state
        .store
        .lock()
        .audio(&id)
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "not_found"))?;
    let content_type = [(header::CONTENT_TYPE, HeaderValue::from_static("audio/webm"))];
    if !state.omit_audio_length {
        return Ok((content_type, object.data).into_response());
    }
    let chunks: Vec<Result<Bytes, std::io::Error>> = object
        .data
        .chunks(AUDIO_CHUNK)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    let body = StreamBody::new(futures::stream::iter(chunks));
    Ok((content_type, body).into_response())
}

async fn filter_options(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.lock().filter_options())
}

async fn resolve_recipients(
    State(state): State<AppState>,
    Json(req): Json<ResolveRecipientsRequest>,
) -> impl IntoResponse {
    let count = state.store.lock().resolve(&req.filter);
    Json(ResolveRecipientsResponse { count })
}

pub async fn run_http_server(addr: SocketAddr, state: AppState) -> Result<()> {
    info!(%addr, "conversation stub listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}
