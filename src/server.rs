use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::generation::{GenerationCallback, GenerationSpec, MusicGenerator};
use crate::lyricist::{LyricsWriter, SongBrief};
use crate::mailer::{otp_email, Mailer};
use crate::payments::{
    idempotency_key, PaymentStatus, PaymentStore, PaymentWebhookEvent, RazorpayClient, PRICE_PAISE,
};
use crate::requests::{
    DraftSource, LyricsDraft, Owner, RequestStatus, RequestStore, SongRequest, SongRequestCreate,
};
use crate::segment::{segment_lines, LyricLine};
use crate::songs::{Song, SongStore};
use crate::status::{self, CallbackKind, SongStatus};
use crate::users::{AnonymousUser, User, UserStore};

#[derive(Clone)]
pub struct AppState {
    pub users: UserStore,
    pub requests: RequestStore,
    pub songs: SongStore,
    pub payment_store: PaymentStore,
    pub generator: Arc<dyn MusicGenerator>,
    pub lyricist: Arc<dyn LyricsWriter>,
    pub mailer: Arc<dyn Mailer>,
    pub payments: Arc<RazorpayClient>,
    pub auth_secret: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/auth/otp/request", post(request_otp))
        .route("/auth/otp/verify", post(verify_otp))
        .route("/auth/anonymous", post(create_anonymous))
        .route("/auth/me", get(me))
        .route("/requests", get(list_requests).post(create_request))
        .route("/requests/:id", get(get_request))
        .route(
            "/requests/:id/lyrics",
            get(list_drafts).post(generate_lyrics),
        )
        .route("/requests/:id/approve", post(approve_draft))
        .route("/requests/:id/generate", post(start_generation))
        .route("/lyrics/:id", put(edit_draft))
        .route("/lyrics/:id/refine", post(refine_draft))
        .route("/songs", get(list_songs))
        .route("/songs/:id", get(get_song))
        .route("/songs/:id/play", get(get_playback))
        .route("/api/song/status/:id", post(poll_status))
        .route("/payments/order", post(create_payment_order))
        .route("/webhooks/generation", post(generation_webhook))
        .route("/webhooks/payment", post(payment_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Root endpoint
async fn root() -> &'static str {
    "Melodia API v0.1.0"
}

// ========== IDENTITY ==========

/// Resolve the caller's identity: a signed bearer token, or an anonymous
/// session id in `X-Anonymous-Id`.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Owner, StatusCode> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let token = auth::bearer_token(value).ok_or(StatusCode::UNAUTHORIZED)?;
        let user_id = auth::verify_token(&state.auth_secret, token).map_err(|e| {
            tracing::debug!("Token rejected: {}", e);
            StatusCode::UNAUTHORIZED
        })?;

        let user = state.users.get_user(&user_id).await.map_err(|e| {
            tracing::error!("Failed to load user {}: {}", user_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

        return match user {
            Some(user) => Ok(Owner::User(user.id)),
            None => Err(StatusCode::UNAUTHORIZED),
        };
    }

    if let Some(anon_id) = headers.get("x-anonymous-id").and_then(|v| v.to_str().ok()) {
        let anon = state.users.get_anonymous(anon_id).await.map_err(|e| {
            tracing::error!("Failed to load anonymous session: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

        return match anon {
            Some(anon) => Ok(Owner::Anonymous(anon.id)),
            None => Err(StatusCode::UNAUTHORIZED),
        };
    }

    Err(StatusCode::UNAUTHORIZED)
}

/// Load a request and enforce that the caller owns it.
async fn load_owned_request(
    state: &AppState,
    owner: &Owner,
    request_id: &str,
) -> Result<SongRequest, StatusCode> {
    let request = state
        .requests
        .get(request_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch request {}: {}", request_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or_else(|| {
            tracing::debug!("Request {} not found", request_id);
            StatusCode::NOT_FOUND
        })?;

    if !request.owned_by(owner) {
        tracing::warn!("Request {} accessed by non-owner", request_id);
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(request)
}

// ========== AUTH ENDPOINTS ==========

#[derive(Debug, Deserialize)]
struct OtpRequest {
    email: String,
}

#[derive(Debug, Serialize)]
struct OkResponse {
    success: bool,
}

/// Email a sign-in code to the address
async fn request_otp(
    State(state): State<AppState>,
    Json(body): Json<OtpRequest>,
) -> Result<Json<OkResponse>, StatusCode> {
    let email = body.email.trim().to_lowercase();
    if !auth::is_valid_email(&email) {
        return Err(StatusCode::BAD_REQUEST);
    }

    tracing::debug!("Issuing sign-in code for {}", email);

    let code = auth::generate_otp();
    state
        .users
        .store_otp(&email, &auth::hash_code(&code), &auth::otp_expiry())
        .await
        .map_err(|e| {
            tracing::error!("Failed to store sign-in code: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let (subject, html) = otp_email(&code);
    // Mail failures are logged but not surfaced, so the endpoint cannot be
    // used to probe which addresses exist.
    if let Err(e) = state.mailer.send(&email, &subject, &html).await {
        tracing::error!("Failed to send sign-in code to {}: {}", email, e);
    }

    Ok(Json(OkResponse { success: true }))
}

#[derive(Debug, Deserialize)]
struct OtpVerify {
    email: String,
    code: String,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    success: bool,
    token: String,
    user: User,
}

/// Verify a sign-in code and mint a session token
async fn verify_otp(
    State(state): State<AppState>,
    Json(body): Json<OtpVerify>,
) -> Result<Json<SessionResponse>, StatusCode> {
    let email = body.email.trim().to_lowercase();
    let code = body.code.trim();
    if !auth::is_valid_email(&email) || code.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let valid = state
        .users
        .consume_otp(&email, &auth::hash_code(code))
        .await
        .map_err(|e| {
            tracing::error!("Failed to verify sign-in code: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if !valid {
        tracing::debug!("Invalid sign-in code for {}", email);
        return Err(StatusCode::UNAUTHORIZED);
    }

    let user = state.users.create_or_get_user(&email).await.map_err(|e| {
        tracing::error!("Failed to create user: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let token = auth::sign_token(&state.auth_secret, &user.id).map_err(|e| {
        tracing::error!("Failed to sign token: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    tracing::debug!("User {} signed in", user.id);
    Ok(Json(SessionResponse {
        success: true,
        token,
        user,
    }))
}

/// Mint an anonymous session
async fn create_anonymous(
    State(state): State<AppState>,
) -> Result<Json<AnonymousUser>, StatusCode> {
    let anon = state.users.create_anonymous().await.map_err(|e| {
        tracing::error!("Failed to create anonymous session: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    tracing::debug!("Anonymous session created: {}", anon.id);
    Ok(Json(anon))
}

/// Return the signed-in user
async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<User>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;
    let Owner::User(user_id) = owner else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let user = state
        .users
        .get_user(&user_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to load user: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    Ok(Json(user))
}

// ========== SONG REQUEST ENDPOINTS ==========

/// Create a song request
async fn create_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(create): Json<SongRequestCreate>,
) -> Result<Json<SongRequest>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;

    if create.recipient_name.trim().is_empty()
        || create.occasion.trim().is_empty()
        || create.story.trim().is_empty()
    {
        return Err(StatusCode::BAD_REQUEST);
    }

    let request = state.requests.create(&owner, create).await.map_err(|e| {
        tracing::error!("Failed to create request: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    tracing::debug!("Created request {}", request.id);
    Ok(Json(request))
}

#[derive(Debug, Deserialize)]
struct ListRequestsQuery {
    q: Option<String>,
}

/// List the caller's requests
async fn list_requests(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListRequestsQuery>,
) -> Result<Json<Vec<SongRequest>>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;

    let requests = state
        .requests
        .list_for_owner(&owner, query.q.as_deref())
        .await
        .map_err(|e| {
            tracing::error!("Failed to list requests: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    tracing::debug!("Returning {} requests", requests.len());
    Ok(Json(requests))
}

/// Get a specific request
async fn get_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SongRequest>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;
    let request = load_owned_request(&state, &owner, &id).await?;
    Ok(Json(request))
}

// ========== LYRICS ENDPOINTS ==========

/// Generate a fresh lyrics draft for a request
async fn generate_lyrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<LyricsDraft>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;
    let request = load_owned_request(&state, &owner, &id).await?;

    let brief = SongBrief {
        recipient_name: request.recipient_name.clone(),
        occasion: request.occasion.clone(),
        languages: request.languages.clone(),
        mood: request.mood.clone(),
        story: request.story.clone(),
    };

    let content = state.lyricist.write(&brief).await.map_err(|e| {
        tracing::error!("Lyrics generation failed for request {}: {}", id, e);
        StatusCode::BAD_GATEWAY
    })?;

    let draft = state
        .requests
        .add_draft(&id, content, DraftSource::Llm)
        .await
        .map_err(|e| {
            tracing::error!("Failed to store draft: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    tracing::debug!("Draft v{} created for request {}", draft.version, id);
    Ok(Json(draft))
}

/// List a request's lyrics drafts
async fn list_drafts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<LyricsDraft>>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;
    load_owned_request(&state, &owner, &id).await?;

    let drafts = state.requests.list_drafts(&id).await.map_err(|e| {
        tracing::error!("Failed to list drafts: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(drafts))
}

/// Load a draft and enforce ownership through its request.
async fn load_owned_draft(
    state: &AppState,
    owner: &Owner,
    draft_id: &str,
) -> Result<LyricsDraft, StatusCode> {
    let draft = state
        .requests
        .get_draft(draft_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch draft {}: {}", draft_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    load_owned_request(state, owner, &draft.request_id).await?;
    Ok(draft)
}

#[derive(Debug, Deserialize)]
struct DraftEdit {
    content: String,
}

/// Save a user edit as a new draft version
async fn edit_draft(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(edit): Json<DraftEdit>,
) -> Result<Json<LyricsDraft>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;
    let draft = load_owned_draft(&state, &owner, &id).await?;

    if edit.content.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let new_draft = state
        .requests
        .add_draft(&draft.request_id, edit.content, DraftSource::User)
        .await
        .map_err(|e| {
            tracing::error!("Failed to store edited draft: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    tracing::debug!(
        "Draft {} edited into v{} for request {}",
        id,
        new_draft.version,
        new_draft.request_id
    );
    Ok(Json(new_draft))
}

#[derive(Debug, Deserialize)]
struct DraftRefine {
    notes: String,
}

/// Ask the LLM to rework a draft according to the user's notes
async fn refine_draft(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(refine): Json<DraftRefine>,
) -> Result<Json<LyricsDraft>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;
    let draft = load_owned_draft(&state, &owner, &id).await?;

    if refine.notes.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let content = state
        .lyricist
        .refine(&draft.content, &refine.notes)
        .await
        .map_err(|e| {
            tracing::error!("Lyrics refinement failed for draft {}: {}", id, e);
            StatusCode::BAD_GATEWAY
        })?;

    let new_draft = state
        .requests
        .add_draft(&draft.request_id, content, DraftSource::Llm)
        .await
        .map_err(|e| {
            tracing::error!("Failed to store refined draft: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(new_draft))
}

#[derive(Debug, Deserialize)]
struct ApproveBody {
    draft_id: String,
}

/// Approve a draft for generation
async fn approve_draft(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<SongRequest>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;
    load_owned_request(&state, &owner, &id).await?;

    let approved = state
        .requests
        .approve_draft(&id, &body.draft_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to approve draft: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if !approved {
        tracing::debug!("Draft {} does not belong to request {}", body.draft_id, id);
        return Err(StatusCode::NOT_FOUND);
    }

    let request = load_owned_request(&state, &owner, &id).await?;
    tracing::debug!("Draft {} approved for request {}", body.draft_id, id);
    Ok(Json(request))
}

// ========== GENERATION ENDPOINTS ==========

/// Trigger music generation for a request's approved lyrics
async fn start_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Song>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;
    let request = load_owned_request(&state, &owner, &id).await?;

    let Some(draft_id) = &request.approved_draft_id else {
        tracing::debug!("Request {} has no approved lyrics", id);
        return Err(StatusCode::CONFLICT);
    };

    if !request.paid {
        tracing::debug!("Request {} is unpaid", id);
        return Err(StatusCode::PAYMENT_REQUIRED);
    }

    let draft = state
        .requests
        .get_draft(draft_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to load approved draft: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    let spec = GenerationSpec {
        title: format!("A song for {}", request.recipient_name),
        lyrics: draft.content,
        style: request.mood.clone(),
        instrumental: false,
    };

    let task_id = state.generator.start(&spec).await.map_err(|e| {
        tracing::error!("Failed to start generation for request {}: {}", id, e);
        StatusCode::BAD_GATEWAY
    })?;

    let song = state
        .songs
        .create_for_request(&id, &task_id, Some(spec.title))
        .await
        .map_err(|e| {
            tracing::error!("Failed to create song row: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    state
        .requests
        .set_status(&id, RequestStatus::Generating)
        .await
        .map_err(|e| {
            tracing::error!("Failed to update request status: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    tracing::debug!("Generation started for request {}: task {}", id, task_id);
    Ok(Json(song))
}

#[derive(Debug, Deserialize)]
struct GenerationWebhookQuery {
    #[serde(rename = "requestId")]
    request_id: Option<String>,
    #[serde(rename = "userId")]
    #[allow(dead_code)]
    user_id: Option<String>,
    #[serde(rename = "anonymousUserId")]
    #[allow(dead_code)]
    anonymous_user_id: Option<String>,
}

/// Generation provider webhook
///
/// Answers `200 {success:true}` on every recognized and unrecognized case
/// except a malformed `requestId`, so the provider never retries
/// deliveries we have already absorbed.
async fn generation_webhook(
    State(state): State<AppState>,
    Query(query): Query<GenerationWebhookQuery>,
    Json(callback): Json<GenerationCallback>,
) -> Result<Json<OkResponse>, StatusCode> {
    if let Some(request_id) = query.request_id.as_deref() {
        if uuid::Uuid::parse_str(request_id).is_err() {
            tracing::warn!("Webhook carried malformed requestId: {}", request_id);
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    let Some(data) = callback.data else {
        tracing::warn!("Webhook carried no data payload");
        return Ok(Json(OkResponse { success: true }));
    };

    let Some(task_id) = data.task_id.as_deref().filter(|t| !t.is_empty()) else {
        tracing::warn!("Webhook carried no task id");
        return Ok(Json(OkResponse { success: true }));
    };

    let song = state.songs.find_by_task(task_id).await.map_err(|e| {
        tracing::error!("Failed to look up task {}: {}", task_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let Some(song) = song else {
        tracing::warn!("Webhook for unknown task: {}", task_id);
        return Ok(Json(OkResponse { success: true }));
    };

    let kind = CallbackKind::parse(&data.callback_type);
    tracing::debug!(
        "Webhook for song {}: callbackType={:?}, code={}, {} variants",
        song.id,
        kind,
        callback.code,
        data.data.len()
    );

    if kind == CallbackKind::Error || callback.code != 200 {
        let error = callback
            .msg
            .unwrap_or_else(|| "generation failed".to_string());
        if let Err(e) = state.songs.mark_failed(&song.id, &error).await {
            tracing::error!("Failed to record generation failure: {}", e);
        }
        return Ok(Json(OkResponse { success: true }));
    }

    let candidate = status::apply_callback(song.status, kind, &data.data);
    let updated = state
        .songs
        .apply_update(&song.id, candidate, &data.data)
        .await
        .map_err(|e| {
            tracing::error!("Failed to apply webhook update: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if let Some(updated) = updated {
        if updated.status == SongStatus::Complete {
            if let Err(e) = state
                .requests
                .set_status(&updated.request_id, RequestStatus::Delivered)
                .await
            {
                tracing::error!("Failed to mark request delivered: {}", e);
            }
        }
    }

    Ok(Json(OkResponse { success: true }))
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    #[serde(rename = "taskId")]
    task_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    status: &'static str,
    is_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    song_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    estimated_completion: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct PollResponse {
    success: bool,
    status: StatusPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    song: Option<Song>,
}

fn status_payload(song: &Song) -> StatusPayload {
    StatusPayload {
        status: song.status.as_str(),
        is_ready: song.status.is_ready(),
        song_url: song.playable_url().map(str::to_string),
        duration: song.duration_secs,
        estimated_completion: if song.status == SongStatus::Pending {
            Some("~2 minutes")
        } else {
            None
        },
        error: song.error.clone(),
    }
}

/// Client-driven status poll
///
/// The second trigger path for reconciliation: calls the provider's status
/// API directly and funnels the result through the same update routine as
/// the webhook.
async fn poll_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;

    let song = state
        .songs
        .get(&id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch song {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    load_owned_request(&state, &owner, &song.request_id).await?;

    // An already-complete song answers from the database; no provider call
    // and no rewrite.
    if song.status == SongStatus::Complete {
        tracing::debug!("Song {} already complete, answering from store", id);
        return Ok(Json(PollResponse {
            success: true,
            status: status_payload(&song),
            song: Some(song),
        }));
    }

    let task_id = query
        .task_id
        .as_deref()
        .filter(|t| !t.is_empty())
        .or(song.task_id.as_deref());

    let Some(task_id) = task_id else {
        tracing::debug!("Song {} has no task id yet", id);
        return Ok(Json(PollResponse {
            success: true,
            status: StatusPayload {
                status: SongStatus::Pending.as_str(),
                is_ready: false,
                song_url: None,
                duration: None,
                estimated_completion: Some("~2 minutes"),
                error: None,
            },
            song: Some(song),
        }));
    };

    let provider_status = match state.generator.fetch_status(task_id).await {
        Ok(status) => status,
        Err(e) => {
            // The client keeps polling, so a provider hiccup is soft: report
            // it in the payload, not as an HTTP failure.
            tracing::warn!("Status fetch failed for task {}: {}", task_id, e);
            return Ok(Json(PollResponse {
                success: false,
                status: StatusPayload {
                    status: SongStatus::Pending.as_str(),
                    is_ready: false,
                    song_url: None,
                    duration: None,
                    estimated_completion: None,
                    error: Some(e.to_string()),
                },
                song: Some(song),
            }));
        }
    };

    let mapped = status::status_from_provider(&provider_status.state, &provider_status.variants);
    tracing::debug!(
        "Task {} reported '{}', mapped to {}",
        task_id,
        provider_status.state,
        mapped.as_str()
    );

    let updated = if mapped == SongStatus::Failed {
        let error = provider_status
            .error
            .unwrap_or_else(|| "generation failed".to_string());
        state.songs.mark_failed(&song.id, &error).await
    } else {
        state
            .songs
            .apply_update(&song.id, mapped, &provider_status.variants)
            .await
    }
    .map_err(|e| {
        tracing::error!("Failed to apply poll update: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .ok_or(StatusCode::NOT_FOUND)?;

    if updated.status == SongStatus::Complete {
        if let Err(e) = state
            .requests
            .set_status(&updated.request_id, RequestStatus::Delivered)
            .await
        {
            tracing::error!("Failed to mark request delivered: {}", e);
        }
    }

    Ok(Json(PollResponse {
        success: true,
        status: status_payload(&updated),
        song: Some(updated),
    }))
}

// ========== SONG ENDPOINTS ==========

/// List the caller's songs
async fn list_songs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Song>>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;

    let songs = state.songs.list_for_owner(&owner).await.map_err(|e| {
        tracing::error!("Failed to list songs: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    tracing::debug!("Returning {} songs", songs.len());
    Ok(Json(songs))
}

/// Get a specific song
async fn get_song(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Song>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;

    let song = state
        .songs
        .get(&id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch song {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    load_owned_request(&state, &owner, &song.request_id).await?;
    Ok(Json(song))
}

#[derive(Debug, Serialize)]
struct PlaybackResponse {
    song_url: String,
    duration_secs: i64,
    lines: Vec<LyricLine>,
}

/// Playback payload: best available URL plus timed lyric lines
async fn get_playback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<PlaybackResponse>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;

    let song = state
        .songs
        .get(&id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch song {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let request = load_owned_request(&state, &owner, &song.request_id).await?;

    let Some(song_url) = song.playable_url() else {
        tracing::debug!("Song {} has no playable URL yet", id);
        return Err(StatusCode::CONFLICT);
    };

    let duration_secs = song.duration_secs.unwrap_or(0);

    let lines = match &request.approved_draft_id {
        Some(draft_id) => {
            let draft = state.requests.get_draft(draft_id).await.map_err(|e| {
                tracing::error!("Failed to load approved draft: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
            match draft {
                Some(draft) if duration_secs > 0 => {
                    segment_lines(&draft.content, duration_secs as u32)
                }
                _ => Vec::new(),
            }
        }
        None => Vec::new(),
    };

    Ok(Json(PlaybackResponse {
        song_url: song_url.to_string(),
        duration_secs,
        lines,
    }))
}

// ========== PAYMENT ENDPOINTS ==========

#[derive(Debug, Deserialize)]
struct PaymentOrderBody {
    request_id: String,
}

#[derive(Debug, Serialize)]
struct PaymentOrderResponse {
    success: bool,
    order_id: String,
    amount: i64,
    currency: String,
    key_id: String,
}

/// Create a payment order for a request
async fn create_payment_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PaymentOrderBody>,
) -> Result<Json<PaymentOrderResponse>, StatusCode> {
    let owner = authenticate(&state, &headers).await?;
    let request = load_owned_request(&state, &owner, &body.request_id).await?;

    if request.paid {
        tracing::debug!("Request {} is already paid", request.id);
        return Err(StatusCode::CONFLICT);
    }

    let order = state
        .payments
        .create_order(PRICE_PAISE, &request.id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to create payment order: {}", e);
            StatusCode::BAD_GATEWAY
        })?;

    state
        .payment_store
        .create(&request.id, &order.id, order.amount, &order.currency)
        .await
        .map_err(|e| {
            tracing::error!("Failed to store payment: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    tracing::debug!(
        "Payment order {} created for request {}",
        order.id,
        request.id
    );
    Ok(Json(PaymentOrderResponse {
        success: true,
        order_id: order.id,
        amount: order.amount,
        currency: order.currency,
        key_id: state.payments.key_id().to_string(),
    }))
}

/// Payment provider webhook
///
/// Signature-checked against the raw body; deliveries are deduplicated by
/// a body hash so provider retries never double-process.
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<OkResponse>, StatusCode> {
    let signature = headers
        .get("x-razorpay-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Payment webhook without signature");
            StatusCode::BAD_REQUEST
        })?;

    if !state.payments.verify_webhook_signature(&body, signature) {
        tracing::warn!("Payment webhook signature mismatch");
        return Err(StatusCode::BAD_REQUEST);
    }

    let event: PaymentWebhookEvent = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!("Unparseable payment webhook: {}", e);
        StatusCode::BAD_REQUEST
    })?;

    let key = idempotency_key(&body);
    let fresh = state
        .payment_store
        .record_webhook(&key, &event.event)
        .await
        .map_err(|e| {
            tracing::error!("Failed to record payment webhook: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if !fresh {
        tracing::debug!("Payment webhook replay, already processed: {}", event.event);
        return Ok(Json(OkResponse { success: true }));
    }

    let entity = event.payload.payment.map(|p| p.entity);
    let order_id = entity.as_ref().and_then(|e| e.order_id.clone());
    let payment_id = entity.as_ref().map(|e| e.id.clone());

    match event.event.as_str() {
        "payment.captured" => {
            let Some(order_id) = order_id else {
                tracing::warn!("Capture event without order id");
                return Ok(Json(OkResponse { success: true }));
            };

            let payment = state
                .payment_store
                .set_status(&order_id, PaymentStatus::Captured, payment_id.as_deref())
                .await
                .map_err(|e| {
                    tracing::error!("Failed to mark payment captured: {}", e);
                    StatusCode::INTERNAL_SERVER_ERROR
                })?;

            match payment {
                Some(payment) => {
                    if let Err(e) = state.requests.mark_paid(&payment.request_id).await {
                        tracing::error!("Failed to mark request paid: {}", e);
                    }
                    tracing::debug!("Payment captured for request {}", payment.request_id);
                }
                None => tracing::warn!("Capture event for unknown order: {}", order_id),
            }
        }
        "payment.failed" => {
            if let Some(order_id) = order_id {
                if let Err(e) = state
                    .payment_store
                    .set_status(&order_id, PaymentStatus::Failed, payment_id.as_deref())
                    .await
                {
                    tracing::error!("Failed to mark payment failed: {}", e);
                }
            }
        }
        other => {
            tracing::debug!("Ignoring payment event: {}", other);
        }
    }

    Ok(Json(OkResponse { success: true }))
}
