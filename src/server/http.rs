//! HTTP handlers for the surrounding surface: auth, health, the voice
//! catalog, TTS upload proxying, and user-settings (spec.md §1 "Supporting
//! concerns ... are external collaborators and are specified only at their
//! interface").

use axum::{
    body::Bytes,
    extract::{Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::broker::ServiceAddress;
use crate::server::auth::{
    GoogleLoginRequest, LoginRequest, LoginResponse, LogoutRequest, RefreshRequest, TokenType,
};
use crate::server::ServerState;
use crate::storage::{get_user_data_from_storage, UserData};
use crate::types::UserSettings;

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn login_response(state: &ServerState, email: &str) -> impl IntoResponse {
    let access_token = match state.auth.generate_access_token(email) {
        Ok(t) => t,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let refresh_token = match state.auth.generate_refresh_token(email) {
        Ok(t) => t,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    (
        StatusCode::OK,
        Json(LoginResponse {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: state.auth.access_token_expiry_minutes() * 60,
        }),
    )
        .into_response()
}

/// Password login. Creates a user record on first login, matching the
/// source's `get_or_create` pattern at `storage.py`.
pub async fn login_handler(State(state): State<ServerState>, Json(req): Json<LoginRequest>) -> impl IntoResponse {
    if let Some(remaining) = state.auth.is_locked(&req.email) {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            format!("account locked for {} more seconds", remaining.num_seconds()),
        );
    }

    let user = match get_user_data_from_storage(&state.config.storage.users_dir, &req.email) {
        Ok(user) => user,
        Err(_) => {
            let hashed = match crate::server::auth::hash_password(&req.password) {
                Ok(h) => h,
                Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            };
            let user = UserData::new(&req.email, hashed);
            if let Err(e) = user.save(&state.config.storage.users_dir) {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
            user
        }
    };

    match crate::server::auth::verify_password(&req.password, &user.hashed_password) {
        Ok(true) => {
            state.auth.clear_login_attempts(&req.email);
            login_response(&state, &user.email).into_response()
        }
        _ => {
            state.auth.record_failed_login(&req.email);
            error_response(StatusCode::UNAUTHORIZED, "invalid email or password")
        }
    }
}

/// Google sign-in: verify the ID token, then issue this service's own JWT
/// pair for the verified email, creating a user record on first sign-in.
pub async fn google_login_handler(
    State(state): State<ServerState>,
    Json(req): Json<GoogleLoginRequest>,
) -> impl IntoResponse {
    let email = match state.auth.verify_google_id_token(&req.id_token).await {
        Ok(email) => email,
        Err(e) => return error_response(StatusCode::UNAUTHORIZED, e.to_string()),
    };

    if get_user_data_from_storage(&state.config.storage.users_dir, &email).is_err() {
        let mut user = UserData::new(&email, "");
        user.google_sub = Some(email.clone());
        if let Err(e) = user.save(&state.config.storage.users_dir) {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }

    login_response(&state, &email).into_response()
}

pub async fn refresh_handler(State(state): State<ServerState>, Json(req): Json<RefreshRequest>) -> impl IntoResponse {
    let claims = match state.auth.validate_token(&req.refresh_token) {
        Ok(c) => c,
        Err(e) => return error_response(StatusCode::UNAUTHORIZED, e.to_string()),
    };
    if claims.token_type != TokenType::Refresh {
        return error_response(StatusCode::UNAUTHORIZED, "not a refresh token");
    }
    let _ = state.auth.revoke_token(&claims.jti);
    login_response(&state, &claims.sub).into_response()
}

pub async fn logout_handler(State(state): State<ServerState>, Json(req): Json<LogoutRequest>) -> impl IntoResponse {
    match state.auth.validate_token(&req.token) {
        Ok(claims) => {
            let _ = state.auth.revoke_token(&claims.jti);
            (StatusCode::OK, Json(json!({ "message": "logged out" }))).into_response()
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    stt_up: bool,
    llm_up: bool,
    ok: bool,
}

/// Health endpoint the gateway itself also consults before accepting a new
/// session (spec.md §6 "Health interface").
pub async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let stt = ServiceAddress::internal(&state.config.stt.url).unwrap_or(ServiceAddress::Fixed(state.config.stt.url.clone()));
    let llm = ServiceAddress::Fixed(state.config.llm.url.clone());
    let status = state.broker.health(&stt, &llm).await;
    let code = if status.ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        code,
        Json(HealthResponse { stt_up: status.stt_up, llm_up: status.llm_up, ok: status.ok }),
    )
}

/// Prometheus text exposition (SPEC_FULL.md §4.9). Metric names and bucket
/// arrays are part of the external observability contract and must match
/// `crate::metrics` exactly.
pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(),
    )
}

/// Static voice catalog proxy (spec.md §1: "a static voice catalog proxy"
/// is an external collaborator, specified only at its interface).
pub async fn voices_handler(State(state): State<ServerState>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "voices": state.config.voices })))
}

#[derive(Debug, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    pub voice: String,
}

/// Proxy a text-to-speech request to the TTS service's HTTP boundary
/// (spec.md §1 Non-goal: "the choice of compression codec for audio" and
/// TTS's own implementation are out of scope here).
pub async fn tts_handler(State(state): State<ServerState>, Json(req): Json<TtsRequest>) -> impl IntoResponse {
    let response = state
        .http
        .post(format!("{}/v1/speak", state.config.tts.url))
        .json(&json!({ "text": req.text, "voice": req.voice }))
        .send()
        .await;

    match response {
        Ok(resp) if resp.status().is_success() => match resp.bytes().await {
            Ok(bytes) => (StatusCode::OK, bytes).into_response(),
            Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
        },
        Ok(resp) => error_response(StatusCode::BAD_GATEWAY, format!("TTS service returned {}", resp.status())),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Upload a reference voice sample for cloning, forwarded verbatim to the
/// TTS service (spec.md §1: "voice-file upload" is an external collaborator
/// operation; this service only proxies the bytes).
pub async fn voice_upload_handler(State(state): State<ServerState>, mut multipart: Multipart) -> impl IntoResponse {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("voice.wav").to_string();
        let data: Bytes = match field.bytes().await {
            Ok(d) => d,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        };

        let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = state
            .http
            .post(format!("{}/v1/voices", state.config.tts.url))
            .multipart(form)
            .send()
            .await;

        return match response {
            Ok(resp) if resp.status().is_success() => (StatusCode::CREATED, Json(json!({ "status": "uploaded" }))).into_response(),
            Ok(resp) => error_response(StatusCode::BAD_GATEWAY, format!("TTS service returned {}", resp.status())),
            Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        };
    }
    error_response(StatusCode::BAD_REQUEST, "missing `file` field")
}

/// Read the authenticated user's settings.
pub async fn get_user_handler(
    State(state): State<ServerState>,
    claims: axum::Extension<crate::server::auth::Claims>,
) -> impl IntoResponse {
    match get_user_data_from_storage(&state.config.storage.users_dir, &claims.sub) {
        Ok(user) => (StatusCode::OK, Json(user.user_settings)).into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e.to_string()),
    }
}

/// Update the authenticated user's settings (name, prompt, friends,
/// documents, thinking mode).
pub async fn update_user_handler(
    State(state): State<ServerState>,
    claims: axum::Extension<crate::server::auth::Claims>,
    Json(settings): Json<UserSettings>,
) -> impl IntoResponse {
    let mut user = match get_user_data_from_storage(&state.config.storage.users_dir, &claims.sub) {
        Ok(user) => user,
        Err(e) => return error_response(StatusCode::NOT_FOUND, e.to_string()),
    };
    user.user_settings = settings;
    match user.save(&state.config.storage.users_dir) {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "saved" }))).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
