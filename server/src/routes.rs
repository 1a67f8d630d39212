use std::path::PathBuf;

use axum::extract::multipart::Field;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use color_eyre::eyre::eyre;
use serde::Deserialize;
use serde_json::json;
use tower_cookies::{CookieManagerLayer, Cookies};
use tracing::info;

use crate::auth::{self, AuthUser};
use crate::errors::{ApiError, ApiResponse, ApiResult};
use crate::media::MediaClient;
use crate::password;
use crate::state::AppState;
use crate::user::{self, NewUser, PublicUser, User};

/// Build the application router with all routes.
pub fn routes(app_state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/users", user_routes())
        .layer(CookieManagerLayer::new())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app_state)
}

fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/refresh-token", post(refresh_access_token))
        .route("/change-password", post(change_password))
        .route("/current-user", get(current_user))
        .route("/update-account", patch(update_account))
        .route("/avatar", patch(update_avatar))
        .route("/cover-image", patch(update_cover_image))
}

/// Fields collected from the registration multipart form. File fields are
/// staged to local paths before any of them is pushed to the media host.
#[derive(Debug, Default)]
struct RegisterForm {
    username: Option<String>,
    email: Option<String>,
    full_name: Option<String>,
    password: Option<String>,
    avatar_path: Option<PathBuf>,
    cover_image_path: Option<PathBuf>,
}

/// Register a new account: multipart form with text fields `username`,
/// `email`, `fullName`, `password`, a required `avatar` file, and an
/// optional `coverImage` file.
async fn register(State(state): State<AppState>, multipart: Multipart) -> ApiResult<Response> {
    let form = collect_register_form(&state.media, multipart).await?;

    match register_inner(&state, &form).await {
        Ok(response) => Ok(response),
        Err(err) => {
            // Rejected requests must not leave staged files behind.
            discard_staged(&form).await;
            Err(err)
        }
    }
}

async fn register_inner(state: &AppState, form: &RegisterForm) -> ApiResult<Response> {
    let username = form.username.as_deref().unwrap_or_default();
    let email = form.email.as_deref().unwrap_or_default();
    let full_name = form.full_name.as_deref().unwrap_or_default();
    let password = form.password.as_deref().unwrap_or_default();

    if [username, email, full_name, password]
        .iter()
        .any(|field| field.trim().is_empty())
    {
        return Err(ApiError::Validation("all fields are required".into()));
    }

    let username = user::normalize_identifier(username);
    let email = user::normalize_identifier(email);

    let existing =
        User::get_by_username_or_email(&state.db, Some(username.as_str()), Some(email.as_str()))
            .await?;
    if existing.is_some() {
        return Err(ApiError::Conflict(
            "user with username or email already exists".into(),
        ));
    }

    let avatar_path = form
        .avatar_path
        .as_deref()
        .ok_or_else(|| ApiError::Validation("avatar file is required".into()))?;
    let avatar_url = state
        .media
        .upload(avatar_path)
        .await
        .ok_or_else(|| ApiError::Validation("avatar file is required".into()))?;

    let cover_image_url = match form.cover_image_path.as_deref() {
        Some(path) => state.media.upload(path).await,
        None => None,
    };

    let password_hash = password::hash(password)?;

    let created = User::create(
        &state.db,
        NewUser {
            username,
            email,
            full_name: full_name.trim().to_string(),
            password_hash,
            avatar_url,
            cover_image_url,
        },
    )
    .await?;

    let created_user = User::get_by_id(&state.db, created.user_id)
        .await?
        .ok_or_else(|| ApiError::Internal(eyre!("user record missing after registration")))?;

    Ok(ApiResponse::new(
        StatusCode::CREATED,
        PublicUser::from(created_user),
        "user registered successfully",
    )
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    username: Option<String>,
    email: Option<String>,
    password: Option<String>,
}

/// Log in with a username or an email; either identifier is accepted, and
/// at least one must be present.
async fn login(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Response> {
    let username = request
        .username
        .as_deref()
        .map(user::normalize_identifier)
        .filter(|value| !value.is_empty());
    let email = request
        .email
        .as_deref()
        .map(user::normalize_identifier)
        .filter(|value| !value.is_empty());

    if username.is_none() && email.is_none() {
        return Err(ApiError::Validation("username or email is required".into()));
    }

    let password = request.password.as_deref().unwrap_or_default();
    if password.is_empty() {
        return Err(ApiError::Validation("password is required".into()));
    }

    let user = User::get_by_username_or_email(&state.db, username.as_deref(), email.as_deref())
        .await?
        .ok_or_else(|| ApiError::NotFound("user does not exist".into()))?;

    if !password::verify(password, &user.password_hash) {
        return Err(ApiError::Unauthorized("incorrect password".into()));
    }

    let pair = state.tokens.issue_pair(&user)?;
    User::update_refresh_token(&state.db, user.user_id, Some(&pair.refresh_token)).await?;

    auth::set_token_cookies(&cookies, &state.tokens, &pair);
    info!("user {} logged in", user.username);

    Ok(ApiResponse::new(
        StatusCode::OK,
        json!({
            "user": PublicUser::from(user),
            "accessToken": pair.access_token,
            "refreshToken": pair.refresh_token,
        }),
        "user logged in successfully",
    )
    .into_response())
}

/// Log out the verified caller: drop the stored refresh token and expire
/// both cookies.
async fn logout(
    State(state): State<AppState>,
    cookies: Cookies,
    AuthUser { user }: AuthUser,
) -> ApiResult<Response> {
    User::update_refresh_token(&state.db, user.user_id, None).await?;
    auth::clear_token_cookies(&cookies);
    info!("user {} logged out", user.username);

    Ok(ApiResponse::new(StatusCode::OK, json!({}), "user logged out successfully").into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshTokenRequest {
    refresh_token: Option<String>,
}

/// Exchange a valid, still-current refresh token (from the cookie or the
/// body) for a new token pair. A token that no longer matches the stored
/// value has been superseded by a later login or refresh and is refused.
async fn refresh_access_token(
    State(state): State<AppState>,
    cookies: Cookies,
    body: Option<Json<RefreshTokenRequest>>,
) -> ApiResult<Response> {
    let presented = cookies
        .get(auth::REFRESH_TOKEN_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .or_else(|| body.and_then(|Json(request)| request.refresh_token))
        .ok_or_else(|| ApiError::Unauthorized("unauthorized request".into()))?;

    let claims = state.tokens.verify_refresh(&presented)?;

    let user = User::get_by_id(&state.db, claims.sub)
        .await
        .map_err(|e| refresh_unauthorized(e.into()))?
        .ok_or_else(|| ApiError::Unauthorized("invalid refresh token".into()))?;

    if user.refresh_token.as_deref() != Some(presented.as_str()) {
        return Err(ApiError::Unauthorized(
            "refresh token is expired or used".into(),
        ));
    }

    let pair = state.tokens.issue_pair(&user).map_err(refresh_unauthorized)?;
    User::update_refresh_token(&state.db, user.user_id, Some(&pair.refresh_token))
        .await
        .map_err(|e| refresh_unauthorized(e.into()))?;

    auth::set_token_cookies(&cookies, &state.tokens, &pair);
    info!("refreshed session for user {}", user.username);

    Ok(ApiResponse::new(StatusCode::OK, pair, "access token refreshed").into_response())
}

// Every failure inside the refresh flow is reported as 401 carrying the
// underlying message.
fn refresh_unauthorized(err: ApiError) -> ApiError {
    match err {
        ApiError::Unauthorized(_) => err,
        other => ApiError::Unauthorized(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    old_password: String,
    new_password: String,
}

/// Change the caller's password after verifying the current one.
async fn change_password(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    Json(request): Json<ChangePasswordRequest>,
) -> ApiResult<Response> {
    if !password::verify(&request.old_password, &user.password_hash) {
        return Err(ApiError::Validation("invalid old password".into()));
    }

    // Hash first; a hashing failure leaves the stored digest untouched.
    let password_hash = password::hash(&request.new_password)?;
    User::update_password(&state.db, user.user_id, &password_hash).await?;

    Ok(ApiResponse::new(StatusCode::OK, json!({}), "password changed successfully").into_response())
}

/// Return the verified caller's sanitized record.
async fn current_user(AuthUser { user }: AuthUser) -> Response {
    ApiResponse::new(
        StatusCode::OK,
        PublicUser::from(user),
        "current user fetched successfully",
    )
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateAccountRequest {
    full_name: Option<String>,
    email: Option<String>,
}

/// Update the caller's full name and email.
async fn update_account(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    Json(request): Json<UpdateAccountRequest>,
) -> ApiResult<Response> {
    let full_name = request.full_name.as_deref().map(str::trim).unwrap_or_default();
    let email = request.email.as_deref().unwrap_or_default();

    if full_name.is_empty() || email.trim().is_empty() {
        return Err(ApiError::Validation("all fields are required".into()));
    }

    let email = user::normalize_identifier(email);
    let updated = User::update_profile(&state.db, user.user_id, full_name, &email).await?;

    Ok(ApiResponse::new(
        StatusCode::OK,
        PublicUser::from(updated),
        "account details updated successfully",
    )
    .into_response())
}

/// Replace the caller's avatar with a newly uploaded file.
async fn update_avatar(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    multipart: Multipart,
) -> ApiResult<Response> {
    let staged = stage_single_file(&state.media, multipart, "avatar")
        .await?
        .ok_or_else(|| ApiError::Validation("avatar file is missing".into()))?;

    let avatar_url = state
        .media
        .upload(&staged)
        .await
        .ok_or_else(|| ApiError::Validation("error while uploading avatar".into()))?;

    let updated = User::update_avatar(&state.db, user.user_id, &avatar_url).await?;

    Ok(ApiResponse::new(
        StatusCode::OK,
        PublicUser::from(updated),
        "avatar updated successfully",
    )
    .into_response())
}

/// Replace the caller's cover image with a newly uploaded file. Unlike
/// registration, here the file is the point of the request, so a missing
/// one is an error.
async fn update_cover_image(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    multipart: Multipart,
) -> ApiResult<Response> {
    let staged = stage_single_file(&state.media, multipart, "coverImage")
        .await?
        .ok_or_else(|| ApiError::Validation("cover image file is missing".into()))?;

    let cover_image_url = state
        .media
        .upload(&staged)
        .await
        .ok_or_else(|| ApiError::Validation("error while uploading cover image".into()))?;

    let updated = User::update_cover_image(&state.db, user.user_id, &cover_image_url).await?;

    Ok(ApiResponse::new(
        StatusCode::OK,
        PublicUser::from(updated),
        "cover image updated successfully",
    )
    .into_response())
}

async fn collect_register_form(
    media: &MediaClient,
    multipart: Multipart,
) -> ApiResult<RegisterForm> {
    let mut form = RegisterForm::default();

    match fill_register_form(media, multipart, &mut form).await {
        Ok(()) => Ok(form),
        Err(err) => {
            // A field that failed mid-stream must not strand earlier files.
            discard_staged(&form).await;
            Err(err)
        }
    }
}

async fn fill_register_form(
    media: &MediaClient,
    mut multipart: Multipart,
    form: &mut RegisterForm,
) -> ApiResult<()> {
    while let Some(field) = multipart.next_field().await.map_err(malformed_multipart)? {
        let Some(name) = field.name().map(|name| name.to_string()) else {
            continue;
        };

        match name.as_str() {
            "username" => form.username = Some(read_text(field).await?),
            "email" => form.email = Some(read_text(field).await?),
            "fullName" => form.full_name = Some(read_text(field).await?),
            "password" => form.password = Some(read_text(field).await?),
            // At most one file per field; later duplicates are ignored.
            "avatar" if form.avatar_path.is_none() => {
                form.avatar_path = Some(stage_file(media, field).await?);
            }
            "coverImage" if form.cover_image_path.is_none() => {
                form.cover_image_path = Some(stage_file(media, field).await?);
            }
            _ => {}
        }
    }

    Ok(())
}

async fn stage_single_file(
    media: &MediaClient,
    mut multipart: Multipart,
    field_name: &str,
) -> ApiResult<Option<PathBuf>> {
    while let Some(field) = multipart.next_field().await.map_err(malformed_multipart)? {
        if field.name() == Some(field_name) {
            return Ok(Some(stage_file(media, field).await?));
        }
    }

    Ok(None)
}

async fn read_text(field: Field<'_>) -> ApiResult<String> {
    field.text().await.map_err(malformed_multipart)
}

async fn stage_file(media: &MediaClient, field: Field<'_>) -> ApiResult<PathBuf> {
    let original_name = field.file_name().unwrap_or("upload").to_string();
    let data = field.bytes().await.map_err(malformed_multipart)?;

    Ok(media.stage(&original_name, &data).await?)
}

async fn discard_staged(form: &RegisterForm) {
    for path in [form.avatar_path.as_deref(), form.cover_image_path.as_deref()]
        .into_iter()
        .flatten()
    {
        // Already-uploaded files are gone by now; ignore the miss.
        let _ = tokio::fs::remove_file(path).await;
    }
}

fn malformed_multipart(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::Validation(format!("malformed multipart form: {err}"))
}
