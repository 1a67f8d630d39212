use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use chrono::Utc;
use color_eyre::eyre::eyre;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::Duration;
use tower_cookies::{Cookie, Cookies};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::state::{AppState, AuthConfig};
use crate::user::User;

/// Cookie names for the two token classes.
pub const ACCESS_TOKEN_COOKIE: &str = "accessToken";
pub const REFRESH_TOKEN_COOKIE: &str = "refreshToken";

/// Claims carried by a short-lived access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims carried by a long-lived refresh token. Identity only, so a leaked
/// token decoded without verification reveals nothing else.
#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: Uuid,
    pub iat: i64,
    pub exp: i64,
}

/// A freshly issued access/refresh pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Issues and verifies both token classes. Access and refresh tokens are
/// signed with independent secrets so compromise of one cannot forge the
/// other.
#[derive(Clone)]
pub struct TokenKeys {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
}

impl TokenKeys {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(config.access_secret.as_ref()),
            access_decoding: DecodingKey::from_secret(config.access_secret.as_ref()),
            refresh_encoding: EncodingKey::from_secret(config.refresh_secret.as_ref()),
            refresh_decoding: DecodingKey::from_secret(config.refresh_secret.as_ref()),
            access_ttl_seconds: config.access_ttl_seconds,
            refresh_ttl_seconds: config.refresh_ttl_seconds,
        }
    }

    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }

    pub fn issue_access(&self, user: &User) -> Result<String, ApiError> {
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            sub: user.user_id,
            username: user.username.clone(),
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            iat: now,
            exp: now + self.access_ttl_seconds,
        };

        encode(&Header::default(), &claims, &self.access_encoding)
            .map_err(|e| ApiError::Internal(eyre!("failed to sign access token: {e}")))
    }

    pub fn issue_refresh(&self, user_id: Uuid) -> Result<String, ApiError> {
        let now = Utc::now().timestamp();
        let claims = RefreshClaims {
            sub: user_id,
            iat: now,
            exp: now + self.refresh_ttl_seconds,
        };

        encode(&Header::default(), &claims, &self.refresh_encoding)
            .map_err(|e| ApiError::Internal(eyre!("failed to sign refresh token: {e}")))
    }

    pub fn issue_pair(&self, user: &User) -> Result<TokenPair, ApiError> {
        Ok(TokenPair {
            access_token: self.issue_access(user)?,
            refresh_token: self.issue_refresh(user.user_id)?,
        })
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, ApiError> {
        decode::<AccessClaims>(token, &self.access_decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| ApiError::Unauthorized("invalid access token".into()))
    }

    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, ApiError> {
        decode::<RefreshClaims>(token, &self.refresh_decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| ApiError::Unauthorized("invalid refresh token".into()))
    }
}

/// The verified caller. Reads the access token from the `accessToken`
/// cookie or an `Authorization: Bearer` header, verifies it, and loads the
/// matching user record; any failure rejects with 401 before the handler
/// body runs.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cookies = Cookies::from_request_parts(parts, state)
            .await
            .map_err(|_| ApiError::Unauthorized("unauthorized request".into()))?;

        let token = cookies
            .get(ACCESS_TOKEN_COOKIE)
            .map(|cookie| cookie.value().to_string())
            .or_else(|| bearer_token(parts))
            .ok_or_else(|| ApiError::Unauthorized("unauthorized request".into()))?;

        let claims = state.tokens.verify_access(&token)?;

        let user = User::get_by_id(&state.db, claims.sub)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("invalid access token".into()))?;

        Ok(AuthUser { user })
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.to_string())
}

fn token_cookie(name: &'static str, value: String, max_age_seconds: i64) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_secure(true);
    cookie.set_max_age(Duration::seconds(max_age_seconds));
    cookie
}

/// Set both token cookies after a successful login or refresh.
pub fn set_token_cookies(cookies: &Cookies, keys: &TokenKeys, pair: &TokenPair) {
    cookies.add(token_cookie(
        ACCESS_TOKEN_COOKIE,
        pair.access_token.clone(),
        keys.access_ttl_seconds(),
    ));
    cookies.add(token_cookie(
        REFRESH_TOKEN_COOKIE,
        pair.refresh_token.clone(),
        keys.refresh_ttl_seconds(),
    ));
}

/// Expire both token cookies.
pub fn clear_token_cookies(cookies: &Cookies) {
    for name in [ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE] {
        let mut cookie = Cookie::new(name, "");
        cookie.set_path("/");
        cookie.set_http_only(true);
        cookie.set_secure(true);
        cookie.set_max_age(Duration::seconds(-1));
        cookies.remove(cookie);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys(access_ttl: i64, refresh_ttl: i64) -> TokenKeys {
        TokenKeys::new(&AuthConfig {
            access_secret: "access-secret-for-tests".into(),
            refresh_secret: "refresh-secret-for-tests".into(),
            access_ttl_seconds: access_ttl,
            refresh_ttl_seconds: refresh_ttl,
        })
    }

    fn test_user() -> User {
        User {
            user_id: Uuid::new_v4(),
            username: "alice".into(),
            email: "alice@x.com".into(),
            full_name: "Alice A".into(),
            password_hash: "$argon2id$irrelevant".into(),
            avatar_url: "https://media.example/avatar.png".into(),
            cover_image_url: None,
            refresh_token: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn access_token_round_trips_its_claims() {
        let keys = test_keys(3600, 86400);
        let user = test_user();

        let token = keys.issue_access(&user).unwrap();
        let claims = keys.verify_access(&token).unwrap();

        assert_eq!(claims.sub, user.user_id);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.email, "alice@x.com");
        assert_eq!(claims.full_name, "Alice A");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn refresh_token_carries_identity_only() {
        let keys = test_keys(3600, 86400);
        let user_id = Uuid::new_v4();

        let token = keys.issue_refresh(user_id).unwrap();
        let claims = keys.verify_refresh(&token).unwrap();

        assert_eq!(claims.sub, user_id);
    }

    #[test]
    fn tokens_do_not_verify_across_classes() {
        let keys = test_keys(3600, 86400);
        let user = test_user();

        let access = keys.issue_access(&user).unwrap();
        let refresh = keys.issue_refresh(user.user_id).unwrap();

        assert!(keys.verify_refresh(&access).is_err());
        assert!(keys.verify_access(&refresh).is_err());
    }

    #[test]
    fn a_foreign_secret_cannot_forge_tokens() {
        let keys = test_keys(3600, 86400);
        let other = TokenKeys::new(&AuthConfig {
            access_secret: "some-other-secret".into(),
            refresh_secret: "another-other-secret".into(),
            access_ttl_seconds: 3600,
            refresh_ttl_seconds: 86400,
        });

        let token = other.issue_access(&test_user()).unwrap();
        assert!(keys.verify_access(&token).is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        // Far enough in the past to clear the default validation leeway.
        let keys = test_keys(-300, -300);
        let user = test_user();

        let access = keys.issue_access(&user).unwrap();
        let refresh = keys.issue_refresh(user.user_id).unwrap();

        assert!(keys.verify_access(&access).is_err());
        assert!(keys.verify_refresh(&refresh).is_err());
    }

    #[test]
    fn token_pair_serializes_camel_case() {
        let pair = TokenPair {
            access_token: "a".into(),
            refresh_token: "r".into(),
        };
        let value = serde_json::to_value(&pair).unwrap();
        assert_eq!(value["accessToken"], "a");
        assert_eq!(value["refreshToken"], "r");
    }

    #[test]
    fn token_cookies_are_server_only() {
        let cookie = token_cookie(ACCESS_TOKEN_COOKIE, "tok".into(), 3600);
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.max_age(), Some(Duration::seconds(3600)));
    }
}
