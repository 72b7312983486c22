//! Session issuance and device management endpoints.

use axum::{
    extract::{Extension, Path},
    http::{
        header::{InvalidHeaderValue, AUTHORIZATION, COOKIE, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use super::error::AuthError;
use super::principal::Principal;
use super::state::{AuthConfig, AuthState};
use super::storage;
use super::types::{LoginResponse, MessageResponse, SessionInfo, UserSummary};
use super::utils::{generate_refresh_token, hash_refresh_token};

const REFRESH_COOKIE_NAME: &str = "custodia_refresh";

/// Everything minted for one fresh session.
pub(super) struct IssuedSession {
    pub(super) access_token: String,
    pub(super) refresh_token: String,
    pub(super) expires_in: i64,
    pub(super) roles: Vec<String>,
    pub(super) permissions: Vec<String>,
}

/// Snapshot roles, create the session row with cap eviction, and mint the
/// token pair. Shared by password, step-up, and federated logins.
pub(super) async fn establish_session(
    pool: &PgPool,
    state: &AuthState,
    user: &storage::UserRecord,
    origin: &str,
    device: &str,
) -> anyhow::Result<IssuedSession> {
    let (roles, permissions) = storage::load_roles_and_permissions(pool, user.id).await?;

    let refresh_token = generate_refresh_token()?;
    let refresh_hash = hash_refresh_token(&refresh_token);
    let session_id = storage::create_session(
        pool,
        storage::NewSession {
            user_id: user.id,
            device,
            origin,
            refresh_token_hash: &refresh_hash,
            refresh_ttl_seconds: state.config().refresh_token_ttl_seconds(),
            max_sessions: user.max_sessions,
        },
    )
    .await?;

    let expires_in = state.config().access_token_ttl_seconds();
    let access_token = state.signer().access_token(
        user.id,
        &user.email,
        session_id,
        roles.clone(),
        permissions.clone(),
        expires_in,
    )?;

    Ok(IssuedSession {
        access_token,
        refresh_token,
        expires_in,
        roles,
        permissions,
    })
}

pub(super) fn login_response(user: &storage::UserRecord, issued: IssuedSession) -> LoginResponse {
    LoginResponse {
        access_token: issued.access_token,
        expires_in: issued.expires_in,
        user: UserSummary {
            id: user.id,
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            avatar_url: user.avatar_url.clone(),
            roles: issued.roles,
            permissions: issued.permissions,
            two_factor_enabled: user.totp_enabled,
        },
    }
}

/// Build the `HttpOnly` refresh cookie.
pub(super) fn refresh_cookie(
    config: &AuthConfig,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = config.refresh_token_ttl_seconds();
    let secure = config.refresh_cookie_secure();
    let mut cookie = format!(
        "{REFRESH_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={ttl_seconds}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(super) fn clear_refresh_cookie(config: &AuthConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let secure = config.refresh_cookie_secure();
    let mut cookie =
        format!("{REFRESH_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(super) fn extract_refresh_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == REFRESH_COOKIE_NAME && !val.is_empty() {
            return Some(val.to_string());
        }
    }
    None
}

pub(super) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Revoke the session behind the refresh cookie and clear the cookie.
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 204, description = "Session cleared")
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    if let Some(token) = extract_refresh_token(&headers) {
        let token_hash = hash_refresh_token(&token);
        // Logout is idempotent; a burned token is not an error.
        if let Err(err) = storage::logout_session(&pool, &token_hash).await {
            error!("Failed to revoke session on logout: {err}");
        }
    }

    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_refresh_cookie(auth_state.config()) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, response_headers).into_response()
}

/// Revoke every session and refresh token the account holds.
#[utoipa::path(
    post,
    path = "/auth/revoke-all",
    responses(
        (status = 200, description = "All sessions revoked", body = MessageResponse),
        (status = 401, description = "Not authenticated", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn revoke_all(
    principal: Extension<Principal>,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    let revoked = storage::revoke_all_sessions(&pool, principal.user_id).await?;

    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_refresh_cookie(auth_state.config()) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    Ok((
        response_headers,
        Json(MessageResponse::new(format!("revoked {revoked} sessions"))),
    ))
}

/// List the account's active sessions, most recently active first.
#[utoipa::path(
    get,
    path = "/auth/sessions",
    responses(
        (status = 200, description = "Active sessions", body = [SessionInfo]),
        (status = 401, description = "Not authenticated", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn sessions(
    principal: Extension<Principal>,
    pool: Extension<PgPool>,
) -> Result<Json<Vec<SessionInfo>>, AuthError> {
    let rows = storage::list_sessions(&pool, principal.user_id).await?;
    let sessions = rows
        .into_iter()
        .map(|row| SessionInfo {
            current: row.id == principal.session_id,
            id: row.id,
            device: row.device,
            origin: row.origin,
            created_at: row.created_at,
            last_active_at: row.last_active_at,
            expires_at: row.expires_at,
        })
        .collect();
    Ok(Json(sessions))
}

/// Revoke one of the account's sessions by id.
#[utoipa::path(
    delete,
    path = "/auth/sessions/{id}",
    params(
        ("id" = Uuid, Path, description = "Session id")
    ),
    responses(
        (status = 204, description = "Session revoked"),
        (status = 404, description = "No such session", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn remove_session(
    principal: Extension<Principal>,
    pool: Extension<PgPool>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AuthError> {
    if storage::revoke_session(&pool, principal.user_id, session_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AuthError::NotFound)
    }
}

/// The authenticated account's profile, roles, and permissions.
#[utoipa::path(
    get,
    path = "/auth/me",
    responses(
        (status = 200, description = "Authenticated user", body = UserSummary),
        (status = 401, description = "Not authenticated", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn me(
    principal: Extension<Principal>,
    pool: Extension<PgPool>,
) -> Result<Json<UserSummary>, AuthError> {
    let user = storage::fetch_user_by_id(&pool, principal.user_id)
        .await?
        .ok_or(AuthError::NotFound)?;
    let (roles, permissions) = storage::load_roles_and_permissions(&pool, user.id).await?;

    Ok(Json(UserSummary {
        id: user.id,
        email: user.email,
        display_name: user.display_name,
        avatar_url: user.avatar_url,
        roles,
        permissions,
        two_factor_enabled: user.totp_enabled,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::state::AuthConfig;
    use super::{
        clear_refresh_cookie, extract_bearer_token, extract_refresh_token, logout, refresh_cookie,
    };
    use crate::api::handlers::auth::federated::ProviderRegistry;
    use crate::api::handlers::auth::state::AuthState;
    use crate::security::geoip::GeoResolver;
    use crate::tokens::TokenSigner;
    use anyhow::Result;
    use axum::extract::Extension;
    use axum::http::header::COOKIE;
    use axum::http::{HeaderMap, HeaderValue, StatusCode};
    use axum::response::IntoResponse;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    fn auth_state(frontend: &str) -> Arc<AuthState> {
        let config = AuthConfig::new(frontend.to_string());
        let signer = TokenSigner::new(&SecretString::from("top-secret"), "custodia");
        Arc::new(AuthState::new(
            config,
            signer,
            GeoResolver::new(""),
            ProviderRegistry::default(),
            SecretString::from("pepper"),
        ))
    }

    #[test]
    fn refresh_cookie_attributes() {
        let config = AuthConfig::new("https://custodia.dev".to_string());
        let cookie = refresh_cookie(&config, "tok123").unwrap();
        let value = cookie.to_str().unwrap();
        assert!(value.starts_with("custodia_refresh=tok123"));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("SameSite=Strict"));
        assert!(value.contains("Path=/"));
        assert!(value.contains("Secure"));

        let plain = AuthConfig::new("http://localhost:3000".to_string());
        let cookie = refresh_cookie(&plain, "tok123").unwrap();
        assert!(!cookie.to_str().unwrap().contains("Secure"));
    }

    #[test]
    fn clear_cookie_expires_immediately() {
        let config = AuthConfig::new("http://localhost:3000".to_string());
        let cookie = clear_refresh_cookie(&config).unwrap();
        let value = cookie.to_str().unwrap();
        assert!(value.starts_with("custodia_refresh=;"));
        assert!(value.contains("Max-Age=0"));
    }

    #[test]
    fn extract_refresh_token_parses_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; custodia_refresh=abc123; lang=en"),
        );
        assert_eq!(extract_refresh_token(&headers), Some("abc123".to_string()));

        let mut empty = HeaderMap::new();
        empty.insert(COOKIE, HeaderValue::from_static("custodia_refresh="));
        assert_eq!(extract_refresh_token(&empty), None);

        assert_eq!(extract_refresh_token(&HeaderMap::new()), None);
    }

    #[test]
    fn extract_bearer_token_cases() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );
        assert_eq!(
            extract_bearer_token(&headers),
            Some("abc.def.ghi".to_string())
        );

        let mut lower = HeaderMap::new();
        lower.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("bearer xyz"),
        );
        assert_eq!(extract_bearer_token(&lower), Some("xyz".to_string()));

        let mut bare = HeaderMap::new();
        bare.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer "),
        );
        assert_eq!(extract_bearer_token(&bare), None);
    }

    #[tokio::test]
    async fn logout_without_cookie_still_clears() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = logout(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state("http://localhost:3000")),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let cookie = response
            .headers()
            .get(axum::http::header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(cookie.contains("Max-Age=0"));
        Ok(())
    }
}
