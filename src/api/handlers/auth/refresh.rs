//! Refresh-token rotation endpoint.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap},
    response::IntoResponse,
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::debug;

use super::error::AuthError;
use super::session::{extract_refresh_token, refresh_cookie};
use super::state::AuthState;
use super::storage;
use super::types::RefreshResponse;
use super::utils::{generate_refresh_token, hash_refresh_token};

/// Exchange the refresh cookie for a new access token and a rotated cookie.
/// Presenting a revoked or unknown token fails; an expired token is burned
/// as a side effect. A locked account is refused before the token is
/// touched, so the session survives the lock window.
#[utoipa::path(
    post,
    path = "/auth/refresh-token",
    responses(
        (status = 200, description = "New token pair", body = RefreshResponse),
        (status = 401, description = "Missing, invalid, or expired refresh token", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn refresh(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    let Some(presented) = extract_refresh_token(&headers) else {
        return Err(AuthError::TokenInvalid);
    };

    let old_hash = hash_refresh_token(&presented);
    let new_token = generate_refresh_token()?;
    let new_hash = hash_refresh_token(&new_token);

    let record = match storage::rotate_refresh_token(
        &pool,
        &old_hash,
        &new_hash,
        auth_state.config().refresh_token_ttl_seconds(),
    )
    .await?
    {
        storage::RotateOutcome::Rotated(record) => record,
        storage::RotateOutcome::Expired => return Err(AuthError::TokenExpired),
        storage::RotateOutcome::Missing => return Err(AuthError::TokenInvalid),
        storage::RotateOutcome::Locked => return Err(AuthError::AccountLocked),
    };
    let session_id = record.session_id.ok_or(AuthError::TokenInvalid)?;

    let user = storage::fetch_user_by_id(&pool, record.user_id)
        .await?
        .ok_or(AuthError::TokenInvalid)?;

    // Roles are re-read so a revoked permission stops riding along on the
    // next rotation.
    let (roles, permissions) = storage::load_roles_and_permissions(&pool, user.id).await?;
    let expires_in = auth_state.config().access_token_ttl_seconds();
    let access_token = auth_state.signer().access_token(
        user.id,
        &user.email,
        session_id,
        roles,
        permissions,
        expires_in,
    )?;

    let cookie = refresh_cookie(auth_state.config(), &new_token)
        .map_err(|err| AuthError::Internal(err.into()))?;
    debug!(user_id = %user.id, "refresh token rotated");

    let mut response_headers = HeaderMap::new();
    response_headers.insert(SET_COOKIE, cookie);
    Ok((
        response_headers,
        Json(RefreshResponse {
            access_token,
            expires_in,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::refresh;
    use crate::api::handlers::auth::error::AuthError;
    use crate::api::handlers::auth::federated::ProviderRegistry;
    use crate::api::handlers::auth::state::{AuthConfig, AuthState};
    use crate::security::geoip::GeoResolver;
    use crate::tokens::TokenSigner;
    use anyhow::Result;
    use axum::extract::Extension;
    use axum::http::HeaderMap;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    fn auth_state() -> Arc<AuthState> {
        let config = AuthConfig::new("http://localhost:3000".to_string());
        let signer = TokenSigner::new(&SecretString::from("top-secret"), "custodia");
        Arc::new(AuthState::new(
            config,
            signer,
            GeoResolver::new(""),
            ProviderRegistry::default(),
            SecretString::from("pepper"),
        ))
    }

    #[tokio::test]
    async fn refresh_without_cookie_is_invalid() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = refresh(HeaderMap::new(), Extension(pool), Extension(auth_state())).await;
        assert!(matches!(result, Err(AuthError::TokenInvalid)));
        Ok(())
    }
}
