//! Password reset with emailed one-time codes.

use axum::{extract::Extension, Json};
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use super::error::AuthError;
use super::state::AuthState;
use super::storage;
use super::types::{ForgotPasswordRequest, MessageResponse, ResetPasswordRequest};
use super::utils::{
    generate_numeric_code, hash_numeric_code, hash_password, hashes_match, normalize_email,
    valid_email, validate_password,
};
use crate::api::email::{TEMPLATE_PASSWORD_CHANGED, TEMPLATE_RESET_CODE};

/// Start a password reset. The response never reveals whether the account
/// exists.
#[utoipa::path(
    post,
    path = "/auth/forgot-password",
    request_body = ForgotPasswordRequest,
    responses(
        (status = 200, description = "Reset code queued if applicable", body = MessageResponse),
        (status = 422, description = "Invalid email", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn forgot_password(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ForgotPasswordRequest>>,
) -> Result<Json<MessageResponse>, AuthError> {
    let Some(Json(request)) = payload else {
        return Err(AuthError::Validation("missing payload".to_string()));
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return Err(AuthError::Validation("invalid email address".to_string()));
    }

    if let Some(user) = storage::fetch_user_by_email(&pool, &email).await? {
        let code = generate_numeric_code()?;
        let code_hash = hash_numeric_code(&code);
        storage::store_reset_code(
            &pool,
            user.id,
            &code_hash,
            auth_state.config().reset_code_ttl_seconds(),
        )
        .await?;

        let payload = json!({
            "email": user.email,
            "display_name": user.display_name,
            "code": code,
        });
        storage::enqueue_email(&pool, &user.email, TEMPLATE_RESET_CODE, &payload).await?;
        info!(user_id = %user.id, "password reset code queued");
    }

    Ok(Json(MessageResponse::new(
        "if the account exists, a reset code is on its way",
    )))
}

/// Complete a password reset with the emailed code. Every session and
/// refresh token the account holds is revoked.
#[utoipa::path(
    post,
    path = "/auth/reset-password",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password reset", body = MessageResponse),
        (status = 401, description = "Invalid or expired code", body = super::error::ErrorResponse),
        (status = 422, description = "Invalid email or password", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn reset_password(
    pool: Extension<PgPool>,
    payload: Option<Json<ResetPasswordRequest>>,
) -> Result<Json<MessageResponse>, AuthError> {
    let Some(Json(request)) = payload else {
        return Err(AuthError::Validation("missing payload".to_string()));
    };

    let email = normalize_email(&request.email);
    let code = request.code.trim();
    if !valid_email(&email) || code.is_empty() {
        return Err(AuthError::TokenInvalid);
    }
    validate_password(&request.new_password).map_err(AuthError::Validation)?;

    let Some(user) = storage::fetch_user_by_email(&pool, &email).await? else {
        return Err(AuthError::TokenInvalid);
    };

    let Some(stored_hash) = user.reset_code_hash.as_deref() else {
        return Err(AuthError::TokenInvalid);
    };
    let expired = match user.reset_code_expires_at {
        Some(expires_at) => expires_at <= Utc::now(),
        None => true,
    };
    if expired {
        return Err(AuthError::TokenExpired);
    }
    if !hashes_match(&hash_numeric_code(code), stored_hash) {
        return Err(AuthError::TokenInvalid);
    }

    let new_hash = hash_password(&request.new_password)?;
    let payload = json!({
        "email": user.email,
        "display_name": user.display_name,
    });
    storage::reset_password(
        &pool,
        user.id,
        &user.email,
        &new_hash,
        TEMPLATE_PASSWORD_CHANGED,
        &payload,
    )
    .await?;
    info!(user_id = %user.id, "password reset; all sessions revoked");

    Ok(Json(MessageResponse::new(
        "password updated; sign in with your new password",
    )))
}

#[cfg(test)]
mod tests {
    use super::{forgot_password, reset_password};
    use crate::api::handlers::auth::error::AuthError;
    use crate::api::handlers::auth::federated::ProviderRegistry;
    use crate::api::handlers::auth::state::{AuthConfig, AuthState};
    use crate::api::handlers::auth::types::{ForgotPasswordRequest, ResetPasswordRequest};
    use crate::security::geoip::GeoResolver;
    use crate::tokens::TokenSigner;
    use anyhow::Result;
    use axum::extract::Extension;
    use axum::Json;
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
    async fn forgot_password_rejects_malformed_email() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = forgot_password(
            Extension(pool),
            Extension(auth_state()),
            Some(Json(ForgotPasswordRequest {
                email: "nope".to_string(),
            })),
        )
        .await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn reset_password_rejects_blank_code() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = reset_password(
            Extension(pool),
            Some(Json(ResetPasswordRequest {
                email: "alice@example.com".to_string(),
                code: "  ".to_string(),
                new_password: "Sup3rSecret".to_string(),
            })),
        )
        .await;
        assert!(matches!(result, Err(AuthError::TokenInvalid)));
        Ok(())
    }

    #[tokio::test]
    async fn reset_password_enforces_password_policy() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = reset_password(
            Extension(pool),
            Some(Json(ResetPasswordRequest {
                email: "alice@example.com".to_string(),
                code: "123456".to_string(),
                new_password: "weak".to_string(),
            })),
        )
        .await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
        Ok(())
    }
}
