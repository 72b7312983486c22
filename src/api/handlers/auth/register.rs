//! Registration, email activation, and activation resend.

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::error::AuthError;
use super::state::AuthState;
use super::storage;
use super::types::{MessageResponse, RegisterRequest, ResendActivationRequest, VerifyEmailRequest};
use super::utils::{
    build_activation_url, hash_password, normalize_email, valid_email, validate_password,
};
use crate::api::email::TEMPLATE_ACTIVATION;
use super::DEFAULT_ROLE;

/// Create an unverified account and queue its activation email.
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created, activation email queued", body = MessageResponse),
        (status = 409, description = "Email already registered", body = super::error::ErrorResponse),
        (status = 422, description = "Invalid email or password", body = super::error::ErrorResponse),
        (status = 502, description = "Activation email could not be queued", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn register(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<RegisterRequest>>,
) -> Result<impl IntoResponse, AuthError> {
    let Some(Json(request)) = payload else {
        return Err(AuthError::Validation("missing payload".to_string()));
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return Err(AuthError::Validation("invalid email address".to_string()));
    }
    validate_password(&request.password).map_err(AuthError::Validation)?;

    let display_name = request
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(&email)
        .to_string();

    let password_hash = hash_password(&request.password)?;

    // The id is minted here so the activation token can reference the row
    // before it exists.
    let user_id = Uuid::new_v4();
    let token = auth_state.signer().activation_token(
        user_id,
        &email,
        auth_state.config().activation_token_ttl_seconds(),
    )?;
    let payload = activation_payload(auth_state.config().frontend_base_url(), &email, &display_name, &token);

    let outcome = storage::create_user_with_activation(
        &pool,
        user_id,
        &email,
        &password_hash,
        &display_name,
        TEMPLATE_ACTIVATION,
        &payload,
    )
    .await?;

    match outcome {
        storage::SignupOutcome::Created => {
            info!(%user_id, "account created");
            Ok((
                StatusCode::CREATED,
                Json(MessageResponse::new(
                    "account created; check your email to activate it",
                )),
            ))
        }
        storage::SignupOutcome::DuplicateVerified => Err(AuthError::DuplicateIdentity),
        storage::SignupOutcome::DuplicatePending { user_id } => {
            // Re-mint for the existing row so the link carries the right id.
            let token = auth_state.signer().activation_token(
                user_id,
                &email,
                auth_state.config().activation_token_ttl_seconds(),
            )?;
            let payload = activation_payload(
                auth_state.config().frontend_base_url(),
                &email,
                &display_name,
                &token,
            );
            storage::enqueue_email(&pool, &email, TEMPLATE_ACTIVATION, &payload).await?;
            Err(AuthError::PendingVerification)
        }
        storage::SignupOutcome::MessagingFailed => Err(AuthError::MessagingFailure),
    }
}

fn activation_payload(
    frontend_base_url: &str,
    email: &str,
    display_name: &str,
    token: &str,
) -> serde_json::Value {
    json!({
        "email": email,
        "display_name": display_name,
        "activation_url": build_activation_url(frontend_base_url, token),
    })
}

/// Consume an activation token and verify the account.
#[utoipa::path(
    get,
    path = "/auth/verify-email",
    params(
        ("token" = String, Query, description = "Activation token from the email link")
    ),
    responses(
        (status = 200, description = "Account verified", body = MessageResponse),
        (status = 401, description = "Invalid or expired token", body = super::error::ErrorResponse),
        (status = 409, description = "Account already verified", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn verify_email(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Query(request): Query<VerifyEmailRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    let claims = auth_state.signer().decode_activation(&request.token)?;

    let user = storage::fetch_user_by_id(&pool, claims.sub)
        .await?
        .ok_or(AuthError::TokenInvalid)?;

    // A token minted before the account was verified is spent; one minted
    // afterwards (resend race) is equally useless.
    if let Some(verified_at) = user.email_verified_at {
        if verified_at.timestamp() >= claims.iat {
            return Err(AuthError::AlreadyVerified);
        }
    }

    storage::mark_email_verified(&pool, user.id, DEFAULT_ROLE).await?;
    info!(user_id = %user.id, "email verified");

    Ok(Json(MessageResponse::new("email verified; you can sign in")))
}

/// Queue a fresh activation email. The response never reveals whether the
/// account exists.
#[utoipa::path(
    post,
    path = "/auth/resend-activation",
    request_body = ResendActivationRequest,
    responses(
        (status = 200, description = "Activation email queued if applicable", body = MessageResponse),
        (status = 422, description = "Invalid email", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn resend_activation(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ResendActivationRequest>>,
) -> Result<Json<MessageResponse>, AuthError> {
    let Some(Json(request)) = payload else {
        return Err(AuthError::Validation("missing payload".to_string()));
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return Err(AuthError::Validation("invalid email address".to_string()));
    }

    if let Some(user) = storage::fetch_user_by_email(&pool, &email).await? {
        if user.email_verified_at.is_none() {
            let token = auth_state.signer().activation_token(
                user.id,
                &user.email,
                auth_state.config().activation_token_ttl_seconds(),
            )?;
            let payload = activation_payload(
                auth_state.config().frontend_base_url(),
                &user.email,
                &user.display_name,
                &token,
            );
            storage::enqueue_email(&pool, &user.email, TEMPLATE_ACTIVATION, &payload).await?;
        }
    }

    Ok(Json(MessageResponse::new(
        "if the account exists and is unverified, a new activation email is on its way",
    )))
}

#[cfg(test)]
mod tests {
    use super::{activation_payload, register, resend_activation, verify_email};
    use crate::api::handlers::auth::error::AuthError;
    use crate::api::handlers::auth::federated::ProviderRegistry;
    use crate::api::handlers::auth::state::{AuthConfig, AuthState};
    use crate::api::handlers::auth::types::{
        RegisterRequest, ResendActivationRequest, VerifyEmailRequest,
    };
    use crate::security::geoip::GeoResolver;
    use crate::tokens::TokenSigner;
    use anyhow::Result;
    use axum::extract::{Extension, Query};
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

    #[test]
    fn activation_payload_shape() {
        let payload = activation_payload(
            "http://localhost:3000",
            "alice@example.com",
            "Alice",
            "tok",
        );
        assert_eq!(
            payload.get("activation_url").and_then(|v| v.as_str()),
            Some("http://localhost:3000/verify-email?token=tok")
        );
        assert_eq!(
            payload.get("email").and_then(|v| v.as_str()),
            Some("alice@example.com")
        );
    }

    #[tokio::test]
    async fn register_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = register(Extension(pool), Extension(auth_state()), None).await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_weak_password() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = register(
            Extension(pool),
            Extension(auth_state()),
            Some(Json(RegisterRequest {
                email: "alice@example.com".to_string(),
                password: "weak".to_string(),
                display_name: None,
            })),
        )
        .await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_malformed_email() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = register(
            Extension(pool),
            Extension(auth_state()),
            Some(Json(RegisterRequest {
                email: "not-an-email".to_string(),
                password: "Sup3rSecret".to_string(),
                display_name: None,
            })),
        )
        .await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn verify_email_rejects_garbage_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = verify_email(
            Extension(pool),
            Extension(auth_state()),
            Query(VerifyEmailRequest {
                token: "not-a-jwt".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(AuthError::TokenInvalid)));
        Ok(())
    }

    #[tokio::test]
    async fn resend_activation_rejects_malformed_email() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = resend_activation(
            Extension(pool),
            Extension(auth_state()),
            Some(Json(ResendActivationRequest {
                email: "nope".to_string(),
            })),
        )
        .await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
        Ok(())
    }
}
