//! TOTP enrollment and backup code management.
//!
//! Enrollment is two-phase: `generate-secret` parks a pending secret with a
//! short TTL, `verify-and-enable` promotes it only after the caller proves
//! possession with a live code.

use anyhow::anyhow;
use axum::{extract::Extension, Json};
use chrono::Utc;
use secrecy::ExposeSecret;
use sqlx::PgPool;
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};

use super::error::AuthError;
use super::principal::Principal;
use super::recovery::{verify_backup_code, BackupCodeBatch};
use super::state::AuthState;
use super::storage;
use super::types::{
    BackupCodesResponse, MessageResponse, TwoFactorCodeRequest, TwoFactorEnableResponse,
    TwoFactorSecretResponse,
};
use super::PERMISSION_MANAGE_2FA;

const TOTP_DIGITS: usize = 6;
const TOTP_STEP_SECONDS: u64 = 30;

pub(super) fn build_totp(secret_base32: &str, issuer: &str, account: &str) -> anyhow::Result<TOTP> {
    let secret = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|_| anyhow!("invalid totp secret"))?;
    TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        1,
        TOTP_STEP_SECONDS,
        secret,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|err| anyhow!("failed to build totp: {err}"))
}

/// Check a login-supplied second factor: a live TOTP code first, then the
/// backup codes. A matched backup code is burned on the spot.
pub(super) async fn verify_two_factor_code(
    pool: &PgPool,
    state: &AuthState,
    user: &storage::UserRecord,
    code: &str,
) -> Result<bool, AuthError> {
    let code = code.trim();
    if code.is_empty() {
        return Ok(false);
    }

    if let Some(secret) = user.totp_secret.as_deref() {
        let totp = build_totp(secret, state.config().totp_issuer(), &user.email)?;
        if totp.check_current(code).unwrap_or(false) {
            return Ok(true);
        }
    }

    let pepper = state.backup_code_pepper().expose_secret().as_bytes().to_vec();
    for row in storage::list_backup_codes(pool, user.id).await? {
        if verify_backup_code(code, &row.code_hash, &pepper)? {
            // The delete is the claim: of two logins racing on the same
            // code, only the one whose delete lands authenticates.
            return Ok(storage::consume_backup_code(pool, user.id, row.id).await?);
        }
    }

    Ok(false)
}

/// Start TOTP enrollment with a short-lived pending secret.
#[utoipa::path(
    post,
    path = "/auth/2fa/generate-secret",
    responses(
        (status = 200, description = "Pending secret created", body = TwoFactorSecretResponse),
        (status = 401, description = "Not authenticated", body = super::error::ErrorResponse),
        (status = 403, description = "Missing permission", body = super::error::ErrorResponse),
        (status = 422, description = "Two-factor already enabled", body = super::error::ErrorResponse)
    ),
    tag = "two-factor"
)]
pub async fn generate_secret(
    principal: Extension<Principal>,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<Json<TwoFactorSecretResponse>, AuthError> {
    principal.require_permissions(&[PERMISSION_MANAGE_2FA])?;

    let user = storage::fetch_user_by_id(&pool, principal.user_id)
        .await?
        .ok_or(AuthError::NotFound)?;
    if user.totp_enabled {
        return Err(AuthError::Validation(
            "two-factor is already enabled; disable it first".to_string(),
        ));
    }

    let secret = Secret::generate_secret().to_encoded().to_string();
    let totp = build_totp(&secret, auth_state.config().totp_issuer(), &user.email)?;
    let otpauth_url = totp.get_url();

    storage::store_pending_totp(
        &pool,
        user.id,
        &secret,
        auth_state.config().pending_totp_ttl_seconds(),
    )
    .await?;

    Ok(Json(TwoFactorSecretResponse {
        secret,
        otpauth_url,
    }))
}

/// Prove possession of the pending secret and switch two-factor on.
/// Returns the one-time cleartext backup code batch.
#[utoipa::path(
    post,
    path = "/auth/2fa/verify-and-enable",
    request_body = TwoFactorCodeRequest,
    responses(
        (status = 200, description = "Two-factor enabled", body = TwoFactorEnableResponse),
        (status = 401, description = "Invalid code or expired setup", body = super::error::ErrorResponse),
        (status = 403, description = "Missing permission", body = super::error::ErrorResponse)
    ),
    tag = "two-factor"
)]
pub async fn verify_and_enable(
    principal: Extension<Principal>,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<TwoFactorCodeRequest>,
) -> Result<Json<TwoFactorEnableResponse>, AuthError> {
    principal.require_permissions(&[PERMISSION_MANAGE_2FA])?;

    let user = storage::fetch_user_by_id(&pool, principal.user_id)
        .await?
        .ok_or(AuthError::NotFound)?;

    let Some(pending) = user.totp_pending_secret.as_deref() else {
        return Err(AuthError::Validation(
            "no pending two-factor setup".to_string(),
        ));
    };
    let expired = match user.totp_pending_expires_at {
        Some(expires_at) => expires_at <= Utc::now(),
        None => true,
    };
    if expired {
        return Err(AuthError::TokenExpired);
    }

    let totp = build_totp(pending, auth_state.config().totp_issuer(), &user.email)?;
    if !totp.check_current(request.code.trim()).unwrap_or(false) {
        return Err(AuthError::TwoFactorInvalid);
    }

    let pepper = auth_state.backup_code_pepper().expose_secret().as_bytes().to_vec();
    let batch = BackupCodeBatch::generate(&pepper)?;
    storage::enable_totp(&pool, user.id, pending, &batch.code_hashes).await?;

    Ok(Json(TwoFactorEnableResponse {
        message: "two-factor enabled".to_string(),
        backup_codes: batch.codes,
    }))
}

/// Switch two-factor off. Requires a valid current code or backup code.
#[utoipa::path(
    post,
    path = "/auth/2fa/disable",
    request_body = TwoFactorCodeRequest,
    responses(
        (status = 200, description = "Two-factor disabled", body = MessageResponse),
        (status = 401, description = "Invalid code", body = super::error::ErrorResponse),
        (status = 403, description = "Missing permission", body = super::error::ErrorResponse)
    ),
    tag = "two-factor"
)]
pub async fn disable(
    principal: Extension<Principal>,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<TwoFactorCodeRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    principal.require_permissions(&[PERMISSION_MANAGE_2FA])?;

    let user = storage::fetch_user_by_id(&pool, principal.user_id)
        .await?
        .ok_or(AuthError::NotFound)?;
    if !user.totp_enabled {
        return Err(AuthError::Validation(
            "two-factor is not enabled".to_string(),
        ));
    }

    if !verify_two_factor_code(&pool, &auth_state, &user, &request.code).await? {
        return Err(AuthError::TwoFactorInvalid);
    }

    storage::disable_totp(&pool, user.id).await?;
    Ok(Json(MessageResponse::new("two-factor disabled")))
}

/// Replace the backup code set and return the new batch once, in cleartext.
#[utoipa::path(
    post,
    path = "/auth/2fa/backup-codes",
    responses(
        (status = 200, description = "Fresh backup codes", body = BackupCodesResponse),
        (status = 401, description = "Not authenticated", body = super::error::ErrorResponse),
        (status = 403, description = "Missing permission", body = super::error::ErrorResponse),
        (status = 422, description = "Two-factor not enabled", body = super::error::ErrorResponse)
    ),
    tag = "two-factor"
)]
pub async fn backup_codes(
    principal: Extension<Principal>,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<Json<BackupCodesResponse>, AuthError> {
    principal.require_permissions(&[PERMISSION_MANAGE_2FA])?;

    let user = storage::fetch_user_by_id(&pool, principal.user_id)
        .await?
        .ok_or(AuthError::NotFound)?;
    if !user.totp_enabled {
        return Err(AuthError::Validation(
            "two-factor is not enabled".to_string(),
        ));
    }

    let pepper = auth_state.backup_code_pepper().expose_secret().as_bytes().to_vec();
    let batch = BackupCodeBatch::generate(&pepper)?;
    storage::replace_backup_codes(&pool, user.id, &batch.code_hashes).await?;

    Ok(Json(BackupCodesResponse {
        backup_codes: batch.codes,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::principal::Principal;
    use super::{build_totp, generate_secret};
    use crate::api::handlers::auth::error::AuthError;
    use crate::api::handlers::auth::federated::ProviderRegistry;
    use crate::api::handlers::auth::state::{AuthConfig, AuthState};
    use crate::security::geoip::GeoResolver;
    use crate::tokens::TokenSigner;
    use anyhow::Result;
    use axum::extract::Extension;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;
    use uuid::Uuid;

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
    fn build_totp_produces_provisioning_url() {
        let totp = build_totp("JBSWY3DPEHPK3PXP", "Custodia", "alice@example.com").unwrap();
        let url = totp.get_url();
        assert!(url.starts_with("otpauth://totp/"));
        assert!(url.contains("Custodia"));
        assert!(url.contains("alice%40example.com"));
    }

    #[test]
    fn build_totp_rejects_garbage_secret() {
        assert!(build_totp("not base32!!", "Custodia", "alice@example.com").is_err());
    }

    #[test]
    fn burned_backup_code_matches_no_remaining_row() -> Result<()> {
        use crate::api::handlers::auth::recovery::{verify_backup_code, BackupCodeBatch};

        // Once the winning claim deletes the row, the same code must not
        // authenticate against any code left in the batch.
        let pepper = b"pepper";
        let batch = BackupCodeBatch::generate(pepper)?;
        let code = &batch.codes[0];
        assert!(verify_backup_code(code, &batch.code_hashes[0], pepper)?);
        for hash in &batch.code_hashes[1..] {
            assert!(!verify_backup_code(code, hash, pepper)?);
        }
        Ok(())
    }

    #[test]
    fn short_code_never_matches() {
        let totp = build_totp("JBSWY3DPEHPK3PXP", "Custodia", "alice@example.com").unwrap();
        assert!(!totp.check_current("12345").unwrap_or(true));
    }

    #[tokio::test]
    async fn generate_secret_requires_permission() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let principal = Principal {
            user_id: Uuid::new_v4(),
            email: "alice@example.com".to_string(),
            session_id: Uuid::new_v4(),
            roles: vec!["User".to_string()],
            permissions: vec![],
        };
        let result = generate_secret(
            Extension(principal),
            Extension(pool),
            Extension(auth_state()),
        )
        .await;
        assert!(matches!(result, Err(AuthError::Forbidden)));
        Ok(())
    }
}
