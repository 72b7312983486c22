//! Password login and step-up verification.
//!
//! The login pipeline is ordered so an attacker learns as little as
//! possible: credential resolution, lock check, password verification,
//! anomaly classification, and only then the verification and two-factor
//! gates. Anomalies interrupt the login before any account state leaks.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info};

use super::error::AuthError;
use super::federated::provider_display;
use super::session::{establish_session, login_response, refresh_cookie};
use super::state::AuthState;
use super::storage;
use super::two_factor::verify_two_factor_code;
use super::types::{LoginRequest, LoginResponse, VerifySecurityCodeRequest};
use super::utils::{
    device_descriptor, generate_numeric_code, hash_numeric_code, hashes_match, network_origin,
    normalize_email, valid_email, verify_password,
};
use crate::api::email::TEMPLATE_SECURITY_CODE;
use crate::security::{
    classify, LoginObservation, FREQUENT_LOGIN_WINDOW_SECONDS, SUSPICION_LOCK_THRESHOLD,
};

/// Password login. Returns the access token and user summary, with the
/// refresh token in an `HttpOnly` cookie.
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated", body = LoginResponse),
        (status = 401, description = "Invalid credentials or second factor", body = super::error::ErrorResponse),
        (status = 403, description = "Step-up or verification required", body = super::error::ErrorResponse),
        (status = 409, description = "Account uses federated login", body = super::error::ErrorResponse),
        (status = 423, description = "Account locked", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<LoginRequest>>,
) -> Result<impl IntoResponse, AuthError> {
    let Some(Json(request)) = payload else {
        return Err(AuthError::Validation("missing payload".to_string()));
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) || request.password.is_empty() {
        return Err(AuthError::InvalidCredentials);
    }

    let origin = network_origin(&headers);
    let device = device_descriptor(&headers);

    let Some(user) = storage::fetch_user_by_email(&pool, &email).await? else {
        return Err(AuthError::InvalidCredentials);
    };

    check_lock(&pool, &user).await?;

    let Some(password_hash) = user.password_hash.as_deref() else {
        let providers = storage::linked_providers(&pool, user.id).await?;
        let named = if providers.is_empty() {
            "a federated provider".to_string()
        } else {
            providers
                .iter()
                .map(|p| provider_display(p))
                .collect::<Vec<_>>()
                .join(" or ")
        };
        return Err(AuthError::UseFederatedLogin { providers: named });
    };

    let location = auth_state.geo().resolve(&origin).await;

    if !verify_password(&request.password, password_hash) {
        let failures = storage::record_failed_password_login(
            &pool,
            user.id,
            auth_state.config().failed_login_limit(),
            auth_state.config().lockout_seconds(),
        )
        .await?;
        record_attempt(&pool, user.id, &origin, &device, &location, false).await;
        info!(user_id = %user.id, failures, "failed password login");
        return Err(AuthError::InvalidCredentials);
    }

    // Anomaly classification runs before the verification and two-factor
    // gates so a hijacked password cannot probe account state.
    let baseline = storage::latest_successful_attempt(&pool, user.id).await?;
    let recent =
        storage::count_recent_attempts(&pool, user.id, FREQUENT_LOGIN_WINDOW_SECONDS).await?;
    let observation = LoginObservation {
        origin: origin.clone(),
        device: device.clone(),
        location: location.clone(),
        attempted_at: Utc::now(),
        tz_offset_minutes: user.tz_offset_minutes,
        recent_attempts: recent,
    };
    let patterns = classify(&observation, baseline.as_ref());

    if !patterns.is_empty() {
        let escalate = patterns.len() >= SUSPICION_LOCK_THRESHOLD;
        let code = generate_numeric_code()?;
        let code_hash = hash_numeric_code(&code);
        let patterns: Vec<String> = patterns.iter().map(ToString::to_string).collect();
        let payload = json!({
            "email": user.email,
            "display_name": user.display_name,
            "code": code,
            "patterns": patterns,
            "origin": origin,
            "device": device,
            "location": location,
        });

        storage::record_suspicious_login(
            &pool,
            storage::SuspiciousLogin {
                user_id: user.id,
                email: &user.email,
                origin: &origin,
                device: &device,
                location: &location,
                patterns: &patterns,
                code_hash: &code_hash,
                code_ttl_seconds: auth_state.config().security_code_ttl_seconds(),
                lock_seconds: escalate.then(|| auth_state.config().lockout_seconds()),
                template: TEMPLATE_SECURITY_CODE,
                payload: &payload,
            },
        )
        .await?;

        info!(user_id = %user.id, ?patterns, escalate, "suspicious login challenged");
        if escalate {
            return Err(AuthError::AccountLocked);
        }
        return Err(AuthError::StepUpRequired);
    }

    require_verified_and_second_factor(
        &pool,
        &auth_state,
        &user,
        request.two_factor_code.as_deref(),
        &origin,
        &device,
        &location,
    )
    .await?;

    if user.failed_logins > 0 {
        storage::clear_lock(&pool, user.id).await?;
    }

    record_attempt(&pool, user.id, &origin, &device, &location, true).await;

    let issued = establish_session(&pool, &auth_state, &user, &origin, &device).await?;
    let cookie = refresh_cookie(auth_state.config(), &issued.refresh_token)
        .map_err(|err| AuthError::Internal(err.into()))?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(SET_COOKIE, cookie);
    Ok((response_headers, Json(login_response(&user, issued))))
}

/// Complete a challenged login with the emailed security code.
#[utoipa::path(
    post,
    path = "/auth/verify-security-code",
    request_body = VerifySecurityCodeRequest,
    responses(
        (status = 200, description = "Authenticated", body = LoginResponse),
        (status = 401, description = "Invalid or expired code", body = super::error::ErrorResponse),
        (status = 403, description = "Verification or two-factor required", body = super::error::ErrorResponse),
        (status = 423, description = "Account locked", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn verify_security_code(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<VerifySecurityCodeRequest>>,
) -> Result<impl IntoResponse, AuthError> {
    let Some(Json(request)) = payload else {
        return Err(AuthError::Validation("missing payload".to_string()));
    };

    let email = normalize_email(&request.email);
    let code = request.code.trim();
    if !valid_email(&email) || code.is_empty() {
        return Err(AuthError::TokenInvalid);
    }

    let Some(user) = storage::fetch_user_by_email(&pool, &email).await? else {
        return Err(AuthError::TokenInvalid);
    };

    check_lock(&pool, &user).await?;

    let Some(stored_hash) = user.security_code_hash.as_deref() else {
        return Err(AuthError::TokenInvalid);
    };
    let expired = match user.security_code_expires_at {
        Some(expires_at) => expires_at <= Utc::now(),
        None => true,
    };
    if expired {
        return Err(AuthError::TokenExpired);
    }
    if !hashes_match(&hash_numeric_code(code), stored_hash) {
        return Err(AuthError::TokenInvalid);
    }

    let origin = network_origin(&headers);
    let device = device_descriptor(&headers);
    let location = auth_state.geo().resolve(&origin).await;

    require_verified_and_second_factor(
        &pool,
        &auth_state,
        &user,
        request.two_factor_code.as_deref(),
        &origin,
        &device,
        &location,
    )
    .await?;

    storage::clear_security_challenge(&pool, user.id, "verified via security code").await?;
    record_attempt(&pool, user.id, &origin, &device, &location, true).await;

    let issued = establish_session(&pool, &auth_state, &user, &origin, &device).await?;
    let cookie = refresh_cookie(auth_state.config(), &issued.refresh_token)
        .map_err(|err| AuthError::Internal(err.into()))?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(SET_COOKIE, cookie);
    Ok((response_headers, Json(login_response(&user, issued))))
}

/// Reject locked accounts; a lapsed timed lock is cleared instead.
async fn check_lock(pool: &PgPool, user: &storage::UserRecord) -> Result<(), AuthError> {
    match storage::lock_disposition(user.locked, user.locked_until, Utc::now()) {
        storage::LockDisposition::Unlocked => Ok(()),
        storage::LockDisposition::Lapsed => {
            storage::clear_lock(pool, user.id).await?;
            Ok(())
        }
        storage::LockDisposition::Held => Err(AuthError::AccountLocked),
    }
}

/// The gates every interactive login passes after credentials check out.
async fn require_verified_and_second_factor(
    pool: &PgPool,
    state: &AuthState,
    user: &storage::UserRecord,
    two_factor_code: Option<&str>,
    origin: &str,
    device: &str,
    location: &str,
) -> Result<(), AuthError> {
    if user.email_verified_at.is_none() {
        return Err(AuthError::EmailUnverified);
    }

    if user.totp_enabled {
        let code = two_factor_code.map(str::trim).filter(|code| !code.is_empty());
        let Some(code) = code else {
            return Err(AuthError::TwoFactorRequired);
        };
        if !verify_two_factor_code(pool, state, user, code).await? {
            record_attempt(pool, user.id, origin, device, location, false).await;
            return Err(AuthError::TwoFactorInvalid);
        }
    }

    Ok(())
}

/// Attempt rows feed anomaly baselines; persistence failures must not
/// break the login itself.
async fn record_attempt(
    pool: &PgPool,
    user_id: uuid::Uuid,
    origin: &str,
    device: &str,
    location: &str,
    successful: bool,
) {
    if let Err(err) =
        storage::record_login_attempt(pool, user_id, origin, device, location, successful, &[])
            .await
    {
        error!("Failed to record login attempt: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::{login, verify_security_code};
    use crate::api::handlers::auth::error::AuthError;
    use crate::api::handlers::auth::federated::ProviderRegistry;
    use crate::api::handlers::auth::state::{AuthConfig, AuthState};
    use crate::api::handlers::auth::types::{LoginRequest, VerifySecurityCodeRequest};
    use crate::security::geoip::GeoResolver;
    use crate::tokens::TokenSigner;
    use anyhow::Result;
    use axum::extract::Extension;
    use axum::http::HeaderMap;
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
    async fn login_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = login(HeaderMap::new(), Extension(pool), Extension(auth_state()), None).await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn login_rejects_malformed_email_without_database() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = login(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(LoginRequest {
                email: "not-an-email".to_string(),
                password: "Sup3rSecret".to_string(),
                two_factor_code: None,
            })),
        )
        .await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
        Ok(())
    }

    #[tokio::test]
    async fn login_rejects_empty_password() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = login(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(LoginRequest {
                email: "alice@example.com".to_string(),
                password: String::new(),
                two_factor_code: None,
            })),
        )
        .await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
        Ok(())
    }

    #[tokio::test]
    async fn verify_security_code_rejects_blank_code() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let result = verify_security_code(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(VerifySecurityCodeRequest {
                email: "alice@example.com".to_string(),
                code: "  ".to_string(),
                two_factor_code: None,
            })),
        )
        .await;
        assert!(matches!(result, Err(AuthError::TokenInvalid)));
        Ok(())
    }
}
