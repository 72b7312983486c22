//! Bearer authentication middleware and the request principal.
//!
//! The middleware decodes the access token and parks a [`Principal`] in the
//! request extensions. When the access token has merely expired it attempts
//! one refresh-cookie rotation before failing, surfacing the new pair via
//! the `x-access-token` response header and a fresh cookie.

use axum::{
    extract::{Extension, Request},
    http::{header::SET_COOKIE, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::error::AuthError;
use super::session::{extract_bearer_token, extract_refresh_token, refresh_cookie};
use super::state::AuthState;
use super::storage;
use super::utils::{generate_refresh_token, hash_refresh_token};
use crate::tokens::{AccessClaims, Error as TokenError};

/// Response header carrying a transparently renewed access token.
pub(crate) const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// The authenticated caller, as snapshotted in the access token.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
    pub session_id: Uuid,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl Principal {
    /// Fail closed unless the principal holds every required permission.
    pub fn require_permissions(&self, required: &[&str]) -> Result<(), AuthError> {
        let held = required
            .iter()
            .all(|needed| self.permissions.iter().any(|have| have == needed));
        if held {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }
}

impl From<AccessClaims> for Principal {
    fn from(claims: AccessClaims) -> Self {
        Self {
            user_id: claims.sub,
            email: claims.email,
            session_id: claims.sid,
            roles: claims.roles,
            permissions: claims.permissions,
        }
    }
}

/// Token pair minted during a transparent renewal.
struct Renewed {
    principal: Principal,
    access_token: String,
    refresh_token: String,
}

/// Axum middleware guarding the authenticated routes.
pub async fn authenticate(
    Extension(pool): Extension<PgPool>,
    Extension(auth_state): Extension<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(token) = extract_bearer_token(request.headers()) else {
        return Err(AuthError::TokenInvalid);
    };

    match auth_state.signer().decode_access(&token) {
        Ok(claims) => {
            request.extensions_mut().insert(Principal::from(claims));
            Ok(next.run(request).await)
        }
        Err(TokenError::Expired) => {
            let Some(refresh) = extract_refresh_token(request.headers()) else {
                return Err(AuthError::TokenExpired);
            };
            let renewed = renew_from_refresh(&pool, &auth_state, &refresh).await?;
            debug!(user_id = %renewed.principal.user_id, "access token renewed in-flight");

            request.extensions_mut().insert(renewed.principal);
            let mut response = next.run(request).await;

            if let Ok(value) = HeaderValue::from_str(&renewed.access_token) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(ACCESS_TOKEN_HEADER), value);
            }
            if let Ok(cookie) = refresh_cookie(auth_state.config(), &renewed.refresh_token) {
                response.headers_mut().append(SET_COOKIE, cookie);
            }
            Ok(response)
        }
        Err(TokenError::Invalid) => Err(AuthError::TokenInvalid),
    }
}

/// One rotation attempt from the refresh cookie; any miss fails the request.
async fn renew_from_refresh(
    pool: &PgPool,
    state: &AuthState,
    refresh: &str,
) -> Result<Renewed, AuthError> {
    let old_hash = hash_refresh_token(refresh);
    let new_refresh = generate_refresh_token()?;
    let new_hash = hash_refresh_token(&new_refresh);

    let record = match storage::rotate_refresh_token(
        pool,
        &old_hash,
        &new_hash,
        state.config().refresh_token_ttl_seconds(),
    )
    .await?
    {
        storage::RotateOutcome::Rotated(record) => record,
        storage::RotateOutcome::Expired => return Err(AuthError::TokenExpired),
        storage::RotateOutcome::Missing => return Err(AuthError::TokenInvalid),
        storage::RotateOutcome::Locked => return Err(AuthError::AccountLocked),
    };
    let session_id = record.session_id.ok_or(AuthError::TokenInvalid)?;

    let user = storage::fetch_user_by_id(pool, record.user_id)
        .await?
        .ok_or(AuthError::TokenInvalid)?;

    let (roles, permissions) = storage::load_roles_and_permissions(pool, user.id).await?;
    let access_token = state.signer().access_token(
        user.id,
        &user.email,
        session_id,
        roles.clone(),
        permissions.clone(),
        state.config().access_token_ttl_seconds(),
    )?;

    Ok(Renewed {
        principal: Principal {
            user_id: user.id,
            email: user.email,
            session_id,
            roles,
            permissions,
        },
        access_token,
        refresh_token: new_refresh,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn principal(permissions: Vec<String>) -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            email: "alice@example.com".to_string(),
            session_id: Uuid::new_v4(),
            roles: vec!["User".to_string()],
            permissions,
        }
    }

    #[test]
    fn require_permissions_needs_all() {
        let p = principal(vec!["Update Profile".to_string(), "Manage Two-Factor".to_string()]);
        assert!(p.require_permissions(&["Update Profile"]).is_ok());
        assert!(p
            .require_permissions(&["Update Profile", "Manage Two-Factor"])
            .is_ok());
        assert!(matches!(
            p.require_permissions(&["Update Profile", "Administer"]),
            Err(AuthError::Forbidden)
        ));
    }

    #[test]
    fn require_permissions_with_empty_set() {
        let p = principal(vec![]);
        assert!(p.require_permissions(&[]).is_ok());
        assert!(p.require_permissions(&["Update Profile"]).is_err());
    }

    #[test]
    fn principal_from_claims() {
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            sub: user_id,
            email: "alice@example.com".to_string(),
            sid: session_id,
            roles: vec!["User".to_string()],
            permissions: vec!["Update Profile".to_string()],
            iss: "custodia".to_string(),
            iat: now,
            exp: now + 900,
            jti: "01JABCDEF".to_string(),
        };

        let p = Principal::from(claims);
        assert_eq!(p.user_id, user_id);
        assert_eq!(p.session_id, session_id);
        assert_eq!(p.roles, vec!["User".to_string()]);
        assert_eq!(p.permissions, vec!["Update Profile".to_string()]);
    }
}
