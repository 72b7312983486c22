use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

/// Authentication failure taxonomy. Every variant maps to a stable error
/// kind and a 4xx status; persistence and transport failures ride in
/// `Internal` and surface as an opaque 500.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("an account with this email already exists")]
    DuplicateIdentity,

    #[error("account is awaiting verification; a new activation email has been sent")]
    PendingVerification,

    #[error("token is invalid")]
    TokenInvalid,

    #[error("token has expired")]
    TokenExpired,

    #[error("account is already verified")]
    AlreadyVerified,

    #[error("email or password is incorrect")]
    InvalidCredentials,

    #[error("account is temporarily locked; try again later")]
    AccountLocked,

    #[error("additional verification required; a security code has been sent to your email")]
    StepUpRequired,

    #[error("email address has not been verified")]
    EmailUnverified,

    #[error("a two-factor code is required")]
    TwoFactorRequired,

    #[error("two-factor code is invalid")]
    TwoFactorInvalid,

    #[error("this account signs in with {providers}; use that provider instead")]
    UseFederatedLogin { providers: String },

    #[error("not found")]
    NotFound,

    #[error("unable to send the required notification; try again later")]
    MessagingFailure,

    #[error("{0}")]
    Validation(String),

    #[error("insufficient permissions")]
    Forbidden,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// JSON error payload: `{"error": KIND, "message": "..."}`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl AuthError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateIdentity => "DUPLICATE_IDENTITY",
            Self::PendingVerification => "PENDING_VERIFICATION",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::AlreadyVerified => "ALREADY_VERIFIED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::StepUpRequired => "STEP_UP_REQUIRED",
            Self::EmailUnverified => "EMAIL_UNVERIFIED",
            Self::TwoFactorRequired => "TWO_FACTOR_REQUIRED",
            Self::TwoFactorInvalid => "TWO_FACTOR_INVALID",
            Self::UseFederatedLogin { .. } => "USE_FEDERATED_LOGIN",
            Self::NotFound => "NOT_FOUND",
            Self::MessagingFailure => "MESSAGING_FAILURE",
            Self::Validation(_) => "VALIDATION",
            Self::Forbidden => "FORBIDDEN",
            Self::Internal(_) => "INTERNAL",
        }
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::DuplicateIdentity
            | Self::PendingVerification
            | Self::AlreadyVerified
            | Self::UseFederatedLogin { .. } => StatusCode::CONFLICT,
            Self::TokenInvalid
            | Self::TokenExpired
            | Self::InvalidCredentials
            | Self::TwoFactorRequired
            | Self::TwoFactorInvalid => StatusCode::UNAUTHORIZED,
            Self::AccountLocked => StatusCode::LOCKED,
            Self::StepUpRequired | Self::EmailUnverified | Self::Forbidden => {
                StatusCode::FORBIDDEN
            }
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MessagingFailure => StatusCode::BAD_GATEWAY,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<crate::tokens::Error> for AuthError {
    fn from(err: crate::tokens::Error) -> Self {
        match err {
            crate::tokens::Error::Expired => Self::TokenExpired,
            crate::tokens::Error::Invalid => Self::TokenInvalid,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Internal(err) => {
                tracing::error!("internal error: {err:#}");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error: self.kind().to_string(),
            message,
        };

        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(AuthError::DuplicateIdentity.status(), StatusCode::CONFLICT);
        assert_eq!(AuthError::TokenExpired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::AccountLocked.status(), StatusCode::LOCKED);
        assert_eq!(AuthError::StepUpRequired.status(), StatusCode::FORBIDDEN);
        assert_eq!(AuthError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AuthError::MessagingFailure.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AuthError::Validation("bad email".to_string()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(AuthError::InvalidCredentials.kind(), "INVALID_CREDENTIALS");
        assert_eq!(AuthError::TwoFactorRequired.kind(), "TWO_FACTOR_REQUIRED");
        assert_eq!(
            AuthError::UseFederatedLogin {
                providers: "Google".to_string()
            }
            .kind(),
            "USE_FEDERATED_LOGIN"
        );
    }

    #[test]
    fn federated_message_names_the_providers() {
        let err = AuthError::UseFederatedLogin {
            providers: "Google or GitHub".to_string(),
        };
        assert!(err.to_string().contains("Google or GitHub"));
    }

    #[test]
    fn token_errors_map_onto_taxonomy() {
        assert!(matches!(
            AuthError::from(crate::tokens::Error::Expired),
            AuthError::TokenExpired
        ));
        assert!(matches!(
            AuthError::from(crate::tokens::Error::Invalid),
            AuthError::TokenInvalid
        ));
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let response = AuthError::Internal(anyhow!("db connection refused")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
