use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `purpose` claim value for account-activation tokens.
pub const PURPOSE_ACTIVATION: &str = "account-activation";

/// `purpose` claim value for federated-login state tokens.
pub const PURPOSE_OAUTH_STATE: &str = "oauth-state";

/// Claims carried by an access token. Roles and permissions are a snapshot
/// taken at issuance, not re-read on every request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub email: String,
    /// Session the token was minted for.
    pub sid: Uuid,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Claims carried by an email-activation token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivationClaims {
    pub sub: Uuid,
    pub email: String,
    pub purpose: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims carried by the `state` parameter of a federated login. The `jti`
/// makes each round trip single-purpose even though the token is stateless.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateClaims {
    pub provider: String,
    pub purpose: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}
