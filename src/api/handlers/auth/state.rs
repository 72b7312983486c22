//! Auth state and configuration.

use secrecy::SecretString;

use crate::security::geoip::GeoResolver;
use crate::tokens::TokenSigner;

use super::federated::ProviderRegistry;

const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_ACTIVATION_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_RESET_CODE_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_SECURITY_CODE_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_PENDING_TOTP_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_STATE_TOKEN_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_FAILED_LOGIN_LIMIT: i32 = 5;
const DEFAULT_LOCKOUT_SECONDS: i64 = 30 * 60;
const DEFAULT_TOTP_ISSUER: &str = "Custodia";
const DEFAULT_GEOIP_BASE_URL: &str = "http://ip-api.com";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    access_token_ttl_seconds: i64,
    refresh_token_ttl_seconds: i64,
    activation_token_ttl_seconds: i64,
    reset_code_ttl_seconds: i64,
    security_code_ttl_seconds: i64,
    pending_totp_ttl_seconds: i64,
    state_token_ttl_seconds: i64,
    failed_login_limit: i32,
    lockout_seconds: i64,
    totp_issuer: String,
    geoip_base_url: String,
}

impl AuthConfig {
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        // Links and redirects append paths, so drop any trailing slash.
        let frontend_base_url = frontend_base_url.trim_end_matches('/').to_string();

        Self {
            frontend_base_url,
            access_token_ttl_seconds: DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
            refresh_token_ttl_seconds: DEFAULT_REFRESH_TOKEN_TTL_SECONDS,
            activation_token_ttl_seconds: DEFAULT_ACTIVATION_TOKEN_TTL_SECONDS,
            reset_code_ttl_seconds: DEFAULT_RESET_CODE_TTL_SECONDS,
            security_code_ttl_seconds: DEFAULT_SECURITY_CODE_TTL_SECONDS,
            pending_totp_ttl_seconds: DEFAULT_PENDING_TOTP_TTL_SECONDS,
            state_token_ttl_seconds: DEFAULT_STATE_TOKEN_TTL_SECONDS,
            failed_login_limit: DEFAULT_FAILED_LOGIN_LIMIT,
            lockout_seconds: DEFAULT_LOCKOUT_SECONDS,
            totp_issuer: DEFAULT_TOTP_ISSUER.to_string(),
            geoip_base_url: DEFAULT_GEOIP_BASE_URL.to_string(),
        }
    }

    #[must_use]
    pub fn with_access_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_activation_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.activation_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_reset_code_ttl_seconds(mut self, seconds: i64) -> Self {
        self.reset_code_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_security_code_ttl_seconds(mut self, seconds: i64) -> Self {
        self.security_code_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_pending_totp_ttl_seconds(mut self, seconds: i64) -> Self {
        self.pending_totp_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_state_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.state_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_failed_login_limit(mut self, limit: i32) -> Self {
        self.failed_login_limit = limit;
        self
    }

    #[must_use]
    pub fn with_lockout_seconds(mut self, seconds: i64) -> Self {
        self.lockout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_totp_issuer(mut self, issuer: String) -> Self {
        self.totp_issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_geoip_base_url(mut self, base_url: String) -> Self {
        self.geoip_base_url = base_url;
        self
    }

    pub(crate) fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    pub(crate) fn geoip_base_url(&self) -> &str {
        &self.geoip_base_url
    }

    #[must_use]
    pub fn totp_issuer(&self) -> &str {
        &self.totp_issuer
    }

    pub(super) fn access_token_ttl_seconds(&self) -> i64 {
        self.access_token_ttl_seconds
    }

    pub(super) fn refresh_token_ttl_seconds(&self) -> i64 {
        self.refresh_token_ttl_seconds
    }

    pub(super) fn activation_token_ttl_seconds(&self) -> i64 {
        self.activation_token_ttl_seconds
    }

    pub(super) fn reset_code_ttl_seconds(&self) -> i64 {
        self.reset_code_ttl_seconds
    }

    pub(super) fn security_code_ttl_seconds(&self) -> i64 {
        self.security_code_ttl_seconds
    }

    pub(super) fn pending_totp_ttl_seconds(&self) -> i64 {
        self.pending_totp_ttl_seconds
    }

    pub(super) fn state_token_ttl_seconds(&self) -> i64 {
        self.state_token_ttl_seconds
    }

    pub(super) fn failed_login_limit(&self) -> i32 {
        self.failed_login_limit
    }

    pub(super) fn lockout_seconds(&self) -> i64 {
        self.lockout_seconds
    }

    pub(super) fn refresh_cookie_secure(&self) -> bool {
        self.frontend_base_url.starts_with("https://")
    }
}

pub struct AuthState {
    config: AuthConfig,
    signer: TokenSigner,
    geo: GeoResolver,
    providers: ProviderRegistry,
    backup_code_pepper: SecretString,
}

impl AuthState {
    pub fn new(
        config: AuthConfig,
        signer: TokenSigner,
        geo: GeoResolver,
        providers: ProviderRegistry,
        backup_code_pepper: SecretString,
    ) -> Self {
        Self {
            config,
            signer,
            geo,
            providers,
            backup_code_pepper,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub(super) fn geo(&self) -> &GeoResolver {
        &self.geo
    }

    pub(super) fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub(super) fn backup_code_pepper(&self) -> &SecretString {
        &self.backup_code_pepper
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthConfig, AuthState};
    use crate::api::handlers::auth::federated::ProviderRegistry;
    use crate::security::geoip::GeoResolver;
    use crate::tokens::TokenSigner;
    use secrecy::SecretString;

    #[test]
    fn auth_config_defaults_and_overrides() {
        let config = AuthConfig::new("https://custodia.dev/".to_string());

        assert_eq!(config.frontend_base_url(), "https://custodia.dev");
        assert_eq!(
            config.access_token_ttl_seconds(),
            super::DEFAULT_ACCESS_TOKEN_TTL_SECONDS
        );
        assert_eq!(
            config.refresh_token_ttl_seconds(),
            super::DEFAULT_REFRESH_TOKEN_TTL_SECONDS
        );
        assert_eq!(config.failed_login_limit(), 5);
        assert_eq!(config.totp_issuer(), super::DEFAULT_TOTP_ISSUER);
        assert_eq!(config.geoip_base_url(), super::DEFAULT_GEOIP_BASE_URL);

        let config = config
            .with_access_token_ttl_seconds(60)
            .with_refresh_token_ttl_seconds(120)
            .with_failed_login_limit(3)
            .with_lockout_seconds(42)
            .with_totp_issuer("Custodia Test".to_string())
            .with_geoip_base_url(String::new());

        assert_eq!(config.access_token_ttl_seconds(), 60);
        assert_eq!(config.refresh_token_ttl_seconds(), 120);
        assert_eq!(config.failed_login_limit(), 3);
        assert_eq!(config.lockout_seconds(), 42);
        assert_eq!(config.totp_issuer(), "Custodia Test");
        assert_eq!(config.geoip_base_url(), "");
    }

    #[test]
    fn refresh_cookie_secure_follows_frontend_scheme() {
        let https = AuthConfig::new("https://custodia.dev".to_string());
        assert!(https.refresh_cookie_secure());

        let http = AuthConfig::new("http://localhost:3000".to_string());
        assert!(!http.refresh_cookie_secure());
    }

    #[test]
    fn auth_state_exposes_parts() {
        let config = AuthConfig::new("https://custodia.dev".to_string());
        let signer = TokenSigner::new(&SecretString::from("top-secret"), "custodia");
        let geo = GeoResolver::new("");
        let state = AuthState::new(
            config,
            signer,
            geo,
            ProviderRegistry::default(),
            SecretString::from("pepper"),
        );

        assert_eq!(state.config().frontend_base_url(), "https://custodia.dev");
        assert!(state.providers().is_empty());
    }
}
