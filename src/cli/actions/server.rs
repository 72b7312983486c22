use crate::{
    api,
    api::handlers::auth::{
        federated::{PROVIDER_GITHUB, PROVIDER_GOOGLE},
        AuthConfig, AuthState, ProviderConfig, ProviderRegistry,
    },
    security::geoip::GeoResolver,
    tokens::TokenSigner,
};
use anyhow::Result;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub frontend_base_url: String,
    pub api_base_url: String,
    pub token_secret: SecretString,
    pub token_issuer: String,
    pub backup_code_pepper: SecretString,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_seconds: i64,
    pub activation_token_ttl_seconds: i64,
    pub reset_code_ttl_seconds: i64,
    pub security_code_ttl_seconds: i64,
    pub pending_totp_ttl_seconds: i64,
    pub state_token_ttl_seconds: i64,
    pub failed_login_limit: i32,
    pub lockout_seconds: i64,
    pub totp_issuer: String,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<SecretString>,
    pub github_client_id: Option<String>,
    pub github_client_secret: Option<SecretString>,
    pub geoip_base_url: String,
    pub email_outbox_poll_seconds: u64,
    pub email_outbox_batch_size: usize,
    pub email_outbox_max_attempts: u32,
    pub email_outbox_backoff_base_seconds: u64,
    pub email_outbox_backoff_max_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub attempt_retention_days: i64,
    pub alert_retention_days: i64,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let config = AuthConfig::new(args.frontend_base_url)
        .with_access_token_ttl_seconds(args.access_token_ttl_seconds)
        .with_refresh_token_ttl_seconds(args.refresh_token_ttl_seconds)
        .with_activation_token_ttl_seconds(args.activation_token_ttl_seconds)
        .with_reset_code_ttl_seconds(args.reset_code_ttl_seconds)
        .with_security_code_ttl_seconds(args.security_code_ttl_seconds)
        .with_pending_totp_ttl_seconds(args.pending_totp_ttl_seconds)
        .with_state_token_ttl_seconds(args.state_token_ttl_seconds)
        .with_failed_login_limit(args.failed_login_limit)
        .with_lockout_seconds(args.lockout_seconds)
        .with_totp_issuer(args.totp_issuer)
        .with_geoip_base_url(args.geoip_base_url);

    let signer = TokenSigner::new(&args.token_secret, args.token_issuer);
    let geo = GeoResolver::new(config.geoip_base_url());

    let api_base_url = args.api_base_url.trim_end_matches('/');
    let mut providers = ProviderRegistry::default();
    if let (Some(client_id), Some(client_secret)) =
        (args.google_client_id, args.google_client_secret)
    {
        providers = providers.with_google(ProviderConfig::new(
            client_id,
            client_secret,
            format!("{api_base_url}/auth/{PROVIDER_GOOGLE}/callback"),
        ));
        info!("Google federated login enabled");
    }
    if let (Some(client_id), Some(client_secret)) =
        (args.github_client_id, args.github_client_secret)
    {
        providers = providers.with_github(ProviderConfig::new(
            client_id,
            client_secret,
            format!("{api_base_url}/auth/{PROVIDER_GITHUB}/callback"),
        ));
        info!("GitHub federated login enabled");
    }

    let auth_state = Arc::new(AuthState::new(
        config,
        signer,
        geo,
        providers,
        args.backup_code_pepper,
    ));

    let email_config = api::email::EmailWorkerConfig::new()
        .with_poll_interval_seconds(args.email_outbox_poll_seconds)
        .with_batch_size(args.email_outbox_batch_size)
        .with_max_attempts(args.email_outbox_max_attempts)
        .with_backoff_base_seconds(args.email_outbox_backoff_base_seconds)
        .with_backoff_max_seconds(args.email_outbox_backoff_max_seconds);

    let sweeper_config = api::sweeper::SweeperConfig::new()
        .with_interval_seconds(args.sweep_interval_seconds)
        .with_attempt_retention_days(args.attempt_retention_days)
        .with_alert_retention_days(args.alert_retention_days);

    api::new(args.port, args.dsn, auth_state, email_config, sweeper_config).await
}
