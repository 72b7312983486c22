//! Federated login with Google and GitHub.
//!
//! The authorize leg redirects to the provider with a signed, short-lived
//! `state` token; the callback leg exchanges the code, fetches the profile,
//! links or creates the account, and hands the browser back to the frontend
//! with the access token in the URL fragment. The provider already
//! authenticated the user, so the password, anomaly, and two-factor gates
//! are skipped; the account lock still holds.

use axum::{
    extract::{Extension, Path, Query},
    http::{header::SET_COOKIE, HeaderMap},
    response::{IntoResponse, Redirect},
};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

use super::error::AuthError;
use super::session::{establish_session, refresh_cookie};
use super::state::AuthState;
use super::storage;
use super::utils::{device_descriptor, network_origin};
use super::DEFAULT_ROLE;

pub(crate) const PROVIDER_GOOGLE: &str = "google";
pub(crate) const PROVIDER_GITHUB: &str = "github";

const EXCHANGE_TIMEOUT_SECONDS: u64 = 10;

const GOOGLE_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_USER_URL: &str = "https://api.github.com/user";
const GITHUB_EMAILS_URL: &str = "https://api.github.com/user/emails";

/// Human-readable provider name for error messages.
pub(super) fn provider_display(provider: &str) -> String {
    match provider {
        PROVIDER_GOOGLE => "Google".to_string(),
        PROVIDER_GITHUB => "GitHub".to_string(),
        other => other.to_string(),
    }
}

/// One configured OAuth application.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    client_id: String,
    client_secret: SecretString,
    redirect_url: String,
}

impl ProviderConfig {
    #[must_use]
    pub fn new(client_id: String, client_secret: SecretString, redirect_url: String) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_url,
        }
    }
}

/// The providers this deployment accepts. Unconfigured providers answer
/// with `NotFound` on both legs.
#[derive(Clone, Debug, Default)]
pub struct ProviderRegistry {
    google: Option<ProviderConfig>,
    github: Option<ProviderConfig>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn with_google(mut self, config: ProviderConfig) -> Self {
        self.google = Some(config);
        self
    }

    #[must_use]
    pub fn with_github(mut self, config: ProviderConfig) -> Self {
        self.github = Some(config);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.google.is_none() && self.github.is_none()
    }

    fn get(&self, provider: &str) -> Option<&ProviderConfig> {
        match provider {
            PROVIDER_GOOGLE => self.google.as_ref(),
            PROVIDER_GITHUB => self.github.as_ref(),
            _ => None,
        }
    }
}

/// Profile as reported by the provider after the code exchange.
struct FederatedProfile {
    external_id: String,
    email: String,
    display_name: String,
    avatar_url: Option<String>,
}

#[derive(Deserialize)]
pub struct CallbackParams {
    code: String,
    state: String,
}

/// Redirect to the provider's authorization page.
#[utoipa::path(
    get,
    path = "/auth/{provider}",
    params(
        ("provider" = String, Path, description = "Federated provider: google or github")
    ),
    responses(
        (status = 302, description = "Redirect to the provider"),
        (status = 404, description = "Unknown or unconfigured provider", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn authorize(
    Path(provider): Path<String>,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<Redirect, AuthError> {
    let config = auth_state
        .providers()
        .get(&provider)
        .ok_or(AuthError::NotFound)?;

    let state = auth_state
        .signer()
        .state_token(&provider, auth_state.config().state_token_ttl_seconds())?;

    let url = authorize_url(&provider, config, &state)
        .map_err(|err| AuthError::Internal(err.into()))?;
    Ok(Redirect::temporary(url.as_str()))
}

fn authorize_url(
    provider: &str,
    config: &ProviderConfig,
    state: &str,
) -> Result<Url, url::ParseError> {
    let (base, scope) = match provider {
        PROVIDER_GOOGLE => (GOOGLE_AUTHORIZE_URL, "openid email profile"),
        _ => (GITHUB_AUTHORIZE_URL, "read:user user:email"),
    };

    let mut url = Url::parse(base)?;
    url.query_pairs_mut()
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", &config.redirect_url)
        .append_pair("response_type", "code")
        .append_pair("scope", scope)
        .append_pair("state", state);
    Ok(url)
}

/// Provider callback: exchange the code, link or create the account, and
/// bounce back to the frontend with a fresh session.
#[utoipa::path(
    get,
    path = "/auth/{provider}/callback",
    params(
        ("provider" = String, Path, description = "Federated provider: google or github"),
        ("code" = String, Query, description = "Authorization code"),
        ("state" = String, Query, description = "Signed state parameter")
    ),
    responses(
        (status = 302, description = "Redirect to the frontend with the session"),
        (status = 401, description = "Invalid or expired state", body = super::error::ErrorResponse),
        (status = 404, description = "Unknown or unconfigured provider", body = super::error::ErrorResponse),
        (status = 423, description = "Account locked", body = super::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn callback(
    Path(provider): Path<String>,
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Query(params): Query<CallbackParams>,
) -> Result<impl IntoResponse, AuthError> {
    let config = auth_state
        .providers()
        .get(&provider)
        .ok_or(AuthError::NotFound)?;

    // The state token pins the provider; a Google state cannot finish a
    // GitHub login.
    let claims = auth_state.signer().decode_state(&params.state)?;
    if claims.provider != provider {
        return Err(AuthError::TokenInvalid);
    }

    let client = http_client();
    let profile = match provider.as_str() {
        PROVIDER_GOOGLE => google_profile(&client, config, &params.code).await?,
        _ => github_profile(&client, config, &params.code).await?,
    };

    let linked = storage::link_or_create_federated(
        &pool,
        storage::FederatedLink {
            provider: &provider,
            external_id: &profile.external_id,
            email: &profile.email.trim().to_lowercase(),
            display_name: &profile.display_name,
            avatar_url: profile.avatar_url.as_deref(),
            default_role: DEFAULT_ROLE,
        },
    )
    .await?;

    let user = storage::fetch_user_by_id(&pool, linked.user_id)
        .await?
        .ok_or(AuthError::NotFound)?;

    match storage::lock_disposition(user.locked, user.locked_until, Utc::now()) {
        storage::LockDisposition::Unlocked => {}
        storage::LockDisposition::Lapsed => storage::clear_lock(&pool, user.id).await?,
        storage::LockDisposition::Held => return Err(AuthError::AccountLocked),
    }

    let origin = network_origin(&headers);
    let device = device_descriptor(&headers);
    let location = auth_state.geo().resolve(&origin).await;
    if let Err(err) =
        storage::record_login_attempt(&pool, user.id, &origin, &device, &location, true, &[]).await
    {
        tracing::error!("Failed to record federated login attempt: {err}");
    }

    let issued = establish_session(&pool, &auth_state, &user, &origin, &device).await?;
    let cookie = refresh_cookie(auth_state.config(), &issued.refresh_token)
        .map_err(|err| AuthError::Internal(err.into()))?;

    info!(user_id = %user.id, provider, created = linked.created, "federated login");

    // The access token travels in the fragment so it never reaches the
    // frontend's server logs.
    let destination = format!(
        "{}/oauth/callback#access_token={}&expires_in={}",
        auth_state.config().frontend_base_url(),
        issued.access_token,
        issued.expires_in
    );

    let mut response_headers = HeaderMap::new();
    response_headers.insert(SET_COOKIE, cookie);
    Ok((response_headers, Redirect::temporary(&destination)))
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(crate::APP_USER_AGENT)
        .timeout(Duration::from_secs(EXCHANGE_TIMEOUT_SECONDS))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[derive(Deserialize)]
struct TokenExchange {
    access_token: String,
}

#[derive(Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

async fn google_profile(
    client: &reqwest::Client,
    config: &ProviderConfig,
    code: &str,
) -> Result<FederatedProfile, AuthError> {
    let exchange: TokenExchange = client
        .post(GOOGLE_TOKEN_URL)
        .form(&[
            ("code", code),
            ("client_id", &config.client_id),
            ("client_secret", config.client_secret.expose_secret()),
            ("redirect_uri", &config.redirect_url),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .await
        .map_err(exchange_error)?
        .error_for_status()
        .map_err(exchange_error)?
        .json()
        .await
        .map_err(exchange_error)?;

    let info: GoogleUserInfo = client
        .get(GOOGLE_USERINFO_URL)
        .bearer_auth(&exchange.access_token)
        .send()
        .await
        .map_err(exchange_error)?
        .error_for_status()
        .map_err(exchange_error)?
        .json()
        .await
        .map_err(exchange_error)?;

    let display_name = info
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| info.email.clone());

    Ok(FederatedProfile {
        external_id: info.sub,
        email: info.email,
        display_name,
        avatar_url: info.picture,
    })
}

#[derive(Deserialize)]
struct GithubUser {
    id: i64,
    login: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct GithubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

async fn github_profile(
    client: &reqwest::Client,
    config: &ProviderConfig,
    code: &str,
) -> Result<FederatedProfile, AuthError> {
    let exchange: TokenExchange = client
        .post(GITHUB_TOKEN_URL)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&[
            ("code", code),
            ("client_id", &config.client_id),
            ("client_secret", config.client_secret.expose_secret()),
            ("redirect_uri", &config.redirect_url),
        ])
        .send()
        .await
        .map_err(exchange_error)?
        .error_for_status()
        .map_err(exchange_error)?
        .json()
        .await
        .map_err(exchange_error)?;

    let user: GithubUser = client
        .get(GITHUB_USER_URL)
        .bearer_auth(&exchange.access_token)
        .send()
        .await
        .map_err(exchange_error)?
        .error_for_status()
        .map_err(exchange_error)?
        .json()
        .await
        .map_err(exchange_error)?;

    // The profile email is often hidden; the emails endpoint carries the
    // primary verified address.
    let email = match user.email.filter(|email| !email.trim().is_empty()) {
        Some(email) => email,
        None => {
            let emails: Vec<GithubEmail> = client
                .get(GITHUB_EMAILS_URL)
                .bearer_auth(&exchange.access_token)
                .send()
                .await
                .map_err(exchange_error)?
                .error_for_status()
                .map_err(exchange_error)?
                .json()
                .await
                .map_err(exchange_error)?;
            emails
                .into_iter()
                .find(|entry| entry.primary && entry.verified)
                .map(|entry| entry.email)
                .ok_or(AuthError::Validation(
                    "the GitHub account has no verified primary email".to_string(),
                ))?
        }
    };

    let display_name = user
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(user.login);

    Ok(FederatedProfile {
        external_id: user.id.to_string(),
        email,
        display_name,
        avatar_url: user.avatar_url,
    })
}

fn exchange_error(err: reqwest::Error) -> AuthError {
    AuthError::Internal(anyhow::Error::new(err).context("provider exchange failed"))
}
