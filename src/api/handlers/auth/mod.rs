//! Authentication and session security handlers.
//!
//! Submodules split by flow: registration/activation, password login and
//! step-up, refresh rotation, session management, password reset, TOTP and
//! backup codes, and federated login. `storage` holds every SQL statement;
//! handlers never touch the pool directly for anything stateful.

pub mod error;
pub mod federated;
pub mod login;
pub mod password;
pub mod principal;
mod recovery;
pub mod refresh;
pub mod register;
pub mod session;
mod state;
mod storage;
pub mod two_factor;
pub mod types;
mod utils;

use sqlx::PgPool;

pub use federated::{ProviderConfig, ProviderRegistry};
pub use state::{AuthConfig, AuthState};

/// Role granted on verification or first federated sign-in.
pub const DEFAULT_ROLE: &str = "User";

pub const PERMISSION_UPDATE_PROFILE: &str = "Update Profile";
pub const PERMISSION_MANAGE_2FA: &str = "Manage Two-Factor";

/// Permissions attached to [`DEFAULT_ROLE`] at startup.
pub const DEFAULT_ROLE_PERMISSIONS: &[&str] =
    &[PERMISSION_UPDATE_PROFILE, PERMISSION_MANAGE_2FA];

/// Seed the default role and its permissions. Idempotent.
///
/// # Errors
///
/// Returns an error if the database is unreachable.
pub async fn seed_roles(pool: &PgPool) -> anyhow::Result<()> {
    storage::ensure_role(pool, DEFAULT_ROLE, DEFAULT_ROLE_PERMISSIONS).await
}
