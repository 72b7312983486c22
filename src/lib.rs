//! # Custodia (Authentication & Session Security)
//!
//! `custodia` is an authentication and session security service. It handles
//! account registration with email activation, password logins with anomaly
//! detection and step-up verification, TOTP two-factor enrollment with backup
//! codes, rotating refresh tokens, and federated login via Google and GitHub.
//!
//! ## Sessions & Tokens
//!
//! Access tokens are short-lived HS256 JWTs carrying a snapshot of the user's
//! roles and permissions. Refresh tokens are opaque random values stored by
//! hash only; every exchange rotates the token, and reuse of a rotated token
//! fails closed. Each user holds a bounded set of sessions; creating one past
//! the cap evicts the least recently used.
//!
//! ## Anomaly Detection
//!
//! Password logins are compared against the account's most recent successful
//! attempt (origin, device, location, time of day, frequency). Deviations
//! escalate to an emailed step-up code; enough of them temporarily lock the
//! account and raise a security alert.
//!
//! ## Anti-Probing
//!
//! Resend-activation and forgot-password respond identically whether or not
//! the account exists, so neither can be used to enumerate registered email
//! addresses.

pub mod api;
pub mod cli;
pub mod security;
pub mod tokens;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        // Should be a hex string (full SHA-1 is 40 chars, but could be short)
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
