//! Small helpers shared by the auth handlers: input validation, opaque
//! token generation, and code hashing.

use anyhow::{Context, Result};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Normalize an email for lookup/uniqueness checks.
pub(super) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(super) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Password policy: at least 8 characters with one uppercase letter and
/// one digit.
pub(super) fn validate_password(password: &str) -> Result<(), String> {
    if password.len() < 8 {
        return Err("password must be at least 8 characters".to_string());
    }
    if password.len() > 255 {
        return Err("password must be at most 255 characters".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) || !password.chars().any(char::is_numeric)
    {
        return Err("password must contain at least one uppercase letter and one digit".to_string());
    }
    Ok(())
}

/// Hash a password with Argon2id and a fresh random salt.
pub(super) fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| anyhow::anyhow!("failed to hash password"))?
        .to_string();
    Ok(hash)
}

/// Verify a password against a stored Argon2id hash. Malformed stored
/// hashes simply never match.
pub(super) fn verify_password(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

/// Create a new opaque refresh token.
/// The raw value is only returned to the client; the database stores a hash.
pub(crate) fn generate_refresh_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate refresh token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a refresh token so raw values never touch the database.
/// The hash is the lookup key when the token is presented again.
pub(crate) fn hash_refresh_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Six-digit one-time code for password reset and step-up verification.
/// No leading zeros, matching what users expect to type from an email.
pub(super) fn generate_numeric_code() -> Result<String> {
    let mut bytes = [0u8; 4];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate one-time code")?;
    let n = 100_000 + u32::from_be_bytes(bytes) % 900_000;
    Ok(n.to_string())
}

/// Hash a one-time code for storage; only the hash is compared later.
pub(super) fn hash_numeric_code(code: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(code.trim().as_bytes());
    hasher.finalize().to_vec()
}

/// Constant-time comparison for stored code hashes.
pub(super) fn hashes_match(left: &[u8], right: &[u8]) -> bool {
    left.ct_eq(right).into()
}

/// Activation link included in outbound emails.
pub(super) fn build_activation_url(frontend_base_url: &str, token: &str) -> String {
    let base = frontend_base_url.trim_end_matches('/');
    format!("{base}/verify-email?token={token}")
}

pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Network origin of the request, from common proxy headers.
pub(super) fn network_origin(headers: &axum::http::HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    if let Some(ip) = forwarded {
        return ip;
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map_or_else(|| "Unknown IP".to_string(), str::to_string)
}

/// Device descriptor of the request; the User-Agent header verbatim.
pub(super) fn device_descriptor(headers: &axum::http::HeaderMap) -> String {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map_or_else(|| "Unknown Device".to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn valid_email_accepts_basic_format() {
        assert!(valid_email("a@example.com"));
        assert!(valid_email("name.surname@example.co"));
    }

    #[test]
    fn valid_email_rejects_missing_parts() {
        assert!(!valid_email("not-an-email"));
        assert!(!valid_email("missing-at.example.com"));
        assert!(!valid_email("missing-domain@"));
    }

    #[test]
    fn password_policy_requires_length_case_and_digit() {
        assert!(validate_password("Str0ng!Pass").is_ok());
        assert!(validate_password("Short1A").is_err());
        assert!(validate_password("alllowercase1").is_err());
        assert!(validate_password("NoDigitsHere").is_err());
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("Str0ng!Pass").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("Str0ng!Pass", &hash));
        assert!(!verify_password("Wr0ng!Pass", &hash));
    }

    #[test]
    fn verify_password_rejects_malformed_hash() {
        assert!(!verify_password("Str0ng!Pass", "not-a-phc-string"));
        assert!(!verify_password("Str0ng!Pass", ""));
    }

    #[test]
    fn generate_refresh_token_round_trip() {
        let decoded_len = generate_refresh_token()
            .ok()
            .and_then(|token| URL_SAFE_NO_PAD.decode(token.as_bytes()).ok())
            .map(|bytes| bytes.len());
        assert_eq!(decoded_len, Some(32));
    }

    #[test]
    fn hash_refresh_token_stable() {
        let first = hash_refresh_token("token");
        let second = hash_refresh_token("token");
        let different = hash_refresh_token("other");
        assert_eq!(first, second);
        assert_ne!(first, different);
    }

    #[test]
    fn numeric_code_is_six_digits() {
        for _ in 0..64 {
            let code = generate_numeric_code().unwrap();
            assert_eq!(code.len(), 6);
            let n: u32 = code.parse().unwrap();
            assert!((100_000..1_000_000).contains(&n));
        }
    }

    #[test]
    fn hash_numeric_code_ignores_surrounding_whitespace() {
        assert_eq!(hash_numeric_code(" 123456 "), hash_numeric_code("123456"));
    }

    #[test]
    fn hashes_match_is_exact() {
        let a = hash_numeric_code("123456");
        let b = hash_numeric_code("123456");
        let c = hash_numeric_code("654321");
        assert!(hashes_match(&a, &b));
        assert!(!hashes_match(&a, &c));
    }

    #[test]
    fn build_activation_url_trims_trailing_slash() {
        let url = build_activation_url("https://app.custodia.dev/", "token");
        assert_eq!(url, "https://app.custodia.dev/verify-email?token=token");
    }

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &'static str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn is_unique_violation_matches_sqlstate() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(is_unique_violation(&err));

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("99999"),
        }));
        assert!(!is_unique_violation(&err));

        let err = sqlx::Error::RowNotFound;
        assert!(!is_unique_violation(&err));
    }

    #[test]
    fn network_origin_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(network_origin(&headers), "1.2.3.4");
    }

    #[test]
    fn network_origin_falls_back_to_real_ip_then_unknown() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(network_origin(&headers), "9.9.9.9");

        let headers = HeaderMap::new();
        assert_eq!(network_origin(&headers), "Unknown IP");
    }

    #[test]
    fn device_descriptor_reads_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0"),
        );
        assert_eq!(device_descriptor(&headers), "Mozilla/5.0");

        let headers = HeaderMap::new();
        assert_eq!(device_descriptor(&headers), "Unknown Device");
    }
}
