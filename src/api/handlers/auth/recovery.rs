//! Backup code generation and verification.
//!
//! Backup codes substitute for a TOTP code when the authenticator is
//! unavailable. Each code is single-use and stored only as an Argon2id
//! hash with a server-side pepper.

use anyhow::{Context, Result};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::rngs::OsRng;
use rand::RngCore;

pub(super) const BACKUP_CODE_COUNT: usize = 8;
const BACKUP_CODE_LEN: usize = 12;
const BACKUP_CODE_GROUP_SIZE: usize = 4;
// No 0/1/I/O, so codes survive being read aloud or retyped.
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A freshly generated batch: cleartext codes handed to the user exactly
/// once, plus the hashes that get persisted.
#[derive(Debug)]
pub struct BackupCodeBatch {
    pub codes: Vec<String>,
    pub code_hashes: Vec<String>,
}

impl BackupCodeBatch {
    /// Generate a full batch of backup codes using the provided pepper.
    pub fn generate(pepper: &[u8]) -> Result<Self> {
        let mut rng = OsRng;
        Self::generate_with_rng(&mut rng, pepper)
    }

    fn generate_with_rng<R: RngCore + ?Sized>(rng: &mut R, pepper: &[u8]) -> Result<Self> {
        let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);
        let mut code_hashes = Vec::with_capacity(BACKUP_CODE_COUNT);
        for _ in 0..BACKUP_CODE_COUNT {
            let code = generate_code(rng)?;
            let hash = hash_backup_code(&code, pepper)?;
            codes.push(code);
            code_hashes.push(hash);
        }
        Ok(Self { codes, code_hashes })
    }
}

/// Normalize a backup code for verification: strip separators, uppercase.
pub fn normalize_backup_code(input: &str) -> Result<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    if normalized.len() != BACKUP_CODE_LEN {
        return Err(anyhow::anyhow!("invalid backup code length"));
    }

    if !normalized
        .as_bytes()
        .iter()
        .all(|ch| BACKUP_CODE_ALPHABET.contains(ch))
    {
        return Err(anyhow::anyhow!("invalid backup code characters"));
    }

    Ok(normalized)
}

/// Format a normalized backup code for display.
pub fn format_backup_code(normalized: &str) -> Result<String> {
    if normalized.len() != BACKUP_CODE_LEN {
        return Err(anyhow::anyhow!("invalid backup code length"));
    }
    let mut out = String::with_capacity(BACKUP_CODE_LEN + 2);
    for (idx, chunk) in normalized
        .as_bytes()
        .chunks(BACKUP_CODE_GROUP_SIZE)
        .enumerate()
    {
        if idx > 0 {
            out.push('-');
        }
        out.push_str(std::str::from_utf8(chunk).context("invalid backup code chunk")?);
    }
    Ok(out)
}

/// Verify a backup code against one stored hash.
pub fn verify_backup_code(code: &str, stored_hash: &str, pepper: &[u8]) -> Result<bool> {
    let Ok(normalized) = normalize_backup_code(code) else {
        return Ok(false);
    };
    let parsed =
        PasswordHash::new(stored_hash).map_err(|_| anyhow::anyhow!("invalid backup code hash"))?;
    let argon2 = argon2_with_pepper(pepper)?;
    Ok(argon2
        .verify_password(normalized.as_bytes(), &parsed)
        .is_ok())
}

fn argon2_with_pepper(pepper: &[u8]) -> Result<Argon2<'_>> {
    Argon2::new_with_secret(
        pepper,
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::default(),
    )
    .map_err(|_| anyhow::anyhow!("failed to initialize Argon2id"))
}

/// Generate a single backup code in grouped form.
fn generate_code<R: RngCore + ?Sized>(rng: &mut R) -> Result<String> {
    let mut raw = [0u8; BACKUP_CODE_LEN];
    rng.fill_bytes(&mut raw);
    let mut normalized = String::with_capacity(BACKUP_CODE_LEN);
    for byte in raw {
        let idx = usize::from(byte) % BACKUP_CODE_ALPHABET.len();
        if let Some(&char_byte) = BACKUP_CODE_ALPHABET.get(idx) {
            normalized.push(char_byte as char);
        }
    }
    format_backup_code(&normalized)
}

/// Hash a backup code using Argon2id with the server-side pepper.
fn hash_backup_code(code: &str, pepper: &[u8]) -> Result<String> {
    let normalized = normalize_backup_code(code)?;
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = argon2_with_pepper(pepper)?;
    let hash = argon2
        .hash_password(normalized.as_bytes(), &salt)
        .map_err(|_| anyhow::anyhow!("failed to hash backup code"))?
        .to_string();
    Ok(hash)
}
