use crate::tokens::claims::{
    AccessClaims, ActivationClaims, StateClaims, PURPOSE_ACTIVATION, PURPOSE_OAUTH_STATE,
};
use crate::tokens::error::Error;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use ulid::Ulid;
use uuid::Uuid;

/// Signs and verifies the service's HS256 tokens. One signer instance is
/// shared across handlers; the signing secret never leaves it.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
}

impl TokenSigner {
    #[must_use]
    pub fn new(secret: &SecretString, issuer: impl Into<String>) -> Self {
        let secret = secret.expose_secret().as_bytes();

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation
    }

    /// Mint an access token carrying the role/permission snapshot for one
    /// session.
    ///
    /// # Errors
    ///
    /// Returns an error if claim serialization or signing fails.
    pub fn access_token(
        &self,
        user_id: Uuid,
        email: &str,
        session_id: Uuid,
        roles: Vec<String>,
        permissions: Vec<String>,
        ttl_seconds: i64,
    ) -> Result<String, Error> {
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            sub: user_id,
            email: email.to_string(),
            sid: session_id,
            roles,
            permissions,
            iss: self.issuer.clone(),
            iat: now,
            exp: now + ttl_seconds,
            jti: Ulid::new().to_string(),
        };

        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    /// Decode and validate an access token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Expired`] past `exp`, [`Error::Invalid`] for any
    /// other failure (bad signature, wrong issuer, malformed token).
    pub fn decode_access(&self, token: &str) -> Result<AccessClaims, Error> {
        let data = decode::<AccessClaims>(token, &self.decoding, &self.validation())?;
        Ok(data.claims)
    }

    /// Mint an email-activation token.
    ///
    /// # Errors
    ///
    /// Returns an error if claim serialization or signing fails.
    pub fn activation_token(
        &self,
        user_id: Uuid,
        email: &str,
        ttl_seconds: i64,
    ) -> Result<String, Error> {
        let now = Utc::now().timestamp();
        let claims = ActivationClaims {
            sub: user_id,
            email: email.to_string(),
            purpose: PURPOSE_ACTIVATION.to_string(),
            iss: self.issuer.clone(),
            iat: now,
            exp: now + ttl_seconds,
        };

        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    /// Decode an activation token, rejecting tokens minted for any other
    /// purpose.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Expired`] or [`Error::Invalid`] as for
    /// [`Self::decode_access`].
    pub fn decode_activation(&self, token: &str) -> Result<ActivationClaims, Error> {
        let data = decode::<ActivationClaims>(token, &self.decoding, &self.validation())?;
        if data.claims.purpose != PURPOSE_ACTIVATION {
            return Err(Error::Invalid);
        }
        Ok(data.claims)
    }

    /// Mint the `state` parameter for a federated authorization redirect.
    ///
    /// # Errors
    ///
    /// Returns an error if claim serialization or signing fails.
    pub fn state_token(&self, provider: &str, ttl_seconds: i64) -> Result<String, Error> {
        let now = Utc::now().timestamp();
        let claims = StateClaims {
            provider: provider.to_string(),
            purpose: PURPOSE_OAUTH_STATE.to_string(),
            iss: self.issuer.clone(),
            iat: now,
            exp: now + ttl_seconds,
            jti: Ulid::new().to_string(),
        };

        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    /// Decode the `state` parameter returned by a provider callback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Expired`] or [`Error::Invalid`] as for
    /// [`Self::decode_access`].
    pub fn decode_state(&self, token: &str) -> Result<StateClaims, Error> {
        let data = decode::<StateClaims>(token, &self.decoding, &self.validation())?;
        if data.claims.purpose != PURPOSE_OAUTH_STATE {
            return Err(Error::Invalid);
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(
            &SecretString::from("test-signing-secret-at-least-32-bytes"),
            "custodia",
        )
    }

    #[test]
    fn access_token_round_trip() {
        let signer = signer();
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        let token = signer
            .access_token(
                user_id,
                "alice@example.com",
                session_id,
                vec!["User".to_string()],
                vec!["Update Profile".to_string()],
                900,
            )
            .unwrap();

        let claims = signer.decode_access(&token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.sid, session_id);
        assert_eq!(claims.email, "alice@example.com");
        assert_eq!(claims.roles, vec!["User".to_string()]);
        assert_eq!(claims.permissions, vec!["Update Profile".to_string()]);
        assert_eq!(claims.exp - claims.iat, 900);
        assert!(!claims.jti.is_empty());
    }

    #[test]
    fn expired_access_token_is_rejected() {
        let signer = signer();
        // Past the decoder's 60s leeway.
        let token = signer
            .access_token(Uuid::new_v4(), "a@b.com", Uuid::new_v4(), vec![], vec![], -120)
            .unwrap();

        assert_eq!(signer.decode_access(&token), Err(Error::Expired));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let signer = signer();
        let token = signer
            .access_token(Uuid::new_v4(), "a@b.com", Uuid::new_v4(), vec![], vec![], 900)
            .unwrap();

        let mut tampered = token.clone();
        tampered.pop();
        tampered.push('x');
        assert_eq!(signer.decode_access(&tampered), Err(Error::Invalid));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let signer = signer();
        let other = TokenSigner::new(&SecretString::from("another-secret-entirely"), "custodia");

        let token = signer
            .activation_token(Uuid::new_v4(), "a@b.com", 3600)
            .unwrap();
        assert_eq!(other.decode_activation(&token), Err(Error::Invalid));
    }

    #[test]
    fn activation_token_round_trip() {
        let signer = signer();
        let user_id = Uuid::new_v4();

        let token = signer
            .activation_token(user_id, "alice@example.com", 86_400)
            .unwrap();
        let claims = signer.decode_activation(&token).unwrap();

        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.purpose, PURPOSE_ACTIVATION);
        assert_eq!(claims.exp - claims.iat, 86_400);
    }

    #[test]
    fn purpose_is_enforced_across_token_kinds() {
        let signer = signer();

        let access = signer
            .access_token(Uuid::new_v4(), "a@b.com", Uuid::new_v4(), vec![], vec![], 900)
            .unwrap();
        assert_eq!(signer.decode_activation(&access), Err(Error::Invalid));

        let state = signer.state_token("google", 600).unwrap();
        assert_eq!(signer.decode_activation(&state), Err(Error::Invalid));
    }

    #[test]
    fn state_token_round_trip() {
        let signer = signer();

        let token = signer.state_token("github", 600).unwrap();
        let claims = signer.decode_state(&token).unwrap();

        assert_eq!(claims.provider, "github");
        assert_eq!(claims.purpose, PURPOSE_OAUTH_STATE);
    }

    #[test]
    fn issuer_mismatch_is_rejected() {
        let secret = SecretString::from("shared-secret-between-both-signers");
        let ours = TokenSigner::new(&secret, "custodia");
        let theirs = TokenSigner::new(&secret, "someone-else");

        let token = theirs.state_token("google", 600).unwrap();
        assert_eq!(ours.decode_state(&token), Err(Error::Invalid));
    }
}
