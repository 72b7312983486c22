//! Signed-token support: HS256 access tokens carrying a role/permission
//! snapshot, activation tokens for email verification, and state tokens
//! for the federated login round trip.
//!
//! Refresh tokens are not signed; they are opaque random values persisted
//! by hash only (see `api::handlers::auth::utils`).

pub mod claims;
pub mod error;
pub mod signer;

pub use claims::{AccessClaims, ActivationClaims, StateClaims};
pub use error::Error;
pub use signer::TokenSigner;
