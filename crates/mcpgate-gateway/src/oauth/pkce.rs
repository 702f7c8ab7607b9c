//! PKCE (RFC 7636), S256 only.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Challenge method sent in every authorization request.
pub const CHALLENGE_METHOD: &str = "S256";

/// A verifier/challenge pair for one authorization attempt.
#[derive(Debug, Clone)]
pub struct PkcePair {
    /// Kept secret until the token exchange.
    pub verifier: String,
    /// Sent in the authorization request.
    pub challenge: String,
}

impl PkcePair {
    /// Generate a fresh pair: 32 random bytes, base64url verifier,
    /// base64url(SHA-256(verifier)) challenge.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let random_bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        let verifier = URL_SAFE_NO_PAD.encode(&random_bytes);
        let challenge = Self::challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// Compute the S256 challenge for a verifier.
    pub fn challenge_for(verifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

/// Random `state` parameter for CSRF protection.
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}
