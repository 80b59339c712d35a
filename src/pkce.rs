//! PKCE and state token generation for the authorization flow
//!
//! Implements the S256 code challenge method from RFC 7636. Verifiers and
//! state tokens are 32 bytes of OS randomness encoded base64url without
//! padding, which keeps them inside the RFC 7636 character set.

use rand::Rng;
use sha2::{Digest, Sha256};

/// PKCE challenge method sent to the provider. Plain is never used.
pub const CHALLENGE_METHOD: &str = "S256";

/// A generated PKCE verifier/challenge pair.
///
/// The verifier stays server-side until the callback exchange; only the
/// challenge travels in the authorization URL.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

/// Generate a fresh PKCE pair.
pub fn generate_pkce_pair() -> PkcePair {
    let verifier = random_token();
    let challenge = challenge_for(&verifier);
    PkcePair {
        verifier,
        challenge,
    }
}

/// Compute the S256 challenge for a verifier.
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64_url::encode(&digest)
}

/// Generate a cryptographically secure random state token
pub fn generate_state_token() -> String {
    random_token()
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    base64_url::encode(&bytes)
}
