//! PKCE (RFC 7636) verifier/challenge generation and verification, and
//! `state` generation for the OAuth authorization-code flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// A PKCE verifier/challenge pair (S256 method only — plain is not offered).
#[derive(Debug, Clone)]
pub struct PkceCodes {
    pub verifier: String,
    pub challenge: String,
}

impl PkceCodes {
    /// Generate a fresh verifier (43-128 chars per RFC 7636; we emit 43 from
    /// 32 random bytes) and its S256 challenge.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = challenge_for(&verifier);
        Self { verifier, challenge }
    }

    /// Verify that `verifier` hashes to the `challenge` this struct was
    /// generated with. Used by the token endpoint to check a client's
    /// presented `code_verifier` against the `code_challenge` stored at
    /// `/oauth2/authorize` time.
    pub fn verify(&self, verifier: &str) -> bool {
        constant_time_eq(challenge_for(verifier).as_bytes(), self.challenge.as_bytes())
    }
}

/// Compute the S256 challenge for a given verifier.
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Generate a random `state` value for CSRF-binding an authorization
/// request to its callback.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_is_url_safe_and_correct_length() {
        let codes = PkceCodes::generate();
        assert!(codes.verifier.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(codes.verifier.len() >= 43);
    }

    #[test]
    fn challenge_matches_sha256_of_verifier() {
        let codes = PkceCodes::generate();
        assert_eq!(challenge_for(&codes.verifier), codes.challenge);
    }

    #[test]
    fn verify_accepts_correct_verifier() {
        let codes = PkceCodes::generate();
        assert!(codes.verify(&codes.verifier));
    }

    #[test]
    fn verify_rejects_wrong_verifier() {
        let codes = PkceCodes::generate();
        assert!(!codes.verify("not-the-right-verifier"));
    }

    #[test]
    fn codes_are_unique_per_generation() {
        let a = PkceCodes::generate();
        let b = PkceCodes::generate();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.challenge, b.challenge);
    }

    #[test]
    fn state_is_reasonably_long_and_unique() {
        let s1 = generate_state();
        let s2 = generate_state();
        assert!(s1.len() >= 40);
        assert_ne!(s1, s2);
    }
}
