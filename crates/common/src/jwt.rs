//! Access/refresh token minting and validation, with key-id based rotation
//! so a freshly-rotated signing key does not invalidate tokens issued
//! moments earlier.

use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Claims carried by a TMI access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the principal's user_id.
    pub sub: Uuid,
    pub email: String,
    pub provider: String,
    #[serde(default)]
    pub admin: bool,
    pub iss: String,
    pub aud: String,
    pub exp: u64,
    pub iat: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token missing")]
    Missing,
    #[error("token malformed")]
    Malformed,
    #[error("token expired")]
    Expired,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("audience invalid")]
    AudienceInvalid,
}

/// A set of symmetric signing keys, each addressed by a `kid`. The most
/// recently added key is used for signing; all keys remain valid for
/// verification until explicitly dropped, so a rotation does not reject
/// tokens issued just before it.
///
/// A production deployment would prefer an asymmetric algorithm (RS256/ES256)
/// so verification does not require distributing the signing secret; the
/// rotation mechanics here (kid-addressed key lookup, signing-key swap) are
/// algorithm-agnostic and would carry over unchanged.
#[derive(Clone)]
pub struct SigningKeySet {
    active_kid: String,
    keys: HashMap<String, String>,
    issuer: String,
    audience: String,
}

impl SigningKeySet {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>, initial_secret: impl Into<String>) -> Self {
        let kid = Uuid::new_v4().to_string();
        let mut keys = HashMap::new();
        keys.insert(kid.clone(), initial_secret.into());
        Self {
            active_kid: kid,
            keys,
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// Rotate to a new signing key; previous keys remain valid for
    /// verification.
    pub fn rotate(&mut self, new_secret: impl Into<String>) -> String {
        let kid = Uuid::new_v4().to_string();
        self.keys.insert(kid.clone(), new_secret.into());
        self.active_kid = kid.clone();
        kid
    }

    /// Drop a retired key so tokens signed with it are no longer accepted.
    pub fn retire(&mut self, kid: &str) {
        if kid != self.active_kid {
            self.keys.remove(kid);
        }
    }

    pub fn mint(&self, user_id: Uuid, email: &str, provider: &str, admin: bool, ttl_secs: u64) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock error")?
            .as_secs();
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            provider: provider.to_string(),
            admin,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp: now + ttl_secs,
        };
        let secret = self
            .keys
            .get(&self.active_kid)
            .expect("active_kid always present in keys");
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.active_kid.clone());
        jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(secret.as_bytes()))
            .context("failed to encode JWT")
    }

    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        if token.is_empty() {
            return Err(TokenError::Missing);
        }
        let header = jsonwebtoken::decode_header(token).map_err(|_| TokenError::Malformed)?;
        let kid = header.kid.ok_or(TokenError::Malformed)?;
        let secret = self.keys.get(&kid).ok_or(TokenError::SignatureInvalid)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let data = jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
            jsonwebtoken::errors::ErrorKind::InvalidAudience => TokenError::AudienceInvalid,
            jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::SignatureInvalid,
            _ => TokenError::Malformed,
        })?;

        Ok(data.claims)
    }

    pub fn active_kid(&self) -> &str {
        &self.active_kid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SigningKeySet {
        SigningKeySet::new("tmi", "tmi-clients", "test-secret-0")
    }

    #[test]
    fn mint_and_validate_roundtrip() {
        let ks = keys();
        let user_id = Uuid::new_v4();
        let token = ks.mint(user_id, "alice@example.com", "test", false, 900).unwrap();
        let claims = ks.validate(&token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "alice@example.com");
        assert!(!claims.admin);
    }

    #[test]
    fn rotation_keeps_old_tokens_valid() {
        let mut ks = keys();
        let user_id = Uuid::new_v4();
        let old_token = ks.mint(user_id, "a@x.com", "test", false, 900).unwrap();
        ks.rotate("test-secret-1");
        assert!(ks.validate(&old_token).is_ok());
        let new_token = ks.mint(user_id, "a@x.com", "test", false, 900).unwrap();
        assert!(ks.validate(&new_token).is_ok());
    }

    #[test]
    fn retiring_a_key_invalidates_its_tokens() {
        let mut ks = keys();
        let old_kid = ks.active_kid().to_string();
        let user_id = Uuid::new_v4();
        let old_token = ks.mint(user_id, "a@x.com", "test", false, 900).unwrap();
        ks.rotate("test-secret-1");
        ks.retire(&old_kid);
        assert!(matches!(
            ks.validate(&old_token),
            Err(TokenError::SignatureInvalid)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let ks = keys();
        let user_id = Uuid::new_v4();
        let token = ks.mint(user_id, "a@x.com", "test", false, 0).unwrap();
        std::thread::sleep(std::time::Duration::from_secs(1));
        assert!(matches!(ks.validate(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn malformed_token_is_rejected() {
        let ks = keys();
        assert!(matches!(
            ks.validate("not-a-jwt"),
            Err(TokenError::Malformed)
        ));
    }

    #[test]
    fn missing_token_is_rejected() {
        let ks = keys();
        assert!(matches!(ks.validate(""), Err(TokenError::Missing)));
    }

    #[test]
    fn unknown_kid_is_signature_invalid() {
        let ks = keys();
        let other = SigningKeySet::new("tmi", "tmi-clients", "different-secret");
        let token = other.mint(Uuid::new_v4(), "a@x.com", "test", false, 900).unwrap();
        assert!(matches!(
            ks.validate(&token),
            Err(TokenError::SignatureInvalid)
        ));
    }
}
