//! Session token service
//!
//! NIST 800-53: IA-2 (Identification and Authentication), SC-13 (Cryptographic Protection),
//! AC-12 (Session Termination)
//! Implementation: HMAC-SHA256 signed, time-bounded tokens in the compact
//! `header.payload.signature` form, base64url without padding.

use crate::config::SessionConfig;
use crate::error::TokenError;
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HS256";
const SIGNATURE_LEN: usize = 32;
const DEFAULT_SESSION_MINUTES: i64 = 30;

/// Token header
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Claims carried by a session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identity
    pub sub: String,
    /// Granted roles
    pub roles: Vec<String>,
    /// Issued at, unix seconds
    pub iat: i64,
    /// Expires at, unix seconds
    pub exp: i64,
    /// Token id
    pub jti: String,
    /// Issuer
    pub iss: String,
}

/// A freshly issued token
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Compact token string
    pub token: String,
    /// Claims it carries
    pub claims: Claims,
}

impl IssuedToken {
    /// Lifetime at issue time
    pub fn expires_in_seconds(&self) -> i64 {
        self.claims.exp - self.claims.iat
    }
}

/// Issues and verifies session tokens
///
/// The signing key is read-only after construction.
pub struct TokenService {
    mac: HmacSha256,
    issuer: String,
    lifetime_secs: i64,
    revoked: Option<DashMap<String, i64>>,
}

impl TokenService {
    /// Build from session configuration
    ///
    /// A random 256-bit key is generated when no secret is configured; tokens
    /// then do not survive a restart.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the key cannot initialise the MAC
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let key = match &config.secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                warn!(
                    event = "session_key_generated",
                    "No session secret configured; using an ephemeral key"
                );
                let mut key = vec![0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut key);
                key
            }
        };

        let minutes = if config.session_timeout_minutes > 0 {
            config.session_timeout_minutes
        } else {
            warn!(
                event = "session_config_fallback",
                value = config.session_timeout_minutes,
                "session_timeout_minutes must be positive; using {DEFAULT_SESSION_MINUTES}"
            );
            DEFAULT_SESSION_MINUTES
        };

        Self::with_key(&key, &config.issuer, minutes.saturating_mul(60), config.revocation_enabled)
    }

    /// Build from an explicit key and lifetime
    ///
    /// # Errors
    ///
    /// `Error::Config` for an empty key or non-positive lifetime
    pub fn with_key(
        key: &[u8],
        issuer: &str,
        lifetime_secs: i64,
        revocation: bool,
    ) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::Config("session signing key must not be empty".to_string()));
        }
        if lifetime_secs <= 0 {
            return Err(Error::Config("session lifetime must be positive".to_string()));
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| Error::Config(format!("invalid session signing key: {e}")))?;

        Ok(Self {
            mac,
            issuer: issuer.to_string(),
            lifetime_secs,
            revoked: revocation.then(DashMap::new),
        })
    }

    /// Whether logout revokes tokens before expiry
    pub fn revocation_enabled(&self) -> bool {
        self.revoked.is_some()
    }

    /// Token lifetime in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.lifetime_secs
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    /// Issue a token for `identity` carrying `roles`
    ///
    /// # Errors
    ///
    /// `Error::InvalidInput` for a blank identity, `Error::Internal` if the
    /// claims cannot be serialized
    pub fn issue(&self, identity: &str, roles: &[String]) -> Result<IssuedToken> {
        if identity.trim().is_empty() {
            return Err(Error::invalid("token subject must not be empty"));
        }

        let iat = Utc::now().timestamp();
        let claims = Claims {
            sub: identity.to_string(),
            roles: roles.to_vec(),
            iat,
            exp: iat + self.lifetime_secs,
            jti: uuid::Uuid::new_v4().to_string(),
            iss: self.issuer.clone(),
        };

        let header = Header {
            alg: ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        };
        let header = serde_json::to_vec(&header).map_err(|e| Error::Internal(e.to_string()))?;
        let payload = serde_json::to_vec(&claims).map_err(|e| Error::Internal(e.to_string()))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = URL_SAFE_NO_PAD.encode(self.sign(signing_input.as_bytes()));

        debug!(subject = %claims.sub, jti = %claims.jti, "Issued session token");

        Ok(IssuedToken {
            token: format!("{signing_input}.{signature}"),
            claims,
        })
    }

    /// Verify signature, algorithm and claims, ignoring expiry and revocation
    ///
    /// Every check runs before any result is chosen, so the failing check
    /// cannot be told apart by timing.
    fn authenticate(&self, token: &str) -> std::result::Result<Claims, TokenError> {
        let segments: Vec<&str> = token.split('.').collect();
        let shape_ok = segments.len() == 3 && segments.iter().all(|s| !s.is_empty());

        let (header_b64, payload_b64, signature_b64) = if shape_ok {
            (segments[0], segments[1], segments[2])
        } else {
            (token, "", "")
        };

        let signing_input_len = header_b64.len() + 1 + payload_b64.len();
        let signing_input = &token[..signing_input_len.min(token.len())];
        let expected = self.sign(signing_input.as_bytes());

        let provided = URL_SAFE_NO_PAD.decode(signature_b64).ok();
        let provided_ok = provided.is_some();
        let provided = provided
            .filter(|p| p.len() == SIGNATURE_LEN)
            .unwrap_or_else(|| vec![0u8; SIGNATURE_LEN]);
        let signature_ok: bool = expected.ct_eq(&provided).into();

        let header = URL_SAFE_NO_PAD
            .decode(header_b64)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Header>(&bytes).ok());
        let header_ok = header.is_some();
        let algorithm_ok = header.is_some_and(|h| h.alg == ALGORITHM);

        let claims = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Claims>(&bytes).ok());
        let payload_ok = claims.is_some();
        let claims_ok = claims.as_ref().is_some_and(|c| {
            !c.sub.trim().is_empty() && c.exp > c.iat && c.iss == self.issuer && !c.jti.is_empty()
        });

        if !(shape_ok && provided_ok && header_ok && payload_ok) {
            return Err(TokenError::Malformed);
        }
        if !algorithm_ok {
            return Err(TokenError::UnsupportedAlgorithm);
        }
        if !signature_ok {
            return Err(TokenError::BadSignature);
        }
        match claims {
            Some(claims) if claims_ok => Ok(claims),
            _ => Err(TokenError::InvalidClaims),
        }
    }

    /// Verify a token and return its claims
    ///
    /// # NIST 800-53: IA-2, AC-12
    ///
    /// # Errors
    ///
    /// `Error::TokenInvalid` for any structural, signature, claim, expiry or
    /// revocation failure
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let claims = self.authenticate(token).map_err(|reason| {
            debug!(reason = %reason, "Token rejected");
            Error::TokenInvalid(reason)
        })?;

        if Utc::now().timestamp() >= claims.exp {
            return Err(Error::TokenInvalid(TokenError::Expired));
        }
        if let Some(revoked) = &self.revoked {
            if revoked.contains_key(&claims.jti) {
                return Err(Error::TokenInvalid(TokenError::Revoked));
            }
        }

        Ok(claims)
    }

    /// Seconds until expiry; 0 or less once expired or when the token is invalid
    pub fn remaining_seconds(&self, token: &str) -> i64 {
        match self.authenticate(token) {
            Ok(claims) => claims.exp - Utc::now().timestamp(),
            Err(_) => 0,
        }
    }

    /// Revoke a verified token until its natural expiry
    ///
    /// Returns `false` when revocation is disabled.
    pub fn revoke(&self, claims: &Claims) -> bool {
        match &self.revoked {
            Some(revoked) => {
                revoked.insert(claims.jti.clone(), claims.exp);
                info!(
                    event = "token_revoked",
                    subject = %claims.sub,
                    jti = %claims.jti,
                    "Token revoked"
                );
                true
            }
            None => false,
        }
    }

    /// Drop revocations whose tokens have expired anyway
    pub fn purge_expired_revocations(&self) -> usize {
        let Some(revoked) = &self.revoked else {
            return 0;
        };
        let now = Utc::now().timestamp();
        let before = revoked.len();
        revoked.retain(|_, exp| *exp > now);
        before.saturating_sub(revoked.len())
    }

    /// Revocations currently tracked
    pub fn revoked_count(&self) -> usize {
        self.revoked.as_ref().map_or(0, DashMap::len)
    }
}

/// Extract a bearer token from an `Authorization` header value
///
/// Requires the exact `Bearer ` prefix; anything else yields `None`.
pub fn extract_bearer(header: Option<&str>) -> Option<&str> {
    let token = header?.strip_prefix("Bearer ")?;
    if token.is_empty() || token.contains(char::is_whitespace) {
        return None;
    }
    Some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::with_key(b"0123456789abcdef0123456789abcdef", "archive-gate", 1800, true)
            .unwrap()
    }

    #[test]
    fn test_issue_and_verify() {
        let svc = service();
        let issued = svc.issue("alice", &["reader".to_string()]).unwrap();
        let claims = svc.verify(&issued.token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.roles, vec!["reader".to_string()]);
        assert!(claims.exp > claims.iat);
        assert_eq!(issued.expires_in_seconds(), 1800);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let issued = service().issue("alice", &[]).unwrap();
        let other =
            TokenService::with_key(b"another-key-another-key-another!", "archive-gate", 1800, false)
                .unwrap();
        assert!(matches!(
            other.verify(&issued.token),
            Err(Error::TokenInvalid(TokenError::BadSignature))
        ));
    }

    #[test]
    fn test_segment_count() {
        let svc = service();
        for bad in ["", "a.b", "a.b.c.d", "..", "abc"] {
            assert!(matches!(
                svc.verify(bad),
                Err(Error::TokenInvalid(TokenError::Malformed))
            ));
        }
    }

    #[test]
    fn test_revocation() {
        let svc = service();
        let issued = svc.issue("alice", &[]).unwrap();
        assert!(svc.revoke(&issued.claims));
        assert!(matches!(
            svc.verify(&issued.token),
            Err(Error::TokenInvalid(TokenError::Revoked))
        ));
        assert_eq!(svc.purge_expired_revocations(), 0);
        assert_eq!(svc.revoked_count(), 1);
    }

    #[test]
    fn test_remaining_seconds() {
        let svc = service();
        let issued = svc.issue("alice", &[]).unwrap();
        let left = svc.remaining_seconds(&issued.token);
        assert!(left > 1790 && left <= 1800);
        assert_eq!(svc.remaining_seconds("garbage"), 0);
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer(Some("Bearer abc.def.ghi")), Some("abc.def.ghi"));
        assert_eq!(extract_bearer(Some("bearer abc")), None);
        assert_eq!(extract_bearer(Some("BEARER abc")), None);
        assert_eq!(extract_bearer(Some("Bearer ")), None);
        assert_eq!(extract_bearer(Some("Bearer  abc")), None);
        assert_eq!(extract_bearer(Some("Basic abc")), None);
        assert_eq!(extract_bearer(None), None);
    }
}
