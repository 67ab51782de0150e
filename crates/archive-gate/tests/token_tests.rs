//! Session token integration tests
//!
//! NIST 800-53: IA-2 (Identification and Authentication), SC-13 (Cryptographic Protection),
//! AC-12 (Session Termination)
//! Implementation: Tampering, forged headers, expiry and revocation

use archive_gate::error::TokenError;
use archive_gate::token::{extract_bearer, Claims, TokenService};
use archive_gate::Error;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

const KEY: &[u8] = b"integration-test-key-0123456789!";
const ISSUER: &str = "archive-gate";

fn service(revocation: bool) -> TokenService {
    TokenService::with_key(KEY, ISSUER, 1800, revocation).unwrap()
}

/// Build and sign a token by hand with `KEY`
fn forge(header: &str, claims: &Claims) -> String {
    let payload = serde_json::to_vec(claims).unwrap();
    let input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(payload)
    );
    let mut mac = Hmac::<Sha256>::new_from_slice(KEY).unwrap();
    mac.update(input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{input}.{signature}")
}

fn claims(iat: i64, exp: i64) -> Claims {
    Claims {
        sub: "alice".to_string(),
        roles: vec!["reader".to_string()],
        iat,
        exp,
        jti: "f0f0f0f0-0000-4000-8000-000000000001".to_string(),
        iss: ISSUER.to_string(),
    }
}

fn flip_last_char(segment: &str) -> String {
    let mut chars: Vec<char> = segment.chars().collect();
    if let Some(last) = chars.last_mut() {
        *last = if *last == 'A' { 'B' } else { 'A' };
    }
    chars.into_iter().collect()
}

/// NIST 800-53: IA-2 - Issued tokens verify and carry their roles
#[test]
fn test_round_trip() {
    let svc = service(false);
    let roles = vec!["reader".to_string(), "operator".to_string()];
    let issued = svc.issue("alice", &roles).unwrap();

    let verified = svc.verify(&issued.token).unwrap();
    assert_eq!(verified, issued.claims);
    assert_eq!(verified.iss, ISSUER);
    assert_eq!(verified.roles, roles);
}

/// NIST 800-53: SC-13 - A modified payload fails the signature check
#[test]
fn test_tampered_payload_rejected() {
    let svc = service(false);
    let issued = svc.issue("alice", &["reader".to_string()]).unwrap();
    let parts: Vec<&str> = issued.token.split('.').collect();

    let mut elevated = issued.claims.clone();
    elevated.roles = vec!["admin".to_string()];
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&elevated).unwrap());
    let tampered = format!("{}.{}.{}", parts[0], payload, parts[2]);

    assert!(matches!(
        svc.verify(&tampered),
        Err(Error::TokenInvalid(TokenError::BadSignature))
    ));
}

/// NIST 800-53: SC-13 - A modified signature is rejected
#[test]
fn test_tampered_signature_rejected() {
    let svc = service(false);
    let issued = svc.issue("alice", &[]).unwrap();
    let parts: Vec<&str> = issued.token.split('.').collect();
    let tampered = format!("{}.{}.{}", parts[0], parts[1], flip_last_char(parts[2]));

    assert!(matches!(svc.verify(&tampered), Err(Error::TokenInvalid(_))));
}

/// NIST 800-53: SC-13 - Only HS256 headers are accepted
#[test]
fn test_none_algorithm_rejected() {
    let svc = service(false);
    let now = Utc::now().timestamp();
    let token = forge(r#"{"alg":"none","typ":"JWT"}"#, &claims(now, now + 600));

    assert!(matches!(
        svc.verify(&token),
        Err(Error::TokenInvalid(TokenError::UnsupportedAlgorithm))
    ));
}

/// NIST 800-53: AC-12 - Expired tokens fail even with a valid signature
#[test]
fn test_expired_token_rejected() {
    let svc = service(false);
    let now = Utc::now().timestamp();
    let token = forge(r#"{"alg":"HS256","typ":"JWT"}"#, &claims(now - 120, now - 60));

    assert!(matches!(
        svc.verify(&token),
        Err(Error::TokenInvalid(TokenError::Expired))
    ));
    assert!(svc.remaining_seconds(&token) <= 0);
}

/// NIST 800-53: IA-2 - A hand-signed token with valid claims verifies
#[test]
fn test_hand_signed_token_accepted() {
    let svc = service(false);
    let now = Utc::now().timestamp();
    let token = forge(r#"{"alg":"HS256","typ":"JWT"}"#, &claims(now, now + 600));

    let verified = svc.verify(&token).unwrap();
    assert_eq!(verified.sub, "alice");
}

/// NIST 800-53: IA-2 - Tokens from another issuer are rejected
#[test]
fn test_foreign_issuer_rejected() {
    let svc = service(false);
    let now = Utc::now().timestamp();
    let mut foreign = claims(now, now + 600);
    foreign.iss = "somebody-else".to_string();
    let token = forge(r#"{"alg":"HS256","typ":"JWT"}"#, &foreign);

    assert!(matches!(
        svc.verify(&token),
        Err(Error::TokenInvalid(TokenError::InvalidClaims))
    ));
}

/// NIST 800-53: IA-2 - Non-token input is malformed
#[test]
fn test_garbage_is_malformed() {
    let svc = service(false);
    for bad in ["not-a-token", "a.b.c", "%%%.%%%.%%%"] {
        assert!(matches!(
            svc.verify(bad),
            Err(Error::TokenInvalid(TokenError::Malformed))
        ));
    }
}

/// NIST 800-53: AC-12 - Revocation is opt-in
#[test]
fn test_revocation_opt_in() {
    let stateless = service(false);
    let issued = stateless.issue("alice", &[]).unwrap();
    assert!(!stateless.revoke(&issued.claims));
    assert!(stateless.verify(&issued.token).is_ok());

    let revoking = service(true);
    let issued = revoking.issue("alice", &[]).unwrap();
    assert!(revoking.revoke(&issued.claims));
    assert!(matches!(
        revoking.verify(&issued.token),
        Err(Error::TokenInvalid(TokenError::Revoked))
    ));
}

/// NIST 800-53: IA-2 - Bearer extraction requires the exact scheme
#[test]
fn test_bearer_extraction() {
    assert_eq!(extract_bearer(Some("Bearer x.y.z")), Some("x.y.z"));
    assert_eq!(extract_bearer(Some("Token x.y.z")), None);
    assert_eq!(extract_bearer(Some("Bearer x y")), None);
}

/// NIST 800-53: IA-2 - Invalid lifetimes and keys are configuration errors
#[test]
fn test_invalid_construction() {
    assert!(matches!(
        TokenService::with_key(b"", ISSUER, 60, false),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        TokenService::with_key(KEY, ISSUER, 0, false),
        Err(Error::Config(_))
    ));
}
