//! Bearer-token verification against a JWKS document
//!
//! The verifier holds the whole JWKS in memory: keys are fetched (or passed
//! inline) once at construction and reconstructed into RSA decoding keys per
//! verification, keyed by `kid`. Verification itself is synchronous so both
//! the axum middleware and the tonic interceptor can call it in place.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;

use crate::claims::AuthenticationClaims;
use crate::config::AuthConfig;
use crate::error::{Error, Result};

/// Raw JWK structure as served by a JWKS endpoint
#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    /// Key ID
    #[serde(default)]
    kid: Option<String>,
    /// Key type (e.g. "RSA")
    kty: String,
    /// RSA modulus (base64url big-endian)
    #[serde(default)]
    n: Option<String>,
    /// RSA public exponent (base64url big-endian)
    #[serde(default)]
    e: Option<String>,
}

/// JWKS response envelope
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

/// Stored key components; `DecodingKey` is rebuilt per verification because
/// it is not `Clone`
#[derive(Debug, Clone)]
struct RsaComponents {
    n: String,
    e: String,
}

impl RsaComponents {
    fn to_decoding_key(&self) -> Result<DecodingKey> {
        check_exponent_width(&self.e)?;
        DecodingKey::from_rsa_components(&self.n, &self.e).map_err(Error::from)
    }
}

/// Fail when the base64url exponent is wider than the platform integer.
fn check_exponent_width(e: &str) -> Result<()> {
    let bytes = URL_SAFE_NO_PAD
        .decode(e)
        .map_err(|err| Error::Unauthenticated(format!("invalid JWK exponent: {err}")))?;
    let significant = bytes.iter().skip_while(|b| **b == 0).count();
    if significant > std::mem::size_of::<usize>() {
        return Err(Error::ExponentTooLarge);
    }
    Ok(())
}

/// Verifies bearer tokens and produces [`AuthenticationClaims`]
#[derive(Debug, Default)]
pub struct TokenVerifier {
    jwks_source: String,
    keys: HashMap<String, RsaComponents>,
    audience: String,
    issuer: String,
}

impl TokenVerifier {
    /// A verifier with no JWKS: authentication is disabled and the ingress
    /// interceptors pass requests through.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build a verifier from a raw JWKS document.
    ///
    /// Keys without a `kid` or with a non-RSA type are skipped; audience and
    /// issuer checks are enforced only when non-empty.
    pub fn new(jwks: &str, audience: &str, issuer: &str) -> Result<Self> {
        if jwks.trim().is_empty() {
            return Ok(Self::disabled());
        }

        let document: JwksDocument = serde_json::from_str(jwks)
            .map_err(|e| Error::Validation(format!("invalid JWKS document: {e}")))?;

        let mut keys = HashMap::new();
        for jwk in document.keys {
            if jwk.kty != "RSA" {
                tracing::debug!(kty = %jwk.kty, "skipping non-RSA JWK");
                continue;
            }
            let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) else {
                tracing::warn!("skipping RSA JWK missing kid, n, or e");
                continue;
            };
            keys.insert(kid, RsaComponents { n, e });
        }

        Ok(Self {
            jwks_source: jwks.to_string(),
            keys,
            audience: audience.to_string(),
            issuer: issuer.to_string(),
        })
    }

    /// Fetch the JWKS document from `uri` and build a verifier from it.
    pub async fn fetch(uri: &str, audience: &str, issuer: &str) -> Result<Self> {
        let jwks = reqwest::get(uri).await?.error_for_status()?.text().await?;
        Self::new(&jwks, audience, issuer)
    }

    /// Build a verifier from the loaded configuration: inline JWKS when
    /// present, otherwise fetched from the configured URI, otherwise
    /// disabled.
    pub async fn from_config(config: &AuthConfig) -> Result<Self> {
        if !config.jwks.trim().is_empty() {
            return Self::new(&config.jwks, &config.audience, &config.issuer);
        }
        if !config.jwks_uri.trim().is_empty() {
            return Self::fetch(&config.jwks_uri, &config.audience, &config.issuer).await;
        }
        Ok(Self::disabled())
    }

    /// Whether authentication is enforced.
    pub fn is_enabled(&self) -> bool {
        !self.jwks_source.trim().is_empty()
    }

    /// The raw JWKS document this verifier was built from; empty when
    /// disabled.
    pub fn jwks_source(&self) -> &str {
        &self.jwks_source
    }

    /// Verify a bearer token and return its claims.
    pub fn verify(&self, token: &str) -> Result<AuthenticationClaims> {
        let header = decode_header(token)?;
        let kid = header
            .kid
            .ok_or_else(|| Error::Unauthenticated("token has no key id".to_string()))?;
        let components = self
            .keys
            .get(&kid)
            .ok_or_else(|| Error::Unauthenticated(format!("unknown key id {kid}")))?;

        let key = components.to_decoding_key()?;

        let mut validation = Validation::new(header.alg);
        if self.audience.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&[self.audience.as_str()]);
        }
        if !self.issuer.is_empty() {
            validation.set_issuer(&[self.issuer.as_str()]);
        }

        let data = decode::<AuthenticationClaims>(token, &key, &validation)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2048-bit modulus from RFC 7515 appendix A.2 (public components only)
    const RFC_MODULUS: &str = "ofgWCuLjybRlzo0tZWJjNiuSfb4p4fAkd_wWJcyQoTbji9k0l8W26mPddxHmfHQp-Vaw-4qPCJrcS2mJPMEzP1Pt0Bm4d4QlL-yRT-SFd2lZS-pCgNMsD1W_YpRPEwOWvG6b32690r2jZ47soMZo9wGzjb_7OMg0LOL-bSf63kpaSHSXndS5z5rexMdbBYUsLA9e-KXBdQOS-UTo7WTBEMa2R2CapHg665xsmtdVMTBQY4uDZlxvb3qCo5ZwKh9kG4LT6_I5IhlJH7aGhyxXFvUK-DWNmoudF8NAco9_h9iaGNj8q2ethFkMLs91kzk2PAcDTW9gb54h4FRWyuXpoQ";

    fn jwks_with_exponent(e: &str) -> String {
        format!(
            r#"{{"keys":[{{"kty":"RSA","kid":"k1","n":"{RFC_MODULUS}","e":"{e}"}}]}}"#
        )
    }

    #[test]
    fn test_empty_source_is_disabled() {
        let verifier = TokenVerifier::new("", "", "").unwrap();
        assert!(!verifier.is_enabled());
        assert!(verifier.jwks_source().is_empty());
    }

    #[test]
    fn test_parses_rsa_keys_by_kid() {
        let verifier = TokenVerifier::new(&jwks_with_exponent("AQAB"), "", "").unwrap();
        assert!(verifier.is_enabled());
        assert!(verifier.keys.contains_key("k1"));
    }

    #[test]
    fn test_skips_non_rsa_keys() {
        let jwks = r#"{"keys":[{"kty":"EC","kid":"ec1","crv":"P-256","x":"x","y":"y"}]}"#;
        let verifier = TokenVerifier::new(jwks, "", "").unwrap();
        assert!(verifier.keys.is_empty());
    }

    #[test]
    fn test_invalid_document_fails_validation() {
        let err = TokenVerifier::new("{\"keys\": 7}", "", "").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_standard_exponent_is_accepted() {
        assert!(check_exponent_width("AQAB").is_ok());
    }

    #[test]
    fn test_oversized_exponent_is_rejected() {
        // Nine significant bytes cannot fit a 64-bit platform integer
        let wide = URL_SAFE_NO_PAD.encode([0x01u8; 9]);
        let err = check_exponent_width(&wide).unwrap_err();
        assert!(matches!(err, Error::ExponentTooLarge));
    }

    #[test]
    fn test_leading_zero_bytes_are_not_significant() {
        let padded = URL_SAFE_NO_PAD.encode([0x00, 0x00, 0x00, 0x01, 0x00, 0x01]);
        assert!(check_exponent_width(&padded).is_ok());
    }

    #[test]
    fn test_verify_rejects_token_without_key_id() {
        let verifier = TokenVerifier::new(&jwks_with_exponent("AQAB"), "", "").unwrap();
        // Header {"alg":"RS256","typ":"JWT"} with no kid
        let token = "eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCJ9.e30.c2ln";
        let err = verifier.verify(token).unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[test]
    fn test_verify_rejects_unknown_key_id() {
        let verifier = TokenVerifier::new(&jwks_with_exponent("AQAB"), "", "").unwrap();
        // Header {"alg":"RS256","kid":"other"}
        let token = "eyJhbGciOiJSUzI1NiIsImtpZCI6Im90aGVyIn0.e30.c2ln";
        let err = verifier.verify(token).unwrap_err();
        match err {
            Error::Unauthenticated(msg) => assert!(msg.contains("other")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_oversized_exponent_fails_verification_cleanly() {
        let wide = URL_SAFE_NO_PAD.encode([0x01u8; 9]);
        let verifier = TokenVerifier::new(&jwks_with_exponent(&wide), "", "").unwrap();
        // Header {"alg":"RS256","kid":"k1"}
        let token = "eyJhbGciOiJSUzI1NiIsImtpZCI6ImsxIn0.e30.c2ln";
        let err = verifier.verify(token).unwrap_err();
        assert!(matches!(err, Error::ExponentTooLarge));
    }
}
