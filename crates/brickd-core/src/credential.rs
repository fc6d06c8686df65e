//! Broker credentials
//!
//! The broker authenticates the gateway with a short-lived signed token
//! (JWT) passed as the MQTT password. The audience is the project id and
//! the token expires after a fixed validity window, so the session must
//! mint a new one and reconnect before it lapses.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};

/// Validity window of an issued token
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// Signing algorithm for the private key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    #[default]
    RS256,
    ES256,
}

impl SigningAlgorithm {
    fn encoding_key(&self, private_key_pem: &[u8]) -> GatewayResult<EncodingKey> {
        let key = match self {
            SigningAlgorithm::RS256 => EncodingKey::from_rsa_pem(private_key_pem),
            SigningAlgorithm::ES256 => EncodingKey::from_ec_pem(private_key_pem),
        };
        key.map_err(|e| GatewayError::Credential(format!("Invalid {:?} private key: {}", self, e)))
    }

    fn jwt_algorithm(&self) -> Algorithm {
        match self {
            SigningAlgorithm::RS256 => Algorithm::RS256,
            SigningAlgorithm::ES256 => Algorithm::ES256,
        }
    }
}

/// Claim set carried by the token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// A signed token together with its validity window
#[derive(Clone)]
pub struct Credential {
    token: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Point in time at which `fraction` of the validity window has elapsed
    pub fn renew_at(&self, fraction: f64) -> DateTime<Utc> {
        let window = (self.expires_at - self.issued_at).num_milliseconds() as f64;
        let offset = (window * fraction.clamp(0.0, 1.0)) as i64;
        self.issued_at + chrono::Duration::milliseconds(offset)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Mints broker credentials from project identity and private key material
#[derive(Debug, Clone)]
pub struct CredentialIssuer {
    algorithm: SigningAlgorithm,
    validity: Duration,
}

impl Default for CredentialIssuer {
    fn default() -> Self {
        Self::new(SigningAlgorithm::default(), DEFAULT_TOKEN_VALIDITY)
    }
}

impl CredentialIssuer {
    pub fn new(algorithm: SigningAlgorithm, validity: Duration) -> Self {
        Self {
            algorithm,
            validity,
        }
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Issue a token valid from now
    pub fn issue(&self, project_id: &str, private_key_pem: &str) -> GatewayResult<Credential> {
        self.issue_at(project_id, private_key_pem, Utc::now())
    }

    /// Issue a token with an explicit issue time
    pub fn issue_at(
        &self,
        project_id: &str,
        private_key_pem: &str,
        now: DateTime<Utc>,
    ) -> GatewayResult<Credential> {
        let key = self.algorithm.encoding_key(private_key_pem.as_bytes())?;

        // Claims carry whole seconds; keep the in-memory window identical
        let issued_at = now.with_nanosecond(0).unwrap_or(now);
        let expires_at = issued_at + chrono::Duration::seconds(self.validity.as_secs() as i64);

        let claims = TokenClaims {
            aud: project_id.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        let header = Header::new(self.algorithm.jwt_algorithm());
        let token = jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| GatewayError::Credential(format!("Signing failed: {}", e)))?;

        debug!(project = %project_id, %expires_at, "Issued broker credential");

        Ok(Credential {
            token,
            issued_at,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jsonwebtoken::{DecodingKey, Validation};

    const RSA_PRIVATE: &str = include_str!("../testdata/rsa_private.pem");
    const RSA_PUBLIC: &str = include_str!("../testdata/rsa_public.pem");
    const EC_PRIVATE: &str = include_str!("../testdata/ec_private.pem");
    const EC_PUBLIC: &str = include_str!("../testdata/ec_public.pem");

    fn decode(token: &str, key: DecodingKey, alg: Algorithm, audience: &str) -> TokenClaims {
        let mut validation = Validation::new(alg);
        validation.set_audience(&[audience]);
        // Fixed clocks are in the past
        validation.validate_exp = false;
        jsonwebtoken::decode::<TokenClaims>(token, &key, &validation)
            .unwrap()
            .claims
    }

    #[test]
    fn test_expiry_is_exactly_one_validity_window() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let credential = CredentialIssuer::default()
            .issue_at("brickd", RSA_PRIVATE, now)
            .unwrap();

        let claims = decode(
            credential.token(),
            DecodingKey::from_rsa_pem(RSA_PUBLIC.as_bytes()).unwrap(),
            Algorithm::RS256,
            "brickd",
        );

        assert_eq!(claims.aud, "brickd");
        assert_eq!(claims.iat, now.timestamp());
        assert_eq!(claims.exp, claims.iat + 24 * 60 * 60);
        assert_eq!(credential.issued_at(), now);
        assert_eq!(credential.expires_at().timestamp(), claims.exp);
    }

    #[test]
    fn test_es256_key() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let issuer = CredentialIssuer::new(SigningAlgorithm::ES256, DEFAULT_TOKEN_VALIDITY);
        let credential = issuer.issue_at("fleet", EC_PRIVATE, now).unwrap();

        let claims = decode(
            credential.token(),
            DecodingKey::from_ec_pem(EC_PUBLIC.as_bytes()).unwrap(),
            Algorithm::ES256,
            "fleet",
        );
        assert_eq!(claims.exp - claims.iat, 86_400);
    }

    #[test]
    fn test_invalid_key_material() {
        let err = CredentialIssuer::default()
            .issue("brickd", "-----BEGIN NOTHING-----")
            .unwrap_err();
        assert!(matches!(err, GatewayError::Credential(_)));
    }

    #[test]
    fn test_rsa_key_rejected_for_es256() {
        let issuer = CredentialIssuer::new(SigningAlgorithm::ES256, DEFAULT_TOKEN_VALIDITY);
        assert!(matches!(
            issuer.issue("brickd", RSA_PRIVATE),
            Err(GatewayError::Credential(_))
        ));
    }

    #[test]
    fn test_renewal_point_and_remaining() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let credential = CredentialIssuer::default()
            .issue_at("brickd", RSA_PRIVATE, now)
            .unwrap();

        let renew = credential.renew_at(0.9);
        assert_eq!((renew - now).num_seconds(), 77_760);
        assert_eq!(credential.remaining(now), DEFAULT_TOKEN_VALIDITY);
        assert!(!credential.is_expired(renew));
        assert!(credential.is_expired(credential.expires_at()));
        assert_eq!(credential.remaining(credential.expires_at()), Duration::ZERO);
    }

    #[test]
    fn test_debug_redacts_token() {
        let credential = CredentialIssuer::default()
            .issue("brickd", RSA_PRIVATE)
            .unwrap();
        let printed = format!("{:?}", credential);
        assert!(!printed.contains(credential.token()));
    }
}
