//! Local JWT validation.

use crate::error::{Error, Result};
use common::{AuthError, Claims, TokenValidator};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

const LEEWAY_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    sid: String,
    #[serde(default)]
    jti: String,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Clone)]
enum KeyMode {
    Hmac(DecodingKey),
    Rsa(DecodingKey),
    Unconfigured,
}

/// Validates HS256 (shared secret) or RS256 (public key) tokens.
///
/// A configured public key takes precedence over the secret.
#[derive(Clone)]
pub struct JwtValidator {
    mode: KeyMode,
}

impl JwtValidator {
    pub fn new(secret: &str, public_key_pem: &str) -> Result<Self> {
        let secret = secret.trim();
        let pem = public_key_pem.trim();

        let mode = if !pem.is_empty() {
            // PEMs passed through env vars often carry literal "\n".
            let pem = pem.replace("\\n", "\n");
            KeyMode::Rsa(DecodingKey::from_rsa_pem(pem.as_bytes())?)
        } else if !secret.is_empty() {
            KeyMode::Hmac(DecodingKey::from_secret(secret.as_bytes()))
        } else {
            KeyMode::Unconfigured
        };
        Ok(Self { mode })
    }

    pub fn hmac(secret: &str) -> Result<Self> {
        if secret.trim().is_empty() {
            return Err(Error::InvalidConfig("empty JWT secret".to_string()));
        }
        Self::new(secret, "")
    }

    fn key_and_validation(&self) -> std::result::Result<(&DecodingKey, Validation), AuthError> {
        let (key, algorithms) = match &self.mode {
            KeyMode::Rsa(key) => (key, vec![Algorithm::RS256]),
            KeyMode::Hmac(key) => (key, vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512]),
            KeyMode::Unconfigured => {
                return Err(AuthError::InvalidToken("jwt key not configured".to_string()))
            }
        };
        let mut validation = Validation::new(algorithms[0]);
        validation.algorithms = algorithms;
        validation.leeway = LEEWAY_SECS;
        validation.set_required_spec_claims::<&str>(&[]);
        Ok((key, validation))
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> std::result::Result<Claims, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let (key, validation) = self.key_and_validation()?;
        let data = decode::<TokenClaims>(token, key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let claims = data.claims;

        let subject = claims.sub.trim().to_string();
        if subject.is_empty() {
            return Err(AuthError::InvalidToken("missing subject".to_string()));
        }

        let session_id = [claims.sid.trim(), claims.jti.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| match claims.exp {
                Some(exp) => format!("{}:{}", subject, exp),
                None => subject.clone(),
            });

        Ok(Claims {
            subject,
            session_id,
            roles: claims.roles,
        })
    }
}

/// Token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let header = header.trim();
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
