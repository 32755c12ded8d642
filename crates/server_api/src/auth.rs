//! Bearer credential parsing.
//!
//! The relay trusts whoever issued the token and only reads the `email`
//! claim. Signatures, expiry and audience are not checked, so a forged token
//! is accepted as authentic; the result is a [`ClaimedIdentity`] for that
//! reason.

use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;
use shared::{domain::ClaimedIdentity, error::ApiError};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Missing or invalid Authorization header")]
    MissingHeader,
    #[error("Authorization header is not a bearer token")]
    NotBearer,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("Email not found in token")]
    MissingEmail,
}

impl From<CredentialError> for ApiError {
    fn from(value: CredentialError) -> Self {
        ApiError::unauthorized(value.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    #[serde(default)]
    email: Option<String>,
}

/// Reads the claimed identity out of an `Authorization` header value.
pub fn claimed_identity(authorization: Option<&str>) -> Result<ClaimedIdentity, CredentialError> {
    let header = authorization
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(CredentialError::MissingHeader)?;
    let token = header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(CredentialError::NotBearer)?;

    let header = decode_header(token).map_err(|e| CredentialError::Malformed(e.to_string()))?;
    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<UnverifiedClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| CredentialError::Malformed(e.to_string()))?;

    data.claims
        .email
        .filter(|email| !email.is_empty())
        .map(ClaimedIdentity::new)
        .ok_or(CredentialError::MissingEmail)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
