//! Opaque authorization tags carried on operations and baselines.
//!
//! The engine never interprets a tag. It only checks the `<scheme>:<payload>`
//! envelope so corrupted data is surfaced instead of silently becoming
//! public, then propagates the tag verbatim through merge and rebase.
//! Enforcement belongs to whoever consumes the tags.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Maximum encoded length of an authorization tag.
pub const MAX_AUTHZ_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthzError {
    #[error("authorization tag is empty")]
    Empty,

    #[error("authorization tag exceeds {MAX_AUTHZ_LEN} bytes")]
    TooLong,

    #[error("authorization tag {0:?} is missing a `<scheme>:` prefix")]
    MissingScheme(String),

    #[error("authorization tag {0:?} has an invalid scheme")]
    InvalidScheme(String),

    #[error("authorization tag {0:?} has an empty or non-printable payload")]
    InvalidPayload(String),
}

impl AuthzError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::AuthorizationDecode
    }
}

/// A validated, otherwise opaque authorization tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Authorization(String);

impl Authorization {
    /// Decode a raw tag, validating only its envelope.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthzError`] describing the first envelope problem.
    pub fn parse(raw: &str) -> Result<Self, AuthzError> {
        if raw.is_empty() {
            return Err(AuthzError::Empty);
        }
        if raw.len() > MAX_AUTHZ_LEN {
            return Err(AuthzError::TooLong);
        }
        let (scheme, payload) = raw
            .split_once(':')
            .ok_or_else(|| AuthzError::MissingScheme(raw.to_string()))?;
        if scheme.is_empty()
            || !scheme
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(AuthzError::InvalidScheme(raw.to_string()));
        }
        if payload.is_empty() || payload.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(AuthzError::InvalidPayload(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The scheme prefix, for routing to an external enforcer.
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.0.split_once(':').map_or("", |(scheme, _)| scheme)
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Authorization {
    type Error = AuthzError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Authorization> for String {
    fn from(value: Authorization) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_tags() {
        let tag = Authorization::parse("user:alice@example.com").expect("valid");
        assert_eq!(tag.scheme(), "user");
        assert_eq!(tag.as_str(), "user:alice@example.com");
    }

    #[test]
    fn rejects_malformed_tags() {
        assert_eq!(Authorization::parse(""), Err(AuthzError::Empty));
        assert!(matches!(
            Authorization::parse("alice"),
            Err(AuthzError::MissingScheme(_))
        ));
        assert!(matches!(
            Authorization::parse("User:alice"),
            Err(AuthzError::InvalidScheme(_))
        ));
        assert!(matches!(
            Authorization::parse("user:"),
            Err(AuthzError::InvalidPayload(_))
        ));
        assert!(matches!(
            Authorization::parse("user:a b"),
            Err(AuthzError::InvalidPayload(_))
        ));
        assert_eq!(
            Authorization::parse(&format!("user:{}", "x".repeat(MAX_AUTHZ_LEN))),
            Err(AuthzError::TooLong)
        );
    }

    #[test]
    fn deserialization_surfaces_decode_errors() {
        assert!(serde_json::from_str::<Authorization>("\"not-a-tag\"").is_err());
        let tag: Authorization = serde_json::from_str("\"own:u1\"").expect("valid");
        assert_eq!(tag.scheme(), "own");
    }
}
