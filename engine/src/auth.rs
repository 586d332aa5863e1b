use std::collections::HashMap;
use std::fmt;

use keyframe_stream_common::config::AuthConfig;

/// Identity a session runs as once its token is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity(pub String);

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
}

/// Token verification at connection time. Token issuance lives elsewhere.
pub trait AuthValidator: Send + Sync {
    fn verify(&self, token: &str) -> Result<SessionIdentity, AuthError>;
}

/// Validator backed by the `[auth]` table of the config file.
pub struct StaticTokenValidator {
    tokens: HashMap<String, String>,
    dev: Option<(String, String)>,
}

impl StaticTokenValidator {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            tokens: config.tokens.clone(),
            dev: config
                .dev_token
                .clone()
                .filter(|t| !t.is_empty())
                .map(|t| (t, config.dev_identity.clone())),
        }
    }
}

impl AuthValidator for StaticTokenValidator {
    fn verify(&self, token: &str) -> Result<SessionIdentity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        if let Some((dev_token, identity)) = &self.dev {
            if token == dev_token {
                return Ok(SessionIdentity(identity.clone()));
            }
        }
        self.tokens
            .get(token)
            .map(|identity| SessionIdentity(identity.clone()))
            .ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(dev_token: Option<&str>) -> StaticTokenValidator {
        let mut tokens = HashMap::new();
        tokens.insert("abc123".to_string(), "user-1".to_string());
        StaticTokenValidator::from_config(&AuthConfig {
            tokens,
            dev_token: dev_token.map(str::to_string),
            dev_identity: "dev-user".into(),
        })
    }

    #[test]
    fn known_token_maps_to_identity() {
        let v = validator(None);
        assert_eq!(v.verify("abc123").unwrap(), SessionIdentity("user-1".into()));
    }

    #[test]
    fn unknown_and_empty_tokens_rejected() {
        let v = validator(None);
        assert_eq!(v.verify("nope"), Err(AuthError::InvalidToken));
        assert_eq!(v.verify(""), Err(AuthError::MissingToken));
    }

    #[test]
    fn dev_token_only_when_enabled() {
        assert_eq!(validator(None).verify("dev"), Err(AuthError::InvalidToken));
        let v = validator(Some("dev"));
        assert_eq!(v.verify("dev").unwrap().to_string(), "dev-user");
        assert!(v.verify("abc123").is_ok());
    }

    #[test]
    fn empty_dev_token_is_disabled() {
        assert_eq!(validator(Some("")).verify(""), Err(AuthError::MissingToken));
    }
}
