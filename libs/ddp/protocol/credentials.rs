//! Login credentials and the identity the server returns

use crate::error::{DdpError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Credentials accepted by `login`
///
/// Exactly one variant is sent per login call. Plain passwords never
/// reach the wire: they are hashed into the digest form first.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Username (or email) with a clear-text password, hashed before sending
    Password { user: String, password: String },
    /// Username (or email) with a precomputed lowercase-hex SHA-256 digest
    PasswordDigest { user: String, digest: String },
    /// OAuth credential pair
    OAuth {
        credential_token: String,
        credential_secret: String,
    },
    /// Token from an earlier login
    Resume { token: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password { user, .. } => write!(f, "Password({})", user),
            Credentials::PasswordDigest { user, .. } => write!(f, "PasswordDigest({})", user),
            Credentials::OAuth { .. } => write!(f, "OAuth"),
            Credentials::Resume { .. } => write!(f, "Resume"),
        }
    }
}

/// Lowercase-hex SHA-256 of a password
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn user_selector(user: &str) -> Value {
    if user.contains('@') {
        json!({ "email": user })
    } else {
        json!({ "username": user })
    }
}

impl Credentials {
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Password {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn resume(token: impl Into<String>) -> Self {
        Credentials::Resume { token: token.into() }
    }

    /// Build the single parameter of the `login` method call
    pub fn to_login_params(&self) -> Result<Value> {
        match self {
            Credentials::Password { user, password } => {
                if user.is_empty() {
                    return Err(DdpError::InvalidCredentials("empty username".into()));
                }
                Ok(json!({
                    "user": user_selector(user),
                    "password": { "digest": password_digest(password), "algorithm": "sha-256" },
                }))
            }
            Credentials::PasswordDigest { user, digest } => {
                if user.is_empty() || digest.is_empty() {
                    return Err(DdpError::InvalidCredentials("empty username or digest".into()));
                }
                Ok(json!({
                    "user": user_selector(user),
                    "password": { "digest": digest.to_lowercase(), "algorithm": "sha-256" },
                }))
            }
            Credentials::OAuth {
                credential_token,
                credential_secret,
            } => Ok(json!({
                "oauth": {
                    "credentialToken": credential_token,
                    "credentialSecret": credential_secret,
                }
            })),
            Credentials::Resume { token } => {
                if token.is_empty() {
                    return Err(DdpError::InvalidCredentials("empty resume token".into()));
                }
                Ok(json!({ "resume": token }))
            }
        }
    }
}

/// Identity issued by the server on a successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResult {
    pub user_id: String,
    pub token: String,
    pub token_expires: Option<DateTime<Utc>>,
}

impl LoginResult {
    /// Parse `{id, token, tokenExpires: {"$date": ms}}`
    pub fn from_value(value: &Value) -> Result<Self> {
        let user_id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DdpError::InvalidCredentials("login result without id".into()))?;
        let token = value
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| DdpError::InvalidCredentials("login result without token".into()))?;

        let token_expires = value
            .get("tokenExpires")
            .and_then(|expires| expires.get("$date").or(Some(expires)))
            .and_then(Value::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(Self {
            user_id: user_id.to_string(),
            token: token.to_string(),
            token_expires,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.token_expires.map_or(false, |expires| expires <= now)
    }
}
