use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[repr(transparent)]
pub struct UserID(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[repr(transparent)]
pub struct Username(pub String);

/// An encoded argon2 hash, salt and parameters included.
#[derive(Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct HashedPassword(pub String);

// Hashes end up in account records, which may be debug-logged.
impl fmt::Debug for HashedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HashedPassword(..)")
    }
}

/// A stored account. Never serialized: only its claims leave the service.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: UserID,
    pub username: Username,
    pub hashed_password: HashedPassword,
}

/// The signed payload of a session token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Claims {
    /// Account id.
    pub sub: u64,
    pub username: String,
    /// Issued at, seconds since the unix epoch.
    pub iat: u64,
    /// Expiry, seconds since the unix epoch.
    pub exp: u64,
    pub iss: String,
}

/// The caller resolved by the auth middleware, handed to protected handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: UserID,
    pub username: Username,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: UserID(claims.sub),
            username: Username(claims.username),
        }
    }
}

/// What a successful registration hands back: the new account and its first token.
#[derive(Debug, Clone)]
pub struct Registration {
    pub user_id: UserID,
    pub username: Username,
    pub token: String,
}
