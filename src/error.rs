use warp::reject::Reject;

use crate::token::TokenRejection;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("username and password are required")]
    MissingFields,
    #[error("an account with that username already exists")]
    UsernameAlreadyTaken,
    #[error("username or password incorrect")]
    LoginFailed,
    #[error("no bearer token provided")]
    MissingToken,
    #[error("token rejected: {source}")]
    TokenError {
        #[from]
        source: TokenRejection,
    },
    #[error("error while hashing password")]
    HashingError {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("error while signing token")]
    SigningError {
        #[from]
        source: jsonwebtoken::errors::Error,
    },
    #[error("error during database operation")]
    DatabaseError {
        #[from]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl AuthError {
    pub(crate) fn hashing(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::HashingError {
            source: source.into(),
        }
    }

    pub(crate) fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::DatabaseError {
            source: source.into(),
        }
    }

    /// Failures of our own machinery, as opposed to bad client input.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::HashingError { .. } | Self::SigningError { .. } | Self::DatabaseError { .. }
        )
    }
}

impl Reject for AuthError {}
