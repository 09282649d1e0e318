use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};

use crate::{
    error::AuthError,
    types::{Account, Claims},
};

/// Why a presented token was refused.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    /// Not a token we could parse, or its claims are unacceptable.
    #[error("malformed token")]
    Invalid,
    /// Well-formed, but the signature does not match our secret.
    #[error("bad signature")]
    BadSignature,
    /// Genuine, but past its expiry.
    #[error("expired")]
    Expired,
}

/// Signs and checks HS256 session tokens.
///
/// Tokens are stateless: nothing is stored server-side, so every process that
/// shares the same secret and issuer accepts every token any of them issued.
#[derive(Clone)]
pub struct TokenIssuer {
    issuer: String,
    lifetime: Duration,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: &[u8], issuer: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            issuer: issuer.into(),
            lifetime,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    /// Issue a token for `account` valid from `now` for the configured lifetime.
    pub fn issue(&self, account: &Account, now: SystemTime) -> Result<String, AuthError> {
        self.issue_with_ttl(account, now, self.lifetime)
    }

    /// Lifetimes are whole seconds; anything shorter than one second is rounded up
    /// so that `exp` is always strictly after `iat`. Expiry saturates rather than
    /// wrapping for absurdly long lifetimes.
    pub fn issue_with_ttl(
        &self,
        account: &Account,
        now: SystemTime,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let iat = unix_seconds(now);

        let claims = Claims {
            sub: account.id.0,
            username: account.username.0.clone(),
            iat,
            exp: iat.saturating_add(ttl.as_secs().max(1)),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;

        Ok(token)
    }

    /// Check the signature first, then the issuer, and only then the expiry.
    /// The token is valid while `now` is strictly before `exp`.
    pub fn verify(&self, token: &str, now: SystemTime) -> Result<Claims, TokenRejection> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        // expiry is judged against the caller's clock below, with no leeway
        validation.validate_exp = false;
        validation.leeway = 0;

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|err| match err.kind() {
                ErrorKind::InvalidSignature => TokenRejection::BadSignature,
                _ => TokenRejection::Invalid,
            })?
            .claims;

        if claims.exp <= claims.iat {
            return Err(TokenRejection::Invalid);
        }

        if unix_seconds(now) >= claims.exp {
            return Err(TokenRejection::Expired);
        }

        Ok(claims)
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
