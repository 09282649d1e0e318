use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument};

use crate::{
    error::AuthError,
    hasher::PasswordHasher,
    store::UserDatabase,
    token::{TokenIssuer, TokenRejection},
    types::{Account, Claims, HashedPassword, Identity, Registration, Username},
};

// Hashed once per process and checked against when a login names an unknown
// user, so that path costs the same as a wrong password.
const DUMMY_PASSWORD: &str = "not a real password";

#[derive(Clone)]
pub struct AuthConfig {
    /// The issuer for auth tokens. We will validate that all auth tokens match the given issuer.
    pub auth_token_issuer: String,
    /// The secret used to sign JWT authorization tokens. Every worker serving the same
    /// clients must use the same secret, or tokens issued by one are refused by the others.
    /// If the secret changes, all currently authenticated sessions will be terminated.
    pub auth_token_secret: String,
    /// How long auth tokens should remain valid for. After this interval, the client will have to re-login.
    pub auth_token_lifetime: Duration,
    /// Cost parameters for new password hashes.
    pub password_hasher: PasswordHasher,
    pub database_connection: Arc<Mutex<dyn UserDatabase>>,
}

pub(crate) struct AuthInternal {
    hasher: PasswordHasher,
    tokens: TokenIssuer,
    database_connection: Arc<Mutex<dyn UserDatabase>>,
    dummy_hash: OnceCell<HashedPassword>,
}

/// Account registration, login and token checks. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Auth {
    pub(crate) internal: Arc<AuthInternal>,
}

impl Auth {
    pub fn new(config: AuthConfig) -> Self {
        let tokens = TokenIssuer::new(
            config.auth_token_secret.as_bytes(),
            config.auth_token_issuer,
            config.auth_token_lifetime,
        );

        Self {
            internal: Arc::new(AuthInternal {
                hasher: config.password_hasher,
                tokens,
                database_connection: config.database_connection,
                dummy_hash: OnceCell::new(),
            }),
        }
    }

    /// Hash the stand-in password used for unknown-user logins, so the first
    /// such login costs one hash like every later one. Call before serving.
    pub async fn warm_up(&self) -> Result<(), AuthError> {
        self.dummy_hash().await?;

        Ok(())
    }

    /// Create an account and log it straight in.
    ///
    /// The account is committed before any token exists, so a rejected
    /// registration never produces a usable token.
    #[instrument(skip(self, password))]
    pub async fn register(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Registration, AuthError> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingFields);
        }

        let username = Username(username.to_owned());

        // skip the expensive hash when the name is obviously gone; the store
        // still has the final say below
        if self.find_user(&username).await?.is_some() {
            return Err(AuthError::UsernameAlreadyTaken);
        }

        let hashed_password = self.hash(password).await?;

        let account = self
            .internal
            .database_connection
            .lock()
            .await
            .create_user(&username, &hashed_password)
            .await?;

        let token = self.internal.tokens.issue(&account, SystemTime::now())?;

        info!(user_id = account.id.0, "account registered");

        Ok(Registration {
            user_id: account.id,
            username: account.username,
            token,
        })
    }

    /// Check a username and password and issue a fresh token.
    ///
    /// An unknown username and a wrong password fail identically, with
    /// [`AuthError::LoginFailed`], and take the same time to do so.
    #[instrument(skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingFields);
        }

        let account = self.find_user(&Username(username.to_owned())).await?;

        let Some(account) = account else {
            let dummy = self.dummy_hash().await?;
            self.verify(password, dummy).await?;
            debug!("login for unknown user");
            return Err(AuthError::LoginFailed);
        };

        if !self.verify(password, account.hashed_password.clone()).await? {
            debug!(user_id = account.id.0, "login with wrong password");
            return Err(AuthError::LoginFailed);
        }

        let token = self.internal.tokens.issue(&account, SystemTime::now())?;

        info!(user_id = account.id.0, "login succeeded");

        Ok(token)
    }

    /// Resolve a bearer token to the identity it was issued for.
    pub fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.verify_token(token, SystemTime::now())?;

        Ok(claims.into())
    }

    pub fn verify_token(&self, token: &str, now: SystemTime) -> Result<Claims, TokenRejection> {
        self.internal.tokens.verify(token, now)
    }

    async fn dummy_hash(&self) -> Result<HashedPassword, AuthError> {
        let dummy = self
            .internal
            .dummy_hash
            .get_or_try_init(|| self.hash(DUMMY_PASSWORD))
            .await?;

        Ok(dummy.clone())
    }

    async fn find_user(&self, username: &Username) -> Result<Option<Account>, AuthError> {
        self.internal
            .database_connection
            .lock()
            .await
            .find_user(username)
            .await
    }

    // argon2 is deliberately slow; keep it off the event loop
    async fn hash(&self, password: &str) -> Result<HashedPassword, AuthError> {
        let hasher = self.internal.hasher;
        let password = password.to_owned();

        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(AuthError::hashing)?
    }

    async fn verify(&self, password: &str, hash: HashedPassword) -> Result<bool, AuthError> {
        let hasher = self.internal.hasher;
        let password = password.to_owned();

        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(AuthError::hashing)
    }
}
