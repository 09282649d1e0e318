//! Account storage.
//!
//! [`UserDatabase`] is the seam between the account service and wherever accounts
//! actually live. Two implementations ship with the crate:
//!
//! - [`SqliteUserDatabase`]: a file on disk, shared by every worker process on
//!   the host. This is the store of record whenever more than one worker runs.
//! - [`InMemoryUserDatabase`]: a map local to one process, for tests and
//!   single-worker deployments. Accounts created in one process are invisible
//!   to every other process.

mod memory;
mod sqlite;

use async_trait::async_trait;

pub use memory::InMemoryUserDatabase;
pub use sqlite::SqliteUserDatabase;

use crate::{
    error::AuthError,
    types::{Account, HashedPassword, Username},
};

#[async_trait]
pub trait UserDatabase: Send + Sync + 'static {
    /// Create an account with the given username. Checking for an existing
    /// account and inserting the new one must happen as one atomic step: if the
    /// username is already in use, return [`AuthError::UsernameAlreadyTaken`] and
    /// leave the store untouched.
    async fn create_user(
        &mut self,
        username: &Username,
        hashed_password: &HashedPassword,
    ) -> Result<Account, AuthError>;

    /// Retrieve the account with the specified username, if there is one.
    async fn find_user(&self, username: &Username) -> Result<Option<Account>, AuthError>;
}
