use std::{
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use crate::{
    error::AuthError,
    store::UserDatabase,
    types::{Account, HashedPassword, UserID, Username},
};

/// How long a writer waits on another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed account store.
///
/// Several processes may open the same file at once; the `UNIQUE` constraint on
/// `username` is what makes registration atomic across all of them. Each call
/// runs on the blocking thread pool so the event loop keeps serving requests
/// while SQLite waits on disk or on a lock.
#[derive(Clone)]
pub struct SqliteUserDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteUserDatabase {
    /// Open (or create) the account database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let conn = Connection::open(path.as_ref()).map_err(AuthError::database)?;
        Self::init(conn)
    }

    /// A private database that lives as long as this handle. Mostly for tests.
    pub fn open_in_memory() -> Result<Self, AuthError> {
        let conn = Connection::open_in_memory().map_err(AuthError::database)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, AuthError> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(AuthError::database)?;

        // WAL so readers in one worker don't block on a writer in another
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;

             CREATE TABLE IF NOT EXISTS accounts (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 username TEXT NOT NULL UNIQUE,
                 password_hash TEXT NOT NULL,
                 created_at INTEGER NOT NULL
             );",
        )
        .map_err(AuthError::database)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, AuthError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, AuthError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(AuthError::database)?
    }
}

#[async_trait]
impl UserDatabase for SqliteUserDatabase {
    async fn create_user(
        &mut self,
        username: &Username,
        hashed_password: &HashedPassword,
    ) -> Result<Account, AuthError> {
        let username = username.clone();
        let hashed_password = hashed_password.clone();

        self.with_conn(move |conn| {
            let created_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs() as i64)
                .unwrap_or(0);

            let result = conn.execute(
                "INSERT INTO accounts (username, password_hash, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![username.0, hashed_password.0, created_at],
            );

            match result {
                Ok(_) => {
                    let id = UserID(conn.last_insert_rowid() as u64);
                    debug!(user_id = id.0, "account row inserted");
                    Ok(Account {
                        id,
                        username,
                        hashed_password,
                    })
                }
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(AuthError::UsernameAlreadyTaken)
                }
                Err(err) => Err(AuthError::database(err)),
            }
        })
        .await
    }

    async fn find_user(&self, username: &Username) -> Result<Option<Account>, AuthError> {
        let username = username.clone();

        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, password_hash FROM accounts WHERE username = ?1",
                rusqlite::params![username.0],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(AuthError::database)
            .map(|row| {
                row.map(|(id, password_hash)| Account {
                    id: UserID(id as u64),
                    username,
                    hashed_password: HashedPassword(password_hash),
                })
            })
        })
        .await
    }
}
