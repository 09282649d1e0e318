use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    error::AuthError,
    store::UserDatabase,
    types::{Account, HashedPassword, UserID, Username},
};

/// Process-local account map. Ids are handed out sequentially from 1.
#[derive(Debug, Default)]
pub struct InMemoryUserDatabase {
    storage: HashMap<String, Account>,
}

impl InMemoryUserDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

#[async_trait]
impl UserDatabase for InMemoryUserDatabase {
    async fn create_user(
        &mut self,
        username: &Username,
        hashed_password: &HashedPassword,
    ) -> Result<Account, AuthError> {
        if self.storage.contains_key(&username.0) {
            return Err(AuthError::UsernameAlreadyTaken);
        }

        let account = Account {
            id: UserID(self.storage.len() as u64 + 1),
            username: username.clone(),
            hashed_password: hashed_password.clone(),
        };
        self.storage.insert(username.0.clone(), account.clone());

        Ok(account)
    }

    async fn find_user(&self, username: &Username) -> Result<Option<Account>, AuthError> {
        Ok(self.storage.get(&username.0).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;

    fn name(s: &str) -> Username {
        Username(s.into())
    }

    fn hash(s: &str) -> HashedPassword {
        HashedPassword(s.into())
    }

    #[tokio::test]
    async fn create_then_find() {
        let mut db = InMemoryUserDatabase::new();

        let alice = db.create_user(&name("alice"), &hash("h1")).await.unwrap();
        let bob = db.create_user(&name("bob"), &hash("h2")).await.unwrap();

        assert_eq!(alice.id, UserID(1));
        assert_eq!(bob.id, UserID(2));

        let found = db.find_user(&name("alice")).await.unwrap().unwrap();
        assert_eq!(found.id, alice.id);
        assert_eq!(found.hashed_password, hash("h1"));
        assert!(db.find_user(&name("carol")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected_and_original_kept() {
        let mut db = InMemoryUserDatabase::new();
        db.create_user(&name("alice"), &hash("h1")).await.unwrap();

        let err = db.create_user(&name("alice"), &hash("h2")).await.unwrap_err();
        assert!(matches!(err, AuthError::UsernameAlreadyTaken));

        let found = db.find_user(&name("alice")).await.unwrap().unwrap();
        assert_eq!(found.hashed_password, hash("h1"));
        assert_eq!(db.len(), 1);
    }

    #[tokio::test]
    async fn usernames_are_case_sensitive() {
        let mut db = InMemoryUserDatabase::new();
        db.create_user(&name("alice"), &hash("h1")).await.unwrap();

        assert!(db.create_user(&name("Alice"), &hash("h2")).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_registrations_only_one_wins() {
        let db: Arc<Mutex<dyn UserDatabase>> = Arc::new(Mutex::new(InMemoryUserDatabase::new()));

        let attempts = (0..16).map(|i| {
            let db = db.clone();
            tokio::spawn(async move {
                db.lock()
                    .await
                    .create_user(&name("alice"), &hash(&format!("h{i}")))
                    .await
            })
        });

        let mut created = 0;
        for attempt in attempts.collect::<Vec<_>>() {
            match attempt.await.unwrap() {
                Ok(_) => created += 1,
                Err(AuthError::UsernameAlreadyTaken) => {}
                Err(other) => panic!("unexpected error {other}"),
            }
        }

        assert_eq!(created, 1);
    }
}
