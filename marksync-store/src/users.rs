//! User table and the credential check used by the handshake.
//!
//! Passwords are stored as `sha256("<name>:<password>")` in hex.

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::Row;
use tracing::info;

use marksync_core::UserName;

use crate::db::Store;
use crate::error::StoreError;

/// `validate(user, pass)` capability consumed by sessions.
#[async_trait]
pub trait Credentials: Send + Sync {
    async fn validate(&self, user: &UserName, credential: &str) -> Result<bool, StoreError>;
}

/// One row of `user list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub name: UserName,
    pub real_name: Option<String>,
}

fn password_hash(user: &UserName, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

impl Store {
    pub async fn add_user(
        &self,
        user: &UserName,
        password: &str,
        real_name: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO users (name, password_hash, real_name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user.as_str())
        .bind(password_hash(user, password))
        .bind(real_name)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!(user = %user, "user added");
                Ok(())
            }
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(StoreError::UserExists(user.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn remove_user(&self, user: &UserName) -> Result<(), StoreError> {
        let removed = sqlx::query("DELETE FROM users WHERE name = ?")
            .bind(user.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(StoreError::UserNotFound(user.clone()));
        }
        info!(user = %user, "user removed");
        Ok(())
    }

    pub async fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
        let rows = sqlx::query("SELECT name, real_name FROM users ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| -> Result<UserSummary, StoreError> {
                Ok(UserSummary {
                    name: UserName(row.try_get("name")?),
                    real_name: row.try_get("real_name")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Credentials for Store {
    async fn validate(&self, user: &UserName, credential: &str) -> Result<bool, StoreError> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT password_hash FROM users WHERE name = ?")
                .bind(user.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(stored.is_some_and(|hash| hash == password_hash(user, credential)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marksync_core::KindClasses;

    #[tokio::test]
    async fn validate_checks_password() {
        let store = Store::in_memory(KindClasses::default()).await.unwrap();
        let alice = UserName::from("alice");
        store.add_user(&alice, "hunter2", Some("Alice")).await.unwrap();

        assert!(store.validate(&alice, "hunter2").await.unwrap());
        assert!(!store.validate(&alice, "hunter3").await.unwrap());
        assert!(!store
            .validate(&UserName::from("mallory"), "hunter2")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn duplicate_and_missing_users() {
        let store = Store::in_memory(KindClasses::default()).await.unwrap();
        let bob = UserName::from("bob");
        store.add_user(&bob, "pw", None).await.unwrap();
        assert!(matches!(
            store.add_user(&bob, "pw", None).await.unwrap_err(),
            StoreError::UserExists(_)
        ));

        store.remove_user(&bob).await.unwrap();
        assert!(matches!(
            store.remove_user(&bob).await.unwrap_err(),
            StoreError::UserNotFound(_)
        ));
        assert!(store.list_users().await.unwrap().is_empty());
    }

    #[test]
    fn hash_is_salted_by_user_name() {
        assert_ne!(
            password_hash(&UserName::from("a"), "pw"),
            password_hash(&UserName::from("b"), "pw")
        );
        assert_eq!(password_hash(&UserName::from("a"), "pw").len(), 64);
    }
}
