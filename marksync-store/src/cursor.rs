//! Per (project, user) cursor: the last change id the user has consumed.
//!
//! Cursors live in their own table, apart from the change records, and only
//! ever move forward.

use chrono::Utc;
use tracing::warn;

use marksync_core::{ChangeId, Project, UserName};

use crate::db::Store;
use crate::error::StoreError;

/// Outcome of [`Store::set_cursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorUpdate {
    /// Stored value moved forward (or was created).
    Advanced,
    /// Stored value already equals the requested id.
    Unchanged,
    /// Requested id is behind the stored one; nothing written.
    Rejected { stored: ChangeId },
}

impl Store {
    /// Last consumed change id, or `None` for a user new to the project.
    pub async fn cursor(
        &self,
        project: &Project,
        user: &UserName,
    ) -> Result<Option<ChangeId>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT last_change_id FROM cursors WHERE project_id = ? AND user_name = ?",
        )
        .bind(project.id.0)
        .bind(user.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(|id| ChangeId(id as u64)))
    }

    /// Idempotent, monotonic upsert.
    pub async fn set_cursor(
        &self,
        project: &Project,
        user: &UserName,
        id: ChangeId,
    ) -> Result<CursorUpdate, StoreError> {
        let written = sqlx::query(
            r#"
            INSERT INTO cursors (project_id, user_name, last_change_id, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (project_id, user_name) DO UPDATE
                SET last_change_id = excluded.last_change_id,
                    updated_at = excluded.updated_at
                WHERE excluded.last_change_id > cursors.last_change_id
            "#,
        )
        .bind(project.id.0)
        .bind(user.as_str())
        .bind(id.0 as i64)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if written > 0 {
            return Ok(CursorUpdate::Advanced);
        }

        let stored = self.cursor(project, user).await?.unwrap_or(ChangeId::ZERO);
        if stored > id {
            warn!(
                project = %project.name,
                user = %user,
                stored = %stored,
                requested = %id,
                "ignoring cursor update that would move backwards"
            );
            return Ok(CursorUpdate::Rejected { stored });
        }
        Ok(CursorUpdate::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marksync_core::{KindClasses, ProjectName};

    async fn setup() -> (Store, Project, UserName) {
        let store = Store::in_memory(KindClasses::default()).await.unwrap();
        let project = store
            .create_project(&ProjectName::from("bootrom"))
            .await
            .unwrap();
        (store, project, UserName::from("alice"))
    }

    #[tokio::test]
    async fn new_user_has_no_cursor() {
        let (store, project, user) = setup().await;
        assert_eq!(store.cursor(&project, &user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cursor_only_moves_forward() {
        let (store, project, user) = setup().await;
        assert_eq!(
            store.set_cursor(&project, &user, ChangeId(5)).await.unwrap(),
            CursorUpdate::Advanced
        );
        assert_eq!(
            store.set_cursor(&project, &user, ChangeId(5)).await.unwrap(),
            CursorUpdate::Unchanged
        );
        assert_eq!(
            store.set_cursor(&project, &user, ChangeId(3)).await.unwrap(),
            CursorUpdate::Rejected {
                stored: ChangeId(5)
            }
        );
        assert_eq!(
            store.set_cursor(&project, &user, ChangeId(8)).await.unwrap(),
            CursorUpdate::Advanced
        );
        assert_eq!(
            store.cursor(&project, &user).await.unwrap(),
            Some(ChangeId(8))
        );
    }

    #[tokio::test]
    async fn cursors_are_per_user_and_project() {
        let (store, project, alice) = setup().await;
        let other = store
            .create_project(&ProjectName::from("kernel"))
            .await
            .unwrap();
        let bob = UserName::from("bob");

        store.set_cursor(&project, &alice, ChangeId(4)).await.unwrap();
        store.set_cursor(&other, &alice, ChangeId(9)).await.unwrap();

        assert_eq!(store.cursor(&project, &alice).await.unwrap(), Some(ChangeId(4)));
        assert_eq!(store.cursor(&other, &alice).await.unwrap(), Some(ChangeId(9)));
        assert_eq!(store.cursor(&project, &bob).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cursor_is_not_a_change_record() {
        let (store, project, user) = setup().await;
        store.set_cursor(&project, &user, ChangeId(2)).await.unwrap();
        assert!(store.live_records(&project).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropping_project_removes_cursors() {
        let (store, project, user) = setup().await;
        store.set_cursor(&project, &user, ChangeId(2)).await.unwrap();
        store.drop_project(&project.name).await.unwrap();
        let recreated = store.create_project(&project.name).await.unwrap();
        assert_eq!(store.cursor(&recreated, &user).await.unwrap(), None);
    }
}
