//! Project catalogue: create / drop / list / lookup.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::info;

use marksync_core::{ChangeId, Project, ProjectId, ProjectName};

use crate::db::Store;
use crate::error::StoreError;

/// One row of `project list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSummary {
    pub project: Project,
    pub live_records: u64,
    pub next_change_id: ChangeId,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Create an empty project. Fails if the name is taken.
    pub async fn create_project(&self, name: &ProjectName) -> Result<Project, StoreError> {
        let result = sqlx::query("INSERT INTO projects (name, created_at) VALUES (?, ?)")
            .bind(name.as_str())
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) => {
                let project = Project {
                    id: ProjectId(done.last_insert_rowid()),
                    name: name.clone(),
                };
                info!(project = %name, id = %project.id, "project created");
                Ok(project)
            }
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(StoreError::ProjectExists(name.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a project together with all its change records and cursors.
    pub async fn drop_project(&self, name: &ProjectName) -> Result<(), StoreError> {
        let project = self
            .find_project(name)
            .await?
            .ok_or_else(|| StoreError::ProjectNotFound(name.clone()))?;

        let lock = self.project_lock(project.id);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM changes WHERE project_id = ?")
            .bind(project.id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM cursors WHERE project_id = ?")
            .bind(project.id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(project.id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.forget_project_lock(project.id);
        info!(project = %name, removed, "project dropped");
        Ok(())
    }

    /// Look up a live project by name.
    pub async fn find_project(&self, name: &ProjectName) -> Result<Option<Project>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM projects WHERE name = ?")
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(id.map(|id| Project {
            id: ProjectId(id),
            name: name.clone(),
        }))
    }

    /// All projects sorted by name, with live record counts.
    pub async fn list_projects(&self) -> Result<Vec<ProjectSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.name, p.next_change_id, p.created_at,
                   (SELECT COUNT(*) FROM changes c WHERE c.project_id = p.id) AS live_records
            FROM projects p
            ORDER BY p.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ProjectSummary, StoreError> {
                let name: String = row.try_get("name")?;
                let live: i64 = row.try_get("live_records")?;
                let next: i64 = row.try_get("next_change_id")?;
                let created: i64 = row.try_get("created_at")?;
                Ok(ProjectSummary {
                    project: Project {
                        id: ProjectId(row.try_get("id")?),
                        name: ProjectName(name),
                    },
                    live_records: live as u64,
                    next_change_id: ChangeId(next as u64),
                    created_at: DateTime::from_timestamp_millis(created).unwrap_or_default(),
                })
            })
            .collect()
    }
}
