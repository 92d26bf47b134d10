//! Project-scoped, append-only change log with overlap supersede.
//!
//! For a given project and address at most one live record exists per
//! kind-equivalence class. [`Store::append`] deletes the conflicting records
//! and inserts the new one inside one transaction, under the project's write
//! lock, so readers never see a duplicate or a gap at that address.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use marksync_core::{Address, ChangeId, ChangeKind, ChangeRecord, Project, UserName};

use crate::db::Store;
use crate::error::StoreError;

impl Store {
    /// Supersede-then-insert. Returns the stored record with its new id.
    pub async fn append(
        &self,
        project: &Project,
        user: &UserName,
        kind: ChangeKind,
        address: Address,
        payload: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<ChangeRecord, StoreError> {
        let lock = self.project_lock(project.id);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        // Writing first takes the database write lock up front.
        let id: Option<i64> = sqlx::query_scalar(
            "UPDATE projects SET next_change_id = next_change_id + 1 WHERE id = ? \
             RETURNING next_change_id - 1",
        )
        .bind(project.id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(id) = id else {
            return Err(StoreError::ProjectNotFound(project.name.clone()));
        };

        let class = self.classes.class_of(kind);
        let placeholders = vec!["?"; class.len()].join(", ");
        let sql = format!(
            "DELETE FROM changes WHERE project_id = ? AND address = ? AND kind IN ({placeholders})"
        );
        let mut delete = sqlx::query(&sql).bind(project.id.0).bind(address.0 as i64);
        for member in &class {
            delete = delete.bind(i64::from(member.code()));
        }
        let superseded = delete.execute(&mut *tx).await?.rows_affected();

        sqlx::query(
            r#"
            INSERT INTO changes (project_id, id, user_name, created_at, address, kind, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project.id.0)
        .bind(id)
        .bind(user.as_str())
        .bind(timestamp.timestamp_millis())
        .bind(address.0 as i64)
        .bind(i64::from(kind.code()))
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            project = %project.name,
            user = %user,
            change_id = id,
            kind = %kind,
            address = %address,
            superseded,
            "change appended"
        );

        Ok(ChangeRecord {
            id: ChangeId(id as u64),
            project: project.id,
            user: user.clone(),
            timestamp: DateTime::from_timestamp_millis(timestamp.timestamp_millis())
                .unwrap_or(timestamp),
            address,
            kind,
            payload: payload.to_owned(),
        })
    }

    /// All live records with id > `cursor`, ascending, across all users.
    pub async fn list_since(
        &self,
        project: &Project,
        cursor: ChangeId,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, user_name, created_at, address, kind, payload
            FROM changes
            WHERE project_id = ? AND id > ?
            ORDER BY id ASC
            "#,
        )
        .bind(project.id.0)
        .bind(cursor.0 as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Every live record of the project, ordered by id.
    pub async fn live_records(&self, project: &Project) -> Result<Vec<ChangeRecord>, StoreError> {
        self.list_since(project, ChangeId::ZERO).await
    }
}

fn record_from_row(row: &SqliteRow) -> Result<ChangeRecord, StoreError> {
    let id: i64 = row.try_get("id")?;
    let created: i64 = row.try_get("created_at")?;
    let address: i64 = row.try_get("address")?;
    let kind: i64 = row.try_get("kind")?;
    Ok(ChangeRecord {
        id: ChangeId(id as u64),
        project: marksync_core::ProjectId(row.try_get("project_id")?),
        user: UserName(row.try_get("user_name")?),
        timestamp: DateTime::from_timestamp_millis(created).unwrap_or_default(),
        address: Address(address as u64),
        kind: ChangeKind::from_code(kind as u32),
        payload: row.try_get("payload")?,
    })
}
