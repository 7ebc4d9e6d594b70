//! Workflow CRUD operations.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use super::{format_datetime, now, parse_datetime, parse_status, parse_uuid, to_u32};
use crate::{
    models::{NewWorkflowRow, WorkflowRow, WorkflowStatus},
    DbError, DbPool,
};

const WORKFLOW_COLUMNS: &str = "id, name, definition, owner_id, status, timeout_seconds, \
     max_retries, cron_schedule, created_at, updated_at";

fn workflow_from_row(row: &SqliteRow) -> Result<WorkflowRow, DbError> {
    let id: String = row.try_get("id")?;
    let definition: String = row.try_get("definition")?;
    let status: String = row.try_get("status")?;
    let timeout_seconds: i64 = row.try_get("timeout_seconds")?;
    let max_retries: i64 = row.try_get("max_retries")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(WorkflowRow {
        id: parse_uuid(&id)?,
        name: row.try_get("name")?,
        definition: serde_json::from_str(&definition)?,
        owner_id: row.try_get("owner_id")?,
        status: parse_status(&status)?,
        timeout_seconds: u64::try_from(timeout_seconds)
            .map_err(|_| DbError::Corrupt(format!("timeout_seconds out of range: {timeout_seconds}")))?,
        max_retries: to_u32(max_retries, "max_retries")?,
        cron_schedule: row.try_get("cron_schedule")?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

/// Insert a new workflow into the database.
///
/// `definition` must be a valid JSON object produced by serialising the
/// domain workflow definition from the `engine` crate.
pub async fn create_workflow(pool: &DbPool, new: NewWorkflowRow) -> Result<WorkflowRow, DbError> {
    let timestamp = now();
    let row = WorkflowRow {
        id: Uuid::new_v4(),
        name: new.name,
        definition: new.definition,
        owner_id: new.owner_id,
        status: WorkflowStatus::Active,
        timeout_seconds: new.timeout_seconds,
        max_retries: new.max_retries,
        cron_schedule: new.cron_schedule,
        created_at: timestamp,
        updated_at: timestamp,
    };

    let timeout_seconds = i64::try_from(row.timeout_seconds).map_err(|_| {
        DbError::ConstraintViolation(format!("timeout_seconds too large: {}", row.timeout_seconds))
    })?;

    sqlx::query(
        r#"
        INSERT INTO workflows
            (id, name, definition, owner_id, status, timeout_seconds, max_retries,
             cron_schedule, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.id.to_string())
    .bind(&row.name)
    .bind(serde_json::to_string(&row.definition)?)
    .bind(&row.owner_id)
    .bind(row.status.as_str())
    .bind(timeout_seconds)
    .bind(i64::from(row.max_retries))
    .bind(&row.cron_schedule)
    .bind(format_datetime(&row.created_at))
    .bind(format_datetime(&row.updated_at))
    .execute(&pool.writer)
    .await?;

    info!("created workflow '{}' ({})", row.name, row.id);
    Ok(row)
}

/// Fetch a single workflow by its primary key.
pub async fn get_workflow(pool: &DbPool, id: Uuid) -> Result<WorkflowRow, DbError> {
    let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&pool.reader)
        .await?
        .ok_or_else(|| DbError::not_found("workflow", id))?;

    workflow_from_row(&row)
}

/// Return workflows ordered by creation time (newest first), optionally
/// restricted to one owner.
pub async fn list_workflows(pool: &DbPool, owner_id: Option<&str>) -> Result<Vec<WorkflowRow>, DbError> {
    let rows = match owner_id {
        Some(owner) => {
            let sql = format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE owner_id = ? \
                 ORDER BY created_at DESC, rowid DESC"
            );
            sqlx::query(&sql).bind(owner).fetch_all(&pool.reader).await?
        }
        None => {
            let sql = format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY created_at DESC, rowid DESC"
            );
            sqlx::query(&sql).fetch_all(&pool.reader).await?
        }
    };

    rows.iter().map(workflow_from_row).collect()
}

/// Archive or reactivate a workflow. Archived workflows cannot be executed.
pub async fn set_workflow_status(
    pool: &DbPool,
    id: Uuid,
    status: WorkflowStatus,
) -> Result<WorkflowRow, DbError> {
    let result = sqlx::query("UPDATE workflows SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(format_datetime(&now()))
        .bind(id.to_string())
        .execute(&pool.writer)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("workflow", id));
    }

    debug!("workflow {} is now {}", id, status);
    get_workflow(pool, id).await
}

/// Permanently delete a workflow, its executions and their tasks.
///
/// # Errors
/// - `DbError::NotFound` if no such workflow exists.
/// - `DbError::ConstraintViolation` while a pending or running execution
///   still references it.
pub async fn delete_workflow(pool: &DbPool, id: Uuid) -> Result<(), DbError> {
    let mut tx = pool.writer.begin().await?;

    let (active,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM executions WHERE workflow_id = ? AND status IN ('pending', 'running')",
    )
    .bind(id.to_string())
    .fetch_one(&mut *tx)
    .await?;

    if active > 0 {
        return Err(DbError::ConstraintViolation(format!(
            "workflow {id} has {active} unfinished execution(s)"
        )));
    }

    let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("workflow", id));
    }

    tx.commit().await?;
    info!("deleted workflow {}", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionStatus, ExecutionUpdate, NewExecution};
    use crate::pool::create_in_memory_pool;
    use crate::repository::executions;
    use serde_json::json;

    fn sample_workflow(name: &str, owner: &str) -> NewWorkflowRow {
        NewWorkflowRow {
            name: name.into(),
            definition: json!({ "tasks": [{ "name": "a", "agent_type": "echo", "action": "echo" }] }),
            owner_id: owner.into(),
            timeout_seconds: 60,
            max_retries: 2,
            cron_schedule: Some("*/5 * * * *".into()),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips_every_column() {
        let pool = create_in_memory_pool().await.unwrap();
        let created = create_workflow(&pool, sample_workflow("nightly", "alice")).await.unwrap();

        let fetched = get_workflow(&pool, created.id).await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.status, WorkflowStatus::Active);
    }

    #[tokio::test]
    async fn list_filters_by_owner_newest_first() {
        let pool = create_in_memory_pool().await.unwrap();
        let first = create_workflow(&pool, sample_workflow("one", "alice")).await.unwrap();
        let second = create_workflow(&pool, sample_workflow("two", "alice")).await.unwrap();
        create_workflow(&pool, sample_workflow("three", "bob")).await.unwrap();

        let all = list_workflows(&pool, None).await.unwrap();
        assert_eq!(all.len(), 3);

        let alice: Vec<Uuid> = list_workflows(&pool, Some("alice"))
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(alice, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn get_missing_workflow_is_not_found() {
        let pool = create_in_memory_pool().await.unwrap();
        let err = get_workflow(&pool, Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn archive_updates_status() {
        let pool = create_in_memory_pool().await.unwrap();
        let wf = create_workflow(&pool, sample_workflow("w", "o")).await.unwrap();
        let archived = set_workflow_status(&pool, wf.id, WorkflowStatus::Archived).await.unwrap();
        assert_eq!(archived.status, WorkflowStatus::Archived);
        assert!(archived.updated_at >= wf.updated_at);
    }

    #[tokio::test]
    async fn delete_is_refused_while_an_execution_is_unfinished() {
        let pool = create_in_memory_pool().await.unwrap();
        let wf = create_workflow(&pool, sample_workflow("w", "o")).await.unwrap();
        let exec = executions::create_execution(
            &pool,
            NewExecution { workflow_id: wf.id, ..Default::default() },
        )
        .await
        .unwrap();

        assert!(matches!(
            delete_workflow(&pool, wf.id).await,
            Err(DbError::ConstraintViolation(_))
        ));

        executions::update_execution_status(&pool, exec.id, ExecutionUpdate::status(ExecutionStatus::Cancelled))
            .await
            .unwrap();
        delete_workflow(&pool, wf.id).await.unwrap();

        assert!(get_workflow(&pool, wf.id).await.unwrap_err().is_not_found());
        assert!(executions::get_execution(&pool, exec.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_missing_workflow_is_not_found() {
        let pool = create_in_memory_pool().await.unwrap();
        assert!(delete_workflow(&pool, Uuid::new_v4()).await.unwrap_err().is_not_found());
    }
}
