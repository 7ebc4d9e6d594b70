//! Execution lifecycle operations.
//!
//! Status writes follow the execution state machine:
//! `pending → running → {completed, failed, cancelled}` and
//! `pending → {failed, cancelled}`. Rewriting the current status is an
//! idempotent no-op; every other backwards or sideways write is rejected.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    format_datetime, now, parse_datetime, parse_map, parse_optional_datetime, parse_status,
    parse_uuid, to_json,
};
use crate::{
    models::{ExecutionRow, ExecutionStatus, ExecutionUpdate, NewExecution},
    DbError, DbPool,
};

const EXECUTION_COLUMNS: &str = "id, workflow_id, status, trigger_type, triggered_by, variables, \
     created_at, started_at, completed_at, duration_ms, output, error_message";

fn execution_from_row(row: &SqliteRow) -> Result<ExecutionRow, DbError> {
    let id: String = row.try_get("id")?;
    let workflow_id: String = row.try_get("workflow_id")?;
    let status: String = row.try_get("status")?;
    let trigger_type: String = row.try_get("trigger_type")?;
    let variables: String = row.try_get("variables")?;
    let created_at: String = row.try_get("created_at")?;
    let output: String = row.try_get("output")?;

    Ok(ExecutionRow {
        id: parse_uuid(&id)?,
        workflow_id: parse_uuid(&workflow_id)?,
        status: parse_status(&status)?,
        trigger_type: parse_status(&trigger_type)?,
        triggered_by: row.try_get("triggered_by")?,
        variables: parse_map(&variables)?,
        created_at: parse_datetime(&created_at)?,
        started_at: parse_optional_datetime(row.try_get("started_at")?)?,
        completed_at: parse_optional_datetime(row.try_get("completed_at")?)?,
        duration_ms: row.try_get("duration_ms")?,
        output: parse_map(&output)?,
        error_message: row.try_get("error_message")?,
    })
}

async fn fetch_execution<'e, E>(executor: E, id: Uuid) -> Result<ExecutionRow, DbError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| DbError::not_found("execution", id))?;

    execution_from_row(&row)
}

/// Create a `pending` execution for an existing workflow.
///
/// # Errors
/// `DbError::NotFound` if the workflow does not exist.
pub async fn create_execution(pool: &DbPool, new: NewExecution) -> Result<ExecutionRow, DbError> {
    let mut tx = pool.writer.begin().await?;

    let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM workflows WHERE id = ?")
        .bind(new.workflow_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
    if exists.is_none() {
        return Err(DbError::not_found("workflow", new.workflow_id));
    }

    let row = ExecutionRow {
        id: Uuid::new_v4(),
        workflow_id: new.workflow_id,
        status: ExecutionStatus::Pending,
        trigger_type: new.trigger_type,
        triggered_by: new.triggered_by,
        variables: new.variables,
        created_at: now(),
        started_at: None,
        completed_at: None,
        duration_ms: None,
        output: Default::default(),
        error_message: None,
    };

    sqlx::query(
        r#"
        INSERT INTO executions
            (id, workflow_id, status, trigger_type, triggered_by, variables, created_at, output)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.id.to_string())
    .bind(row.workflow_id.to_string())
    .bind(row.status.as_str())
    .bind(row.trigger_type.as_str())
    .bind(&row.triggered_by)
    .bind(to_json(&row.variables)?)
    .bind(format_datetime(&row.created_at))
    .bind(to_json(&row.output)?)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    debug!("created execution {} for workflow {}", row.id, row.workflow_id);
    Ok(row)
}

/// Apply a status transition, stamping `started_at` on entry to `running`
/// and `completed_at`/`duration_ms` on entry to a terminal state. Runs that
/// never started measure their duration from `created_at`.
///
/// # Errors
/// - `DbError::NotFound` if the execution does not exist.
/// - `DbError::ConstraintViolation` for an illegal transition.
pub async fn update_execution_status(
    pool: &DbPool,
    id: Uuid,
    update: ExecutionUpdate,
) -> Result<ExecutionRow, DbError> {
    let mut tx = pool.writer.begin().await?;
    let current = fetch_execution(&mut *tx, id).await?;

    if current.status == update.status {
        debug!("execution {} already {}, ignoring write", id, update.status);
        return Ok(current);
    }

    if !current.status.can_transition_to(update.status) {
        warn!("rejected execution {} transition {} -> {}", id, current.status, update.status);
        return Err(DbError::ConstraintViolation(format!(
            "execution {id} cannot move from {} to {}",
            current.status, update.status
        )));
    }

    let timestamp = now();
    let mut next = current;
    next.status = update.status;
    if update.status == ExecutionStatus::Running {
        next.started_at = Some(timestamp);
    }
    if update.status.is_terminal() {
        next.completed_at = Some(timestamp);
        let from = next.started_at.unwrap_or(next.created_at);
        next.duration_ms = Some((timestamp - from).num_milliseconds().max(0));
    }
    if let Some(output) = update.output {
        next.output = output;
    }
    if update.error_message.is_some() {
        next.error_message = update.error_message;
    }

    sqlx::query(
        r#"
        UPDATE executions
        SET status = ?, started_at = ?, completed_at = ?, duration_ms = ?,
            output = ?, error_message = ?
        WHERE id = ?
        "#,
    )
    .bind(next.status.as_str())
    .bind(next.started_at.as_ref().map(format_datetime))
    .bind(next.completed_at.as_ref().map(format_datetime))
    .bind(next.duration_ms)
    .bind(to_json(&next.output)?)
    .bind(&next.error_message)
    .bind(id.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    info!("execution {} -> {}", id, next.status);
    Ok(next)
}

/// Fetch a single execution by its primary key.
pub async fn get_execution(pool: &DbPool, id: Uuid) -> Result<ExecutionRow, DbError> {
    fetch_execution(&pool.reader, id).await
}

/// Return executions newest first, optionally limited to one workflow.
pub async fn list_executions(
    pool: &DbPool,
    workflow_id: Option<Uuid>,
) -> Result<Vec<ExecutionRow>, DbError> {
    let rows = match workflow_id {
        Some(workflow_id) => {
            let sql = format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions WHERE workflow_id = ? \
                 ORDER BY created_at DESC, rowid DESC"
            );
            sqlx::query(&sql)
                .bind(workflow_id.to_string())
                .fetch_all(&pool.reader)
                .await?
        }
        None => {
            let sql = format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions ORDER BY created_at DESC, rowid DESC"
            );
            sqlx::query(&sql).fetch_all(&pool.reader).await?
        }
    };

    rows.iter().map(execution_from_row).collect()
}

/// Executions still `pending` or `running`, oldest first.
pub async fn list_unfinished_executions(pool: &DbPool) -> Result<Vec<ExecutionRow>, DbError> {
    let sql = format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions WHERE status IN ('pending', 'running') \
         ORDER BY created_at ASC, rowid ASC"
    );
    let rows = sqlx::query(&sql).fetch_all(&pool.reader).await?;
    rows.iter().map(execution_from_row).collect()
}
