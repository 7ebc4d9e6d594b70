//! Task records: one row per TaskDef instance inside an execution.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    format_datetime, now, parse_datetime, parse_map, parse_optional_datetime, parse_status,
    parse_uuid, to_json, to_u32,
};
use crate::{
    models::{ExecutionStatus, NewTask, TaskRow, TaskStatus, TaskUpdate},
    DbError, DbPool,
};

const TASK_COLUMNS: &str = "id, execution_id, position, name, agent_type, action, parameters, \
     status, retry_count, queued_at, started_at, completed_at, output, error_message";

fn task_from_row(row: &SqliteRow) -> Result<TaskRow, DbError> {
    let id: String = row.try_get("id")?;
    let execution_id: String = row.try_get("execution_id")?;
    let position: i64 = row.try_get("position")?;
    let parameters: String = row.try_get("parameters")?;
    let status: String = row.try_get("status")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let queued_at: String = row.try_get("queued_at")?;
    let output: Option<String> = row.try_get("output")?;

    Ok(TaskRow {
        id: parse_uuid(&id)?,
        execution_id: parse_uuid(&execution_id)?,
        position: to_u32(position, "position")?,
        name: row.try_get("name")?,
        agent_type: row.try_get("agent_type")?,
        action: row.try_get("action")?,
        parameters: parse_map(&parameters)?,
        status: parse_status(&status)?,
        retry_count: to_u32(retry_count, "retry_count")?,
        queued_at: parse_datetime(&queued_at)?,
        started_at: parse_optional_datetime(row.try_get("started_at")?)?,
        completed_at: parse_optional_datetime(row.try_get("completed_at")?)?,
        output: output.as_deref().map(parse_map).transpose()?,
        error_message: row.try_get("error_message")?,
    })
}

async fn fetch_task<'e, E>(executor: E, id: Uuid) -> Result<TaskRow, DbError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| DbError::not_found("task", id))?;

    task_from_row(&row)
}

/// Insert a `queued` task for an existing, unfinished execution.
///
/// # Errors
/// `NotFound` for an unknown execution, `ConstraintViolation` when the
/// execution is already terminal.
pub async fn create_task(pool: &DbPool, new: NewTask) -> Result<TaskRow, DbError> {
    let mut tx = pool.writer.begin().await?;

    let parent: Option<(String,)> = sqlx::query_as("SELECT status FROM executions WHERE id = ?")
        .bind(new.execution_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
    let Some((status,)) = parent else {
        return Err(DbError::not_found("execution", new.execution_id));
    };
    let status: ExecutionStatus = parse_status(&status)?;
    if status.is_terminal() {
        return Err(DbError::ConstraintViolation(format!(
            "execution {} is already {status}; task '{}' not created",
            new.execution_id, new.name
        )));
    }

    let row = TaskRow {
        id: Uuid::new_v4(),
        execution_id: new.execution_id,
        position: new.position,
        name: new.name,
        agent_type: new.agent_type,
        action: new.action,
        parameters: new.parameters,
        status: TaskStatus::Queued,
        retry_count: 0,
        queued_at: now(),
        started_at: None,
        completed_at: None,
        output: None,
        error_message: None,
    };

    sqlx::query(
        r#"
        INSERT INTO tasks
            (id, execution_id, position, name, agent_type, action, parameters,
             status, retry_count, queued_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(row.id.to_string())
    .bind(row.execution_id.to_string())
    .bind(i64::from(row.position))
    .bind(&row.name)
    .bind(&row.agent_type)
    .bind(&row.action)
    .bind(to_json(&row.parameters)?)
    .bind(row.status.as_str())
    .bind(format_datetime(&row.queued_at))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    debug!("queued task '{}' ({}) for execution {}", row.name, row.id, row.execution_id);
    Ok(row)
}

/// Apply a task status write.
///
/// `running → running` is how retry attempts are recorded: only
/// `retry_count` moves, and it may never decrease. Terminal tasks accept
/// only an identical-status write, which is a no-op.
pub async fn update_task(pool: &DbPool, id: Uuid, update: TaskUpdate) -> Result<TaskRow, DbError> {
    let mut tx = pool.writer.begin().await?;
    let current = fetch_task(&mut *tx, id).await?;

    if current.status.is_terminal() && current.status == update.status {
        debug!("task {} already {}, ignoring write", id, update.status);
        return Ok(current);
    }

    if !current.status.can_transition_to(update.status) {
        warn!("rejected task {} transition {} -> {}", id, current.status, update.status);
        return Err(DbError::ConstraintViolation(format!(
            "task {id} cannot move from {} to {}",
            current.status, update.status
        )));
    }

    let retry_count = update.retry_count.unwrap_or(current.retry_count);
    if retry_count < current.retry_count {
        return Err(DbError::ConstraintViolation(format!(
            "task {id} retry_count cannot decrease from {} to {retry_count}",
            current.retry_count
        )));
    }

    let timestamp = now();
    let mut next = current;
    if next.status == TaskStatus::Queued && update.status != TaskStatus::Queued {
        next.started_at = Some(timestamp);
    }
    if update.status.is_terminal() {
        next.completed_at = Some(timestamp);
    }
    next.status = update.status;
    next.retry_count = retry_count;
    if update.output.is_some() {
        next.output = update.output;
    }
    if update.error_message.is_some() {
        next.error_message = update.error_message;
    }

    sqlx::query(
        r#"
        UPDATE tasks
        SET status = ?, retry_count = ?, started_at = ?, completed_at = ?,
            output = ?, error_message = ?
        WHERE id = ?
        "#,
    )
    .bind(next.status.as_str())
    .bind(i64::from(next.retry_count))
    .bind(next.started_at.as_ref().map(format_datetime))
    .bind(next.completed_at.as_ref().map(format_datetime))
    .bind(next.output.as_ref().map(to_json).transpose()?)
    .bind(&next.error_message)
    .bind(id.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    debug!("task {} -> {} (retry_count {})", id, next.status, next.retry_count);
    Ok(next)
}

/// Fetch a single task by its primary key.
pub async fn get_task(pool: &DbPool, id: Uuid) -> Result<TaskRow, DbError> {
    fetch_task(&pool.reader, id).await
}

/// All tasks of an execution in definition order.
pub async fn list_tasks_by_execution(pool: &DbPool, execution_id: Uuid) -> Result<Vec<TaskRow>, DbError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE execution_id = ? ORDER BY position ASC, queued_at ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(execution_id.to_string())
        .fetch_all(&pool.reader)
        .await?;

    rows.iter().map(task_from_row).collect()
}
