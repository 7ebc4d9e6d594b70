//! Workflow validation: run this before persisting or executing a workflow.
//!
//! Rules enforced:
//! 1. The workflow has a name and at least one task.
//! 2. Task names are unique, non-empty, made of `[A-Za-z0-9_-]`, and not `input`.
//! 3. Every task names an agent type and an action.
//! 4. Workflow and task timeouts are positive.
//! 5. `${...}` references are well formed and only name tasks declared earlier.
//! 6. A cron schedule, when present, parses as a 5- or 6-field expression.

use std::collections::HashSet;

use crate::{
    models::WorkflowDefinition,
    variables::{is_valid_name, references_in, INPUT_ROOT},
    EngineError,
};

pub fn validate_workflow(
    name: &str,
    definition: &WorkflowDefinition,
    timeout_seconds: u64,
    cron_schedule: Option<&str>,
) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::EmptyName);
    }
    if definition.tasks.is_empty() {
        return Err(EngineError::EmptyWorkflow);
    }
    if timeout_seconds == 0 {
        return Err(EngineError::InvalidTimeout { subject: "workflow".into() });
    }
    if let Some(expression) = cron_schedule {
        validate_cron(expression)?;
    }

    let mut declared: HashSet<&str> = HashSet::new();
    for task in &definition.tasks {
        if !is_valid_name(&task.name) {
            return Err(EngineError::InvalidTaskName(task.name.clone()));
        }
        if task.name == INPUT_ROOT {
            return Err(EngineError::ReservedTaskName(task.name.clone()));
        }
        if declared.contains(task.name.as_str()) {
            return Err(EngineError::DuplicateTaskName(task.name.clone()));
        }
        if task.agent_type.trim().is_empty() {
            return Err(EngineError::MissingField { task: task.name.clone(), field: "agent_type" });
        }
        if task.action.trim().is_empty() {
            return Err(EngineError::MissingField { task: task.name.clone(), field: "action" });
        }
        if task.timeout_seconds == Some(0) {
            return Err(EngineError::InvalidTimeout { subject: format!("task '{}'", task.name) });
        }

        let parameters = serde_json::Value::Object(task.parameters.clone());
        let references = references_in(&parameters).map_err(|source| EngineError::InvalidReference {
            task: task.name.clone(),
            source,
        })?;
        for reference in &references {
            if let Some(referenced) = reference.task() {
                if !declared.contains(referenced) {
                    return Err(EngineError::ForwardReference {
                        task: task.name.clone(),
                        referenced: referenced.to_owned(),
                    });
                }
            }
        }

        declared.insert(task.name.as_str());
    }

    Ok(())
}

/// Parse a 5-field (minute precision) or 6-field (leading seconds) cron
/// expression. Firing times are computed by the external scheduler.
pub fn validate_cron(expression: &str) -> Result<(), EngineError> {
    let invalid = |reason: String| EngineError::InvalidCronSchedule {
        expression: expression.to_owned(),
        reason,
    };

    let trimmed = expression.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed}"),
        6 => trimmed.to_owned(),
        n => return Err(invalid(format!("expected 5 or 6 fields, got {n}"))),
    };

    normalized
        .parse::<croner::Cron>()
        .map(|_| ())
        .map_err(|err| invalid(err.to_string()))
}
