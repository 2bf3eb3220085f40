// Job <-> hash field encoding
//
// Every job is one hash. Absent optional values are absent fields; JSON
// columns (payload, stages, error_details) are stored as JSON strings.

use cairn_core::domain::{Job, JobFailure, JobPayload, JobStatus, Transition};
use cairn_core::error::{AppError, Result};
use cairn_core::port::ProgressUpdate;
use std::collections::HashMap;

/// Field writes for one conditional update
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct FieldUpdate {
    pub set: Vec<(&'static str, String)>,
    pub clear: Vec<&'static str>,
}

impl FieldUpdate {
    fn set(&mut self, field: &'static str, value: impl ToString) {
        self.set.push((field, value.to_string()));
    }

    fn set_opt(&mut self, field: &'static str, value: Option<impl ToString>) {
        match value {
            Some(v) => self.set(field, v),
            None => self.clear.push(field),
        }
    }

    fn clear(&mut self, field: &'static str) {
        self.clear.push(field);
    }

    fn failure(&mut self, failure: &JobFailure) -> Result<()> {
        self.set("error_message", &failure.message);
        let details = failure
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.set_opt("error_details", details);
        Ok(())
    }

    /// Flattened script arguments: `n, field, value, ..., m, field, ...`
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(2 + self.set.len() * 2 + self.clear.len());
        args.push(self.set.len().to_string());
        for (field, value) in &self.set {
            args.push((*field).to_string());
            args.push(value.clone());
        }
        args.push(self.clear.len().to_string());
        args.extend(self.clear.iter().map(|f| (*f).to_string()));
        args
    }
}

/// Fields for a freshly inserted (or reset) row
pub(crate) fn job_fields(job: &Job) -> Result<Vec<(&'static str, String)>> {
    let mut update = FieldUpdate::default();
    update.set("id", &job.id);
    update.set("queue", &job.queue);
    update.set("dedup_key", &job.dedup_key);
    update.set_opt("job_type", job.job_type.as_ref());
    update.set("asset_id", &job.asset_id);
    update.set("user_id", &job.user_id);
    update.set("payload", serde_json::to_string(&job.payload)?);
    update.set("status", job.status.as_str());
    update.set("stages", serde_json::to_string(&job.stages)?);
    update.set_opt("current_stage", job.current_stage.as_ref());
    update.set("overall_progress", job.overall_progress);
    update.set_opt("error_message", job.error_message.as_ref());
    if let Some(details) = &job.error_details {
        update.set("error_details", serde_json::to_string(details)?);
    }
    update.set("retry_count", job.retry_count);
    update.set("max_retries", job.max_retries);
    update.set_opt("locked_by", job.locked_by.as_ref());
    update.set_opt("locked_at", job.locked_at);
    update.set_opt("expires_at", job.expires_at);
    update.set("scheduled_for", job.scheduled_for);
    update.set_opt("next_retry_at", job.next_retry_at);
    update.set("created_at", job.created_at);
    update.set("updated_at", job.updated_at);
    update.set_opt("completed_at", job.completed_at);
    Ok(update.set)
}

/// Field writes equivalent to `Job::apply(transition, now)`
pub(crate) fn transition_fields(transition: &Transition, now: i64) -> Result<FieldUpdate> {
    let mut update = FieldUpdate::default();
    match transition {
        Transition::Complete => {
            update.set("completed_at", now);
            update.clear("error_message");
            update.clear("error_details");
        }
        Transition::Retry {
            retry_count,
            retry_at,
            failure,
        } => {
            update.set("retry_count", retry_count);
            update.set("next_retry_at", retry_at);
            update.set("scheduled_for", retry_at);
            update.failure(failure)?;
        }
        Transition::Reschedule { run_at } => {
            update.set("scheduled_for", run_at);
            update.clear("next_retry_at");
        }
        Transition::Fail { failure } => {
            update.failure(failure)?;
        }
        Transition::Requeue { retry_count } => {
            update.set("retry_count", retry_count);
            update.set("scheduled_for", now);
            update.clear("next_retry_at");
            update.clear("completed_at");
            update.clear("error_message");
            update.clear("error_details");
        }
    }
    update.set("status", transition.target().as_str());
    update.clear("locked_by");
    update.clear("locked_at");
    update.clear("expires_at");
    update.set("updated_at", now);
    Ok(update)
}

pub(crate) fn progress_fields(progress: &ProgressUpdate, now: i64) -> Result<FieldUpdate> {
    let mut update = FieldUpdate::default();
    update.set("stages", serde_json::to_string(&progress.stages)?);
    update.set("overall_progress", progress.overall_progress);
    update.set_opt("current_stage", progress.current_stage.as_ref());
    if let Some(status) = progress.status {
        update.set("status", status.as_str());
    }
    if let Some(message) = &progress.error_message {
        update.set("error_message", message);
    }
    if let Some(completed_at) = progress.completed_at {
        update.set("completed_at", completed_at);
    }
    update.set("updated_at", now);
    Ok(update)
}

/// Decode an HGETALL reply
pub(crate) fn job_from_hash(mut fields: HashMap<String, String>) -> Result<Job> {
    let mut take = |name: &str| fields.remove(name);

    fn required(value: Option<String>, name: &str) -> Result<String> {
        value.ok_or_else(|| AppError::Internal(format!("job hash missing field '{}'", name)))
    }

    fn int<T: std::str::FromStr>(value: String, name: &str) -> Result<T> {
        value
            .parse()
            .map_err(|_| AppError::Internal(format!("job hash field '{}' is not a number", name)))
    }

    fn opt_int(value: Option<String>, name: &str) -> Result<Option<i64>> {
        value.map(|v| int(v, name)).transpose()
    }

    let id = required(take("id"), "id")?;
    let queue = required(take("queue"), "queue")?;
    let dedup_key = required(take("dedup_key"), "dedup_key")?;
    let job_type = take("job_type");
    let asset_id = required(take("asset_id"), "asset_id")?;
    let user_id = required(take("user_id"), "user_id")?;
    let payload: JobPayload = serde_json::from_str(&required(take("payload"), "payload")?)?;
    let status: JobStatus = required(take("status"), "status")?.parse()?;
    let stages = match take("stages") {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Vec::new(),
    };
    let current_stage = take("current_stage");
    let overall_progress = int(required(take("overall_progress"), "overall_progress")?, "overall_progress")?;
    let error_message = take("error_message");
    let error_details = take("error_details")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;
    let retry_count = int(required(take("retry_count"), "retry_count")?, "retry_count")?;
    let max_retries = int(required(take("max_retries"), "max_retries")?, "max_retries")?;
    let locked_by = take("locked_by");
    let locked_at = opt_int(take("locked_at"), "locked_at")?;
    let expires_at = opt_int(take("expires_at"), "expires_at")?;
    let scheduled_for = int(required(take("scheduled_for"), "scheduled_for")?, "scheduled_for")?;
    let next_retry_at = opt_int(take("next_retry_at"), "next_retry_at")?;
    let created_at = int(required(take("created_at"), "created_at")?, "created_at")?;
    let updated_at = int(required(take("updated_at"), "updated_at")?, "updated_at")?;
    let completed_at = opt_int(take("completed_at"), "completed_at")?;

    Ok(Job {
        id,
        queue,
        dedup_key,
        job_type,
        asset_id,
        user_id,
        payload,
        status,
        stages,
        current_stage,
        overall_progress,
        error_message,
        error_details,
        retry_count,
        max_retries,
        locked_by,
        locked_at,
        expires_at,
        scheduled_for,
        next_retry_at,
        created_at,
        updated_at,
        completed_at,
    })
}
