// Recurring Task Domain Model

use crate::domain::error::{DomainError, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Queue that receives recurring-task executions
pub const TASK_QUEUE: &str = "task-processing";

/// Job type tag for a single execution of a recurring task
pub const EXECUTION_JOB_TYPE: &str = "execution";

/// Task record as seen by the recurring scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringTask {
    pub id: String,
    pub user_id: String,
    pub is_recurring: bool,
    pub cron_expression: Option<String>,
    /// No executions scheduled after this instant (epoch ms)
    pub recurrence_end_date: Option<i64>,
    /// Maximum number of completed executions
    pub recurrence_limit: Option<i64>,
    pub next_run_at: Option<i64>,
    pub last_run_at: Option<i64>,
}

/// Fields persisted after a scheduler pass over one task
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrenceUpdate {
    pub last_run_at: Option<i64>,
    pub next_run_at: Option<i64>,
    pub is_recurring: bool,
}

impl RecurringTask {
    /// Deduplication key for the execution scheduled at `scheduled_ms`
    pub fn execution_key(&self, scheduled_ms: i64) -> String {
        format!("tasks:{}:run:{}", self.id, scheduled_ms)
    }

    /// Update that switches recurrence off, keeping timestamps
    pub fn disabled(&self) -> RecurrenceUpdate {
        RecurrenceUpdate {
            last_run_at: self.last_run_at,
            next_run_at: None,
            is_recurring: false,
        }
    }
}

/// Parse a 5-field (minute-first) or 6/7-field (seconds-first) cron expression.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", trimmed),
        6 | 7 => trimmed.to_string(),
        _ => {
            return Err(DomainError::InvalidCron {
                expression: expression.to_string(),
                reason: format!("expected 5-7 fields, got {}", fields),
            })
        }
    };

    Schedule::from_str(&normalized).map_err(|e| DomainError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Next fire time strictly after `after_millis`, evaluated in UTC
pub fn next_occurrence(schedule: &Schedule, after_millis: i64) -> Option<i64> {
    let after: DateTime<Utc> = DateTime::from_timestamp_millis(after_millis)?;
    schedule.after(&after).next().map(|t| t.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn test_five_field_expression_is_minute_first() {
        let schedule = parse_schedule("30 9 * * *").unwrap();
        let next = next_occurrence(&schedule, ms(2024, 3, 1, 10, 0)).unwrap();
        assert_eq!(next, ms(2024, 3, 2, 9, 30));
    }

    #[test]
    fn test_six_field_expression_passes_through() {
        let schedule = parse_schedule("0 */15 * * * *").unwrap();
        let next = next_occurrence(&schedule, ms(2024, 3, 1, 10, 1)).unwrap();
        assert_eq!(next, ms(2024, 3, 1, 10, 15));
    }

    #[test]
    fn test_next_is_strictly_after() {
        let schedule = parse_schedule("0 * * * *").unwrap();
        let at = ms(2024, 3, 1, 10, 0);
        assert_eq!(next_occurrence(&schedule, at), Some(ms(2024, 3, 1, 11, 0)));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(
            parse_schedule("every tuesday"),
            Err(DomainError::InvalidCron { .. })
        ));
        assert!(parse_schedule("* *").is_err());
        assert!(parse_schedule("61 * * * *").is_err());
    }

    #[test]
    fn test_execution_key() {
        let task = RecurringTask {
            id: "t1".into(),
            user_id: "u1".into(),
            is_recurring: true,
            cron_expression: Some("0 * * * *".into()),
            recurrence_end_date: None,
            recurrence_limit: None,
            next_run_at: Some(1000),
            last_run_at: None,
        };
        assert_eq!(task.execution_key(1000), "tasks:t1:run:1000");
        assert!(!task.disabled().is_recurring);
    }
}
