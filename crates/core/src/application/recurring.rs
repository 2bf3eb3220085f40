// Recurring task scheduler - turns due cron tasks into execution jobs
use crate::application::queue::{EnqueueRequest, LazyQueue};
use crate::application::worker::ShutdownToken;
use crate::domain::recurring::{
    next_occurrence, parse_schedule, EXECUTION_JOB_TYPE, TASK_QUEUE,
};
use crate::domain::{RecurrenceUpdate, RecurringTask};
use crate::error::Result;
use crate::port::{RecurringTaskStore, TimeProvider};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default polling interval (10s)
pub const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(10);

/// What one pass did with a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Execution enqueued; next run recorded (None once the end date is passed)
    Scheduled { next_run_at: Option<i64> },
    /// Recurrence switched off (limit reached, end date passed, bad expression)
    Disabled,
}

pub struct RecurringScheduler {
    tasks: Arc<dyn RecurringTaskStore>,
    queue: Arc<LazyQueue>,
    time: Arc<dyn TimeProvider>,
    interval: Duration,
}

impl RecurringScheduler {
    pub fn new(
        tasks: Arc<dyn RecurringTaskStore>,
        queue: Arc<LazyQueue>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            tasks,
            queue,
            time,
            interval: DEFAULT_SCHEDULER_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One pass over due tasks. Returns the number of executions enqueued.
    ///
    /// A failing task is logged and skipped; it stays due and is retried on
    /// the next pass.
    pub async fn run_once(&self) -> Result<usize> {
        let now = self.time.now_millis();
        let due = self.tasks.due_tasks(now).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "Due recurring tasks");

        let mut enqueued = 0;
        for task in &due {
            match self.schedule_task(task, now).await {
                Ok(TaskOutcome::Scheduled { next_run_at }) => {
                    enqueued += 1;
                    info!(task_id = %task.id, next_run_at, "Recurring task execution enqueued");
                }
                Ok(TaskOutcome::Disabled) => {
                    info!(task_id = %task.id, "Recurrence disabled");
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Failed to schedule recurring task");
                }
            }
        }

        // Executions are enqueued with deferred wakeups; wake the pool once
        if enqueued > 0 {
            let queue = self.queue.get().await?;
            queue.notify_workers(TASK_QUEUE, None).await;
        }
        Ok(enqueued)
    }

    async fn schedule_task(&self, task: &RecurringTask, now: i64) -> Result<TaskOutcome> {
        let schedule = match task.cron_expression.as_deref().map(parse_schedule) {
            Some(Ok(schedule)) => schedule,
            Some(Err(e)) => {
                warn!(task_id = %task.id, error = %e, "Invalid cron expression");
                return self.disable(task).await;
            }
            None => {
                warn!(task_id = %task.id, "Recurring task has no cron expression");
                return self.disable(task).await;
            }
        };

        let queue = self.queue.get().await?;

        if let Some(limit) = task.recurrence_limit {
            let runs = queue
                .store()
                .count_completed(TASK_QUEUE, &task.id, Some(EXECUTION_JOB_TYPE))
                .await?;
            if runs >= limit {
                info!(task_id = %task.id, runs, limit, "Recurrence limit reached");
                return self.disable(task).await;
            }
        }

        if task.recurrence_end_date.is_some_and(|end| now > end) {
            return self.disable(task).await;
        }

        let scheduled_for = task.next_run_at.unwrap_or(now);
        let req = EnqueueRequest::new(
            TASK_QUEUE,
            task.execution_key(scheduled_for),
            task.id.clone(),
            task.user_id.clone(),
            json!({
                "taskId": task.id,
                "userId": task.user_id,
                "scheduledFor": scheduled_for,
            }),
        )
        .with_job_type(EXECUTION_JOB_TYPE)
        .deferred();
        queue.enqueue(req).await?;

        let next_run_at = next_occurrence(&schedule, now)
            .filter(|next| task.recurrence_end_date.map_or(true, |end| *next <= end));

        self.tasks
            .update_recurrence(
                &task.id,
                &RecurrenceUpdate {
                    last_run_at: Some(now),
                    next_run_at,
                    is_recurring: next_run_at.is_some(),
                },
            )
            .await?;
        Ok(TaskOutcome::Scheduled { next_run_at })
    }

    async fn disable(&self, task: &RecurringTask) -> Result<TaskOutcome> {
        self.tasks
            .update_recurrence(&task.id, &task.disabled())
            .await?;
        Ok(TaskOutcome::Disabled)
    }

    /// Poll until shutdown
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Recurring scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Recurring scheduler pass failed");
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
        info!("Recurring scheduler stopped");
    }
}
