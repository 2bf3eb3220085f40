// Recurring Task Store Port
// Task rows belong to the content service; the scheduler only reads and
// writes the recurrence fields.

use crate::domain::{RecurrenceUpdate, RecurringTask};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait RecurringTaskStore: Send + Sync {
    /// Tasks with `is_recurring` set and `next_run_at <= now_millis`
    async fn due_tasks(&self, now_millis: i64) -> Result<Vec<RecurringTask>>;

    async fn update_recurrence(&self, task_id: &str, update: &RecurrenceUpdate) -> Result<()>;
}

pub mod mocks {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryTaskStore {
        tasks: Mutex<BTreeMap<String, RecurringTask>>,
    }

    impl InMemoryTaskStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, task: RecurringTask) {
            self.tasks.lock().unwrap().insert(task.id.clone(), task);
        }

        pub fn get(&self, id: &str) -> Option<RecurringTask> {
            self.tasks.lock().unwrap().get(id).cloned()
        }
    }

    #[async_trait]
    impl RecurringTaskStore for InMemoryTaskStore {
        async fn due_tasks(&self, now_millis: i64) -> Result<Vec<RecurringTask>> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .values()
                .filter(|t| t.is_recurring && t.next_run_at.is_some_and(|at| at <= now_millis))
                .cloned()
                .collect())
        }

        async fn update_recurrence(&self, task_id: &str, update: &RecurrenceUpdate) -> Result<()> {
            if let Some(task) = self.tasks.lock().unwrap().get_mut(task_id) {
                task.last_run_at = update.last_run_at;
                task.next_run_at = update.next_run_at;
                task.is_recurring = update.is_recurring;
            }
            Ok(())
        }
    }
}
