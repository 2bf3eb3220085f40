// Port Layer - Interfaces for external dependencies

pub mod event_publisher;
pub mod id_provider; // For deterministic testing
pub mod job_processor;
pub mod job_store;
pub mod recurring_task_store;
pub mod time_provider;
pub mod wakeup_channel;

// Re-exports
pub use event_publisher::{BroadcastPublisher, EventPublisher};
pub use id_provider::{IdProvider, UuidProvider};
pub use job_processor::{JobContext, JobProcessor, Partition, ProcessError};
pub use job_store::{JobStore, ProgressUpdate, OWNED_PROGRESS_STATUSES};
pub use recurring_task_store::RecurringTaskStore;
pub use time_provider::{SystemTimeProvider, TimeProvider};
pub use wakeup_channel::WakeupChannel;
