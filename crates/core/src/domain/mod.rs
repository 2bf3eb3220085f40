// Domain Layer - Pure business logic and entities

pub mod error;
pub mod event;
pub mod job;
pub mod queue;
pub mod recurring;
pub mod stage;

// Re-exports
pub use error::DomainError;
pub use event::{JobEvent, JobEventKind, JobSummary, UserEvent};
pub use job::{Job, JobFailure, JobId, JobPayload, JobStatus, QueueId, Transition};
pub use queue::{wakeup_channel_name, WakeupMessage};
pub use recurring::{RecurrenceUpdate, RecurringTask};
pub use stage::{Stage, StageRollup, StageStatus, StageUpdate};
