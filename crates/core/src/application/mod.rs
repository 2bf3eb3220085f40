// Application Layer - Use Cases and Business Logic

pub mod governor;
pub mod progress;
pub mod queue;
pub mod recovery;
pub mod recurring;
pub mod retry;
pub mod wakeup;
pub mod worker;

// Re-exports
pub use governor::{DomainRateLimiter, GovernorConfig, RateRule, RateRules};
pub use progress::StageTracker;
pub use queue::{
    BrokerQueue, DatabaseQueue, EnqueueRequest, JobHandle, LazyQueue, QueueAdapter, QueueCore,
};
pub use recovery::RecoveryService;
pub use recurring::RecurringScheduler;
pub use retry::RetryPolicy;
pub use wakeup::{ScheduledWakeup, Wakeup};
pub use worker::{shutdown_channel, ShutdownSender, ShutdownToken, Worker};
