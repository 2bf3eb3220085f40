//! Cairn queue daemon
//!
//! Wires the configured backend into the queue adapter and runs the
//! background services for the selected role. Applications register their
//! processors and call [`run`]; the `cairn-queue` binary runs the scheduler
//! and maintenance services with none.

mod backend;
pub mod config;
pub mod logging;
pub mod processors;
mod service;

pub use config::{Backend, DaemonConfig, LogFormat, ServiceRole};
pub use processors::ProcessorRegistry;
pub use service::{run, run_until, Daemon};
