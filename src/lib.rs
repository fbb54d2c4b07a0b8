//! Cadence - multi-tenant outreach scheduling and execution engine.
//!
//! Pending actions in Postgres are claimed by a polling scheduler, pushed
//! through lazily-created per-tenant queues and workers, executed by the
//! action processor, and recovered by a stuck-action reclaimer when a
//! worker dies mid-flight.

pub mod backends;
pub mod config;
pub mod db;
pub mod engine;
pub mod observability;
pub mod outbound;
pub mod processor;
pub mod queue;
pub mod reclaimer;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use backends::{MemoryBackend, ProcessorBackend, QueueBackend, ReclaimerBackend, SchedulerBackend};
pub use config::Config;
pub use db::Database;
pub use engine::Engine;
pub use outbound::{ContentRenderer, Delivery, LogDelivery, SmtpDelivery};
pub use processor::{ActionProcessor, ProcessOutcome, ProcessStatus};
pub use queue::{QueueManager, QueueMetrics};
pub use reclaimer::{Reclaimer, ReclaimerConfig};
pub use retry::BackoffConfig;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use worker::{WorkerConfig, WorkerManager};
