pub mod base;
pub mod memory;
pub mod postgres;

pub use base::{
    BackendError, BackendResult, ClaimedJob, DispatchContext, DueAction, NewAction, NewMessage,
    ProcessorBackend, QueueBackend, QueueCounts, ReclaimerBackend, SchedulerBackend,
};
pub use memory::MemoryBackend;
