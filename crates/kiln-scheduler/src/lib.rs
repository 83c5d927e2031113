//! Job processing for the Kiln build worker.
//!
//! Pulls build jobs from a shared queue, runs a bounded number of them
//! concurrently, records their results and notifies callers.
//! The PostgreSQL queue uses SKIP LOCKED for distributed job claiming.

pub mod callback;
pub mod memory;
pub mod processor;
pub mod queue;
pub mod sink;

pub use callback::CallbackNotifier;
pub use memory::{MemoryQueue, QueueEvent};
pub use processor::{Processor, ProcessorConfig, ProcessorStats};
pub use queue::{JobRecord, PgBuildQueue, create_pool, run_migrations};
pub use sink::QueueLogSink;
pub use sqlx::PgPool;
