//! Core domain types and traits for the Kiln build worker.
//!
//! This crate contains:
//! - Build job, configuration and result types
//! - Resource and worker identifiers
//! - The queue, log sink and image builder traits
//! - Build context (cancellation and deadline)
//! - Image tag scheme

pub mod context;
pub mod error;
pub mod executor;
pub mod id;
pub mod image;
pub mod job;
pub mod queue;

pub use context::BuildContext;
pub use error::{Error, Result};
pub use executor::ImageBuilder;
pub use id::{ResourceId, WorkerId};
pub use image::ImageTags;
pub use job::{BuildConfig, BuildJob, BuildResult, JobStatus};
pub use queue::{BuildQueue, LogSink};
