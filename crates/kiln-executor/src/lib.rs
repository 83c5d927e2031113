//! Cluster-job build pipeline for the Kiln build worker.
//!
//! Provides:
//! - Job specifications for the build, SBOM and signing stages
//! - The [`JobCluster`] seam and its Kubernetes implementation
//! - Registry digest lookup
//! - [`KanikoBuilder`], the [`kiln_core::ImageBuilder`] that drives the stages

pub mod builder;
pub mod cluster;
pub mod kubernetes;
pub mod registry;
pub mod specs;

pub use builder::{DEFAULT_LOG_GRACE, KanikoBuilder};
pub use cluster::{JobCluster, JobEvent, JobEventStream, LogLines};
pub use kubernetes::KubeCluster;
pub use registry::{DigestResolver, ImageReference, RegistryClient};
pub use specs::Stage;
