//! Image builder trait.
//!
//! A builder turns one job into a terminal result. Failures are reported in
//! the result rather than as an `Err`, because a failed build still carries
//! the image reference, duration and message the caller must record.

use async_trait::async_trait;

use crate::{BuildContext, BuildJob, BuildResult};

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Name of this builder.
    fn name(&self) -> &'static str;

    /// Run every stage for `job`, honoring the context's cancellation and
    /// deadline at each suspension point.
    async fn execute(&self, job: &BuildJob, ctx: &BuildContext) -> BuildResult;
}
