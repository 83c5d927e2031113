//! The staged build pipeline: image build, then SBOM, then signature.
//!
//! Each stage is one cluster job: build its spec, submit it, watch it to a
//! terminal condition, then read its pod's output. Only the image build can
//! fail the result; SBOM and signing problems are logged and leave their
//! field empty.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kiln_config::{SigningMode, WorkerConfig};
use kiln_core::{
    BuildContext, BuildJob, BuildResult, Error, ImageBuilder, ImageTags, LogSink, ResourceId,
    Result,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::cluster::{JobCluster, JobEvent, LogLines};
use crate::registry::DigestResolver;
use crate::specs::{self, Stage};

/// How long log retrieval may take once a stage has ended, independent of
/// the build deadline (which may already have passed).
pub const DEFAULT_LOG_GRACE: Duration = Duration::from_secs(30);

/// Builds images with kaniko jobs and post-processes them with syft and
/// cosign jobs.
pub struct KanikoBuilder {
    cluster: Arc<dyn JobCluster>,
    resolver: Arc<dyn DigestResolver>,
    config: WorkerConfig,
    sink: Option<Arc<dyn LogSink>>,
    log_grace: Duration,
}

impl KanikoBuilder {
    pub fn new(
        cluster: Arc<dyn JobCluster>,
        resolver: Arc<dyn DigestResolver>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            cluster,
            resolver,
            config,
            sink: None,
            log_grace: DEFAULT_LOG_GRACE,
        }
    }

    /// Forward progress and build output to `sink`.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_log_grace(mut self, grace: Duration) -> Self {
        self.log_grace = grace;
        self
    }

    async fn progress(&self, job_id: ResourceId, line: &str) {
        info!(job_id = %job_id, "{}", line);
        if let Some(sink) = &self.sink {
            sink.append(job_id, line).await;
        }
    }

    async fn fail(&self, result: BuildResult, started: Instant, message: String) -> BuildResult {
        error!(job_id = %result.job_id, error = %message, "Build failed");
        if let Some(sink) = &self.sink {
            sink.append(result.job_id, &message).await;
        }
        result.fail(message, started.elapsed().as_secs_f64())
    }

    /// Submit a stage's job and return its name.
    async fn submit(
        &self,
        stage: Stage,
        spec: &Job,
        job_id: ResourceId,
        ctx: &BuildContext,
    ) -> Result<String> {
        let name = stage.job_name(job_id);
        ctx.run(self.cluster.create_job(spec)).await?;
        self.progress(job_id, &format!("Created {} job {}", stage, name)).await;
        Ok(name)
    }

    /// Consume watch events until the job reaches a terminal condition. A
    /// stream that ends first is a failure.
    async fn wait_for_completion(&self, stage: Stage, name: &str) -> Result<()> {
        let mut events = self.cluster.watch_job(name).await?;

        while let Some(event) = events.next().await {
            match event? {
                JobEvent::Complete => return Ok(()),
                JobEvent::Failed(message) => {
                    return Err(Error::StageFailed {
                        stage: stage.to_string(),
                        message: format!("job failed: {}", message),
                    });
                }
                JobEvent::Progress => debug!(job = %name, "Job not finished yet"),
            }
        }

        Err(Error::WatchClosed(name.to_string()))
    }

    async fn open_logs(&self, job_name: &str, stage: Stage) -> Result<LogLines> {
        let pod = self
            .cluster
            .find_pod(job_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no pod for job {}", job_name)))?;
        self.cluster.pod_logs(&pod, stage.container()).await
    }

    /// Forward the build container's output line by line. Never fails the
    /// build.
    async fn forward_build_logs(&self, job_id: ResourceId, job_name: &str) {
        let forward = async {
            let mut lines = self.open_logs(job_name, Stage::Build).await?;
            let mut count = 0usize;
            while let Some(line) = lines.next().await {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                debug!(job_id = %job_id, "{}", line);
                if let Some(sink) = &self.sink {
                    sink.append(job_id, &line).await;
                }
                count += 1;
            }
            Ok::<_, Error>(count)
        };

        match tokio::time::timeout(self.log_grace, forward).await {
            Ok(Ok(count)) => debug!(job_id = %job_id, lines = count, "Forwarded build logs"),
            Ok(Err(e)) => {
                warn!(job_id = %job_id, job = %job_name, error = %e, "Could not retrieve build logs")
            }
            Err(_) => warn!(job_id = %job_id, job = %job_name, "Timed out retrieving build logs"),
        }
    }

    /// Whole output of a finished stage.
    async fn stage_output(
        &self,
        job_name: &str,
        stage: Stage,
        ctx: &BuildContext,
    ) -> Result<String> {
        ctx.run(async {
            let mut lines = self.open_logs(job_name, stage).await?;
            let mut output = String::new();
            while let Some(line) = lines.next().await {
                output.push_str(&line?);
                output.push('\n');
            }
            Ok(output)
        })
        .await
    }

    async fn build_image(
        &self,
        job: &BuildJob,
        tags: &ImageTags,
        ctx: &BuildContext,
    ) -> std::result::Result<(), String> {
        let spec = specs::build_job(&self.config, job, tags, ctx.remaining(), Utc::now());
        let name = self
            .submit(Stage::Build, &spec, job.id, ctx)
            .await
            .map_err(|e| format!("failed to create build job: {}", e))?;

        let outcome = ctx.run(self.wait_for_completion(Stage::Build, &name)).await;

        // Captured on success and failure alike.
        self.forward_build_logs(job.id, &name).await;

        outcome.map_err(|e| format!("build failed: {}", e))
    }

    async fn generate_sbom(
        &self,
        job: &BuildJob,
        image: &str,
        ctx: &BuildContext,
    ) -> Result<String> {
        let stage = Stage::Sbom;
        let spec = specs::sbom_job(&self.config, job, image);
        let name = self.submit(stage, &spec, job.id, ctx).await?;
        ctx.run(self.wait_for_completion(stage, &name)).await?;

        let sbom = self.stage_output(&name, stage, ctx).await?;
        if sbom.trim().is_empty() {
            return Err(Error::StageFailed {
                stage: stage.to_string(),
                message: "scanner produced no output".to_string(),
            });
        }
        Ok(sbom)
    }

    async fn sign_image(
        &self,
        job: &BuildJob,
        tags: &ImageTags,
        mode: &SigningMode,
        ctx: &BuildContext,
    ) -> Result<String> {
        let stage = Stage::Sign;
        let spec = specs::sign_job(&self.config, job, &tags.primary, mode);
        let name = self.submit(stage, &spec, job.id, ctx).await?;
        ctx.run(self.wait_for_completion(stage, &name)).await?;

        match self.stage_output(&name, stage, ctx).await {
            Ok(output) => debug!(job_id = %job.id, output = %output.trim(), "Signer output"),
            Err(e) => warn!(job_id = %job.id, error = %e, "Could not read signer output"),
        }

        // The signature lives in the registry next to the image.
        Ok(tags.signature_ref())
    }
}

#[async_trait]
impl ImageBuilder for KanikoBuilder {
    fn name(&self) -> &'static str {
        "kaniko"
    }

    async fn execute(&self, job: &BuildJob, ctx: &BuildContext) -> BuildResult {
        let started = Instant::now();
        let tags = ImageTags::for_job(&self.config.registry.url, job);

        let mut result = BuildResult::for_job(job);
        result.image_uri = Some(tags.primary.clone());

        self.progress(
            job.id,
            &format!("Starting build of {} @ {}", job.git_repo, job.short_sha()),
        )
        .await;

        if let Err(message) = self.build_image(job, &tags, ctx).await {
            return self.fail(result, started, message).await;
        }
        self.progress(job.id, &format!("Pushed {}", tags.primary)).await;

        match ctx.run(self.resolver.resolve(&tags.primary)).await {
            Ok(digest) => result.image_digest = Some(digest),
            Err(e) => warn!(
                job_id = %job.id,
                image = %tags.primary,
                error = %e,
                "Failed to resolve image digest"
            ),
        }

        if self.config.sbom.enabled {
            match ctx.done_reason() {
                Some(reason) => warn!(job_id = %job.id, reason = %reason, "Skipping SBOM generation"),
                None => match self.generate_sbom(job, &tags.primary, ctx).await {
                    Ok(sbom) => {
                        result.sbom = Some(sbom);
                        result.sbom_format = Some(self.config.sbom.format.clone());
                        let line = format!("SBOM generated ({})", self.config.sbom.format);
                        self.progress(job.id, &line).await;
                    }
                    Err(e) => warn!(job_id = %job.id, error = %e, "Failed to generate SBOM"),
                },
            }
        }

        if let Some(mode) = self.config.signing.mode() {
            match ctx.done_reason() {
                Some(reason) => warn!(job_id = %job.id, reason = %reason, "Skipping image signing"),
                None => match self.sign_image(job, &tags, &mode, ctx).await {
                    Ok(signature) => {
                        result.image_signature = Some(signature);
                        self.progress(job.id, "Image signed").await;
                    }
                    Err(e) => warn!(job_id = %job.id, error = %e, "Failed to sign image"),
                },
            }
        }

        let result = result.succeed(started.elapsed().as_secs_f64());
        self.progress(
            job.id,
            &format!("Build completed in {:.1}s", result.duration_secs),
        )
        .await;
        result
    }
}
