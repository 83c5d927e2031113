//! Pipeline behavior against a scripted cluster.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kiln_config::WorkerConfig;
use kiln_core::{
    BuildConfig, BuildContext, BuildJob, Error, ImageBuilder, LogSink, ResourceId, Result,
};
use kiln_executor::{DigestResolver, JobCluster, JobEvent, JobEventStream, KanikoBuilder, LogLines};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
enum Outcome {
    Complete,
    Fail(&'static str),
    Close,
    WatchError(&'static str),
    Reject(&'static str),
    Hang,
}

/// Cluster whose jobs finish the way each stage is scripted to.
struct FakeCluster {
    outcomes: HashMap<&'static str, Outcome>,
    logs: HashMap<&'static str, Vec<&'static str>>,
    created: Mutex<Vec<Job>>,
}

impl FakeCluster {
    fn new() -> Self {
        Self {
            outcomes: HashMap::new(),
            logs: HashMap::from([
                ("kaniko", vec!["INFO Retrieving image manifest", "", "INFO Pushed image"]),
                ("syft", vec![r#"{"spdxVersion":"SPDX-2.3","packages":[]}"#]),
                ("cosign", vec!["tlog entry created with index: 42"]),
            ]),
            created: Mutex::new(Vec::new()),
        }
    }

    fn with(mut self, stage: &'static str, outcome: Outcome) -> Self {
        self.outcomes.insert(stage, outcome);
        self
    }

    fn outcome(&self, job_name: &str) -> Outcome {
        let stage = job_name.split('-').next().unwrap_or_default();
        self.outcomes.get(stage).cloned().unwrap_or(Outcome::Complete)
    }

    fn created_names(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter_map(|j| j.metadata.name.clone())
            .collect()
    }
}

#[async_trait]
impl JobCluster for FakeCluster {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let name = job.metadata.name.clone().unwrap_or_default();
        if let Outcome::Reject(reason) = self.outcome(&name) {
            return Err(Error::Cluster(reason.to_string()));
        }
        self.created.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn watch_job(&self, name: &str) -> Result<JobEventStream> {
        let events: Vec<Result<JobEvent>> = match self.outcome(name) {
            Outcome::Complete => vec![Ok(JobEvent::Progress), Ok(JobEvent::Complete)],
            Outcome::Fail(message) => {
                vec![Ok(JobEvent::Progress), Ok(JobEvent::Failed(message.to_string()))]
            }
            Outcome::Close => vec![Ok(JobEvent::Progress)],
            Outcome::WatchError(message) => vec![
                Ok(JobEvent::Progress),
                Err(Error::Cluster(format!("watch error: {}", message))),
                Ok(JobEvent::Complete),
            ],
            Outcome::Hang => return Ok(futures::stream::pending().boxed()),
            Outcome::Reject(_) => unreachable!("rejected jobs are never watched"),
        };
        Ok(futures::stream::iter(events).boxed())
    }

    async fn find_pod(&self, job_name: &str) -> Result<Option<String>> {
        Ok(Some(format!("{}-x7k2p", job_name)))
    }

    async fn pod_logs(&self, _pod: &str, container: &str) -> Result<LogLines> {
        let lines: Vec<Result<String>> = self
            .logs
            .get(container)
            .into_iter()
            .flatten()
            .map(|l| Ok(l.to_string()))
            .collect();
        Ok(futures::stream::iter(lines).boxed())
    }
}

struct StubResolver {
    fail: bool,
}

#[async_trait]
impl DigestResolver for StubResolver {
    async fn resolve(&self, _image: &str) -> Result<String> {
        if self.fail {
            Err(Error::Registry("manifest unknown".to_string()))
        } else {
            Ok("sha256:4f53cda18c2baa0c0354bb5f9a3ecbe5ed12ab4d8e11ba873c2f11161202b945".to_string())
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

#[async_trait]
impl LogSink for RecordingSink {
    async fn append(&self, _job_id: ResourceId, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

fn config() -> WorkerConfig {
    let mut cfg = WorkerConfig::default();
    cfg.registry.url = "ghcr.io/acme".to_string();
    cfg.signing.keyless = true;
    cfg
}

fn job() -> BuildJob {
    BuildJob {
        id: "0190a7c4-aaaa-7000-8000-000000000001".parse().unwrap(),
        release_id: ResourceId::new(),
        service_id: ResourceId::new(),
        project_id: ResourceId::new(),
        service_name: Some("api".to_string()),
        git_repo: "https://github.com/acme/api".to_string(),
        git_sha: "abc123def456".to_string(),
        git_branch: "main".to_string(),
        build_config: BuildConfig::default(),
        callback_url: None,
        priority: 0,
        created_at: Utc::now(),
    }
}

fn builder(cluster: &Arc<FakeCluster>, cfg: WorkerConfig) -> (KanikoBuilder, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let builder = KanikoBuilder::new(
        cluster.clone(),
        Arc::new(StubResolver { fail: false }),
        cfg,
    )
    .with_log_sink(sink.clone());
    (builder, sink)
}

#[tokio::test]
async fn test_full_pipeline_success() {
    let cluster = Arc::new(FakeCluster::new());
    let (builder, sink) = builder(&cluster, config());

    let result = builder
        .execute(&job(), &BuildContext::detached(Duration::from_secs(60)))
        .await;

    assert!(result.success, "unexpected failure: {:?}", result.error_message);
    assert!(result.error_message.is_none());
    assert!(result.image_uri.as_deref().unwrap().ends_with(":abc123de"));
    assert!(result.image_digest.as_deref().unwrap().starts_with("sha256:"));
    assert!(result.sbom.as_deref().unwrap().contains("SPDX-2.3"));
    assert_eq!(result.sbom_format.as_deref(), Some("spdx-json"));
    assert_eq!(
        result.image_signature.as_deref(),
        Some("ghcr.io/acme/api:abc123de.sig")
    );

    assert_eq!(
        cluster.created_names(),
        vec![
            "build-0190a7c4aaaa70008000000000000001",
            "sbom-0190a7c4aaaa70008000000000000001",
            "sign-0190a7c4aaaa70008000000000000001",
        ]
    );

    let lines = sink.lines.lock().unwrap();
    assert!(lines.iter().any(|l| l == "INFO Pushed image"));
    assert!(!lines.iter().any(|l| l.is_empty()));
}

#[tokio::test]
async fn test_rejected_submission_fails_build() {
    let cluster = Arc::new(FakeCluster::new().with("build", Outcome::Reject("admission webhook denied")));
    let (builder, _) = builder(&cluster, config());

    let result = builder
        .execute(&job(), &BuildContext::detached(Duration::from_secs(60)))
        .await;

    assert!(!result.success);
    let message = result.error_message.as_deref().unwrap();
    assert!(message.contains("failed to create build job"));
    assert!(message.contains("admission webhook denied"));
    assert!(result.duration_secs > 0.0);
    assert!(result.sbom.is_none());
    assert!(result.sbom_format.is_none());
    assert!(result.image_signature.is_none());
    assert!(cluster.created_names().is_empty());
}

#[tokio::test]
async fn test_failed_build_keeps_image_uri_and_logs() {
    let cluster = Arc::new(FakeCluster::new().with("build", Outcome::Fail("BackoffLimitExceeded")));
    let (builder, sink) = builder(&cluster, config());

    let result = builder
        .execute(&job(), &BuildContext::detached(Duration::from_secs(60)))
        .await;

    assert!(!result.success);
    assert!(result.error_message.as_deref().unwrap().contains("job failed: BackoffLimitExceeded"));
    assert_eq!(result.image_uri.as_deref(), Some("ghcr.io/acme/api:abc123de"));
    assert_eq!(cluster.created_names(), vec!["build-0190a7c4aaaa70008000000000000001"]);
    assert!(sink.lines.lock().unwrap().iter().any(|l| l == "INFO Pushed image"));
}

#[tokio::test]
async fn test_closed_watch_is_a_failure() {
    let cluster = Arc::new(FakeCluster::new().with("build", Outcome::Close));
    let (builder, _) = builder(&cluster, config());

    let result = builder
        .execute(&job(), &BuildContext::detached(Duration::from_secs(60)))
        .await;

    assert!(!result.success);
    assert!(
        result
            .error_message
            .as_deref()
            .unwrap()
            .contains("closed before a terminal condition")
    );
}

#[tokio::test]
async fn test_watch_error_fails_the_stage() {
    let cluster = Arc::new(
        FakeCluster::new().with("build", Outcome::WatchError("410 Gone: too old resource version")),
    );
    let (builder, _) = builder(&cluster, config());

    let result = builder
        .execute(&job(), &BuildContext::detached(Duration::from_secs(60)))
        .await;

    assert!(!result.success);
    let message = result.error_message.as_deref().unwrap();
    assert!(message.contains("watch error: 410 Gone"));
    assert_eq!(cluster.created_names().len(), 1);
}

#[tokio::test]
async fn test_sbom_failure_does_not_fail_build() {
    let cluster = Arc::new(FakeCluster::new().with("sbom", Outcome::Fail("OOMKilled")));
    let (builder, _) = builder(&cluster, config());

    let result = builder
        .execute(&job(), &BuildContext::detached(Duration::from_secs(60)))
        .await;

    assert!(result.success);
    assert!(result.image_uri.is_some());
    assert!(result.sbom.is_none());
    assert!(result.sbom_format.is_none());
    assert!(result.image_signature.is_some());
}

#[tokio::test]
async fn test_signing_failure_does_not_fail_build() {
    let cluster = Arc::new(FakeCluster::new().with("sign", Outcome::Close));
    let (builder, _) = builder(&cluster, config());

    let result = builder
        .execute(&job(), &BuildContext::detached(Duration::from_secs(60)))
        .await;

    assert!(result.success);
    assert!(result.image_uri.is_some());
    assert!(result.sbom.is_some());
    assert!(result.image_signature.is_none());
}

#[tokio::test]
async fn test_digest_failure_is_ignored() {
    let cluster = Arc::new(FakeCluster::new());
    let builder = KanikoBuilder::new(cluster.clone(), Arc::new(StubResolver { fail: true }), config());

    let result = builder
        .execute(&job(), &BuildContext::detached(Duration::from_secs(60)))
        .await;

    assert!(result.success);
    assert!(result.image_digest.is_none());
}

#[tokio::test]
async fn test_optional_stages_skipped_when_disabled() {
    let cluster = Arc::new(FakeCluster::new());
    let mut cfg = config();
    cfg.sbom.enabled = false;
    cfg.signing.keyless = false;
    let (builder, _) = builder(&cluster, cfg);

    let result = builder
        .execute(&job(), &BuildContext::detached(Duration::from_secs(60)))
        .await;

    assert!(result.success);
    assert!(result.sbom.is_none());
    assert!(result.image_signature.is_none());
    assert_eq!(cluster.created_names(), vec!["build-0190a7c4aaaa70008000000000000001"]);
}

#[tokio::test]
async fn test_cancellation_aborts_watch() {
    let cluster = Arc::new(FakeCluster::new().with("build", Outcome::Hang));
    let (builder, _) = builder(&cluster, config());

    let shutdown = CancellationToken::new();
    let ctx = BuildContext::new(&shutdown, Duration::from_secs(600));
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), builder.execute(&job(), &ctx))
        .await
        .expect("cancelled build should return promptly");

    assert!(!result.success);
    assert!(result.error_message.as_deref().unwrap().contains("cancelled"));
    assert!(result.image_uri.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_fails_build() {
    let cluster = Arc::new(FakeCluster::new().with("build", Outcome::Hang));
    let (builder, _) = builder(&cluster, config());

    let result = builder
        .execute(&job(), &BuildContext::detached(Duration::from_secs(90)))
        .await;

    assert!(!result.success);
    let message = result.error_message.as_deref().unwrap();
    assert!(message.contains("timeout"), "{}", message);
    assert!(message.contains("90s"), "{}", message);
}
