//! Callback delivery against a local HTTP endpoint.

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use chrono::Utc;
use kiln_core::{BuildConfig, BuildJob, BuildResult, Error, ResourceId, WorkerId};
use kiln_scheduler::{CallbackNotifier, MemoryQueue, Processor, ProcessorConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Delivery {
    authorization: Option<String>,
    body: serde_json::Value,
}

#[derive(Clone, Default)]
struct Received(Arc<Mutex<Vec<Delivery>>>);

impl Received {
    fn all(&self) -> Vec<Delivery> {
        self.0.lock().unwrap().clone()
    }
}

async fn accept(
    State(received): State<Received>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    received.0.lock().unwrap().push(Delivery {
        authorization,
        body: serde_json::from_str(&body).unwrap(),
    });
    StatusCode::OK
}

async fn reject() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Serve the callback routes on an ephemeral port.
async fn serve(received: Received) -> String {
    let app = Router::new()
        .route("/callback", post(accept))
        .route("/broken", post(reject))
        .with_state(received);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn job(callback_url: Option<String>) -> BuildJob {
    BuildJob {
        id: ResourceId::new(),
        release_id: ResourceId::new(),
        service_id: ResourceId::new(),
        project_id: ResourceId::new(),
        service_name: Some("web".to_string()),
        git_repo: "https://github.com/acme/web".to_string(),
        git_sha: "0123456789abcdef".to_string(),
        git_branch: "main".to_string(),
        build_config: BuildConfig::default(),
        callback_url,
        priority: 0,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_notify_posts_result_with_token() {
    let received = Received::default();
    let base = serve(received.clone()).await;
    let j = job(None);
    let result = BuildResult::for_job(&j).fail("kaniko exited with code 1", 12.5);

    let notifier =
        CallbackNotifier::new(Duration::from_secs(5), Some("s3cret".to_string())).unwrap();
    notifier
        .notify(&format!("{}/callback", base), &result)
        .await
        .unwrap();

    let deliveries = received.all();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].authorization.as_deref(), Some("Bearer s3cret"));
    assert_eq!(deliveries[0].body["job_id"], j.id.to_string());
    assert_eq!(deliveries[0].body["success"], false);
    assert_eq!(
        deliveries[0].body["error_message"],
        "kaniko exited with code 1"
    );
}

#[tokio::test]
async fn test_notify_without_token_sends_no_auth() {
    let received = Received::default();
    let base = serve(received.clone()).await;
    let j = job(None);

    let notifier = CallbackNotifier::new(Duration::from_secs(5), None).unwrap();
    notifier
        .notify(&format!("{}/callback", base), &BuildResult::for_job(&j).succeed(3.0))
        .await
        .unwrap();

    let deliveries = received.all();
    assert_eq!(deliveries.len(), 1);
    assert!(deliveries[0].authorization.is_none());
    assert_eq!(deliveries[0].body["success"], true);
}

#[tokio::test]
async fn test_server_error_is_reported() {
    let base = serve(Received::default()).await;
    let j = job(None);

    let notifier = CallbackNotifier::new(Duration::from_secs(5), None).unwrap();
    let err = notifier
        .notify(&format!("{}/broken", base), &BuildResult::for_job(&j).succeed(1.0))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Callback(_)));
    assert!(err.to_string().contains("500"));
}

#[tokio::test]
async fn test_processor_delivers_callback_after_build() {
    let received = Received::default();
    let base = serve(received.clone()).await;
    let queue = Arc::new(MemoryQueue::new());
    let j = job(Some(format!("{}/callback", base)));
    let id = j.id;
    queue.enqueue(j);

    let processor = Arc::new(
        Processor::new(
            WorkerId::new("worker-cb"),
            queue.clone(),
            Arc::new(InstantBuilder),
            ProcessorConfig {
                max_concurrent: 1,
                poll_interval: Duration::from_millis(20),
                ..ProcessorConfig::default()
            },
        )
        .with_notifier(CallbackNotifier::new(Duration::from_secs(5), Some("tok".into())).unwrap()),
    );

    let shutdown = CancellationToken::new();
    let handle = {
        let p = processor.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { p.run(token).await })
    };

    let started = std::time::Instant::now();
    while received.all().is_empty() {
        assert!(started.elapsed() < Duration::from_secs(5), "no callback received");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let deliveries = received.all();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].authorization.as_deref(), Some("Bearer tok"));
    assert_eq!(deliveries[0].body["job_id"], id.to_string());
    assert_eq!(deliveries[0].body["success"], true);
}

/// Builder that succeeds immediately.
struct InstantBuilder;

#[async_trait::async_trait]
impl kiln_core::ImageBuilder for InstantBuilder {
    fn name(&self) -> &'static str {
        "instant"
    }

    async fn execute(&self, job: &BuildJob, _ctx: &kiln_core::BuildContext) -> BuildResult {
        BuildResult::for_job(job).succeed(0.0)
    }
}
