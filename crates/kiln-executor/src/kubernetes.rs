//! Kubernetes implementation of [`JobCluster`].

use async_trait::async_trait;
use futures::future::ready;
use futures::{AsyncBufRead, AsyncBufReadExt, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kiln_core::{Error, Result};
use kube::Client;
use kube::api::{Api, ListParams, LogParams, PostParams};
use kube::runtime::watcher::{self, Event, watcher};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::cluster::{JobCluster, JobEventStream, LogLines, job_event};

/// Lines read ahead of the consumer.
const LOG_BUFFER_LINES: usize = 256;

/// Runs build stages as `batch/v1` Jobs in one namespace.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    /// Connect using the in-cluster or kubeconfig defaults.
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Cluster(e.to_string()))?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl JobCluster for KubeCluster {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let created = self
            .jobs()
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| Error::Cluster(format!("failed to create job: {}", e)))?;
        debug!(
            job = created.metadata.name.as_deref().unwrap_or_default(),
            namespace = %self.namespace,
            "Created cluster job"
        );
        Ok(())
    }

    /// The runtime watcher re-establishes watches the API server closes, so
    /// the stream does not end on its own; a lost watch surfaces as an
    /// `Err` item.
    async fn watch_job(&self, name: &str) -> Result<JobEventStream> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let name = name.to_string();

        let events = watcher(self.jobs(), config).filter_map(move |event| {
            ready(match event {
                Ok(Event::Apply(job)) | Ok(Event::InitApply(job)) => Some(Ok(job_event(&job))),
                Ok(Event::Delete(_)) => Some(Err(Error::Cluster(format!(
                    "job {} was deleted while being watched",
                    name
                )))),
                Ok(Event::Init) | Ok(Event::InitDone) => None,
                Err(e) => Some(Err(Error::Cluster(format!("watch error: {}", e)))),
            })
        });

        Ok(events.boxed())
    }

    async fn find_pod(&self, job_name: &str) -> Result<Option<String>> {
        let params = ListParams::default().labels(&format!("job-name={}", job_name));
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| Error::Cluster(format!("failed to list pods: {}", e)))?;
        Ok(pods.items.into_iter().find_map(|p| p.metadata.name))
    }

    /// Follows the container log as it is read from the API server. The
    /// reader runs on its own task and hands lines over a bounded channel.
    async fn pod_logs(&self, pod: &str, container: &str) -> Result<LogLines> {
        let params = LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };
        let pods = self.pods();
        let pod = pod.to_string();
        let (opened_tx, opened_rx) = oneshot::channel::<Result<()>>();
        let (tx, rx) = mpsc::channel::<Result<String>>(LOG_BUFFER_LINES);

        tokio::spawn(async move {
            let reader = match pods.log_stream(&pod, &params).await {
                Ok(reader) => {
                    let _ = opened_tx.send(Ok(()));
                    reader
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(Error::Cluster(format!(
                        "failed to read logs of {}: {}",
                        pod, e
                    ))));
                    return;
                }
            };

            forward_lines(reader, &pod, tx).await;
        });

        opened_rx
            .await
            .map_err(|_| Error::Cluster("log reader stopped before opening".to_string()))??;

        Ok(receiver_lines(rx))
    }
}

/// Send each line of `reader` until it ends, breaks, or the receiver goes
/// away. A read error is sent once and ends the stream.
async fn forward_lines<R: AsyncBufRead>(
    reader: R,
    pod: &str,
    tx: mpsc::Sender<Result<String>>,
) {
    let mut lines = Box::pin(reader.lines());
    while let Some(line) = lines.next().await {
        let line =
            line.map_err(|e| Error::Cluster(format!("log stream of {} broke: {}", pod, e)));
        let broken = line.is_err();
        if tx.send(line).await.is_err() || broken {
            break;
        }
    }
}

fn receiver_lines(rx: mpsc::Receiver<Result<String>>) -> LogLines {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|line| (line, rx))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    async fn read_all(bytes: &[u8], capacity: usize) -> Vec<Result<String>> {
        let (tx, rx) = mpsc::channel(capacity);
        let reader = Cursor::new(bytes.to_vec());
        tokio::spawn(async move { forward_lines(reader, "build-pod", tx).await });
        receiver_lines(rx).collect().await
    }

    #[tokio::test]
    async fn test_lines_arrive_in_order() {
        let lines = read_all(b"INFO Retrieving image\nINFO Pushing image\nlast", 1).await;
        let lines: Vec<String> = lines.into_iter().map(|l| l.unwrap()).collect();
        assert_eq!(
            lines,
            vec!["INFO Retrieving image", "INFO Pushing image", "last"]
        );
    }

    #[tokio::test]
    async fn test_empty_log_ends_immediately() {
        assert!(read_all(b"", 4).await.is_empty());
    }

    #[tokio::test]
    async fn test_read_error_is_cluster_error_and_ends_stream() {
        let lines = read_all(b"ok\n\xff\xfe\nnever\n", 4).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].as_deref().unwrap(), "ok");
        let err = lines[1].as_ref().unwrap_err();
        assert!(matches!(err, Error::Cluster(_)));
        assert!(err.to_string().contains("build-pod"));
    }

    #[tokio::test]
    async fn test_dropped_consumer_stops_the_reader() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let reader = Cursor::new(b"a\nb\nc\n".to_vec());
        forward_lines(reader, "build-pod", tx).await;
    }
}
