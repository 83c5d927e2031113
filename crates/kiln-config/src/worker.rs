//! Worker configuration.
//!
//! Defaults are built in; a KDL file may override any of them:
//!
//! ```kdl
//! worker-id "builder-1"
//! database-url "postgres://kiln@db/kiln"
//! namespace "kiln-builds"
//!
//! registry "ghcr.io/acme" {
//!     user "kiln-bot"
//!     password "s3cret"
//!     secret "regcred"
//!     cache-repo "ghcr.io/acme/cache"
//! }
//!
//! build {
//!     timeout "45m"
//!     max-concurrent 4
//!     git-credentials "git-credentials"
//! }
//!
//! sbom enabled=#true format="spdx-json"
//! signing enabled=#true key-secret="cosign-key"
//!
//! worker {
//!     poll-interval "5s"
//!     shutdown-timeout "5m"
//! }
//!
//! callback timeout="30s" token="internal-api-key"
//! ```

use kdl::{KdlDocument, KdlNode};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use crate::duration::parse_duration;
use crate::{ConfigError, ConfigResult};

pub const DEFAULT_NAMESPACE: &str = "kiln-builds";
pub const DEFAULT_REGISTRY: &str = "ghcr.io";
pub const DEFAULT_REGISTRY_SECRET: &str = "regcred";
pub const DEFAULT_GIT_CREDENTIALS: &str = "git-credentials";
pub const DEFAULT_SBOM_FORMAT: &str = "spdx-json";
pub const DEFAULT_KANIKO_IMAGE: &str = "gcr.io/kaniko-project/executor:v1.19.0";
pub const DEFAULT_SYFT_IMAGE: &str = "anchore/syft:v1.4.1";
pub const DEFAULT_COSIGN_IMAGE: &str = "gcr.io/projectsigstore/cosign:v2.2.3";

const REDACTED: &str = "***";

/// Complete worker configuration.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerConfig {
    /// Identity registered with the queue. Generated when unset.
    pub worker_id: Option<String>,
    pub database_url: Option<String>,
    /// Namespace the build jobs run in.
    pub namespace: String,
    pub registry: RegistrySettings,
    pub build: BuildSettings,
    pub sbom: SbomSettings,
    pub signing: SigningSettings,
    pub worker: WorkerSettings,
    pub callback: CallbackSettings,
    pub images: ImageSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySettings {
    /// Registry prefix images are pushed under, e.g. `ghcr.io/acme`.
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Cluster secret holding `.dockerconfigjson` for pushes and pulls.
    pub secret: String,
    /// Layer cache location; `{url}/cache` when unset.
    pub cache_repo: Option<String>,
}

impl RegistrySettings {
    pub fn cache_repo(&self) -> String {
        self.cache_repo
            .clone()
            .unwrap_or_else(|| format!("{}/cache", self.url.trim_end_matches('/')))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSettings {
    /// Wall-clock cap for one build, all stages included.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_concurrent: usize,
    /// Cluster secret with a `token` key for private repositories.
    pub git_credentials_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SbomSettings {
    pub enabled: bool,
    pub format: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SigningSettings {
    pub enabled: bool,
    /// Cluster secret holding `cosign.key` and an optional `password`.
    pub key_secret: Option<String>,
    /// Sign with short-lived identity credentials when no key is set.
    pub keyless: bool,
}

/// How images get signed, if at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningMode {
    Key { secret: String },
    Keyless,
}

impl SigningSettings {
    /// The signing mode in effect, or `None` when signing is off or neither
    /// a key nor keyless identity is configured.
    pub fn mode(&self) -> Option<SigningMode> {
        if !self.enabled {
            return None;
        }
        match self.key_secret.as_deref().filter(|k| !k.is_empty()) {
            Some(secret) => Some(SigningMode::Key {
                secret: secret.to_string(),
            }),
            None if self.keyless => Some(SigningMode::Keyless),
            None => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSettings {
    /// Longest a single dequeue waits for a job.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Pause after a failed dequeue.
    #[serde(with = "humantime_serde")]
    pub dequeue_backoff: Duration,
    /// Ceiling on draining in-flight builds at shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub unregister_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackSettings {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Bearer token sent with callbacks.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSettings {
    pub kaniko: String,
    pub syft: String,
    pub cosign: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            database_url: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            registry: RegistrySettings {
                url: DEFAULT_REGISTRY.to_string(),
                user: None,
                password: None,
                secret: DEFAULT_REGISTRY_SECRET.to_string(),
                cache_repo: None,
            },
            build: BuildSettings {
                timeout: Duration::from_secs(30 * 60),
                max_concurrent: 3,
                git_credentials_secret: Some(DEFAULT_GIT_CREDENTIALS.to_string()),
            },
            sbom: SbomSettings {
                enabled: true,
                format: DEFAULT_SBOM_FORMAT.to_string(),
            },
            signing: SigningSettings {
                enabled: true,
                key_secret: None,
                keyless: false,
            },
            worker: WorkerSettings {
                poll_interval: Duration::from_secs(5),
                dequeue_backoff: Duration::from_secs(1),
                shutdown_timeout: Duration::from_secs(5 * 60),
                unregister_timeout: Duration::from_secs(5),
            },
            callback: CallbackSettings {
                timeout: Duration::from_secs(30),
                token: None,
            },
            images: ImageSettings {
                kaniko: DEFAULT_KANIKO_IMAGE.to_string(),
                syft: DEFAULT_SYFT_IMAGE.to_string(),
                cosign: DEFAULT_COSIGN_IMAGE.to_string(),
            },
        }
    }
}

impl WorkerConfig {
    /// Read and parse a KDL config file on top of the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_kdl(&text)
    }

    /// Parse KDL text on top of the defaults.
    pub fn from_kdl(kdl: &str) -> ConfigResult<Self> {
        let doc: KdlDocument = kdl.parse()?;
        let mut cfg = WorkerConfig::default();

        for node in doc.nodes() {
            match node.name().value() {
                "worker-id" => cfg.worker_id = Some(required_string_arg(node)?),
                "database-url" => cfg.database_url = Some(required_string_arg(node)?),
                "namespace" => cfg.namespace = required_string_arg(node)?,
                "registry" => apply_registry(node, &mut cfg.registry)?,
                "build" => apply_build(node, &mut cfg.build)?,
                "sbom" => apply_sbom(node, &mut cfg.sbom)?,
                "signing" => apply_signing(node, &mut cfg.signing)?,
                "worker" => apply_worker(node, &mut cfg.worker)?,
                "callback" => apply_callback(node, &mut cfg.callback)?,
                "images" => apply_images(node, &mut cfg.images)?,
                _ => {} // Ignore unknown nodes
            }
        }

        Ok(cfg)
    }

    /// Check invariants the worker relies on.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.registry.url.trim().is_empty() {
            return Err(ConfigError::MissingField("registry".to_string()));
        }
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::MissingField("namespace".to_string()));
        }
        if self.build.max_concurrent == 0 {
            return Err(ConfigError::invalid(
                "build.max-concurrent",
                "must be at least 1",
            ));
        }
        for (field, value) in [
            ("build.timeout", self.build.timeout),
            ("worker.poll-interval", self.worker.poll_interval),
            ("worker.shutdown-timeout", self.worker.shutdown_timeout),
            ("worker.unregister-timeout", self.worker.unregister_timeout),
            ("callback.timeout", self.callback.timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        if let Some(url) = &self.database_url {
            url::Url::parse(url)
                .map_err(|e| ConfigError::invalid("database-url", e.to_string()))?;
        }
        Ok(())
    }

    /// Copy with credentials masked, for printing.
    pub fn redacted(&self) -> Self {
        let mut cfg = self.clone();
        if cfg.registry.password.is_some() {
            cfg.registry.password = Some(REDACTED.to_string());
        }
        if cfg.callback.token.is_some() {
            cfg.callback.token = Some(REDACTED.to_string());
        }
        if let Some(url) = cfg.database_url.as_deref().and_then(|u| url::Url::parse(u).ok()) {
            if url.password().is_some() {
                let mut masked = url.clone();
                let _ = masked.set_password(Some(REDACTED));
                cfg.database_url = Some(masked.to_string());
            }
        }
        cfg
    }
}

fn apply_registry(node: &KdlNode, reg: &mut RegistrySettings) -> ConfigResult<()> {
    if let Some(url) = get_first_string_arg(node) {
        reg.url = url;
    }
    for child in children(node) {
        match child.name().value() {
            "url" => reg.url = required_string_arg(child)?,
            "user" => reg.user = Some(required_string_arg(child)?),
            "password" => reg.password = Some(required_string_arg(child)?),
            "secret" => reg.secret = required_string_arg(child)?,
            "cache-repo" => reg.cache_repo = Some(required_string_arg(child)?),
            _ => {}
        }
    }
    Ok(())
}

fn apply_build(node: &KdlNode, build: &mut BuildSettings) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "timeout" => build.timeout = duration_arg(child, "build.timeout")?,
            "max-concurrent" => {
                build.max_concurrent = usize_arg(child, "build.max-concurrent")?;
            }
            "git-credentials" => {
                let secret = required_string_arg(child)?;
                build.git_credentials_secret = (!secret.is_empty()).then_some(secret);
            }
            _ => {}
        }
    }
    Ok(())
}

fn apply_sbom(node: &KdlNode, sbom: &mut SbomSettings) -> ConfigResult<()> {
    if let Some(enabled) = get_bool_prop(node, "enabled") {
        sbom.enabled = enabled;
    }
    if let Some(format) = get_string_prop(node, "format") {
        sbom.format = format;
    }
    Ok(())
}

fn apply_signing(node: &KdlNode, signing: &mut SigningSettings) -> ConfigResult<()> {
    if let Some(enabled) = get_bool_prop(node, "enabled") {
        signing.enabled = enabled;
    }
    if let Some(key) = get_string_prop(node, "key-secret") {
        signing.key_secret = (!key.is_empty()).then_some(key);
    }
    if let Some(keyless) = get_bool_prop(node, "keyless") {
        signing.keyless = keyless;
    }
    Ok(())
}

fn apply_worker(node: &KdlNode, worker: &mut WorkerSettings) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "poll-interval" => worker.poll_interval = duration_arg(child, "worker.poll-interval")?,
            "dequeue-backoff" => {
                worker.dequeue_backoff = duration_arg(child, "worker.dequeue-backoff")?;
            }
            "shutdown-timeout" => {
                worker.shutdown_timeout = duration_arg(child, "worker.shutdown-timeout")?;
            }
            "unregister-timeout" => {
                worker.unregister_timeout = duration_arg(child, "worker.unregister-timeout")?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn apply_callback(node: &KdlNode, callback: &mut CallbackSettings) -> ConfigResult<()> {
    if let Some(timeout) = get_string_prop(node, "timeout") {
        callback.timeout = parse_duration("callback.timeout", &timeout)?;
    }
    if let Some(token) = get_string_prop(node, "token") {
        callback.token = (!token.is_empty()).then_some(token);
    }
    Ok(())
}

fn apply_images(node: &KdlNode, images: &mut ImageSettings) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "kaniko" => images.kaniko = required_string_arg(child)?,
            "syft" => images.syft = required_string_arg(child)?,
            "cosign" => images.cosign = required_string_arg(child)?,
            _ => {}
        }
    }
    Ok(())
}

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn required_string_arg(node: &KdlNode) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(node.name().value().to_string()))
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn duration_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let entry = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;

    if let Some(secs) = entry.value().as_integer() {
        let secs = u64::try_from(secs).map_err(|_| ConfigError::invalid(field, "must not be negative"))?;
        return Ok(Duration::from_secs(secs));
    }

    let text = entry
        .value()
        .as_string()
        .ok_or_else(|| ConfigError::invalid(field, "expected a duration string"))?;
    parse_duration(field, text)
}

fn usize_arg(node: &KdlNode, field: &str) -> ConfigResult<usize> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::invalid(field, "expected an integer"))
        .and_then(|n| usize::try_from(n).map_err(|_| ConfigError::invalid(field, "out of range")))
}
