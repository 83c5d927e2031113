//! Cluster job specifications for the three build stages.

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, KeyToPath,
    NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, PodSecurityContext, PodSpec,
    PodTemplateSpec, PreferredSchedulingTerm, ResourceRequirements, SeccompProfile,
    SecretKeySelector, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kiln_config::{SigningMode, WorkerConfig};
use kiln_core::{BuildJob, ImageTags, ResourceId};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const LABEL_BUILD_ID: &str = "kiln.dev/build-id";
pub const LABEL_SERVICE_ID: &str = "kiln.dev/service-id";
pub const LABEL_APP_NAME: &str = "app.kubernetes.io/name";

const BUILD_TTL_SECS: i32 = 3600;
const SBOM_TTL_SECS: i32 = 1800;
const SBOM_DEADLINE_SECS: i64 = 300;
const SIGN_TTL_SECS: i32 = 1800;
const SIGN_DEADLINE_SECS: i64 = 180;
const NON_ROOT_UID: i64 = 1000;
const DEFAULT_BRANCH: &str = "main";

/// One pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Build,
    Sbom,
    Sign,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Sbom => "sbom",
            Stage::Sign => "sign",
        }
    }

    /// Container whose output is the stage's log.
    pub fn container(&self) -> &'static str {
        match self {
            Stage::Build => "kaniko",
            Stage::Sbom => "syft",
            Stage::Sign => "cosign",
        }
    }

    /// Value of the `app.kubernetes.io/name` label.
    pub fn role(&self) -> &'static str {
        match self {
            Stage::Build => "kaniko-build",
            Stage::Sbom => "syft-sbom",
            Stage::Sign => "cosign-sign",
        }
    }

    /// `{stage}-{id as 32 hex digits}`, unique per build and within the
    /// 63-character name limit.
    pub fn job_name(&self, build_id: ResourceId) -> String {
        format!("{}-{}", self.name(), build_id.as_uuid().simple())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Remote build context for kaniko:
/// `git://{repo}#refs/heads/{branch}#{sha}[:{subdir}]`.
pub fn git_context(job: &BuildJob) -> String {
    let repo = job
        .git_repo
        .strip_prefix("https://")
        .or_else(|| job.git_repo.strip_prefix("http://"))
        .unwrap_or(&job.git_repo);
    let branch = if job.git_branch.trim().is_empty() {
        DEFAULT_BRANCH
    } else {
        job.git_branch.trim()
    };

    let mut context = format!("git://{}#refs/heads/{}#{}", repo, branch, job.git_sha);
    let subdir = job.build_config.context();
    if subdir != "." {
        context.push(':');
        context.push_str(subdir.trim_start_matches("./"));
    }
    context
}

/// Arguments for the kaniko executor.
pub fn kaniko_args(
    cfg: &WorkerConfig,
    job: &BuildJob,
    tags: &ImageTags,
    created: DateTime<Utc>,
) -> Vec<String> {
    let mut args = vec![
        format!("--dockerfile={}", job.build_config.dockerfile()),
        format!("--context={}", git_context(job)),
        format!("--destination={}", tags.primary),
        format!("--destination={}", tags.latest),
        "--cache=true".to_string(),
        format!("--cache-repo={}", cfg.registry.cache_repo()),
        "--cache-ttl=168h".to_string(),
        "--reproducible".to_string(),
        "--snapshot-mode=redo".to_string(),
        format!("--label=org.opencontainers.image.source={}", job.git_repo),
        format!("--label=org.opencontainers.image.revision={}", job.git_sha),
        format!(
            "--label=org.opencontainers.image.created={}",
            created.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
        format!("--label=dev.kiln.service-id={}", job.service_id),
        format!("--label=dev.kiln.release-id={}", job.release_id),
        "--verbosity=info".to_string(),
    ];

    for (key, value) in &job.build_config.build_args {
        args.push(format!("--build-arg={}={}", key, value));
    }
    if let Some(target) = job.build_config.target() {
        args.push(format!("--target={}", target));
    }
    args
}

/// The image build job. Runs as root inside a capability-dropped container,
/// since unpacking base layers has to recreate arbitrary file ownership.
pub fn build_job(
    cfg: &WorkerConfig,
    job: &BuildJob,
    tags: &ImageTags,
    deadline: Duration,
    created: DateTime<Utc>,
) -> Job {
    let stage = Stage::Build;
    let mut volumes = vec![docker_config_volume(cfg)];
    let mut mounts = vec![read_only_mount("docker-config", "/kaniko/.docker")];
    let mut env = Vec::new();

    if let Some(secret) = &cfg.build.git_credentials_secret {
        volumes.push(Volume {
            name: "git-credentials".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(read_only_mount("git-credentials", "/kaniko/git-credentials"));
        env.push(secret_env("GIT_TOKEN", secret, "token"));
    }

    let container = Container {
        name: stage.container().to_string(),
        image: Some(cfg.images.kaniko.clone()),
        args: Some(kaniko_args(cfg, job, tags, created)),
        env: Some(env),
        resources: Some(resources("500m", "1Gi", "2", "4Gi")),
        security_context: Some(container_security(false)),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let pod = PodSpec {
        restart_policy: Some("Never".to_string()),
        security_context: Some(pod_security(0, false)),
        affinity: Some(avoid_gpu_nodes()),
        containers: vec![container],
        volumes: Some(volumes),
        ..Default::default()
    };

    let mut metadata = job_metadata(cfg, stage, job);
    metadata.annotations = Some(BTreeMap::from([
        ("kiln.dev/git-repo".to_string(), job.git_repo.clone()),
        ("kiln.dev/git-sha".to_string(), job.git_sha.clone()),
        ("kiln.dev/git-branch".to_string(), job.git_branch.clone()),
    ]));

    wrap(
        metadata,
        stage,
        job.id,
        BUILD_TTL_SECS,
        deadline.as_secs().max(1) as i64,
        pod,
    )
}

/// Syft scan of the pushed image.
pub fn sbom_job(cfg: &WorkerConfig, job: &BuildJob, image: &str) -> Job {
    let stage = Stage::Sbom;
    let container = Container {
        name: stage.container().to_string(),
        image: Some(cfg.images.syft.clone()),
        args: Some(vec![
            "scan".to_string(),
            "--output".to_string(),
            cfg.sbom.format.clone(),
            format!("registry:{}", image),
        ]),
        env: Some(vec![plain_env("DOCKER_CONFIG", "/home/syft/.docker")]),
        resources: Some(resources("100m", "256Mi", "500m", "1Gi")),
        security_context: Some(container_security(true)),
        volume_mounts: Some(vec![
            read_only_mount("docker-config", "/home/syft/.docker"),
            scratch_mount(),
        ]),
        ..Default::default()
    };

    let pod = PodSpec {
        restart_policy: Some("Never".to_string()),
        security_context: Some(pod_security(NON_ROOT_UID, true)),
        containers: vec![container],
        volumes: Some(vec![docker_config_volume(cfg), scratch_volume()]),
        ..Default::default()
    };

    wrap(
        job_metadata(cfg, stage, job),
        stage,
        job.id,
        SBOM_TTL_SECS,
        SBOM_DEADLINE_SECS,
        pod,
    )
}

/// Cosign signature of the pushed image.
pub fn sign_job(cfg: &WorkerConfig, job: &BuildJob, image: &str, mode: &SigningMode) -> Job {
    let stage = Stage::Sign;
    let mut volumes = vec![docker_config_volume(cfg), scratch_volume()];
    let mut mounts = vec![
        read_only_mount("docker-config", "/home/nonroot/.docker"),
        scratch_mount(),
    ];
    let mut env = vec![plain_env("DOCKER_CONFIG", "/home/nonroot/.docker")];

    let args = match mode {
        SigningMode::Key { secret } => {
            volumes.push(Volume {
                name: "cosign-key".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(read_only_mount("cosign-key", "/cosign"));
            env.push(secret_env("COSIGN_PASSWORD", secret, "password"));
            vec![
                "sign".to_string(),
                "--key".to_string(),
                "/cosign/cosign.key".to_string(),
                "--yes".to_string(),
                image.to_string(),
            ]
        }
        SigningMode::Keyless => {
            env.push(plain_env("COSIGN_EXPERIMENTAL", "1"));
            vec!["sign".to_string(), "--yes".to_string(), image.to_string()]
        }
    };

    let container = Container {
        name: stage.container().to_string(),
        image: Some(cfg.images.cosign.clone()),
        args: Some(args),
        env: Some(env),
        resources: Some(resources("50m", "128Mi", "200m", "512Mi")),
        security_context: Some(container_security(true)),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let pod = PodSpec {
        restart_policy: Some("Never".to_string()),
        security_context: Some(pod_security(NON_ROOT_UID, true)),
        containers: vec![container],
        volumes: Some(volumes),
        ..Default::default()
    };

    wrap(
        job_metadata(cfg, stage, job),
        stage,
        job.id,
        SIGN_TTL_SECS,
        SIGN_DEADLINE_SECS,
        pod,
    )
}

fn stage_labels(stage: Stage, build_id: ResourceId) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_BUILD_ID.to_string(), build_id.to_string()),
        (LABEL_APP_NAME.to_string(), stage.role().to_string()),
    ])
}

fn job_metadata(cfg: &WorkerConfig, stage: Stage, job: &BuildJob) -> ObjectMeta {
    let mut labels = stage_labels(stage, job.id);
    labels.insert(LABEL_SERVICE_ID.to_string(), job.service_id.to_string());
    ObjectMeta {
        name: Some(stage.job_name(job.id)),
        namespace: Some(cfg.namespace.clone()),
        labels: Some(labels),
        ..Default::default()
    }
}

fn wrap(
    metadata: ObjectMeta,
    stage: Stage,
    build_id: ResourceId,
    ttl_secs: i32,
    deadline_secs: i64,
    pod: PodSpec,
) -> Job {
    Job {
        metadata,
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(ttl_secs),
            active_deadline_seconds: Some(deadline_secs),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(stage_labels(stage, build_id)),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resources(cpu_req: &str, mem_req: &str, cpu_limit: &str, mem_limit: &str) -> ResourceRequirements {
    let list = |cpu: &str, mem: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(mem.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(list(cpu_req, mem_req)),
        limits: Some(list(cpu_limit, mem_limit)),
        ..Default::default()
    }
}

fn pod_security(uid: i64, non_root: bool) -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(non_root),
        run_as_user: Some(uid),
        run_as_group: Some(uid),
        fs_group: Some(uid),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_security(read_only_root: bool) -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(read_only_root),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn avoid_gpu_nodes() -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                PreferredSchedulingTerm {
                    weight: 100,
                    preference: NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: "nvidia.com/gpu".to_string(),
                            operator: "DoesNotExist".to_string(),
                            values: None,
                        }]),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn docker_config_volume(cfg: &WorkerConfig) -> Volume {
    Volume {
        name: "docker-config".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(cfg.registry.secret.clone()),
            items: Some(vec![KeyToPath {
                key: ".dockerconfigjson".to_string(),
                path: "config.json".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn scratch_volume() -> Volume {
    Volume {
        name: "tmp".to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn scratch_mount() -> VolumeMount {
    VolumeMount {
        name: "tmp".to_string(),
        mount_path: "/tmp".to_string(),
        ..Default::default()
    }
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
