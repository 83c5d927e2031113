//! Image tag scheme.

use regex::Regex;
use std::sync::LazyLock;

use crate::BuildJob;

static INVALID_REPO_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9._-]+").expect("valid regex"));

/// Destination tags for one build.
///
/// Both tags depend only on the registry, the repository path and the commit
/// SHA, so rebuilding a commit pushes to the same tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTags {
    /// `{registry}/{repository}:{short-sha}`
    pub primary: String,
    /// `{registry}/{repository}:latest`
    pub latest: String,
}

impl ImageTags {
    pub fn for_job(registry: &str, job: &BuildJob) -> Self {
        let base = format!("{}/{}", registry.trim_end_matches('/'), repository_path(job));
        Self {
            primary: format!("{}:{}", base, job.short_sha()),
            latest: format!("{}:latest", base),
        }
    }

    /// Signature reference cosign stores next to the image.
    pub fn signature_ref(&self) -> String {
        format!("{}.sig", self.primary)
    }
}

/// Repository path under the registry: the sanitized service name, or
/// `{project.short()}/{service.short()}` when the job carries no usable name.
pub fn repository_path(job: &BuildJob) -> String {
    job.service_name
        .as_deref()
        .map(sanitize_repository)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("{}/{}", job.project_id.short(), job.service_id.short()))
}

fn sanitize_repository(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    INVALID_REPO_CHARS
        .replace_all(&lowered, "-")
        .trim_matches(|c| c == '-' || c == '.' || c == '_')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BuildConfig, ResourceId};
    use chrono::Utc;

    fn job(service_name: Option<&str>, sha: &str) -> BuildJob {
        BuildJob {
            id: ResourceId::new(),
            release_id: ResourceId::new(),
            service_id: "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".parse().unwrap(),
            project_id: "11111111-2222-3333-4444-555555555555".parse().unwrap(),
            service_name: service_name.map(String::from),
            git_repo: "github.com/acme/api".to_string(),
            git_sha: sha.to_string(),
            git_branch: "main".to_string(),
            build_config: BuildConfig::default(),
            callback_url: None,
            priority: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_tags_use_service_name() {
        let tags = ImageTags::for_job("registry.example.com/acme", &job(Some("api"), "abc123def456"));
        assert_eq!(tags.primary, "registry.example.com/acme/api:abc123de");
        assert_eq!(tags.latest, "registry.example.com/acme/api:latest");
    }

    #[test]
    fn test_tags_fall_back_to_short_ids() {
        let tags = ImageTags::for_job("ghcr.io/acme/", &job(None, "abc123456789abcd"));
        assert_eq!(tags.primary, "ghcr.io/acme/55555555/eeeeeeee:abc12345");
        assert!(tags.latest.ends_with("/55555555/eeeeeeee:latest"));
    }

    #[test]
    fn test_tags_are_deterministic() {
        let a = job(Some("Billing API"), "abc123def456");
        let mut b = a.clone();
        b.id = ResourceId::new();
        b.release_id = ResourceId::new();
        let first = ImageTags::for_job("ghcr.io", &a);
        for _ in 0..10 {
            assert_eq!(ImageTags::for_job("ghcr.io", &b), first);
        }
        assert_eq!(first.primary, "ghcr.io/billing-api:abc123de");
    }

    #[test]
    fn test_unusable_service_name_falls_back() {
        let tags = ImageTags::for_job("ghcr.io", &job(Some("***"), "abc123def456"));
        assert_eq!(tags.primary, "ghcr.io/55555555/eeeeeeee:abc123de");
    }

    #[test]
    fn test_signature_ref() {
        let tags = ImageTags::for_job("ghcr.io", &job(Some("api"), "abc123def456"));
        assert_eq!(tags.signature_ref(), "ghcr.io/api:abc123de.sig");
    }
}
