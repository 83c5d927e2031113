//! Registry manifest lookups.

use async_trait::async_trait;
use kiln_config::RegistrySettings;
use kiln_core::{Error, Result};
use reqwest::header::ACCEPT;
use tracing::debug;

const DOCKER_HUB: &str = "registry-1.docker.io";
const DIGEST_HEADER: &str = "docker-content-digest";
const MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";

/// Resolves a pushed tag to its content digest.
#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn resolve(&self, image: &str) -> Result<String>;
}

/// A reference split into registry host, repository and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub host: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self> {
        let image = image.trim();
        if image.is_empty() {
            return Err(Error::InvalidInput("empty image reference".to_string()));
        }

        let (name, tag) = match image.rfind(':') {
            Some(idx) if !image[idx..].contains('/') => (&image[..idx], &image[idx + 1..]),
            _ => (image, "latest"),
        };

        let (host, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DOCKER_HUB.to_string(), name.to_string()),
            None => (DOCKER_HUB.to_string(), format!("library/{}", name)),
        };

        if repository.is_empty() || tag.is_empty() {
            return Err(Error::InvalidInput(format!("invalid image reference: {}", image)));
        }

        Ok(Self {
            host,
            repository,
            tag: tag.to_string(),
        })
    }
}

/// Registry v2 client that reads the `Docker-Content-Digest` header of a
/// manifest `HEAD` request.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    user: Option<String>,
    password: Option<String>,
    scheme: &'static str,
}

impl RegistryClient {
    pub fn new(user: Option<String>, password: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            user,
            password,
            scheme: "https",
        }
    }

    pub fn from_settings(settings: &RegistrySettings) -> Self {
        Self::new(settings.user.clone(), settings.password.clone())
    }

    /// Talk plain HTTP, for local registries.
    pub fn insecure(mut self) -> Self {
        self.scheme = "http";
        self
    }

    fn manifest_url(&self, reference: &ImageReference) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme, reference.host, reference.repository, reference.tag
        )
    }
}

#[async_trait]
impl DigestResolver for RegistryClient {
    async fn resolve(&self, image: &str) -> Result<String> {
        let reference = ImageReference::parse(image)?;
        let url = self.manifest_url(&reference);

        let mut request = self.http.head(&url).header(ACCEPT, MANIFEST_TYPES);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Registry(format!("manifest request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "manifest lookup for {} returned {}",
                image,
                response.status()
            )));
        }

        let digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Registry(format!("no digest header for {}", image)))?;

        debug!(image = %image, digest = %digest, "Resolved image digest");
        Ok(digest)
    }
}
