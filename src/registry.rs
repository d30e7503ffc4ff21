//! Extension registry client.
//!
//! Resolves `publisher.name[@version]` to metadata and downloads the VSIX
//! package. [`OpenVsxRegistry`] speaks the Open VSX REST API:
//! - `GET /api/{namespace}/{name}` (latest) or `/api/{namespace}/{name}/{version}`
//! - `GET /api/{namespace}/{name}/{version}/file/{namespace}.{name}-{version}.vsix`

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

/// Registry-side description of an extension version
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionMetadata {
    pub publisher: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engines: BTreeMap<String, String>,
    /// Dependency ids (`publisher.name`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// `universal`, `web`, or a platform such as `linux-x64`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_platform: Option<String>,
}

/// Errors talking to a registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid registry URL: {0}")]
    InvalidUrl(String),

    #[error("Registry returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Package not found: {0}")]
    PackageNotFound(String),
}

/// Source of extension metadata and packages
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Metadata for `version`, or the latest version when `None`. `Ok(None)` if unknown.
    async fn get_extension(
        &self,
        publisher: &str,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<ExtensionMetadata>, RegistryError>;

    /// Raw VSIX bytes
    async fn download(
        &self,
        publisher: &str,
        name: &str,
        version: &str,
    ) -> Result<Vec<u8>, RegistryError>;
}

/// Open VSX wire format
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenVsxExtension {
    namespace: String,
    name: String,
    version: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    engines: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: Vec<OpenVsxReference>,
    #[serde(default)]
    target_platform: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenVsxReference {
    namespace: String,
    extension: String,
}

impl From<OpenVsxExtension> for ExtensionMetadata {
    fn from(ext: OpenVsxExtension) -> Self {
        Self {
            publisher: ext.namespace,
            name: ext.name,
            version: ext.version,
            display_name: ext.display_name,
            description: ext.description,
            engines: ext.engines,
            dependencies: ext
                .dependencies
                .into_iter()
                .map(|d| format!("{}.{}", d.namespace, d.extension).to_lowercase())
                .collect(),
            target_platform: ext.target_platform,
        }
    }
}

/// HTTP client for an Open VSX compatible registry
#[derive(Debug, Clone)]
pub struct OpenVsxRegistry {
    client: reqwest::Client,
    base_url: Url,
}

impl OpenVsxRegistry {
    pub fn new(base_url: &str) -> Result<Self, RegistryError> {
        let base_url =
            Url::parse(base_url).map_err(|e| RegistryError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(RegistryError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
        })
    }

    /// `{base}/api/{segments...}` with each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RegistryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl RegistryClient for OpenVsxRegistry {
    async fn get_extension(
        &self,
        publisher: &str,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<ExtensionMetadata>, RegistryError> {
        let url = match version {
            Some(v) => self.endpoint(&[publisher, name, v])?,
            None => self.endpoint(&[publisher, name])?,
        };
        debug!(url = %url, "Fetching extension metadata");

        let response = self.client.get(url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RegistryError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let ext: OpenVsxExtension = response.json().await?;
        if let Some(error) = &ext.error {
            debug!(url = %url, error = %error, "Registry reported an error");
            return Ok(None);
        }
        Ok(Some(ext.into()))
    }

    async fn download(
        &self,
        publisher: &str,
        name: &str,
        version: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let file = format!("{}.{}-{}.vsix", publisher, name, version);
        let url = self.endpoint(&[publisher, name, version, "file", &file])?;
        debug!(url = %url, "Downloading extension package");

        let response = self.client.get(url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::PackageNotFound(file));
        }
        if !response.status().is_success() {
            return Err(RegistryError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
