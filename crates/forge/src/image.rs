//! Talos Image Factory integration.
//!
//! Builds a schematic carrying the cluster's system extensions and resolves
//! the installer image URL for it. Materializing the image onto a compute
//! host is a storage operation and lives on the hypervisor.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Talos Image Factory base URL.
pub const IMAGE_FACTORY_URL: &str = "https://factory.talos.dev";

/// Default timeout for factory requests.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Errors from the image service.
#[derive(Error, Debug)]
pub enum ImageError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Schematic serialization failed.
    #[error("schematic error: {0}")]
    Schematic(#[from] serde_yaml::Error),
}

/// Handle to a built image (a factory schematic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHandle {
    /// Schematic ID assigned by the factory.
    pub schematic_id: String,
}

/// OS image build and URL resolution.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Request an image build with the given official extensions.
    async fn build_image(&self, extensions: &[String]) -> Result<ImageHandle, ImageError>;

    /// Resolve the installer ISO URL for a built image.
    fn download_url(
        &self,
        image: &ImageHandle,
        arch: &str,
        platform: &str,
        talos_version: &str,
    ) -> String;
}

#[derive(Serialize)]
struct Schematic<'a> {
    customization: Customization<'a>,
}

#[derive(Serialize)]
struct Customization<'a> {
    #[serde(rename = "systemExtensions")]
    system_extensions: SystemExtensions<'a>,
}

#[derive(Serialize)]
struct SystemExtensions<'a> {
    #[serde(rename = "officialExtensions")]
    official_extensions: &'a [String],
}

#[derive(Deserialize)]
struct SchematicResponse {
    id: String,
}

/// Talos Image Factory client.
#[derive(Clone)]
pub struct ImageFactory {
    client: reqwest::Client,
    base_url: String,
}

impl ImageFactory {
    /// Create a client against the public factory.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, ImageError> {
        Self::with_base_url(IMAGE_FACTORY_URL)
    }

    /// Create a client against a specific factory endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ImageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ImageService for ImageFactory {
    async fn build_image(&self, extensions: &[String]) -> Result<ImageHandle, ImageError> {
        let schematic = Schematic {
            customization: Customization {
                system_extensions: SystemExtensions {
                    official_extensions: extensions,
                },
            },
        };
        let body = serde_yaml::to_string(&schematic)?;
        debug!(extensions = extensions.len(), "submitting schematic");

        let response = self
            .client
            .post(format!("{}/schematics", self.base_url))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ImageError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let schematic: SchematicResponse = response.json().await?;
        info!(schematic_id = %schematic.id, "schematic created");
        Ok(ImageHandle {
            schematic_id: schematic.id,
        })
    }

    fn download_url(
        &self,
        image: &ImageHandle,
        arch: &str,
        platform: &str,
        talos_version: &str,
    ) -> String {
        format!(
            "{}/image/{}/{talos_version}/{platform}-{arch}.iso",
            self.base_url, image.schematic_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn build_image_submits_extensions_and_returns_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/schematics"))
            .and(body_string_contains("siderolabs/qemu-guest-agent"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"id": "abc123"})),
            )
            .mount(&server)
            .await;

        let factory = ImageFactory::with_base_url(server.uri()).unwrap();
        let image = factory
            .build_image(&["siderolabs/qemu-guest-agent".to_string()])
            .await
            .unwrap();
        assert_eq!(image.schematic_id, "abc123");
    }

    #[test]
    fn download_url_shape() {
        let factory = ImageFactory::new().unwrap();
        let image = ImageHandle {
            schematic_id: "abc123".to_string(),
        };
        assert_eq!(
            factory.download_url(&image, "amd64", "metal", "v1.10.0"),
            "https://factory.talos.dev/image/abc123/v1.10.0/metal-amd64.iso"
        );
    }
}
