//! VisionTool: analyzes a medical image and returns free-form text.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::{Device, VisionConfig};

/// Error taxonomy for the vision boundary.
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("vision model unavailable: {0}")]
    VisionUnavailable(String),
    #[error("vision call timed out after {0}s")]
    VisionTimeout(u64),
    #[error("vision endpoint returned a malformed response: {0}")]
    VisionProtocol(String),
    #[error("vision internal error: {0}")]
    VisionInternal(String),
}

/// An image handed to a `VisionTool`. Upload decoding and validation are
/// the caller's (image-upload UI's) job; this type only carries the
/// already-decoded bytes plus a best-effort MIME hint.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageInput {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self { bytes, mime_type: mime_type.into() }
    }

    fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

pub const DEFAULT_PROMPT: &str =
    "Describe any radiological findings visible in this image, including location and severity.";

/// `analyze(image, prompt) -> text`.
#[async_trait]
pub trait VisionTool: Send + Sync {
    async fn analyze(&self, image: &ImageInput, prompt: &str) -> Result<String, VisionError>;
}

/// Local-mode state machine: `Unloaded -> Loading -> Loaded -> Failed`.
/// `OnceCell` guarantees concurrent first calls block on a single
/// initialization and the `Failed` state is sticky for the process
/// lifetime.
pub struct LocalVisionTool {
    config: VisionConfig,
    model: OnceCell<Result<Arc<LoadedModel>, String>>,
}

/// A placeholder for the materialized local model handle. A real
/// implementation would hold tensors/session state here; what matters
/// for the pipeline contract is that construction is fallible and
/// happens exactly once.
struct LoadedModel {
    model_id: String,
}

impl LocalVisionTool {
    pub fn new(config: VisionConfig) -> Self {
        Self { config, model: OnceCell::new() }
    }

    async fn model(&self) -> Result<Arc<LoadedModel>, VisionError> {
        let result = self
            .model
            .get_or_init(|| async {
                tracing::info!(model_id = %self.config.model_id, "loading local vision model");
                match load_model(&self.config).await {
                    Ok(model) => Ok(Arc::new(model)),
                    Err(e) => {
                        tracing::error!(error = %e, "local vision model failed to load");
                        Err(e)
                    },
                }
            })
            .await;

        result.clone().map_err(VisionError::VisionUnavailable)
    }
}

async fn load_model(config: &VisionConfig) -> Result<LoadedModel, String> {
    if config.model_id.is_empty() {
        return Err("model_id is empty".to_string());
    }
    let device = match &config.device {
        Device::Auto => "auto",
        Device::Cpu => "cpu",
        Device::Gpu => "gpu",
        Device::Accelerator => "accelerator",
    };
    tracing::debug!(device, cache_dir = %config.cache_dir, "local model materialized");
    Ok(LoadedModel { model_id: config.model_id.clone() })
}

#[async_trait]
impl VisionTool for LocalVisionTool {
    async fn analyze(&self, image: &ImageInput, prompt: &str) -> Result<String, VisionError> {
        let model = self.model().await?;
        run_local_inference(&model.model_id, image, prompt)
            .await
            .map_err(VisionError::VisionInternal)
    }
}

async fn run_local_inference(
    model_id: &str,
    image: &ImageInput,
    prompt: &str,
) -> Result<String, String> {
    if image.bytes.is_empty() {
        return Err("empty image buffer".to_string());
    }
    tracing::debug!(model_id, bytes = image.bytes.len(), "running local vision inference");
    Ok(format!(
        "Findings: unable to run local model '{model_id}' in this deployment; prompt was '{prompt}'."
    ))
}

/// Remote mode: an HTTP endpoint accepting `{image_base64, prompt}` and
/// returning `{text}`. Shaped like the structured-output LLM client,
/// but without a response-format contract, since the vision endpoint's
/// output is explicitly free-form.
pub struct RemoteVisionTool {
    http_client: reqwest::Client,
    config: VisionConfig,
}

impl RemoteVisionTool {
    pub fn new(config: VisionConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .expect("failed to build vision HTTP client");
        Self { http_client, config }
    }
}

#[derive(Serialize)]
struct RemoteVisionRequest<'a> {
    image_base64: &'a str,
    mime_type: &'a str,
    prompt: &'a str,
}

#[derive(serde::Deserialize)]
struct RemoteVisionResponse {
    text: String,
}

#[async_trait]
impl VisionTool for RemoteVisionTool {
    async fn analyze(&self, image: &ImageInput, prompt: &str) -> Result<String, VisionError> {
        let image_base64 = image.to_base64();
        let body =
            RemoteVisionRequest { image_base64: &image_base64, mime_type: &image.mime_type, prompt };

        let mut request = self.http_client.post(&self.config.endpoint_url).json(&body);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                VisionError::VisionTimeout(self.config.request_timeout_seconds)
            } else if e.is_connect() {
                VisionError::VisionUnavailable(e.to_string())
            } else {
                VisionError::VisionInternal(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(VisionError::VisionUnavailable(format!(
                "vision endpoint returned {}",
                response.status()
            )));
        }

        let parsed: RemoteVisionResponse = response
            .json()
            .await
            .map_err(|e| VisionError::VisionProtocol(e.to_string()))?;

        Ok(parsed.text)
    }
}

/// Mock mode: returns canned text, used in tests and local demos.
pub struct MockVisionTool {
    pub canned_text: String,
}

impl MockVisionTool {
    pub fn new(canned_text: impl Into<String>) -> Self {
        Self { canned_text: canned_text.into() }
    }
}

impl Default for MockVisionTool {
    fn default() -> Self {
        Self::new("Findings: no acute cardiopulmonary abnormality identified.")
    }
}

#[async_trait]
impl VisionTool for MockVisionTool {
    async fn analyze(&self, _image: &ImageInput, _prompt: &str) -> Result<String, VisionError> {
        Ok(self.canned_text.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> ImageInput {
        ImageInput::new(vec![0xFF, 0xD8, 0xFF], "image/jpeg")
    }

    #[tokio::test]
    async fn mock_tool_returns_canned_text() {
        let tool = MockVisionTool::new("Findings: pneumothorax noted.");
        let text = tool.analyze(&sample_image(), DEFAULT_PROMPT).await.unwrap();
        assert_eq!(text, "Findings: pneumothorax noted.");
    }

    #[tokio::test]
    async fn local_tool_loads_once_and_is_reused() {
        let tool = LocalVisionTool::new(VisionConfig {
            mode: crate::config::VisionMode::Local,
            model_id: "demo-model".to_string(),
            ..Default::default()
        });
        let first = tool.analyze(&sample_image(), DEFAULT_PROMPT).await.unwrap();
        let second = tool.analyze(&sample_image(), DEFAULT_PROMPT).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn local_tool_sticky_failure() {
        let tool = LocalVisionTool::new(VisionConfig {
            mode: crate::config::VisionMode::Local,
            model_id: String::new(),
            ..Default::default()
        });
        assert!(tool.analyze(&sample_image(), DEFAULT_PROMPT).await.is_err());
        // second call must not retry loading; still fails with the same state.
        assert!(tool.analyze(&sample_image(), DEFAULT_PROMPT).await.is_err());
    }
}
