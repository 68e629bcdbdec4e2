mod dryrun;
mod openai;
mod replicate;

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use prismatic_contracts::models::{ModelRegistry, ModelSpec};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::artifacts::{ArtifactMetadata, ArtifactStore};
use crate::error::{EngineError, EngineResult};
use crate::http::{encode_data_url, load_image, ImageBytes};

pub use dryrun::DryrunProvider;
pub use openai::OpenAiProvider;
pub use replicate::ReplicateProvider;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub params: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditRequest {
    pub prompt: String,
    /// Absolute, relative or `data:` URLs of the images to edit.
    pub images: Vec<String>,
    pub mask: Option<String>,
    pub params: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub id: String,
    pub url: String,
    pub full_url: String,
    pub thumb_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutput {
    pub images: Vec<GeneratedImage>,
    /// Provider-side job id (prediction id) when the provider assigns one.
    pub job_id: Option<String>,
}

/// One provider family. `model` is already resolved and its default params
/// are merged into the request.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;

    fn supports_edit(&self) -> bool {
        false
    }

    async fn generate(
        &self,
        model: &ModelSpec,
        request: &GenerateRequest,
    ) -> EngineResult<ProviderOutput>;

    async fn edit(
        &self,
        model: &ModelSpec,
        _request: &EditRequest,
    ) -> EngineResult<ProviderOutput> {
        Err(EngineError::unsupported(&model.name, "edit"))
    }
}

struct Route {
    model: ModelSpec,
    provider: Arc<dyn ImageProvider>,
}

/// Model key to `(ModelSpec, provider)` dispatch, built once from the registry.
pub struct ProviderTable {
    routes: IndexMap<String, Route>,
}

impl ProviderTable {
    pub fn new(registry: &ModelRegistry, providers: Vec<Arc<dyn ImageProvider>>) -> Self {
        let mut routes = IndexMap::new();
        for model in registry.list() {
            let Some(provider) = providers
                .iter()
                .find(|provider| provider.name() == model.provider)
            else {
                tracing::debug!(
                    model = %model.name,
                    provider = %model.provider,
                    "no provider registered; model skipped"
                );
                continue;
            };
            routes.insert(
                model.name.clone(),
                Route {
                    model: model.clone(),
                    provider: provider.clone(),
                },
            );
        }
        Self { routes }
    }

    pub fn supports(&self, model_key: &str) -> bool {
        self.routes.contains_key(model_key)
    }

    pub fn supports_edit(&self, model_key: &str) -> bool {
        self.routes
            .get(model_key)
            .map(|route| route.model.can_edit() && route.provider.supports_edit())
            .unwrap_or(false)
    }

    pub fn model_keys(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    pub fn resolve(&self, model_key: &str) -> EngineResult<(&ModelSpec, &dyn ImageProvider)> {
        self.routes
            .get(model_key)
            .map(|route| (&route.model, route.provider.as_ref()))
            .ok_or_else(|| EngineError::ModelNotFound(model_key.to_string()))
    }

    pub async fn generate(
        &self,
        model_key: &str,
        request: &GenerateRequest,
    ) -> EngineResult<ProviderOutput> {
        let (model, provider) = self.resolve(model_key)?;
        let mut request = request.clone();
        request.params = model.merged_params(&request.params);
        let output = provider.generate(model, &request).await?;
        ensure_images(model, output)
    }

    pub async fn edit(
        &self,
        model_key: &str,
        request: &EditRequest,
    ) -> EngineResult<ProviderOutput> {
        let (model, provider) = self.resolve(model_key)?;
        if !model.can_edit() || !provider.supports_edit() {
            return Err(EngineError::unsupported(&model.name, "edit"));
        }
        let mut request = request.clone();
        request.params = model.merged_params(&request.params);
        let output = provider.edit(model, &request).await?;
        ensure_images(model, output)
    }
}

fn ensure_images(model: &ModelSpec, output: ProviderOutput) -> EngineResult<ProviderOutput> {
    if output.images.is_empty() {
        return Err(EngineError::InvalidOutput(format!(
            "{} returned no images",
            model.name
        )));
    }
    Ok(output)
}

/// Provider output before it is normalized into stored artifacts.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RawImage {
    Url(String),
    Bytes(ImageBytes),
}

/// Persists raw provider outputs. URLs already served by the store are kept
/// as they are; everything else is downloaded or decoded and stored.
pub(crate) async fn persist_outputs(
    store: &dyn ArtifactStore,
    http: &HttpClient,
    provider: &str,
    model: &ModelSpec,
    prompt: &str,
    outputs: Vec<RawImage>,
) -> EngineResult<Vec<GeneratedImage>> {
    let mut images = Vec::with_capacity(outputs.len());
    for output in outputs {
        let (image, source_url) = match output {
            RawImage::Url(url) if store.owns_url(&url) => {
                images.push(GeneratedImage {
                    id: owned_artifact_id(&url),
                    url: url.clone(),
                    full_url: url.clone(),
                    thumb_url: url,
                });
                continue;
            }
            RawImage::Url(url) => (load_image(http, provider, &url).await?, Some(url)),
            RawImage::Bytes(bytes) => (bytes, None),
        };
        let stored = store
            .persist(
                image.bytes,
                ArtifactMetadata {
                    provider: provider.to_string(),
                    model: model.name.clone(),
                    prompt: Some(prompt.to_string()),
                    source_url: source_url.filter(|url| !url.starts_with("data:")),
                    mime_type: image.mime_type,
                    extra: Map::new(),
                },
            )
            .await?;
        images.push(GeneratedImage {
            id: stored.id,
            url: stored.full_url.clone(),
            full_url: stored.full_url,
            thumb_url: stored.thumb_url,
        });
    }
    Ok(images)
}

fn owned_artifact_id(url: &str) -> String {
    let file = url.rsplit('/').next().unwrap_or(url);
    file.split('.').next().unwrap_or(file).to_string()
}

/// Bytes of an input image. Store-owned URLs are read from the store and
/// never go through the public base.
pub(crate) async fn fetch_input_image(
    store: &dyn ArtifactStore,
    http: &HttpClient,
    provider: &str,
    url: &str,
    public_base_url: Option<&str>,
) -> EngineResult<ImageBytes> {
    let trimmed = url.trim();
    if store.owns_url(trimmed) {
        return store.load(trimmed).await;
    }
    let resolved = resolve_image_url(trimmed, public_base_url)?;
    load_image(http, provider, &resolved).await
}

/// Input image as a URL a remote provider can read. Store-owned images are
/// sent inline as `data:` URLs.
pub(crate) async fn remote_input_url(
    store: &dyn ArtifactStore,
    url: &str,
    public_base_url: Option<&str>,
) -> EngineResult<String> {
    let trimmed = url.trim();
    if store.owns_url(trimmed) {
        let image = store.load(trimmed).await?;
        return Ok(encode_data_url(&image));
    }
    resolve_image_url(trimmed, public_base_url)
}

/// Makes an image URL fetchable by a remote provider.
pub(crate) fn resolve_image_url(url: &str, public_base_url: Option<&str>) -> EngineResult<String> {
    let trimmed = url.trim();
    let absolute = ["http://", "https://", "data:"]
        .iter()
        .any(|scheme| trimmed.starts_with(scheme));
    if absolute {
        return Ok(trimmed.to_string());
    }
    match public_base_url {
        Some(base) if !trimmed.is_empty() => Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            trimmed.trim_start_matches("./").trim_start_matches('/')
        )),
        _ => Err(EngineError::UnreachableImage(trimmed.to_string())),
    }
}

pub(crate) fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(raw) => Some(*raw),
        Value::Number(raw) => raw.as_i64().map(|value| value != 0),
        Value::String(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(raw) => raw
            .as_i64()
            .or_else(|| raw.as_f64().map(|number| number.round() as i64)),
        Value::String(raw) => raw.trim().parse::<f64>().ok().map(|v| v.round() as i64),
        _ => None,
    }
}

pub(crate) fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(raw) => raw.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}
