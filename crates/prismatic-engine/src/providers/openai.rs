use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use prismatic_contracts::models::ModelSpec;
use reqwest::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::Client as HttpClient;
use serde_json::{json, Map, Value};

use super::{
    fetch_input_image, persist_outputs, EditRequest, GenerateRequest, ImageProvider,
    ProviderOutput, RawImage,
};
use crate::artifacts::ArtifactStore;
use crate::error::{EngineError, EngineResult};
use crate::http::{extension_for_mime, response_json_or_error, ImageBytes};

/// Synchronous request/response provider for the OpenAI Images API.
pub struct OpenAiProvider {
    api_base: String,
    api_key: Option<String>,
    store: Arc<dyn ArtifactStore>,
    http: HttpClient,
    public_base_url: Option<String>,
}

impl OpenAiProvider {
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        store: Arc<dyn ArtifactStore>,
        http: HttpClient,
        public_base_url: Option<String>,
    ) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            api_key,
            store,
            http,
            public_base_url,
        }
    }

    fn api_key(&self) -> EngineResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| EngineError::MissingCredentials {
                provider: "openai".to_string(),
                env_var: "OPENAI_API_KEY".to_string(),
            })
    }

    fn generation_payload(model: &ModelSpec, request: &GenerateRequest) -> Value {
        let mut payload = Map::new();
        payload.insert("model".to_string(), json!(model.external_model));
        payload.insert("prompt".to_string(), json!(request.prompt));
        payload.insert("n".to_string(), json!(1));
        for (key, value) in &request.params {
            if matches!(key.as_str(), "model" | "prompt") || value.is_null() {
                continue;
            }
            payload.insert(key.clone(), value.clone());
        }
        Value::Object(payload)
    }

    async fn image_part(&self, url: &str, fallback_name: &str) -> EngineResult<MultipartPart> {
        let image = fetch_input_image(
            self.store.as_ref(),
            &self.http,
            self.name(),
            url,
            self.public_base_url.as_deref(),
        )
        .await?;
        Self::part_from(image, fallback_name)
    }

    fn part_from(image: ImageBytes, fallback_name: &str) -> EngineResult<MultipartPart> {
        let ext = extension_for_mime(image.mime_type.as_deref()).unwrap_or("png");
        let mime = image
            .mime_type
            .clone()
            .unwrap_or_else(|| format!("image/{ext}"));
        MultipartPart::bytes(image.bytes)
            .file_name(format!("{fallback_name}.{ext}"))
            .mime_str(&mime)
            .map_err(|err| EngineError::InvalidOutput(format!("invalid mime '{mime}': {err}")))
    }

    fn extract_outputs(
        &self,
        response: &Value,
        params: &Map<String, Value>,
    ) -> EngineResult<Vec<RawImage>> {
        let output_format = params
            .get("output_format")
            .and_then(Value::as_str)
            .unwrap_or("png");
        let rows = response
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut out = Vec::new();
        for row in rows {
            if let Some(b64) = row.get("b64_json").and_then(Value::as_str) {
                let bytes = BASE64.decode(b64.as_bytes()).map_err(|err| {
                    EngineError::InvalidOutput(format!("openai image base64 decode failed: {err}"))
                })?;
                out.push(RawImage::Bytes(ImageBytes {
                    bytes,
                    mime_type: Some(format!("image/{output_format}")),
                }));
            } else if let Some(url) = row.get("url").and_then(Value::as_str) {
                out.push(RawImage::Url(url.to_string()));
            }
        }
        if out.is_empty() {
            return Err(EngineError::InvalidOutput(
                "openai response contained no images".to_string(),
            ));
        }
        Ok(out)
    }

    async fn finish(
        &self,
        model: &ModelSpec,
        prompt: &str,
        response: Value,
        params: &Map<String, Value>,
    ) -> EngineResult<ProviderOutput> {
        let outputs = self.extract_outputs(&response, params)?;
        let images = persist_outputs(
            self.store.as_ref(),
            &self.http,
            self.name(),
            model,
            prompt,
            outputs,
        )
        .await?;
        Ok(ProviderOutput {
            images,
            job_id: None,
        })
    }
}

#[async_trait]
impl ImageProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn supports_edit(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        model: &ModelSpec,
        request: &GenerateRequest,
    ) -> EngineResult<ProviderOutput> {
        let api_key = self.api_key()?;
        let endpoint = format!("{}/images/generations", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&Self::generation_payload(model, request))
            .send()
            .await
            .map_err(|err| EngineError::transport(self.name(), &err))?;
        let payload = response_json_or_error(self.name(), response).await?;
        tracing::info!(model = %model.name, "openai generation returned");
        self.finish(model, &request.prompt, payload, &request.params).await
    }

    async fn edit(&self, model: &ModelSpec, request: &EditRequest) -> EngineResult<ProviderOutput> {
        let api_key = self.api_key()?;
        if request.images.is_empty() {
            return Err(EngineError::InvalidOutput(
                "openai image edits require at least one input image".to_string(),
            ));
        }
        let mut form = MultipartForm::new()
            .text("model", model.external_model.clone())
            .text("prompt", request.prompt.clone())
            .text("n", "1");
        for (key, value) in &request.params {
            if matches!(key.as_str(), "model" | "prompt" | "n") || value.is_null() {
                continue;
            }
            form = form.text(key.clone(), form_text(value));
        }
        for (idx, url) in request.images.iter().enumerate() {
            form = form.part("image[]", self.image_part(url, &format!("image-{idx}")).await?);
        }
        if let Some(mask) = request.mask.as_deref() {
            form = form.part("mask", self.image_part(mask, "mask").await?);
        }

        let endpoint = format!("{}/images/edits", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|err| EngineError::transport(self.name(), &err))?;
        let payload = response_json_or_error(self.name(), response).await?;
        tracing::info!(
            model = %model.name,
            images = request.images.len(),
            "openai edit returned"
        );
        self.finish(model, &request.prompt, payload, &request.params).await
    }
}

fn form_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
