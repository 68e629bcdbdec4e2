use std::sync::Arc;

use async_trait::async_trait;
use prismatic_contracts::models::ModelSpec;
use reqwest::Client as HttpClient;
use serde_json::{Map, Number, Value};

use super::{
    persist_outputs, remote_input_url, value_as_bool, value_as_f64, value_as_i64, EditRequest,
    GenerateRequest, ImageProvider, ProviderOutput, RawImage,
};
use crate::artifacts::ArtifactStore;
use crate::error::EngineResult;
use crate::prediction::PredictionClient;

const BOOL_KEYS: &[&str] = &["prompt_upsampling", "go_fast", "disable_safety_checker"];
const INT_KEYS: &[&str] = &[
    "seed",
    "num_outputs",
    "safety_tolerance",
    "num_inference_steps",
    "output_quality",
    "max_images",
];
const FLOAT_KEYS: &[&str] = &["guidance"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageField {
    Single(&'static str),
    List(&'static str),
}

/// Predict-and-poll provider backed by the Replicate predictions API.
pub struct ReplicateProvider {
    predictions: PredictionClient,
    store: Arc<dyn ArtifactStore>,
    http: HttpClient,
    public_base_url: Option<String>,
}

impl ReplicateProvider {
    pub fn new(
        predictions: PredictionClient,
        store: Arc<dyn ArtifactStore>,
        http: HttpClient,
        public_base_url: Option<String>,
    ) -> Self {
        Self {
            predictions,
            store,
            http,
            public_base_url,
        }
    }

    fn image_field(model: &ModelSpec) -> ImageField {
        let id = model.external_model.to_ascii_lowercase();
        if id.contains("flux-kontext") {
            ImageField::Single("input_image")
        } else if id.contains("nano-banana") || id.contains("seedream") {
            ImageField::List("image_input")
        } else {
            ImageField::Single("image")
        }
    }

    fn base_input(prompt: &str, params: &Map<String, Value>) -> Map<String, Value> {
        let mut input = coerce_params(params);
        input.insert("prompt".to_string(), Value::String(prompt.to_string()));
        input
    }

    async fn input_url(&self, url: &str) -> EngineResult<String> {
        remote_input_url(self.store.as_ref(), url, self.public_base_url.as_deref()).await
    }

    async fn edit_input(
        &self,
        model: &ModelSpec,
        request: &EditRequest,
    ) -> EngineResult<Map<String, Value>> {
        let mut input = Self::base_input(&request.prompt, &request.params);
        let mut images = Vec::with_capacity(request.images.len());
        for url in &request.images {
            images.push(self.input_url(url).await?);
        }
        match Self::image_field(model) {
            ImageField::Single(field) => {
                if images.len() > 1 {
                    tracing::debug!(
                        model = %model.name,
                        dropped = images.len() - 1,
                        "model takes a single input image; extra images ignored"
                    );
                }
                if let Some(first) = images.into_iter().next() {
                    input.insert(field.to_string(), Value::String(first));
                }
            }
            ImageField::List(field) => {
                input.insert(
                    field.to_string(),
                    Value::Array(images.into_iter().map(Value::String).collect()),
                );
            }
        }
        if let Some(mask) = request.mask.as_deref() {
            input.insert("mask".to_string(), Value::String(self.input_url(mask).await?));
        }
        Ok(input)
    }

    async fn run(
        &self,
        model: &ModelSpec,
        prompt: &str,
        input: Map<String, Value>,
    ) -> EngineResult<ProviderOutput> {
        let prediction = self.predictions.run(&model.external_model, &input).await?;
        tracing::info!(
            model = %model.name,
            prediction_id = %prediction.id,
            "replicate prediction succeeded"
        );
        let outputs = prediction
            .output_urls()
            .into_iter()
            .map(RawImage::Url)
            .collect();
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
            job_id: Some(prediction.id),
        })
    }
}

#[async_trait]
impl ImageProvider for ReplicateProvider {
    fn name(&self) -> &str {
        "replicate"
    }

    fn supports_edit(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        model: &ModelSpec,
        request: &GenerateRequest,
    ) -> EngineResult<ProviderOutput> {
        let input = Self::base_input(&request.prompt, &request.params);
        self.run(model, &request.prompt, input).await
    }

    async fn edit(&self, model: &ModelSpec, request: &EditRequest) -> EngineResult<ProviderOutput> {
        let input = self.edit_input(model, request).await?;
        self.run(model, &request.prompt, input).await
    }
}

/// Known numeric and boolean inputs arrive as strings from forms and presets.
fn coerce_params(params: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in params {
        if value.is_null() {
            continue;
        }
        let coerced = if BOOL_KEYS.contains(&key.as_str()) {
            value_as_bool(value).map(Value::Bool)
        } else if INT_KEYS.contains(&key.as_str()) {
            value_as_i64(value).map(|number| Value::Number(number.into()))
        } else if FLOAT_KEYS.contains(&key.as_str()) {
            value_as_f64(value)
                .and_then(Number::from_f64)
                .map(Value::Number)
        } else {
            None
        };
        out.insert(key.clone(), coerced.unwrap_or_else(|| value.clone()));
    }
    out
}
