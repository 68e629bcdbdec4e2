use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use prismatic_contracts::models::ModelSpec;
use reqwest::Client as HttpClient;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::{
    persist_outputs, value_as_i64, EditRequest, GenerateRequest, ImageProvider, ProviderOutput,
    RawImage,
};
use crate::artifacts::ArtifactStore;
use crate::error::{EngineError, EngineResult};
use crate::http::ImageBytes;

const DEFAULT_DIMS: (u32, u32) = (256, 256);
const MAX_EDGE: u32 = 2048;

/// Offline provider: renders a solid swatch whose color is a hash of the
/// prompt, seed and inputs. Identical requests give identical bytes.
pub struct DryrunProvider {
    store: Arc<dyn ArtifactStore>,
    http: HttpClient,
}

impl DryrunProvider {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            http: HttpClient::new(),
        }
    }

    async fn render(
        &self,
        model: &ModelSpec,
        prompt: &str,
        inputs: &[String],
        params: &Map<String, Value>,
    ) -> EngineResult<ProviderOutput> {
        let (width, height) = params
            .get("size")
            .and_then(Value::as_str)
            .and_then(parse_dims)
            .unwrap_or(DEFAULT_DIMS);
        let seed = params.get("seed").and_then(value_as_i64).unwrap_or_default();
        let digest = fingerprint(prompt, seed, inputs);
        let bytes = swatch_png(width, height, (digest[0], digest[1], digest[2]))?;
        let images = persist_outputs(
            self.store.as_ref(),
            &self.http,
            self.name(),
            model,
            prompt,
            vec![RawImage::Bytes(ImageBytes {
                bytes,
                mime_type: Some("image/png".to_string()),
            })],
        )
        .await?;
        Ok(ProviderOutput {
            images,
            job_id: Some(format!("dryrun-{}", hex::encode(&digest[..4]))),
        })
    }
}

#[async_trait]
impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn supports_edit(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        model: &ModelSpec,
        request: &GenerateRequest,
    ) -> EngineResult<ProviderOutput> {
        self.render(model, &request.prompt, &[], &request.params).await
    }

    async fn edit(&self, model: &ModelSpec, request: &EditRequest) -> EngineResult<ProviderOutput> {
        self.render(model, &request.prompt, &request.images, &request.params)
            .await
    }
}

fn fingerprint(prompt: &str, seed: i64, inputs: &[String]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    for input in inputs {
        hasher.update(input.as_bytes());
    }
    hasher.finalize().into()
}

fn parse_dims(size: &str) -> Option<(u32, u32)> {
    let lowered = size.trim().to_ascii_lowercase();
    let (w, h) = lowered.split_once('x')?;
    let width = w.trim().parse::<u32>().ok()?;
    let height = h.trim().parse::<u32>().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width.min(MAX_EDGE), height.min(MAX_EDGE)))
}

fn swatch_png(width: u32, height: u32, (r, g, b): (u8, u8, u8)) -> EngineResult<Vec<u8>> {
    let image = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|err| EngineError::InvalidOutput(format!("dryrun encode failed: {err}")))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use prismatic_contracts::models::ModelRegistry;
    use serde_json::json;

    use super::*;
    use crate::artifacts::LocalArtifactStore;

    #[test]
    fn parse_dims_accepts_wxh_only() {
        assert_eq!(parse_dims("512x256"), Some((512, 256)));
        assert_eq!(parse_dims(" 64X64 "), Some((64, 64)));
        assert_eq!(parse_dims("99999x10"), Some((2048, 10)));
        assert_eq!(parse_dims("0x10"), None);
        assert_eq!(parse_dims("2K"), None);
    }

    #[tokio::test]
    async fn same_request_same_artifact() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = LocalArtifactStore::new(temp.path(), "/artifacts");
        let provider = DryrunProvider::new(Arc::new(store));
        let model = ModelRegistry::default()
            .get("dryrun-image-1")
            .cloned()
            .unwrap();
        let request = EditRequest {
            prompt: "a chair, side view".to_string(),
            images: vec!["https://cdn.example.com/chair.png".to_string()],
            params: json!({"size": "32x16"}).as_object().cloned().unwrap(),
            ..EditRequest::default()
        };
        let first = provider.edit(&model, &request).await?;
        let second = provider.edit(&model, &request).await?;
        assert_eq!(first, second);
        assert!(first.job_id.as_deref().unwrap().starts_with("dryrun-"));

        let other = provider
            .edit(
                &model,
                &EditRequest {
                    prompt: "a chair, back view".to_string(),
                    ..request.clone()
                },
            )
            .await?;
        assert_ne!(first.images[0].id, other.images[0].id);

        let stored = image::open(temp.path().join(format!("{}.png", first.images[0].id)))?;
        assert_eq!((stored.width(), stored.height()), (32, 16));
        Ok(())
    }
}
