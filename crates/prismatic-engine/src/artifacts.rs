use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::{ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};
use crate::http::{extension_for_mime, mime_for_extension, ImageBytes};

pub const THUMBNAIL_MAX_EDGE: u32 = 256;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredArtifact {
    pub id: String,
    pub full_url: String,
    pub thumb_url: String,
}

/// Durable home for generated image bytes.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn persist(
        &self,
        bytes: Vec<u8>,
        metadata: ArtifactMetadata,
    ) -> EngineResult<StoredArtifact>;

    /// Reads back the bytes behind a URL this store handed out.
    async fn load(&self, url: &str) -> EngineResult<ImageBytes>;

    /// True for URLs this store handed out; those never need re-downloading.
    fn owns_url(&self, url: &str) -> bool;
}

/// Content-addressed files under a directory served at `url_prefix`.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
    url_prefix: String,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn url_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.url_prefix, file_name)
    }

    /// File name behind an owned URL. Nested or hidden paths are never ours.
    fn file_name_for<'a>(&self, url: &'a str) -> Option<&'a str> {
        let name = url.strip_prefix(&self.url_prefix)?.strip_prefix('/')?;
        let plain = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(|c: char| c == '/' || c == '\\');
        plain.then_some(name)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn persist(
        &self,
        bytes: Vec<u8>,
        metadata: ArtifactMetadata,
    ) -> EngineResult<StoredArtifact> {
        let root = self.root.clone();
        let written =
            tokio::task::spawn_blocking(move || write_artifact(&root, &bytes, &metadata))
                .await
                .map_err(|err| {
                    EngineError::Persistence(format!("artifact writer panicked: {err}"))
                })??;
        tracing::debug!(
            artifact_id = %written.id,
            file = %written.file_name,
            "artifact persisted"
        );
        Ok(StoredArtifact {
            full_url: self.url_for(&written.file_name),
            thumb_url: self.url_for(&written.thumb_name),
            id: written.id,
        })
    }

    async fn load(&self, url: &str) -> EngineResult<ImageBytes> {
        let Some(file_name) = self.file_name_for(url) else {
            return Err(EngineError::UnreachableImage(url.to_string()));
        };
        let path = self.root.join(file_name);
        let bytes = tokio::fs::read(&path).await.map_err(|err| {
            EngineError::Persistence(format!("failed to read {}: {err}", path.display()))
        })?;
        let mime_type = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(mime_for_extension)
            .map(str::to_string);
        Ok(ImageBytes { bytes, mime_type })
    }

    fn owns_url(&self, url: &str) -> bool {
        url.strip_prefix(&self.url_prefix)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    }
}

struct WrittenArtifact {
    id: String,
    file_name: String,
    thumb_name: String,
}

fn write_artifact(
    root: &Path,
    bytes: &[u8],
    metadata: &ArtifactMetadata,
) -> EngineResult<WrittenArtifact> {
    if bytes.is_empty() {
        return Err(EngineError::InvalidOutput(
            "refusing to persist empty image".to_string(),
        ));
    }
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| EngineError::InvalidOutput(format!("unreadable image bytes: {err}")))?;
    let format = reader.format();
    let decoded = reader
        .decode()
        .map_err(|err| EngineError::InvalidOutput(format!("image decode failed: {err}")))?;

    let id = content_id(bytes);
    let ext = extension_for_mime(metadata.mime_type.as_deref())
        .or_else(|| format.and_then(|format| format.extensions_str().first().copied()))
        .unwrap_or("png");
    let file_name = format!("{id}.{ext}");
    let thumb_name = format!("{id}_thumb.jpg");

    fs::create_dir_all(root)?;
    let image_path = root.join(&file_name);
    if !image_path.exists() {
        fs::write(&image_path, bytes)?;
    }

    let thumb_path = root.join(&thumb_name);
    if !thumb_path.exists() {
        decoded
            .thumbnail(THUMBNAIL_MAX_EDGE, THUMBNAIL_MAX_EDGE)
            .to_rgb8()
            .save_with_format(&thumb_path, ImageFormat::Jpeg)
            .map_err(|err| {
                EngineError::Persistence(format!(
                    "failed to write {}: {err}",
                    thumb_path.display()
                ))
            })?;
    }

    let sidecar = json!({
        "id": id,
        "file": file_name,
        "thumb": thumb_name,
        "width": decoded.width(),
        "height": decoded.height(),
        "bytes": bytes.len(),
        "metadata": metadata,
    });
    let sidecar_text = serde_json::to_string_pretty(&sidecar)
        .map_err(|err| EngineError::Persistence(err.to_string()))?;
    fs::write(root.join(format!("{id}.json")), sidecar_text + "\n")?;

    Ok(WrittenArtifact {
        id,
        file_name,
        thumb_name,
    })
}

fn content_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}
