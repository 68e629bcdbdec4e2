use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

const ERROR_BODY_MAX_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

pub(crate) async fn response_json_or_error(
    provider: &str,
    response: HttpResponse,
) -> EngineResult<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .await
        .map_err(|err| EngineError::transport(provider, &err))?;
    if !status.is_success() {
        return Err(EngineError::provider_unavailable(
            provider,
            Some(code),
            truncate_text(&body, ERROR_BODY_MAX_CHARS),
        ));
    }
    serde_json::from_str(&body).map_err(|err| {
        EngineError::InvalidOutput(format!("{provider} returned invalid JSON payload: {err}"))
    })
}

/// Fetches an image from an absolute URL or decodes a `data:` URL.
pub(crate) async fn load_image(
    http: &HttpClient,
    provider: &str,
    url: &str,
) -> EngineResult<ImageBytes> {
    if let Some(image) = decode_data_url(url)? {
        return Ok(image);
    }
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|err| EngineError::transport(provider, &err))?;
    if !response.status().is_success() {
        let code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(EngineError::provider_unavailable(
            provider,
            Some(code),
            format!(
                "image download failed ({url}): {}",
                truncate_text(&body, ERROR_BODY_MAX_CHARS)
            ),
        ));
    }
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .await
        .map_err(|err| EngineError::transport(provider, &err))?
        .to_vec();
    if bytes.is_empty() {
        return Err(EngineError::InvalidOutput(format!(
            "image at {url} is empty"
        )));
    }
    Ok(ImageBytes { bytes, mime_type })
}

pub(crate) fn decode_data_url(url: &str) -> EngineResult<Option<ImageBytes>> {
    let Some(rest) = url.strip_prefix("data:") else {
        return Ok(None);
    };
    let Some((header, data)) = rest.split_once(',') else {
        return Err(EngineError::InvalidOutput("malformed data url".to_string()));
    };
    let Some(mime) = header.strip_suffix(";base64") else {
        return Err(EngineError::InvalidOutput(
            "data url must be base64 encoded".to_string(),
        ));
    };
    let bytes = BASE64.decode(data.trim().as_bytes()).map_err(|err| {
        EngineError::InvalidOutput(format!("data url base64 decode failed: {err}"))
    })?;
    Ok(Some(ImageBytes {
        bytes,
        mime_type: Some(mime.to_string()).filter(|value| !value.is_empty()),
    }))
}

pub(crate) fn encode_data_url(image: &ImageBytes) -> String {
    format!(
        "data:{};base64,{}",
        image.mime_type.as_deref().unwrap_or("image/png"),
        BASE64.encode(&image.bytes)
    )
}

pub(crate) fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

pub(crate) fn extension_for_mime(mime: Option<&str>) -> Option<&'static str> {
    let lowered = mime?.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return Some("jpg");
    }
    if lowered.contains("webp") {
        return Some("webp");
    }
    if lowered.contains("png") {
        return Some("png");
    }
    None
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_urls_decode_with_mime() {
        let encoded = format!("data:image/png;base64,{}", BASE64.encode([1u8, 2, 3]));
        let image = decode_data_url(&encoded).unwrap().unwrap();
        assert_eq!(image.bytes, vec![1, 2, 3]);
        assert_eq!(image.mime_type.as_deref(), Some("image/png"));
        assert!(decode_data_url("https://cdn.example.com/a.png")
            .unwrap()
            .is_none());
    }

    #[test]
    fn data_urls_must_be_base64() {
        assert!(decode_data_url("data:text/plain,hello").is_err());
        assert!(decode_data_url("data:image/png;base64").is_err());
    }

    #[test]
    fn encoded_data_urls_decode_back() {
        let image = ImageBytes {
            bytes: vec![7, 8, 9],
            mime_type: Some("image/webp".to_string()),
        };
        let url = encode_data_url(&image);
        assert!(url.starts_with("data:image/webp;base64,"));
        assert_eq!(decode_data_url(&url).unwrap(), Some(image));
    }

    #[test]
    fn mime_maps_to_extension() {
        assert_eq!(extension_for_mime(Some("image/JPEG")), Some("jpg"));
        assert_eq!(extension_for_mime(Some("image/webp")), Some("webp"));
        assert_eq!(extension_for_mime(Some("application/octet-stream")), None);
        assert_eq!(extension_for_mime(None), None);
        assert_eq!(mime_for_extension("JPG"), Some("image/jpeg"));
        assert_eq!(mime_for_extension("gif"), None);
    }

    #[test]
    fn truncate_text_appends_ellipsis() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
