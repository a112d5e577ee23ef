// Image generation over an OpenAI-compatible `/images/generations` endpoint.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::collaborators::ImageGenerator;
use crate::config::ImageConfig;
use crate::conversation::GeneratedImage;

#[derive(Clone)]
pub struct ImageClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    size: String,
    output_dir: Option<PathBuf>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    #[serde(default)]
    data: Vec<GenerationItem>,
}

#[derive(Debug, Deserialize)]
struct GenerationItem {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    revised_prompt: Option<String>,
}

impl ImageClient {
    pub fn new(config: &ImageConfig, client: reqwest::Client) -> Self {
        Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            model: config.model.clone(),
            size: config.size.clone(),
            output_dir: config
                .output_dir
                .as_deref()
                .map(str::trim)
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            client,
        }
    }

    fn materialize(&self, item: GenerationItem, prompt: &str) -> Result<Option<GeneratedImage>> {
        let alt = Some(item.revised_prompt.unwrap_or_else(|| prompt.to_string()));

        if let Some(data) = item.b64_json.filter(|d| !d.is_empty()) {
            let src = match &self.output_dir {
                Some(dir) => save_base64_png(dir, &data)?.to_string_lossy().into_owned(),
                None => format!("data:image/png;base64,{}", data),
            };
            return Ok(Some(GeneratedImage { src, alt }));
        }

        Ok(item
            .url
            .filter(|url| !url.is_empty())
            .map(|src| GeneratedImage { src, alt }))
    }
}

/// Decode a base64 image and write it under `dir`, returning the file path.
fn save_base64_png(dir: &Path, data: &str) -> Result<PathBuf> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .context("Image payload is not valid base64")?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create image output dir {:?}", dir))?;

    let output_path = dir.join(format!("generated_{}.png", uuid::Uuid::new_v4()));
    std::fs::write(&output_path, bytes)
        .with_context(|| format!("Failed to write image to {:?}", output_path))?;
    Ok(output_path)
}

#[async_trait]
impl ImageGenerator for ImageClient {
    async fn generate_image(&self, prompt: &str) -> Result<Vec<GeneratedImage>> {
        let url = format!("{}/images/generations", self.api_url);
        let body = GenerationRequest {
            model: &self.model,
            prompt,
            n: 1,
            size: &self.size,
        };

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        tracing::info!("Requesting image generation ({})", self.model);
        let response = req
            .send()
            .await
            .context("Failed to send image generation request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Image API returned error {}: {}", status, body);
        }

        let parsed: GenerationResponse = response
            .json()
            .await
            .context("Failed to parse image generation response")?;

        let mut images = Vec::new();
        for item in parsed.data {
            if let Some(image) = self.materialize(item, prompt)? {
                images.push(image);
            }
        }

        if images.is_empty() {
            anyhow::bail!("Image API returned no images");
        }
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_output(dir: Option<&Path>) -> ImageClient {
        let config = ImageConfig {
            output_dir: dir.map(|d| d.to_string_lossy().into_owned()),
            ..ImageConfig::default()
        };
        ImageClient::new(&config, reqwest::Client::new())
    }

    #[test]
    fn base64_payload_becomes_data_uri_without_output_dir() {
        let client = client_with_output(None);
        let image = client
            .materialize(
                GenerationItem {
                    url: None,
                    b64_json: Some("aGVsbG8=".to_string()),
                    revised_prompt: None,
                },
                "a lighthouse",
            )
            .unwrap()
            .unwrap();
        assert_eq!(image.src, "data:image/png;base64,aGVsbG8=");
        assert_eq!(image.alt.as_deref(), Some("a lighthouse"));
    }

    #[test]
    fn base64_payload_is_written_to_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_with_output(Some(dir.path()));
        let image = client
            .materialize(
                GenerationItem {
                    url: None,
                    b64_json: Some("aGVsbG8=".to_string()),
                    revised_prompt: Some("a tall lighthouse".to_string()),
                },
                "a lighthouse",
            )
            .unwrap()
            .unwrap();

        let written = std::fs::read(&image.src).unwrap();
        assert_eq!(written, b"hello");
        assert_eq!(image.alt.as_deref(), Some("a tall lighthouse"));
    }

    #[test]
    fn empty_item_is_skipped_and_bad_base64_errors() {
        let client = client_with_output(None);
        let empty = GenerationItem {
            url: None,
            b64_json: None,
            revised_prompt: None,
        };
        assert!(client.materialize(empty, "p").unwrap().is_none());

        let dir = tempfile::tempdir().unwrap();
        let client = client_with_output(Some(dir.path()));
        let bad = GenerationItem {
            url: None,
            b64_json: Some("***".to_string()),
            revised_prompt: None,
        };
        assert!(client.materialize(bad, "p").is_err());
    }
}
