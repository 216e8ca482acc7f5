/// HTTP embedding provider
///
/// Posts a batch of texts to a self-hosted embedding server. Two request shapes are
/// supported: llamafile/llama.cpp (`{"content": [...]}`) and text-embeddings-inference
/// (`{"inputs": [...]}`). Responses may be a bare `[[f32]]`, llamafile's
/// `{"results": [{"embedding": [...]}]}` or an OpenAI-style `{"data": [...]}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{EmbeddingError, EmbeddingProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Llamafile,
    Inference,
}

impl FromStr for WireFormat {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "llamafile" | "llama.cpp" => Ok(WireFormat::Llamafile),
            "inference" | "tei" => Ok(WireFormat::Inference),
            other => Err(EmbeddingError::NotConfigured(format!(
                "Unknown EMBEDDER_API '{}': expected 'llamafile' or 'inference'",
                other
            ))),
        }
    }
}

#[derive(Serialize)]
struct LlamafileRequest<'a> {
    content: &'a [String],
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a [String],
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbedResponse {
    Plain(Vec<Vec<f32>>),
    Results { results: Vec<EmbedData> },
    Data { data: Vec<EmbedData> },
}

impl EmbedResponse {
    fn into_vectors(self) -> Vec<Vec<f32>> {
        match self {
            EmbedResponse::Plain(vectors) => vectors,
            EmbedResponse::Results { results: items } | EmbedResponse::Data { data: items } => {
                items.into_iter().map(|d| d.embedding).collect()
            }
        }
    }
}

pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    url: String,
    format: WireFormat,
}

impl HttpEmbeddingProvider {
    /// Create a provider posting to `url`.
    ///
    /// # Errors
    /// Returns `EmbeddingError::NotConfigured` if url is empty.
    pub fn new(url: String, format: WireFormat) -> Result<Self, EmbeddingError> {
        if url.trim().is_empty() {
            return Err(EmbeddingError::NotConfigured(
                "EMBEDDER_URL is required for the HTTP embedding provider".to_string(),
            ));
        }

        Ok(HttpEmbeddingProvider {
            client: reqwest::Client::new(),
            url,
            format,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request = self.client.post(&self.url);
        let request = match self.format {
            WireFormat::Llamafile => request.json(&LlamafileRequest { content: texts }),
            WireFormat::Inference => request.json(&InferenceRequest { inputs: texts }),
        };

        let response = request
            .send()
            .await
            .map_err(|e| EmbeddingError::Generation(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(EmbeddingError::Api {
                status,
                message: body,
            });
        }

        let embed_response: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Generation(format!("Failed to parse embedding response: {}", e)))?;

        Ok(embed_response.into_vectors())
    }

    fn model_name(&self) -> &str {
        &self.url
    }
}
