use async_trait::async_trait;
use std::error::Error as StdError;
use std::sync::Arc;
use rllm::{ builder::{ LLMBackend, LLMBuilder }, LLMProvider };

use super::{ LlmConfig, LlmType };

#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<EmbeddingResponse, Box<dyn StdError + Send + Sync>>;
}

pub struct RllmEmbeddingClient {
    llm: Box<dyn LLMProvider + Send + Sync>,
    label: &'static str,
}

impl RllmEmbeddingClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let (backend, label, default_url, default_model) = match config.llm_type {
            LlmType::Ollama =>
                (LLMBackend::Ollama, "Ollama", "http://localhost:11434", "nomic-embed-text"),
            LlmType::OpenAI =>
                (LLMBackend::OpenAI, "OpenAI", "http://localhost:8080/v1/", "text-embedding-3-small"),
        };
        let url = config.base_url.clone().unwrap_or_else(|| default_url.to_string());
        let model = config.embedding_model.clone().unwrap_or_else(|| default_model.to_string());

        let mut builder = LLMBuilder::new()
            .backend(backend)
            .base_url(url)
            .model(model)
            .stream(false);
        if let Some(key) = &config.api_key {
            builder = builder.api_key(key.clone());
        }

        Ok(Self { llm: builder.build()?, label })
    }
}

#[async_trait]
impl EmbeddingClient for RllmEmbeddingClient {
    async fn embed(
        &self,
        text: &str
    ) -> Result<EmbeddingResponse, Box<dyn StdError + Send + Sync>> {
        let mut embeddings = self.llm.embed(vec![text.to_string()]).await?;
        let embedding = embeddings
            .pop()
            .ok_or_else(|| format!("{} embedding generation returned no results", self.label))?;

        Ok(EmbeddingResponse { embedding })
    }
}

pub fn new_client(
    config: &LlmConfig
) -> Result<Arc<dyn EmbeddingClient>, Box<dyn StdError + Send + Sync>> {
    Ok(Arc::new(RllmEmbeddingClient::from_config(config)?))
}
