pub mod qdrant;

use async_trait::async_trait;
use log::info;
use std::error::Error;
use std::sync::Arc;
use crate::cli::Args;
use crate::llm::embedding::new_client as new_embedding_client;
use crate::llm::{ parse_llm_type, LlmConfig };

/// Semantic memory of past exchanges, scoped per chat.
#[async_trait]
pub trait RecallIndex: Send + Sync {
    async fn upsert(&self, chat_id: u32, text: &str) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Most similar stored texts first.
    async fn query(
        &self,
        chat_id: u32,
        text: &str,
        limit: usize
    ) -> Result<Vec<String>, Box<dyn Error + Send + Sync>>;
}

pub fn format_exchange(human: &str, ai: &str) -> String {
    format!("Human: {}\nAI: {}", human.trim_end_matches('\n'), ai.trim_end_matches('\n'))
}

pub fn initialize_recall_index(
    args: &Args
) -> Result<Option<Arc<dyn RecallIndex>>, Box<dyn Error + Send + Sync>> {
    if !args.enable_recall {
        info!("Recall disabled.");
        return Ok(None);
    }

    let embedding_config = LlmConfig {
        llm_type: parse_llm_type(&args.embedding_llm_type)?,
        base_url: args.embedding_base_url.clone(),
        api_key: Some(args.embedding_api_key.clone()).filter(|k| !k.is_empty()),
        completion_model: None,
        embedding_model: args.embedding_model.clone(),
        max_tokens: None,
        raw_prompt: false,
    };
    let embedding_client = new_embedding_client(&embedding_config)?;
    info!(
        "Recall enabled: Qdrant at {}, collection '{}', embedding type {}",
        args.recall_url,
        args.recall_collection,
        args.embedding_llm_type
    );
    let index = qdrant::QdrantRecallIndex::new(args, embedding_client)?;
    Ok(Some(Arc::new(index)))
}
