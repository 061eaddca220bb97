use async_trait::async_trait;
use chrono::Utc;
use log::info;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    value::Kind,
    vectors_config::Config as VectorsConfig,
    Condition,
    CreateCollectionBuilder,
    CreateFieldIndexCollection,
    Distance,
    FieldType,
    Filter,
    PointStruct,
    SearchPointsBuilder,
    UpsertPointsBuilder,
    VectorParams,
};

use crate::cli::Args;
use crate::llm::embedding::EmbeddingClient;
use crate::recall::RecallIndex;

pub struct QdrantRecallIndex {
    client: Qdrant,
    collection_name: String,
    embedding_client: Arc<dyn EmbeddingClient>,
    vector_dim: u64,
    ready: OnceCell<()>,
}

impl QdrantRecallIndex {
    pub fn new(
        args: &Args,
        embedding_client: Arc<dyn EmbeddingClient>
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let client = Qdrant::from_url(&args.recall_url)
            .api_key(args.recall_api_key.clone())
            .build()?;

        Ok(Self {
            client,
            collection_name: args.recall_collection.clone(),
            embedding_client,
            vector_dim: args.recall_dimension as u64,
            ready: OnceCell::new(),
        })
    }

    async fn ensure_collection_exists(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.ready
            .get_or_try_init(|| async {
                if self.client.collection_exists(&self.collection_name).await? {
                    return Ok::<(), Box<dyn Error + Send + Sync>>(());
                }
                let create = CreateCollectionBuilder::new(self.collection_name.clone())
                    .vectors_config(
                        VectorsConfig::Params(VectorParams {
                            size: self.vector_dim,
                            distance: Distance::Cosine.into(),
                            ..Default::default()
                        })
                    )
                    .build();
                self.client.create_collection(create).await?;
                info!("Created Qdrant recall collection: {}", self.collection_name);

                self.client.create_field_index(CreateFieldIndexCollection {
                    collection_name: self.collection_name.clone(),
                    field_name: "chat_id".to_string(),
                    field_type: Some(FieldType::Integer.into()),
                    wait: Some(true),
                    ..Default::default()
                }).await?;
                info!("Created 'chat_id' index in {}", self.collection_name);
                Ok(())
            }).await?;
        Ok(())
    }

    async fn embed_checked(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
        let vector = self.embedding_client.embed(text).await?.embedding;
        if (vector.len() as u64) != self.vector_dim {
            return Err(
                format!(
                    "Embedding dimension mismatch: expected {}, got {}",
                    self.vector_dim,
                    vector.len()
                ).into()
            );
        }
        Ok(vector)
    }
}

#[async_trait]
impl RecallIndex for QdrantRecallIndex {
    async fn upsert(&self, chat_id: u32, text: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.ensure_collection_exists().await?;
        let vector = self.embed_checked(text).await?;

        let mut payload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
        payload.insert("chat_id".to_string(), (chat_id as i64).into());
        payload.insert("text".to_string(), text.to_string().into());
        payload.insert("timestamp".to_string(), Utc::now().timestamp().into());

        let point = PointStruct::new(Uuid::new_v4().to_string(), vector, payload);
        self.client.upsert_points(
            UpsertPointsBuilder::new(&self.collection_name, vec![point]).wait(true)
        ).await?;
        Ok(())
    }

    async fn query(
        &self,
        chat_id: u32,
        text: &str,
        limit: usize
    ) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.ensure_collection_exists().await?;
        let vector = self.embed_checked(text).await?;

        let response = self.client.search_points(
            SearchPointsBuilder::new(&self.collection_name, vector, limit as u64)
                .filter(Filter::must([Condition::matches("chat_id", chat_id as i64)]))
                .with_payload(true)
        ).await?;

        let texts = response.result
            .into_iter()
            .filter_map(|point| {
                match point.payload.get("text").and_then(|v| v.kind.clone()) {
                    Some(Kind::StringValue(s)) => Some(s),
                    _ => None,
                }
            })
            .collect();
        Ok(texts)
    }
}
