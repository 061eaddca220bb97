use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;
use async_trait::async_trait;
use log::debug;
use super::{ http_stream_generate, ChatClient, CompletionResponse, StreamLine, TokenStream };
use crate::llm::LlmConfig;

#[derive(Debug)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    completion_model: String,
    max_tokens: Option<u32>,
    raw: bool,
}

#[derive(Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    raw: bool,
    options: GenerateOptions,
}

#[derive(Deserialize)]
pub struct GenerateResponse {
    pub response: String,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

fn parse_stream_line(line: &str) -> StreamLine {
    if line.is_empty() {
        return StreamLine::Skip;
    }
    match serde_json::from_str::<StreamResponse>(line) {
        Ok(resp) if resp.done && resp.response.is_empty() => StreamLine::Done,
        Ok(resp) if resp.response.is_empty() => StreamLine::Skip,
        Ok(resp) => StreamLine::Token(resp.response),
        Err(e) => {
            debug!("JSON parse error: {} for line: {}", e, line);
            StreamLine::Skip
        }
    }
}

impl OllamaClient {
    pub fn new(base_url: Option<String>, completion_model: Option<String>) -> Self {
        let model = completion_model.unwrap_or_else(|| "llama3".to_string());
        let url = base_url.unwrap_or_else(|| "http://localhost:11434".into());

        Self {
            http: HttpClient::new(),
            base_url: url,
            completion_model: model,
            max_tokens: None,
            raw: false,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        if config.llm_type != crate::llm::LlmType::Ollama {
            return Err("Invalid config type for OllamaClient".into());
        }

        let mut client = Self::new(config.base_url.clone(), config.completion_model.clone());
        client.max_tokens = config.max_tokens;
        client.raw = config.raw_prompt;
        Ok(client)
    }

    fn request(&self, prompt: &str, stream: bool) -> GenerateRequest {
        GenerateRequest {
            model: self.completion_model.clone(),
            prompt: prompt.to_string(),
            stream,
            raw: self.raw,
            options: GenerateOptions { num_predict: self.max_tokens },
        }
    }

    pub async fn generate(
        &self,
        prompt: &str
    ) -> Result<GenerateResponse, Box<dyn StdError + Send + Sync>> {
        let url = format!("{}/api/generate", self.base_url);
        let req = self.request(prompt, false);
        let resp = self.http.post(&url).json(&req).send().await?.error_for_status()?;
        let data = resp.json::<GenerateResponse>().await?;
        Ok(data)
    }
}

#[async_trait]
impl ChatClient for OllamaClient {
    async fn complete(
        &self,
        prompt: &str
    ) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>> {
        let gen_resp = self.generate(prompt).await?;
        Ok(CompletionResponse { response: gen_resp.response })
    }

    async fn stream_completion(
        &self,
        prompt: &str
    ) -> Result<TokenStream, Box<dyn StdError + Send + Sync>> {
        http_stream_generate(
            self.base_url.clone(),
            "/api/generate",
            self.request(prompt, true),
            parse_stream_line,
            None
        ).await
    }

    fn get_model(&self) -> String {
        self.completion_model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}
