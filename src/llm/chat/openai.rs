use async_trait::async_trait;
use log::debug;
use reqwest::{ Client as HttpClient, header::{ AUTHORIZATION, CONTENT_TYPE } };
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;

use super::{ http_stream_generate, ChatClient, CompletionResponse, StreamLine, TokenStream };
use crate::llm::LlmConfig;

/// Client for the OpenAI text completions endpoint, as served by llama.cpp and friends.
pub struct OpenAICompletionClient {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
}

#[derive(Serialize)]
struct CompletionRequest {
    model: String,
    prompt: String,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct CompletionBody {
    choices: Vec<CompletionChoice>,
}

fn parse_sse_line(line: &str) -> StreamLine {
    let data = match line.strip_prefix("data:") {
        Some(data) => data.trim(),
        None => {
            return StreamLine::Skip;
        }
    };
    if data == "[DONE]" {
        return StreamLine::Done;
    }
    match serde_json::from_str::<CompletionBody>(data) {
        Ok(body) =>
            match body.choices.into_iter().next() {
                Some(choice) if !choice.text.is_empty() => StreamLine::Token(choice.text),
                _ => StreamLine::Skip,
            }
        Err(e) => {
            debug!("JSON parse error: {} for data: {}", e, data);
            StreamLine::Skip
        }
    }
}

impl OpenAICompletionClient {
    pub fn new(
        api_key: Option<String>,
        model: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>
    ) -> Self {
        Self {
            http: HttpClient::new(),
            api_key: api_key.unwrap_or_default(),
            model: model.unwrap_or_else(|| "local-model".to_string()),
            base_url: base_url.unwrap_or_else(|| "http://localhost:8080".to_string()),
            max_tokens: max_tokens.unwrap_or(2048),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        if config.llm_type != crate::llm::LlmType::OpenAI {
            return Err("Invalid config type for OpenAICompletionClient".into());
        }
        Ok(
            Self::new(
                config.api_key.clone(),
                config.completion_model.clone(),
                config.base_url.clone(),
                config.max_tokens
            )
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![(CONTENT_TYPE.to_string(), "application/json".to_string())];
        if !self.api_key.is_empty() {
            headers.push((AUTHORIZATION.to_string(), format!("Bearer {}", self.api_key)));
        }
        headers
    }

    fn request(&self, prompt: &str, stream: bool) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            max_tokens: self.max_tokens,
            stream,
        }
    }
}

#[async_trait]
impl ChatClient for OpenAICompletionClient {
    async fn complete(
        &self,
        prompt: &str
    ) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>> {
        let url = format!("{}/v1/completions", self.base_url.trim_end_matches('/'));
        let mut req = self.http.post(&url).json(&self.request(prompt, false));
        for (name, value) in self.headers() {
            req = req.header(name, value);
        }
        let body = req.send().await?.error_for_status()?.json::<CompletionBody>().await?;
        let response = body.choices
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or("completion response contained no choices")?;
        Ok(CompletionResponse { response })
    }

    async fn stream_completion(
        &self,
        prompt: &str
    ) -> Result<TokenStream, Box<dyn StdError + Send + Sync>> {
        http_stream_generate(
            self.base_url.clone(),
            "/v1/completions",
            self.request(prompt, true),
            parse_sse_line,
            Some(self.headers())
        ).await
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"text":" world","index":0}]}"#),
            StreamLine::Token(" world".to_string())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), StreamLine::Done);
        assert_eq!(parse_sse_line(": keep-alive"), StreamLine::Skip);
        assert_eq!(parse_sse_line(r#"data: {"choices":[]}"#), StreamLine::Skip);
    }

    #[test]
    fn test_headers_include_key_only_when_set() {
        let client = OpenAICompletionClient::new(None, None, None, None);
        assert_eq!(client.headers().len(), 1);
        let client = OpenAICompletionClient::new(Some("sk".into()), None, None, None);
        assert!(client.headers().contains(&("authorization".to_string(), "Bearer sk".to_string())));
    }
}
