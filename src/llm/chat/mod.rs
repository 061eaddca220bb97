pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use futures::{ Future, Stream, StreamExt };
use serde::Deserialize;
use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;
use super::{ LlmConfig, LlmType };
use self::ollama::OllamaClient;
use self::openai::OpenAICompletionClient;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub type TokenStream = Pin<
    Box<dyn Stream<Item = Result<String, Box<dyn StdError + Send + Sync>>> + Send>
>;

#[derive(Deserialize, Debug, Clone)]
pub struct CompletionResponse {
    pub response: String,
}

/// Text completion against a locally hosted model.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str
    ) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>>;

    /// Finite, not restartable. Clients without native streaming yield the
    /// whole completion as one chunk.
    async fn stream_completion(
        &self,
        prompt: &str
    ) -> Result<TokenStream, Box<dyn StdError + Send + Sync>> {
        let response = self.complete(prompt).await?.response;
        full_response_as_stream(move || async move { Ok(response) })
    }

    fn get_model(&self) -> String;
    fn get_base_url(&self) -> Option<String>;
}

pub fn create_streaming_response<F, Fut>(
    response_fn: F
) -> Result<TokenStream, Box<dyn StdError + Send + Sync>>
where
    F: FnOnce(mpsc::Sender<Result<String, Box<dyn StdError + Send + Sync>>>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}

pub fn full_response_as_stream<F, Fut>(
    response_fn: F
) -> Result<TokenStream, Box<dyn StdError + Send + Sync>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<String, Box<dyn StdError + Send + Sync>>> + Send + 'static,
{
    create_streaming_response(move |tx| async move {
        match response_fn().await {
            Ok(response) => {
                let _ = tx.send(Ok(response)).await;
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
            }
        }
    })
}

pub fn new_client(
    config: &LlmConfig
) -> Result<Arc<dyn ChatClient>, Box<dyn StdError + Send + Sync>> {
    let client: Arc<dyn ChatClient> = match config.llm_type {
        LlmType::Ollama => {
            let specific_client = OllamaClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::OpenAI => {
            let specific_client = OpenAICompletionClient::from_config(config)?;
            Arc::new(specific_client)
        }
    };
    Ok(client)
}

/// What a line parser found in one line of a streamed body.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamLine {
    Token(String),
    Skip,
    Done,
}

/// POSTs `payload` and feeds every complete body line through `line_parser`.
/// Lines split across chunks are reassembled before parsing.
pub async fn http_stream_generate(
    base_url: String,
    route: &str,
    payload: impl serde::Serialize + Send + 'static,
    line_parser: fn(&str) -> StreamLine,
    headers: Option<Vec<(String, String)>>
) -> Result<TokenStream, Box<dyn StdError + Send + Sync>> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), route);
    let client = reqwest::Client::new();

    create_streaming_response(move |tx| async move {
        let mut req = client.post(&url).json(&payload);

        if let Some(header_list) = headers {
            for (name, value) in header_list {
                req = req.header(name, value);
            }
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let _ = tx.send(Err(Box::new(e) as _)).await;
                return;
            }
        };
        if let Err(e) = resp.error_for_status_ref() {
            let _ = tx.send(Err(Box::new(e) as _)).await;
            return;
        }

        let mut bytes = resp.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(buf) => {
                    buffer.extend_from_slice(&buf);
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let raw: Vec<u8> = buffer.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&raw);
                        match line_parser(line.trim()) {
                            StreamLine::Token(tok) => {
                                if tx.send(Ok(tok)).await.is_err() {
                                    return;
                                }
                            }
                            StreamLine::Skip => {}
                            StreamLine::Done => {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(Box::new(e) as _)).await;
                    return;
                }
            }
        }
        if let StreamLine::Token(tok) = line_parser(String::from_utf8_lossy(&buffer).trim()) {
            let _ = tx.send(Ok(tok)).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClient;

    #[async_trait]
    impl ChatClient for FixedClient {
        async fn complete(
            &self,
            prompt: &str
        ) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>> {
            Ok(CompletionResponse { response: format!("echo: {}", prompt) })
        }

        fn get_model(&self) -> String {
            "fixed".to_string()
        }

        fn get_base_url(&self) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn test_default_stream_yields_full_response() {
        let client = FixedClient;
        let mut stream = client.stream_completion("hi").await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "echo: hi");
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_new_client_selects_backend() {
        let client = new_client(&LlmConfig::default()).unwrap();
        assert_eq!(client.get_base_url().as_deref(), Some("http://localhost:11434"));

        let config = LlmConfig {
            llm_type: LlmType::OpenAI,
            base_url: Some("http://127.0.0.1:8080".to_string()),
            ..Default::default()
        };
        let client = new_client(&config).unwrap();
        assert_eq!(client.get_base_url().as_deref(), Some("http://127.0.0.1:8080"));
    }

    fn whole_line(line: &str) -> StreamLine {
        if line.is_empty() { StreamLine::Skip } else { StreamLine::Token(line.to_string()) }
    }

    /// Answers one POST with a chunked body, one `write` per chunk.
    async fn serve_chunks(chunks: Vec<&'static [u8]>) -> String {
        use tokio::io::{ AsyncReadExt, AsyncWriteExt };
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            let body_start = loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&request[..body_start]).to_lowercase();
            let length: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            while request.len() < body_start + length {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
            }

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\n\r\n"
                ).await
                .unwrap();
            for chunk in chunks {
                let mut frame = format!("{:x}\r\n", chunk.len()).into_bytes();
                frame.extend_from_slice(chunk);
                frame.extend_from_slice(b"\r\n");
                socket.write_all(&frame).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            socket.write_all(b"0\r\n\r\n").await.unwrap();
            socket.flush().await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_stream_keeps_characters_split_across_chunks() {
        // "é" is 0xC3 0xA9; the first chunk ends between the two bytes.
        let base_url = serve_chunks(vec![&b"h\xc3"[..], &b"\xa9llo\nw\xc3\xa9"[..], &b"rld"[..]]).await;
        let stream = http_stream_generate(
            base_url,
            "/api/generate",
            serde_json::json!({ "prompt": "hi" }),
            whole_line,
            None
        ).await.unwrap();

        let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens, vec!["héllo".to_string(), "wérld".to_string()]);
    }
}
