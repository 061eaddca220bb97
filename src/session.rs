use futures::StreamExt;
use log::{ debug, info, warn };
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{ mpsc, watch };

use crate::branch::{ walk, render_outline, AppendCommand, AppendPlan, BranchIndex, RenderInstruction };
use crate::cli::Args;
use crate::config::prompt::{ self, PromptConfig, PromptFormat };
use crate::history::{ format_history_for_prompt, initialize_history_store, HistoryError, SequenceStore };
use crate::llm::{ parse_llm_type, LlmConfig };
use crate::llm::chat::{ ChatClient, new_client as new_chat_client };
use crate::models::chat::{ ChatSummary, SequenceId };
use crate::recall::{ format_exchange, initialize_recall_index, RecallIndex };

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("generation failed: {0}")]
    Generation(#[source] Box<dyn StdError + Send + Sync>),
}

/// Everything a session needs besides its own index. Shared by all chats.
#[derive(Clone)]
pub struct SessionServices {
    pub store: Arc<dyn SequenceStore>,
    pub chat_client: Arc<dyn ChatClient>,
    pub recall: Option<Arc<dyn RecallIndex>>,
    pub prompt_config: Arc<PromptConfig>,
    /// Rounds of the current branch put into the prompt, 0 for all of them.
    pub history_window: usize,
    pub recall_limit: usize,
}

impl SessionServices {
    fn initialize_chat_client(
        args: &Args
    ) -> Result<Arc<dyn ChatClient>, Box<dyn StdError + Send + Sync>> {
        let chat_api_key = if !args.chat_api_key.is_empty() {
            Some(args.chat_api_key.clone())
        } else {
            None
        };
        let chat_config = LlmConfig {
            llm_type: parse_llm_type(&args.chat_llm_type)?,
            base_url: args.chat_base_url.clone(),
            api_key: chat_api_key,
            completion_model: args.chat_model.clone(),
            embedding_model: None,
            max_tokens: args.max_tokens,
            raw_prompt: true,
        };
        let chat_client = new_chat_client(&chat_config)?;
        info!(
            "Chat client configured: Type={}, Model={}, BaseURL={:?}",
            args.chat_llm_type,
            chat_client.get_model(),
            chat_client.get_base_url().as_deref().unwrap_or("adapter default")
        );
        Ok(chat_client)
    }

    fn load_prompt_config(
        args: &Args
    ) -> Result<Arc<PromptConfig>, Box<dyn StdError + Send + Sync>> {
        let mut config = match &args.prompts_path {
            Some(path) => (*prompt::load_prompts(path)?).clone(),
            None => PromptConfig::default(),
        };
        if args.prompts_path.is_none() {
            config.format = args.prompt_format.parse::<PromptFormat>()?;
        }
        if let Some(system_prompt) = &args.system_prompt {
            config.system_prompt = system_prompt.clone();
        }
        info!("Prompt format: {:?}", config.format);
        Ok(Arc::new(config))
    }

    pub fn from_args(args: &Args) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        Ok(Self {
            store: initialize_history_store(args)?,
            chat_client: Self::initialize_chat_client(args)?,
            recall: initialize_recall_index(args)?,
            prompt_config: Self::load_prompt_config(args)?,
            history_window: args.history_window,
            recall_limit: args.recall_limit,
        })
    }
}

/// Result of one accepted input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendOutcome {
    pub round: u32,
    pub sequence_id: SequenceId,
    pub response: String,
    /// Generation was cut short by a stop signal; `response` holds the text received so far.
    pub stopped: bool,
}

/// One open chat. Commands run one at a time; the index only changes after
/// the store accepted the new record.
pub struct ChatSession {
    chat_id: u32,
    index: BranchIndex,
    services: SessionServices,
}

impl ChatSession {
    pub async fn open(chat_id: u32, services: SessionServices) -> Result<Self, SessionError> {
        let history = services.store.load(chat_id).await?;
        let index = BranchIndex::build(&history);
        info!(
            "Opened chat {} with {} rounds and {} sequences",
            chat_id,
            index.len(),
            index.seq_num()
        );
        Ok(Self { chat_id, index, services })
    }

    pub fn chat_id(&self) -> u32 {
        self.chat_id
    }

    pub fn index(&self) -> &BranchIndex {
        &self.index
    }

    pub fn render(&self) -> Vec<RenderInstruction> {
        walk(&self.index).collect()
    }

    pub fn outline(&self) -> String {
        render_outline(&self.index)
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>, SessionError> {
        Ok(self.services.store.list_chats().await?)
    }

    async fn build_prompt(&self, plan: &AppendPlan, text: &str) -> String {
        let window = match self.services.history_window {
            0 => usize::MAX,
            n => n,
        };
        let history = format_history_for_prompt(&self.index.context(plan), window);

        let mut recalled = Vec::new();
        if let Some(recall) = &self.services.recall {
            match recall.query(self.chat_id, text, self.services.recall_limit).await {
                Ok(found) => {
                    recalled = found;
                }
                Err(e) => warn!("Recall query failed for chat {}: {}", self.chat_id, e),
            }
        }
        self.services.prompt_config.render(&recalled, &history, text)
    }

    async fn generate(
        &self,
        prompt: &str,
        tokens: Option<mpsc::Sender<String>>,
        stop: &mut watch::Receiver<bool>
    ) -> Result<(String, bool), SessionError> {
        let mut response = String::new();
        if *stop.borrow_and_update() {
            return Ok((response, true));
        }

        let mut stream = self.services.chat_client
            .stream_completion(prompt).await
            .map_err(SessionError::Generation)?;
        let mut stop_open = true;

        loop {
            tokio::select! {
                changed = stop.changed(), if stop_open => {
                    match changed {
                        Ok(()) if *stop.borrow_and_update() => {
                            info!("Generation stopped for chat {}", self.chat_id);
                            return Ok((response, true));
                        }
                        Ok(()) => {}
                        Err(_) => {
                            stop_open = false;
                        }
                    }
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(token)) => {
                            response.push_str(&token);
                            if let Some(tx) = &tokens {
                                let _ = tx.send(token).await;
                            }
                        }
                        Some(Err(e)) => {
                            return Err(SessionError::Generation(e));
                        }
                        None => {
                            return Ok((response, false));
                        }
                    }
                }
            }
        }
    }

    async fn remember(&self, human: &str, ai: &str) {
        if let Some(recall) = &self.services.recall {
            if let Err(e) = recall.upsert(self.chat_id, &format_exchange(human, ai)).await {
                warn!("Recall upsert failed for chat {}: {}", self.chat_id, e);
            }
        }
    }

    /// Plans the command, streams the reply into `tokens`, persists it and
    /// only then updates the index. Any error leaves the session unchanged.
    pub async fn submit(
        &mut self,
        command: &AppendCommand,
        tokens: Option<mpsc::Sender<String>>,
        mut stop: watch::Receiver<bool>
    ) -> Result<AppendOutcome, SessionError> {
        let plan = self.index.plan(command)?;
        debug!("Chat {}: {:?}", self.chat_id, plan);

        let prompt = self.build_prompt(&plan, &command.text).await;
        let (response, stopped) = self.generate(&prompt, tokens, &mut stop).await?;

        let record = plan.record(&command.text, &response);
        self.services.store.append(self.chat_id, &record).await?;
        self.index.commit(&plan, &command.text, &response);
        info!(
            "Chat {}: sequence {} appended at round {}{}",
            self.chat_id,
            plan.sequence_id,
            plan.round,
            if stopped { " (stopped)" } else { "" }
        );

        self.remember(&command.text, &response).await;

        Ok(AppendOutcome {
            round: plan.round,
            sequence_id: plan.sequence_id,
            response,
            stopped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use crate::branch::index::tests::sample_history;
    use crate::history::{ AppendRecord, MemoryStore };
    use crate::llm::chat::{ create_streaming_response, CompletionResponse, TokenStream };
    use crate::models::chat::ChatHistory;

    /// Streams a fixed list of tokens and remembers every prompt it saw.
    struct ScriptedClient {
        tokens: Vec<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(tokens: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                tokens: tokens
                    .iter()
                    .map(|t| t.to_string())
                    .collect(),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn complete(
            &self,
            prompt: &str
        ) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(CompletionResponse { response: self.tokens.concat() })
        }

        async fn stream_completion(
            &self,
            prompt: &str
        ) -> Result<TokenStream, Box<dyn StdError + Send + Sync>> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let tokens = self.tokens.clone();
            create_streaming_response(move |tx| async move {
                for token in tokens {
                    if tx.send(Ok(token)).await.is_err() {
                        return;
                    }
                }
            })
        }

        fn get_model(&self) -> String {
            "scripted".to_string()
        }

        fn get_base_url(&self) -> Option<String> {
            None
        }
    }

    /// Sends one token, then never finishes.
    struct StallingClient;

    #[async_trait]
    impl ChatClient for StallingClient {
        async fn complete(
            &self,
            _prompt: &str
        ) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>> {
            Err("not used".into())
        }

        async fn stream_completion(
            &self,
            _prompt: &str
        ) -> Result<TokenStream, Box<dyn StdError + Send + Sync>> {
            create_streaming_response(move |tx| async move {
                let _ = tx.send(Ok("partial".to_string())).await;
                std::future::pending::<()>().await;
            })
        }

        fn get_model(&self) -> String {
            "stalling".to_string()
        }

        fn get_base_url(&self) -> Option<String> {
            None
        }
    }

    struct FailingStore;

    #[async_trait]
    impl SequenceStore for FailingStore {
        async fn load(&self, _chat_id: u32) -> Result<ChatHistory, HistoryError> {
            Ok(sample_history())
        }

        async fn append(&self, _chat_id: u32, _record: &AppendRecord) -> Result<(), HistoryError> {
            Err(HistoryError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }

        async fn list_chats(&self) -> Result<Vec<ChatSummary>, HistoryError> {
            Ok(Vec::new())
        }
    }

    fn services(store: Arc<dyn SequenceStore>, client: Arc<dyn ChatClient>) -> SessionServices {
        SessionServices {
            store,
            chat_client: client,
            recall: None,
            prompt_config: Arc::new(PromptConfig {
                system_prompt: "sys".to_string(),
                template: "{chat_history_lines}{human_input}".to_string(),
                format: PromptFormat::Plain,
            }),
            history_window: 0,
            recall_limit: 0,
        }
    }

    fn no_stop() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn test_conversation_from_empty_history() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(&["ok"]);
        let mut session = ChatSession::open(7, services(store.clone(), client.clone())).await.unwrap();
        assert_eq!(
            session.render(),
            vec![RenderInstruction::NewTab { round: 1, anchor: None }]
        );

        let first = session
            .submit(&AppendCommand::branch(1, None, "hi"), None, no_stop()).await
            .unwrap();
        assert_eq!((first.round, first.sequence_id), (1, 1));

        let second = session
            .submit(&AppendCommand::reply(1, 1, "more"), None, no_stop()).await
            .unwrap();
        assert_eq!((second.round, second.sequence_id), (2, 1));

        let third = session
            .submit(&AppendCommand::branch(2, Some(1), "other"), None, no_stop()).await
            .unwrap();
        assert_eq!((third.round, third.sequence_id), (2, 2));

        let stored = store.load(7).await.unwrap();
        assert_eq!(stored[0].messages[0].sequence, vec![1, 2]);
        assert_eq!(stored[1].messages.len(), 2);
        assert_eq!(session.index(), &BranchIndex::build(&stored));
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_prompt_contains_branch_prefix_only() {
        let store = Arc::new(MemoryStore::with_history(5, sample_history()));
        let client = ScriptedClient::new(&["fine"]);
        let mut session = ChatSession::open(5, services(store, client.clone())).await.unwrap();

        session.submit(&AppendCommand::reply(2, 2, "another"), None, no_stop()).await.unwrap();

        let prompt = client.prompts.lock().unwrap()[0].clone();
        assert_eq!(
            prompt,
            "sys\n\nHuman: hi\nAI: hello\nHuman: tell a poem\nAI: roses are red\nanother"
        );
    }

    #[tokio::test]
    async fn test_tokens_are_forwarded() {
        let store = Arc::new(MemoryStore::new());
        let client = ScriptedClient::new(&["Hel", "lo"]);
        let mut session = ChatSession::open(1, services(store, client)).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let outcome = session
            .submit(&AppendCommand::branch(1, None, "hi"), Some(tx), no_stop()).await
            .unwrap();
        assert_eq!(outcome.response, "Hello");
        assert!(!outcome.stopped);
        assert_eq!(rx.recv().await.unwrap(), "Hel");
        assert_eq!(rx.recv().await.unwrap(), "lo");
    }

    #[tokio::test]
    async fn test_duplicate_is_rejected_before_generation() {
        let store = Arc::new(MemoryStore::with_history(5, sample_history()));
        let client = ScriptedClient::new(&["x"]);
        let mut session = ChatSession::open(5, services(store.clone(), client.clone())).await.unwrap();
        let before = session.index().clone();

        let err = session
            .submit(&AppendCommand::reply(2, 1, "again"), None, no_stop()).await
            .unwrap_err();
        assert!(
            matches!(err, SessionError::History(HistoryError::DuplicateSequence { round: 3, sequence_id: 1 }))
        );
        assert_eq!(client.calls(), 0);
        assert_eq!(session.index(), &before);
        assert_eq!(store.load(5).await.unwrap(), sample_history());
    }

    #[tokio::test]
    async fn test_failed_store_leaves_index_untouched() {
        let client = ScriptedClient::new(&["x"]);
        let mut session = ChatSession::open(5, services(Arc::new(FailingStore), client)).await.unwrap();
        let before = session.index().clone();

        let err = session
            .submit(&AppendCommand::branch(2, Some(1), "new"), None, no_stop()).await
            .unwrap_err();
        assert!(matches!(err, SessionError::History(HistoryError::Io(_))));
        assert_eq!(session.index(), &before);
    }

    #[tokio::test]
    async fn test_stop_keeps_partial_response() {
        let store = Arc::new(MemoryStore::new());
        let mut session = ChatSession::open(1, services(store.clone(), Arc::new(StallingClient))).await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel(8);

        let command = AppendCommand::branch(1, None, "hi");
        let driver = async {
            let first = rx.recv().await;
            stop_tx.send(true).unwrap();
            first
        };
        let (outcome, first) = tokio::join!(session.submit(&command, Some(tx), stop_rx), driver);

        assert_eq!(first.as_deref(), Some("partial"));
        let outcome = outcome.unwrap();
        assert!(outcome.stopped);
        assert_eq!(outcome.response, "partial");
        assert_eq!(store.load(1).await.unwrap()[0].messages[0].ai, "partial\n");
    }

    #[tokio::test]
    async fn test_outline_matches_render() {
        let store = Arc::new(MemoryStore::with_history(5, sample_history()));
        let session = ChatSession::open(5, services(store, ScriptedClient::new(&[]))).await.unwrap();
        assert_eq!(session.outline(), render_outline(session.index()));
        assert_eq!(session.render(), walk(session.index()).collect::<Vec<_>>());
    }
}
