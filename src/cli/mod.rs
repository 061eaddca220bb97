use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- History Store Args ---
    /// History chat store type (json, memory)
    #[arg(long, env = "HISTORY_TYPE", default_value = "json")]
    pub history_type: String,

    /// Directory holding one `<chat_id>.json` record per chat
    #[arg(long, env = "HISTORY_DIR", default_value = "memory")]
    pub history_dir: String,

    /// Chat opened when a client does not name one
    #[arg(long, env = "CHAT_ID", default_value = "1")]
    pub chat_id: u32,

    /// Number of earlier rounds of the current branch included in the prompt. 0 keeps the whole branch.
    #[arg(long, env = "HISTORY_WINDOW", default_value = "0")]
    pub history_window: usize,

    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for completion (ollama, openai/llamacpp)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "ollama")]
    pub chat_llm_type: String,

    /// Base URL for the Chat LLM provider API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "CHAT_BASE_URL")]
    pub chat_base_url: Option<String>,

    /// API Key for the Chat LLM provider
    #[arg(long, env = "CHAT_API_KEY", default_value = "")]
    pub chat_api_key: String,

    /// Model name for completion (e.g., llama3, phi3)
    #[arg(long, env = "CHAT_MODEL")]
    pub chat_model: Option<String>,

    /// Upper bound on generated tokens per reply
    #[arg(long, env = "MAX_TOKENS")]
    pub max_tokens: Option<u32>,

    /// Chat template applied to prompts (llama3, phi3, mistral, chatml, plain)
    #[arg(long, env = "PROMPT_FORMAT", default_value = "llama3")]
    pub prompt_format: String,

    /// System prompt, overrides the one from the prompts file
    #[arg(long, env = "SYSTEM_PROMPT")]
    pub system_prompt: Option<String>,

    /// Path to the prompt configuration file.
    #[arg(long, env = "PROMPTS_PATH")]
    pub prompts_path: Option<String>,

    // --- Embedding LLM Provider Args ---
    /// Type of LLM provider for text embedding (ollama, openai)
    #[arg(long, env = "EMBEDDING_LLM_TYPE", default_value = "ollama")]
    pub embedding_llm_type: String,

    /// Base URL for the Embedding LLM provider API
    #[arg(long, env = "EMBEDDING_BASE_URL")]
    pub embedding_base_url: Option<String>,

    /// API Key for the Embedding LLM provider
    #[arg(long, env = "EMBEDDING_API_KEY", default_value = "")]
    pub embedding_api_key: String,

    /// Model name for text embedding (e.g., nomic-embed-text)
    #[arg(long, env = "EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,

    // --- Recall Args ---
    /// Store every exchange in Qdrant and add the closest past exchanges to prompts
    #[arg(long, env = "ENABLE_RECALL", default_value = "false")]
    pub enable_recall: bool,

    /// Qdrant URL for the recall index.
    #[arg(long, env = "RECALL_URL", default_value = "http://localhost:6334")]
    pub recall_url: String,

    /// Optional API Key for the Qdrant instance.
    #[arg(long, env = "RECALL_API_KEY")]
    pub recall_api_key: Option<String>,

    /// Qdrant collection name for past exchanges.
    #[arg(long, env = "RECALL_COLLECTION", default_value = "chat_recall")]
    pub recall_collection: String,

    /// Embedding vector dimension size
    #[arg(long, env = "RECALL_DIMENSION", default_value = "768")]
    pub recall_dimension: usize,

    /// Number of past exchanges added to each prompt.
    #[arg(long, env = "RECALL_LIMIT", default_value = "3")]
    pub recall_limit: usize,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,

    /// Print the branch outline of the chat and exit.
    #[arg(long, default_value = "false")]
    pub print_tree: bool,

    /// Host address and port for the server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Optional API Key required for clients to connect to the WebSocket server. If set, clients must provide this key.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,
}
