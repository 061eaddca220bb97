pub mod branch;
pub mod cli;
pub mod config;
pub mod history;
pub mod llm;
pub mod models;
pub mod recall;
pub mod server;
pub mod session;
pub mod websocket;

use cli::Args;
use log::info;
use server::{ Server, SessionRegistry };
use session::{ ChatSession, SessionServices };
use std::error::Error;
use std::sync::Arc;

fn log_configuration(args: &Args) {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("History Store Type: {}", args.history_type);
    info!("History Directory: {}", args.history_dir);
    info!("Default Chat ID: {}", args.chat_id);
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Prompt Format: {}", args.prompt_format);
    info!("Prompts Path: {}", args.prompts_path.as_deref().unwrap_or("built-in"));
    info!("History Window: {}", args.history_window);
    info!("Recall Enabled: {}", args.enable_recall);
    if args.enable_recall {
        info!("Embedding LLM Type: {}", args.embedding_llm_type);
        info!("Recall Qdrant URL: {}", args.recall_url);
        info!("Recall Collection: {}", args.recall_collection);
    }
    info!("-------------------------");
}

/// Loads the default chat and returns its branch outline.
pub async fn print_tree(args: &Args) -> Result<String, Box<dyn Error + Send + Sync>> {
    let services = SessionServices::from_args(args)?;
    let session = ChatSession::open(args.chat_id, services).await?;
    Ok(session.outline())
}

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    log_configuration(&args);

    let services = SessionServices::from_args(&args)?;
    let registry = Arc::new(SessionRegistry::new(services));
    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, registry, args.server_api_key.clone(), args.chat_id);
    server.run().await?;

    Ok(())
}
