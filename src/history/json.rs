use async_trait::async_trait;
use log::{ debug, info, warn };
use serde::Serialize;
use std::path::{ Path, PathBuf };
use tokio::fs;
use tokio::io::AsyncWriteExt;
use crate::history::{ apply_append, check_layout, AppendRecord, HistoryError, SequenceStore };
use crate::models::chat::{ ChatHistory, ChatSummary };

/// One `<chat_id>.json` file per chat under a single directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    pub fn record_path(&self, chat_id: u32) -> PathBuf {
        self.dir.join(format!("{}.json", chat_id))
    }

    async fn ensure_dir(&self) -> Result<(), HistoryError> {
        match fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(HistoryError::InvalidPath(self.dir.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.dir).await?;
                info!("Created chat history directory {}", self.dir.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_record(&self, path: &Path) -> Result<ChatHistory, HistoryError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ChatHistory::new());
            }
            Err(e) => {
                return Err(e.into());
            }
        };
        if bytes.is_empty() {
            return Ok(ChatHistory::new());
        }
        let history: ChatHistory = serde_json
            ::from_slice(&bytes)
            .map_err(|source| HistoryError::CorruptRecord {
                path: path.to_path_buf(),
                source,
            })?;
        check_layout(&history).map_err(|reason| HistoryError::MalformedRecord {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(history)
    }

    async fn write_record(&self, path: &Path, history: &ChatHistory) -> Result<(), HistoryError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        history.serialize(&mut ser).map_err(HistoryError::Encode)?;

        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for JsonFileStore {
    async fn load(&self, chat_id: u32) -> Result<ChatHistory, HistoryError> {
        self.ensure_dir().await?;
        let path = self.record_path(chat_id);
        let history = self.read_record(&path).await?;
        debug!("Loaded {} rounds for chat {} from {}", history.len(), chat_id, path.display());
        Ok(history)
    }

    async fn append(&self, chat_id: u32, record: &AppendRecord) -> Result<(), HistoryError> {
        self.ensure_dir().await?;
        let path = self.record_path(chat_id);
        let mut history = self.read_record(&path).await?;
        if history.is_empty() {
            info!("Creating a new chat history for chat no.{}", chat_id);
        }
        apply_append(&mut history, record)?;
        self.write_record(&path, &history).await?;
        debug!(
            "Saved sequence {:?} at round {} of chat {} ({} backfill targets)",
            record.sequence_ids,
            record.round,
            chat_id,
            record.backfill.len()
        );
        Ok(())
    }

    async fn list_chats(&self) -> Result<Vec<ChatSummary>, HistoryError> {
        self.ensure_dir().await?;
        let mut chats = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let chat_id = match path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
                Some(id) => id,
                None => {
                    continue;
                }
            };
            match self.read_record(&path).await {
                Ok(history) => chats.push(ChatSummary::from_history(chat_id, &history)),
                Err(e) => warn!("Skipping chat {} in listing: {}", chat_id, e),
            }
        }
        chats.sort_by_key(|c| c.chat_id);
        Ok(chats)
    }
}
