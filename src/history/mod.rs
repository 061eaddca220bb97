mod json;
mod memory;

pub use json::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use log::info;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use crate::branch::Slot;
use crate::cli::Args;
use crate::models::chat::{ ChatHistory, ChatSummary, MessageRecord, RoundRecord, SequenceId };

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("chat record {} is not valid JSON: {source}", .path.display())]
    CorruptRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicated sequence index: sequence {sequence_id} exists in round {round}")]
    DuplicateSequence {
        round: u32,
        sequence_id: SequenceId,
    },

    #[error("not a valid path for chat history: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("round {round} is out of range for a history of {rounds} rounds")]
    RoundOutOfRange {
        round: u32,
        rounds: usize,
    },

    #[error("sequence {sequence_id} has no slot in round {round}")]
    UnknownSequence {
        round: u32,
        sequence_id: SequenceId,
    },

    #[error("a branch at round {round} needs an anchor sequence")]
    MissingAnchor {
        round: u32,
    },

    #[error("backfill target round {round} slot {slot} does not exist")]
    InvalidBackfill {
        round: u32,
        slot: usize,
    },

    #[error("chat record {} is malformed: {reason}", .path.display())]
    MalformedRecord {
        path: PathBuf,
        reason: String,
    },

    #[error("failed to encode chat record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("chat history IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Position of one message: 1-based round, 0-based slot within the round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRef {
    pub round: u32,
    pub slot: usize,
}

/// Everything the store needs to persist one new message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendRecord {
    pub round: u32,
    pub sequence_ids: Vec<SequenceId>,
    pub human: String,
    pub ai: String,
    pub backfill: Vec<SlotRef>,
}

/// Durable, append-only storage of branching chat histories.
///
/// Each append is a whole-record read-modify-write, so a chat id must have a
/// single writer at a time.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn load(&self, chat_id: u32) -> Result<ChatHistory, HistoryError>;

    async fn append(&self, chat_id: u32, record: &AppendRecord) -> Result<(), HistoryError>;

    async fn list_chats(&self) -> Result<Vec<ChatSummary>, HistoryError>;
}

/// Checks the layout every loaded history must have: rounds numbered from 1
/// in order, every message tagged, no id twice in one round.
pub(crate) fn check_layout(history: &ChatHistory) -> Result<(), String> {
    for (pos, record) in history.iter().enumerate() {
        let expected = (pos as u32) + 1;
        if record.round != expected {
            return Err(format!("round {} found at position {}", record.round, expected));
        }
        let mut seen: Vec<SequenceId> = Vec::new();
        for (slot, message) in record.messages.iter().enumerate() {
            if message.sequence.is_empty() {
                return Err(format!("round {} slot {} has no sequence id", expected, slot));
            }
            for id in &message.sequence {
                if seen.contains(id) {
                    return Err(format!("sequence {} appears twice in round {}", id, expected));
                }
                seen.push(*id);
            }
        }
    }
    Ok(())
}

/// Applies `record` to `history` in place. Leaves `history` untouched on error.
pub(crate) fn apply_append(
    history: &mut ChatHistory,
    record: &AppendRecord
) -> Result<(), HistoryError> {
    let rounds = history.len();
    let message = MessageRecord {
        sequence: record.sequence_ids.clone(),
        human: format!("{}\n", record.human),
        ai: format!("{}\n", record.ai),
    };

    if record.round == 0 || (record.round as usize) > rounds + 1 {
        return Err(HistoryError::RoundOutOfRange { round: record.round, rounds });
    }

    if (record.round as usize) <= rounds {
        let existing = &history[(record.round as usize) - 1].messages;
        for msg in existing {
            if let Some(dup) = record.sequence_ids.iter().find(|id| msg.sequence.contains(id)) {
                return Err(HistoryError::DuplicateSequence {
                    round: record.round,
                    sequence_id: *dup,
                });
            }
        }
    }

    for target in &record.backfill {
        let exists = target.round >= 1 &&
            history
                .get((target.round as usize) - 1)
                .map_or(false, |r| target.slot < r.messages.len());
        if !exists {
            return Err(HistoryError::InvalidBackfill { round: target.round, slot: target.slot });
        }
    }

    if (record.round as usize) == rounds + 1 {
        history.push(RoundRecord { round: record.round, messages: vec![message] });
    } else {
        history[(record.round as usize) - 1].messages.push(message);
    }

    for target in &record.backfill {
        let sequence = &mut history[(target.round as usize) - 1].messages[target.slot].sequence;
        for id in &record.sequence_ids {
            if !sequence.contains(id) {
                sequence.push(*id);
            }
        }
    }

    Ok(())
}

pub fn create_history_store(
    args: &Args
) -> Result<Arc<dyn SequenceStore>, Box<dyn Error + Send + Sync>> {
    match args.history_type.to_lowercase().as_str() {
        "json" | "file" => Ok(Arc::new(JsonFileStore::new(&args.history_dir))),
        "memory" => Ok(Arc::new(MemoryStore::new())),
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported history store type: {}", args.history_type)
                    )
                )
            ),
    }
}

pub fn initialize_history_store(
    args: &Args
) -> Result<Arc<dyn SequenceStore>, Box<dyn Error + Send + Sync>> {
    info!("Chat history will be stored in: {} at {}", args.history_type, args.history_dir);
    create_history_store(args)
}

/// Renders the branch prefix leading to a new message, most recent `window` rounds only.
pub fn format_history_for_prompt(path: &[&Slot], window: usize) -> String {
    if path.is_empty() || window == 0 {
        return String::new();
    }
    let start = path.len().saturating_sub(window);
    let mut result = String::new();
    for slot in &path[start..] {
        result.push_str(&format!("Human: {}\n", slot.human.trim_end_matches('\n')));
        result.push_str(&format!("AI: {}\n", slot.ai.trim_end_matches('\n')));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(round: u32, ids: &[SequenceId], backfill: Vec<SlotRef>) -> AppendRecord {
        AppendRecord {
            round,
            sequence_ids: ids.to_vec(),
            human: format!("q{}", round),
            ai: format!("a{}", round),
            backfill,
        }
    }

    #[test]
    fn test_apply_append_new_round_adds_newlines() {
        let mut history = ChatHistory::new();
        apply_append(&mut history, &record(1, &[1], vec![])).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].round, 1);
        assert_eq!(history[0].messages[0].human, "q1\n");
        assert_eq!(history[0].messages[0].ai, "a1\n");
    }

    #[test]
    fn test_apply_append_rejects_shared_id() {
        let mut history = ChatHistory::new();
        apply_append(&mut history, &record(1, &[1], vec![])).unwrap();
        apply_append(&mut history, &record(1, &[2], vec![])).unwrap();
        let before = history.clone();

        let err = apply_append(&mut history, &record(1, &[2], vec![])).unwrap_err();
        assert!(matches!(err, HistoryError::DuplicateSequence { round: 1, sequence_id: 2 }));
        assert_eq!(history, before);
    }

    #[test]
    fn test_apply_append_round_out_of_range() {
        let mut history = ChatHistory::new();
        let err = apply_append(&mut history, &record(2, &[1], vec![])).unwrap_err();
        assert!(matches!(err, HistoryError::RoundOutOfRange { round: 2, rounds: 0 }));
        let err = apply_append(&mut history, &record(0, &[1], vec![])).unwrap_err();
        assert!(matches!(err, HistoryError::RoundOutOfRange { round: 0, rounds: 0 }));
    }

    #[test]
    fn test_apply_append_backfills_ancestors() {
        let mut history = ChatHistory::new();
        apply_append(&mut history, &record(1, &[1], vec![])).unwrap();
        apply_append(&mut history, &record(2, &[1], vec![])).unwrap();
        apply_append(
            &mut history,
            &record(2, &[2], vec![SlotRef { round: 1, slot: 0 }])
        ).unwrap();

        assert_eq!(history[0].messages[0].sequence, vec![1, 2]);
        assert_eq!(history[1].messages[1].sequence, vec![2]);
    }

    #[test]
    fn test_apply_append_invalid_backfill_is_atomic() {
        let mut history = ChatHistory::new();
        apply_append(&mut history, &record(1, &[1], vec![])).unwrap();
        let before = history.clone();

        let err = apply_append(
            &mut history,
            &record(1, &[2], vec![SlotRef { round: 1, slot: 0 }, SlotRef { round: 3, slot: 0 }])
        ).unwrap_err();
        assert!(matches!(err, HistoryError::InvalidBackfill { round: 3, slot: 0 }));
        assert_eq!(history, before);
    }

    #[test]
    fn test_format_history_window() {
        let a = Slot { sequence_ids: vec![1], human: "one\n".into(), ai: "uno\n".into() };
        let b = Slot { sequence_ids: vec![1], human: "two\n".into(), ai: "dos\n".into() };
        let path = vec![&a, &b];

        assert_eq!(format_history_for_prompt(&path, 0), "");
        assert_eq!(format_history_for_prompt(&path, 1), "Human: two\nAI: dos\n");
        assert_eq!(
            format_history_for_prompt(&path, 5),
            "Human: one\nAI: uno\nHuman: two\nAI: dos\n"
        );
    }
}
