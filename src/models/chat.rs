use serde::{ Serialize, Deserialize };

pub type SequenceId = u32;

/// One message slot as it is written to disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub sequence: Vec<SequenceId>,
    #[serde(rename = "Human")]
    pub human: String,
    #[serde(rename = "AI")]
    pub ai: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    pub messages: Vec<MessageRecord>,
}

/// `history[r]` holds round `r + 1`.
pub type ChatHistory = Vec<RoundRecord>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: u32,
    pub title: String,
    pub rounds: usize,
}

impl ChatSummary {
    pub fn from_history(chat_id: u32, history: &ChatHistory) -> Self {
        let title = history
            .first()
            .and_then(|round| round.messages.first())
            .map(|msg| msg.human.trim().to_string())
            .unwrap_or_default();

        Self { chat_id, title, rounds: history.len() }
    }
}
