use serde::{ Serialize, Deserialize };

use crate::branch::RenderInstruction;
use crate::models::chat::{ ChatSummary, SequenceId };

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Ask for the render instructions of the whole chat.
    #[serde(rename = "tree")]
    Tree,
    /// Input typed in the reply box under the last tab of a sequence.
    #[serde(rename = "reply")] Reply {
        round: u32,
        sequence_id: SequenceId,
        content: String,
    },
    /// Input typed in a "New" tab. `sequence_id` is the anchor, absent in round 1.
    #[serde(rename = "branch")] Branch {
        round: u32,
        #[serde(default)]
        sequence_id: Option<SequenceId>,
        content: String,
    },
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "list_chats")]
    ListChats,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "tree")] Tree {
        instructions: Vec<RenderInstruction>,
    },
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "token")] Token {
        content: String,
    },
    #[serde(rename = "appended")] Appended {
        round: u32,
        sequence_id: SequenceId,
        response: String,
        stopped: bool,
        timestamp: i64,
    },
    #[serde(rename = "chats")] Chats {
        chats: Vec<ChatSummary>,
    },
    #[serde(rename = "error")] Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_messages() {
        let msg: ClientMessage = serde_json
            ::from_str(r#"{"type":"reply","round":2,"sequence_id":1,"content":"more"}"#)
            .unwrap();
        assert_eq!(msg, ClientMessage::Reply { round: 2, sequence_id: 1, content: "more".into() });

        let msg: ClientMessage = serde_json
            ::from_str(r#"{"type":"branch","round":1,"content":"hi"}"#)
            .unwrap();
        assert_eq!(msg, ClientMessage::Branch { round: 1, sequence_id: None, content: "hi".into() });

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Stop);
    }

    #[test]
    fn test_server_message_tags() {
        let json = serde_json::to_value(ServerMessage::Token { content: "a".into() }).unwrap();
        assert_eq!(json["type"], "token");
        let json = serde_json::to_value(ServerMessage::Processing).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "processing" }));
    }
}
