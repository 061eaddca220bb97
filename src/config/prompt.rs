use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use log::info;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an AI assistant having a conversation with a human. If you do not know the answer to a question, truthfully say you do not know.";

pub const DEFAULT_TEMPLATE: &str =
    "Pieces of previous conversation, ignore them if they are empty or irrelevant:\n{history}\nCurrent conversation:\n{chat_history_lines}\n{human_input}";

#[derive(Debug)]
pub enum PromptError {
    MissingPlaceholder(String),
    UnknownFormat(String),
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::MissingPlaceholder(key) =>
                write!(f, "Prompt template is missing the '{{{}}}' placeholder", key),
            PromptError::UnknownFormat(name) => write!(f, "Unknown prompt format '{}'", name),
            PromptError::IoError(e) => write!(f, "Prompt file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Prompt JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

/// Chat template of the model behind the generation endpoint.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PromptFormat {
    Llama3,
    Phi3,
    Mistral,
    ChatMl,
    Plain,
}

impl FromStr for PromptFormat {
    type Err = PromptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "llama3" => Ok(PromptFormat::Llama3),
            "phi3" => Ok(PromptFormat::Phi3),
            "mistral" => Ok(PromptFormat::Mistral),
            "chatml" => Ok(PromptFormat::ChatMl),
            "plain" | "none" => Ok(PromptFormat::Plain),
            _ => Err(PromptError::UnknownFormat(s.to_string())),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default = "default_format")]
    pub format: PromptFormat,
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

fn default_format() -> PromptFormat {
    PromptFormat::Llama3
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            template: default_template(),
            format: default_format(),
        }
    }
}

impl PromptConfig {
    fn validate(&self) -> Result<(), PromptError> {
        if !self.template.contains("{human_input}") {
            return Err(PromptError::MissingPlaceholder("human_input".to_string()));
        }
        Ok(())
    }

    /// `recalled` are snippets from the recall index, `history` the windowed branch prefix.
    pub fn render(&self, recalled: &[String], history: &str, human_input: &str) -> String {
        let recalled = recalled.join("\n");
        let body = fill_template(
            &self.template,
            &[
                ("{history}", recalled.as_str()),
                ("{chat_history_lines}", history),
                ("{human_input}", human_input),
            ]
        );
        apply_format(self.format, &self.system_prompt, &body)
    }
}

/// Replaces placeholders in one left-to-right pass; substituted text is never rescanned.
fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        rest = &rest[open..];
        match values.iter().find(|(key, _)| rest.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &rest[key.len()..];
            }
            None => {
                out.push('{');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn apply_format(format: PromptFormat, system: &str, body: &str) -> String {
    match format {
        PromptFormat::Llama3 =>
            format!(
                "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n{}<|eot_id|><|start_header_id|>user<|end_header_id|>\n\n{}<|eot_id|><|start_header_id|>assistant<|end_header_id|>",
                system,
                body
            ),
        PromptFormat::Phi3 => format!("<|user|>\n{}\n\n{}<|end|>\n<|assistant|>", system, body),
        PromptFormat::Mistral => format!("<s>[INST]{}\n\n{}[/INST]", system, body),
        PromptFormat::ChatMl =>
            format!(
                "<|im_start|>system\n{}<|im_end|>\n<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
                system,
                body
            ),
        PromptFormat::Plain => format!("{}\n\n{}", system, body),
    }
}

/// Reads a prompt file. Fields missing from the file keep their defaults.
pub fn load_prompts(path: impl AsRef<Path>) -> Result<Arc<PromptConfig>, PromptError> {
    let file_content = fs::read_to_string(path.as_ref())?;
    let config: PromptConfig = serde_json::from_str(&file_content)?;
    config.validate()?;
    info!("Loaded prompt configuration from {}", path.as_ref().display());
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_render_llama3() {
        let config = PromptConfig {
            system_prompt: "sys".to_string(),
            template: "{history}|{chat_history_lines}|{human_input}".to_string(),
            format: PromptFormat::Llama3,
        };
        let prompt = config.render(&["old".to_string()], "Human: a\nAI: b\n", "hi");
        assert_eq!(
            prompt,
            "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\nsys<|eot_id|><|start_header_id|>user<|end_header_id|>\n\nold|Human: a\nAI: b\n|hi<|eot_id|><|start_header_id|>assistant<|end_header_id|>"
        );
    }

    #[test]
    fn test_inserted_text_is_not_expanded_again() {
        let config = PromptConfig {
            system_prompt: "sys".to_string(),
            template: "{history}|{chat_history_lines}|{human_input}".to_string(),
            format: PromptFormat::Plain,
        };
        let prompt = config.render(
            &["says {human_input}".to_string()],
            "Human: {chat_history_lines}\n",
            "{history} {x"
        );
        assert_eq!(prompt, "sys\n\nsays {human_input}|Human: {chat_history_lines}\n|{history} {x");
    }

    #[test]
    fn test_apply_format_variants() {
        assert_eq!(apply_format(PromptFormat::Plain, "s", "b"), "s\n\nb");
        assert_eq!(apply_format(PromptFormat::Mistral, "s", "b"), "<s>[INST]s\n\nb[/INST]");
        assert!(apply_format(PromptFormat::ChatMl, "s", "b").ends_with("<|im_start|>assistant\n"));
        assert!(apply_format(PromptFormat::Phi3, "s", "b").starts_with("<|user|>\ns"));
    }

    #[test]
    fn test_prompt_format_from_str() {
        assert_eq!("ChatML".parse::<PromptFormat>().unwrap(), PromptFormat::ChatMl);
        assert!(matches!("gpt".parse::<PromptFormat>(), Err(PromptError::UnknownFormat(_))));
    }

    #[test]
    fn test_load_prompts_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"system_prompt": "be brief", "format": "chatml"}}"#).unwrap();
        let config = load_prompts(file.path()).unwrap();
        assert_eq!(config.system_prompt, "be brief");
        assert_eq!(config.format, PromptFormat::ChatMl);
        assert_eq!(config.template, DEFAULT_TEMPLATE);
    }

    #[test]
    fn test_load_prompts_rejects_template_without_input() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"template": "no input here"}}"#).unwrap();
        let err = load_prompts(file.path()).unwrap_err();
        assert!(matches!(err, PromptError::MissingPlaceholder(_)));
    }
}
