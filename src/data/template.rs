//! Prompt rendering.
//!
//! When the tokenizer config ships a chat template, examples and prompts are
//! rendered with the model-native turn delimiters of the detected template
//! family. Without one, a fixed two-section plain-text template is used.
//! The template is resolved once per artifact and rendering is a pure
//! function of its inputs.

use serde::Deserialize;
use std::path::Path;

pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// A single role-tagged turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

impl<'a> ChatMessage<'a> {
    pub fn user(content: &'a str) -> Self {
        Self {
            role: "user",
            content,
        }
    }

    pub fn assistant(content: &'a str) -> Self {
        Self {
            role: "assistant",
            content,
        }
    }
}

/// Chat template families recognized from the template text a tokenizer
/// config ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatFamily {
    /// `<|start_header_id|>role<|end_header_id|>` turns
    Llama3,
    /// `[INST] ... [/INST]` turns
    Inst,
    /// `<|im_start|>role` turns
    ChatMl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTemplate {
    Chat(ChatFamily),
    Plain,
}

#[derive(Deserialize)]
struct TokenizerConfig {
    chat_template: Option<String>,
}

impl PromptTemplate {
    /// Resolve the template from the `tokenizer_config.json` in an artifact
    /// directory. Anything unreadable or unrecognized falls back to the
    /// plain template.
    pub fn from_artifact(dir: &Path) -> Self {
        Self::from_config_file(&dir.join(TOKENIZER_CONFIG_FILE))
    }

    /// Resolve the template from a tokenizer config file path.
    pub fn from_config_file(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::Plain;
        };
        let Ok(config) = serde_json::from_str::<TokenizerConfig>(&raw) else {
            return Self::Plain;
        };
        match config.chat_template {
            Some(template) => Self::from_template_text(&template),
            None => Self::Plain,
        }
    }

    /// Detect the template family from the template source text.
    pub fn from_template_text(template: &str) -> Self {
        if template.contains("<|start_header_id|>") {
            Self::Chat(ChatFamily::Llama3)
        } else if template.contains("[INST]") {
            Self::Chat(ChatFamily::Inst)
        } else if template.contains("<|im_start|>") {
            Self::Chat(ChatFamily::ChatMl)
        } else {
            Self::Plain
        }
    }

    /// Render one instruction/response pair into a training text.
    pub fn format_example(&self, instruction: &str, response: &str) -> String {
        self.render(
            &[
                ChatMessage::user(instruction),
                ChatMessage::assistant(response),
            ],
            false,
        )
    }

    /// Render a user prompt, ending where the assistant reply should start.
    pub fn format_prompt(&self, prompt: &str) -> String {
        self.render(&[ChatMessage::user(prompt)], true)
    }

    /// Render role-tagged turns into the exact text the base model expects.
    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String {
        match self {
            Self::Chat(ChatFamily::Llama3) => render_llama3(messages, add_generation_prompt),
            Self::Chat(ChatFamily::Inst) => render_inst(messages, add_generation_prompt),
            Self::Chat(ChatFamily::ChatMl) => render_chatml(messages, add_generation_prompt),
            Self::Plain => render_plain(messages, add_generation_prompt),
        }
    }
}

fn render_llama3(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let mut out = String::from("<|begin_of_text|>");
    for message in messages {
        out.push_str(&format!(
            "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
            message.role, message.content
        ));
    }
    if add_generation_prompt {
        out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    }
    out
}

fn render_inst(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let mut out = String::from("<s>");
    for message in messages {
        match message.role {
            "assistant" => out.push_str(&format!(" {}</s>", message.content)),
            _ => out.push_str(&format!("[INST] {} [/INST]", message.content)),
        }
    }
    // The closing [/INST] already marks where the reply starts.
    let _ = add_generation_prompt;
    out
}

fn render_chatml(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(&format!(
            "<|im_start|>{}\n{}<|im_end|>\n",
            message.role, message.content
        ));
    }
    if add_generation_prompt {
        out.push_str("<|im_start|>assistant\n");
    }
    out
}

fn render_plain(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let instruction = messages
        .iter()
        .find(|m| m.role != "assistant")
        .map_or("", |m| m.content);
    let response = messages
        .iter()
        .find(|m| m.role == "assistant")
        .map_or("", |m| m.content);
    if add_generation_prompt {
        format!("### Instrucción:\n{instruction}\n\n### Respuesta:\n")
    } else {
        format!("### Instrucción:\n{instruction}\n\n### Respuesta:\n{response}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_example_matches_fixed_template() {
        let text = PromptTemplate::Plain.format_example("What is 2+2?", "4");
        assert_eq!(text, "### Instrucción:\nWhat is 2+2?\n\n### Respuesta:\n4");
    }

    #[test]
    fn plain_prompt_ends_at_response_section() {
        let text = PromptTemplate::Plain.format_prompt("hola");
        assert_eq!(text, "### Instrucción:\nhola\n\n### Respuesta:\n");
    }

    #[test]
    fn formatting_is_idempotent() {
        let template = PromptTemplate::Plain;
        let first = template.format_example("a", "b");
        let second = template.format_example("a", "b");
        assert_eq!(first, second);
    }

    #[test]
    fn empty_fields_are_accepted() {
        let text = PromptTemplate::Plain.format_example("", "");
        assert_eq!(text, "### Instrucción:\n\n\n### Respuesta:\n");
    }

    #[test]
    fn family_detection() {
        let llama3 = "{% for m in messages %}<|start_header_id|>{{ m.role }}<|end_header_id|>{% endfor %}";
        assert_eq!(
            PromptTemplate::from_template_text(llama3),
            PromptTemplate::Chat(ChatFamily::Llama3)
        );
        let inst = "{{ '[INST] ' + message.content + ' [/INST]' }}";
        assert_eq!(
            PromptTemplate::from_template_text(inst),
            PromptTemplate::Chat(ChatFamily::Inst)
        );
        let chatml = "<|im_start|>{{ m.role }}";
        assert_eq!(
            PromptTemplate::from_template_text(chatml),
            PromptTemplate::Chat(ChatFamily::ChatMl)
        );
        assert_eq!(
            PromptTemplate::from_template_text("just text"),
            PromptTemplate::Plain
        );
    }

    #[test]
    fn missing_config_falls_back_to_plain() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PromptTemplate::from_artifact(dir.path()), PromptTemplate::Plain);
    }

    #[test]
    fn config_with_template_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(TOKENIZER_CONFIG_FILE),
            r#"{"chat_template": "<|im_start|>{{ role }}"}"#,
        )
        .unwrap();
        assert_eq!(
            PromptTemplate::from_artifact(dir.path()),
            PromptTemplate::Chat(ChatFamily::ChatMl)
        );
    }

    #[test]
    fn llama3_generation_prompt() {
        let text = PromptTemplate::Chat(ChatFamily::Llama3).format_prompt("hi");
        assert!(text.starts_with("<|begin_of_text|><|start_header_id|>user<|end_header_id|>"));
        assert!(text.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn inst_example_closes_reply() {
        let text = PromptTemplate::Chat(ChatFamily::Inst).format_example("q", "a");
        assert_eq!(text, "<s>[INST] q [/INST] a</s>");
    }
}
