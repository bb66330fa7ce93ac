use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Role markers as emitted by Phi-style chat models
static MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<\|(?:system|user|assistant|end)\|>").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self { role, text: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

/// Turns a conversation into a single prompt string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTemplate {
    pub system: String,
    pub user: String,
    pub assistant: String,
    pub end: String,
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self {
            system: "<|system|>".into(),
            user: "<|user|>".into(),
            assistant: "<|assistant|>".into(),
            end: "<|end|>".into(),
        }
    }
}

impl ChatTemplate {
    fn marker(&self, role: Role) -> &str {
        match role {
            Role::System => &self.system,
            Role::User => &self.user,
            Role::Assistant => &self.assistant,
        }
    }

    /// Builds the prompt: the system block when `system_prompt` is not blank,
    /// then `messages` oldest first, then an open assistant marker.
    pub fn format(&self, messages: &[ChatMessage], system_prompt: &str) -> String {
        let mut prompt = String::new();
        if !system_prompt.trim().is_empty() {
            self.push_block(&mut prompt, Role::System, system_prompt);
        }
        for message in messages {
            self.push_block(&mut prompt, message.role, &message.text);
        }
        prompt.push_str(&self.assistant);
        prompt
    }

    fn push_block(&self, prompt: &mut String, role: Role, text: &str) {
        prompt.push_str(self.marker(role));
        prompt.push('\n');
        prompt.push_str(text);
        prompt.push(' ');
        prompt.push_str(&self.end);
        prompt.push('\n');
    }

    /// Removes role and end markers and trims surrounding whitespace.
    pub fn clean_response(&self, response: &str) -> String {
        if *self == ChatTemplate::default() {
            return MARKER.replace_all(response, "").trim().to_string();
        }
        let mut cleaned = response.to_string();
        for marker in [&self.system, &self.user, &self.assistant, &self.end] {
            if !marker.is_empty() {
                cleaned = cleaned.replace(marker.as_str(), "");
            }
        }
        cleaned.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_orders_oldest_first() {
        let template = ChatTemplate::default();
        let messages = vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello!"), ChatMessage::user("Bye")];
        let prompt = template.format(&messages, "Be brief.");
        assert_eq!(
            prompt,
            "<|system|>\nBe brief. <|end|>\n<|user|>\nHi <|end|>\n<|assistant|>\nHello! <|end|>\n<|user|>\nBye <|end|>\n<|assistant|>"
        );
    }

    #[test]
    fn test_blank_system_prompt_is_skipped() {
        let prompt = ChatTemplate::default().format(&[ChatMessage::user("Hi")], "  ");
        assert!(prompt.starts_with("<|user|>"));
    }

    #[test]
    fn test_clean_response() {
        let template = ChatTemplate::default();
        assert_eq!(template.clean_response("  Sure thing <|end|>\n"), "Sure thing");
        assert_eq!(template.clean_response("<|assistant|> answer <|end|>"), "answer");
        assert_eq!(template.clean_response("no markers here "), "no markers here");
    }

    #[test]
    fn test_custom_markers() {
        let template = ChatTemplate {
            system: "[S]".into(),
            user: "[U]".into(),
            assistant: "[A]".into(),
            end: "[E]".into(),
        };
        assert_eq!(template.clean_response("[A] ok [E]"), "ok");
    }
}
