/// A chat command delivered by the host bot framework.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatCommand {
    /// User text with the command keyword already removed.
    pub text: String,
    /// Session / sender id, sent to the agent as `user_id`.
    pub user_id: String,
    /// Remote conversation to continue, when the host tracks one.
    pub conversation_id: Option<String>,
}

impl ChatCommand {
    pub fn new(text: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_id: user_id.into(),
            conversation_id: None,
        }
    }

    pub fn conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Parses raw chat input, stripping a leading `/keyword` or `keyword`
    /// token. Returns `None` when no message text remains.
    pub fn parse(raw: &str, keyword: &str, user_id: impl Into<String>) -> Option<Self> {
        let text = strip_keyword(raw.trim(), keyword).trim();
        if text.is_empty() {
            return None;
        }
        Some(Self::new(text, user_id))
    }
}

fn strip_keyword<'a>(input: &'a str, keyword: &str) -> &'a str {
    let keyword = keyword.trim_start_matches('/');
    if keyword.is_empty() {
        return input;
    }
    let without_slash = input.strip_prefix('/').unwrap_or(input);
    match without_slash.strip_prefix(keyword) {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest,
        _ => input,
    }
}

/// Reply shown when the command carries no message text.
pub fn usage_hint(keyword: &str) -> String {
    let keyword = keyword.trim_start_matches('/');
    format!("Please provide a message, for example: /{keyword} hello")
}
