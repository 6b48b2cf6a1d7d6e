// src/types/mod.rs - Core message and template types shared across the bot

use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A single chat message as delivered by a platform connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub channel: String,
    pub username: String,
    pub display_name: Option<String>,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Badge names from the platform. `None` means the badge tag was missing
    /// or unparseable, which downstream checks treat as "no badges".
    pub user_badges: Option<Vec<String>>,
    pub is_mod: bool,
    pub is_vip: bool,
}

impl ChatMessage {
    /// Case-folded username, the identity key for seen-lists and greetings.
    pub fn name_key(&self) -> String {
        self.username.to_lowercase()
    }

    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }

    /// Broadcaster detection via badges. Fails open: a message without badge
    /// data is treated as not coming from the broadcaster.
    pub fn is_broadcaster(&self) -> bool {
        match &self.user_badges {
            Some(badges) => badges.iter().any(|b| b == "broadcaster"),
            None => {
                debug!(
                    "no badge data on message from '{}', treating as non-broadcaster",
                    self.username
                );
                false
            }
        }
    }
}

/// The one-time parse of a raw chat line. Every rule evaluator works from the
/// same token so ambiguous whitespace cannot produce diverging views of the
/// message.
#[derive(Debug, Clone)]
pub struct CommandToken {
    /// Sanitized text: printable ASCII only, trimmed.
    pub text: String,
    /// Whitespace-split words of `text`; `words[0]` is the command word.
    pub words: Vec<String>,
}

impl CommandToken {
    pub fn parse(raw: &str) -> Self {
        let text: String = raw.chars().filter(|c| (' '..='~').contains(c)).collect();
        let text = text.trim().to_string();
        let words = text.split_whitespace().map(String::from).collect();
        Self { text, words }
    }

    /// The command word (first word), or "" for an empty message.
    pub fn command(&self) -> &str {
        self.words.first().map(String::as_str).unwrap_or("")
    }

    pub fn arg(&self, n: usize) -> Option<&str> {
        self.words.get(n).map(String::as_str)
    }

    /// The tail of `text` starting at word `from`, with interior spacing
    /// preserved. Empty when fewer than `from` words exist.
    pub fn rest(&self, from: usize) -> String {
        let mut remaining = self.text.as_str();
        for _ in 0..from {
            remaining = remaining.trim_start();
            match remaining.find(char::is_whitespace) {
                Some(i) => remaining = &remaining[i..],
                None => return String::new(),
            }
        }
        remaining.trim_start().to_string()
    }
}

/// A reply payload that is either a single template or a list of templates
/// from which one is chosen uniformly at random.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextOrList {
    One(String),
    Many(Vec<String>),
}

impl TextOrList {
    pub fn choose(&self) -> Option<&str> {
        match self {
            TextOrList::One(s) => {
                if s.is_empty() {
                    None
                } else {
                    Some(s)
                }
            }
            TextOrList::Many(list) => {
                if list.is_empty() {
                    None
                } else {
                    let idx = rand::rng().random_range(0..list.len());
                    Some(&list[idx])
                }
            }
        }
    }
}
