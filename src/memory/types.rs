// src/memory/types.rs
// Core domain types: conversations, messages, memory units, search results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// Role of a conversation message
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Human,
    Assistant,
    System,
}

/// Kind of a stored memory unit
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MemoryUnitType {
    GlobalMu,
    Conversation,
    ErrorLog,
    Decision,
    CodeSnippet,
    Documentation,
    Archive,
}

impl MemoryUnitType {
    /// Parse the legacy tool-surface aliases (GLOBAL / QUICK / ARCHIVE).
    /// QUICK maps to `conversation` - short-lived quick units are subsumed
    /// by conversation units with optional expiry.
    pub fn from_alias(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "GLOBAL" => Some(Self::GlobalMu),
            "QUICK" => Some(Self::Conversation),
            "ARCHIVE" => Some(Self::Archive),
            _ => s.to_lowercase().parse().ok(),
        }
    }
}

/// Ordered element of a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sequence_number: i64,
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub token_count: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// One dialogue session. Append-only messages until ended; never mutated
/// after a memory unit is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_count: i64,
    #[serde(default)]
    pub token_count: i64,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl Conversation {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            session_id: None,
            title: String::new(),
            messages: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            message_count: 0,
            token_count: 0,
            metadata: None,
        }
    }

    /// Append a message with the next dense sequence number.
    pub fn push_message(&mut self, message_type: MessageType, content: impl Into<String>) {
        let content = content.into();
        self.messages.push(Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: self.id.clone(),
            sequence_number: self.messages.len() as i64,
            message_type,
            content,
            token_count: 0,
            timestamp: Utc::now(),
            metadata: None,
        });
        self.message_count = self.messages.len() as i64;
    }
}

/// Compressed, searchable artifact derived from a conversation (or from a
/// synthesized global review, in which case `conversation_id` is None).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUnit {
    pub id: String,
    pub project_id: String,
    pub conversation_id: Option<String>,
    pub unit_type: MemoryUnitType,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub keywords: Vec<String>,
    pub token_count: i64,
    /// Last retrieval score; volatile, not authoritative
    #[serde(default)]
    pub relevance_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

fn default_true() -> bool {
    true
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl MemoryUnit {
    pub fn new(
        project_id: impl Into<String>,
        conversation_id: Option<String>,
        unit_type: MemoryUnitType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            conversation_id,
            unit_type,
            title: String::new(),
            summary: String::new(),
            content: String::new(),
            keywords: Vec::new(),
            token_count: 0,
            relevance_score: 0.0,
            created_at: now,
            updated_at: now,
            expires_at: None,
            is_active: true,
            metadata: empty_object(),
        }
    }

    /// Whether the unit has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn metadata_score(&self, key: &str) -> f64 {
        self.metadata
            .get(key)
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
    }

    pub fn importance_score(&self) -> f64 {
        self.metadata_score("importance_score")
    }

    pub fn quality_score(&self) -> f64 {
        self.metadata_score("quality_score")
    }

    /// Deduplicate keywords case-insensitively, preserving first spelling,
    /// and cap the list at ten.
    pub fn set_keywords(&mut self, keywords: Vec<String>) {
        let mut seen = std::collections::HashSet::new();
        self.keywords = keywords
            .into_iter()
            .filter(|k| seen.insert(k.to_lowercase()))
            .take(10)
            .collect();
    }
}

/// How a retrieval matched a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Semantic,
    Keyword,
    Hybrid,
}

/// One retrieval hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub memory_unit: MemoryUnit,
    pub relevance_score: f64,
    pub match_type: MatchType,
    #[serde(default)]
    pub matched_keywords: Vec<String>,
}
