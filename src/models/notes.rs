use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A piece of durable knowledge spotted on screen (a fact, a doc, a decision).
/// Extracted from action windows, outside the event/activity chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Knowledge {
    pub id: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    /// First action that triggered this extraction, when known.
    pub action_id: Option<String>,
    pub source_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Knowledge {
    pub fn new(
        title: String,
        description: String,
        keywords: Vec<String>,
        source_ids: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            description,
            keywords,
            action_id: source_ids.first().cloned(),
            source_ids,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}

/// An open task the user appeared to create or be assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub action_id: Option<String>,
    pub source_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Todo {
    pub fn new(
        title: String,
        description: String,
        keywords: Vec<String>,
        source_ids: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            description,
            keywords,
            action_id: source_ids.first().cloned(),
            source_ids,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}
