use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured description of a single screenshot, produced by one extraction
/// call and shared by every downstream aggregator in that cycle. Scenes are
/// memory-only; nothing ever writes them to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    /// Perceptual hash of the screenshot this scene was read from.
    pub screenshot_phash: String,
    /// Capture timestamp of that screenshot.
    pub timestamp: DateTime<Utc>,
    pub visual_summary: String,
    #[serde(default)]
    pub detected_text: String,
    #[serde(default)]
    pub ui_elements: Vec<String>,
    pub inferred_activity: String,
    #[serde(default)]
    pub focus_areas: Vec<String>,
}
