use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a single capture sample carried. Screenshot payloads stay in the
/// frame cache; the sample only holds the perceptual hash that keys them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SampleKind {
    Screenshot { phash: String },
    Keyboard { count: u32 },
    Mouse { count: u32 },
}

impl SampleKind {
    pub fn is_screenshot(&self) -> bool {
        matches!(self, SampleKind::Screenshot { .. })
    }
}

/// One raw capture sample before any semantic interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSample {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SampleKind,
}

impl RawSample {
    pub fn screenshot(timestamp: DateTime<Utc>, phash: impl Into<String>) -> Self {
        Self {
            timestamp,
            kind: SampleKind::Screenshot {
                phash: phash.into(),
            },
        }
    }

    pub fn keyboard(timestamp: DateTime<Utc>, count: u32) -> Self {
        Self {
            timestamp,
            kind: SampleKind::Keyboard { count },
        }
    }

    pub fn mouse(timestamp: DateTime<Utc>, count: u32) -> Self {
        Self {
            timestamp,
            kind: SampleKind::Mouse { count },
        }
    }
}

/// A screenshot sample resolved against the frame cache, ready for one
/// extraction call. Produced by the batcher, consumed by the scene extractor.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub phash: String,
    pub timestamp: DateTime<Utc>,
    pub png_bytes: Vec<u8>,
}
