use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;

use crate::llm::{parse_json_reply, ChatMessage, ChatRequest, ContentPart, LlmClient};
use crate::models::{CaptureFrame, RawSample, SampleKind, Scene};
use crate::prompts;
use crate::settings::SettingsStore;

/// Turns one batch of screenshots into structured scene descriptions with a
/// single vision call. Scenes are the shared input for every downstream
/// aggregator in the cycle, so each screenshot crosses the wire exactly once.
pub struct SceneExtractor {
    llm: Arc<dyn LlmClient>,
    settings: Arc<SettingsStore>,
}

impl SceneExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, settings: Arc<SettingsStore>) -> Self {
        Self { llm, settings }
    }

    /// One LLM call for the whole batch. Any failure — transport, malformed
    /// reply, bad indices — degrades to fewer (possibly zero) scenes; it never
    /// fails the batch.
    pub async fn extract(
        &self,
        frames: &[CaptureFrame],
        input_samples: &[RawSample],
        behavior_context: Option<&str>,
    ) -> Vec<Scene> {
        if frames.is_empty() {
            return Vec::new();
        }

        let language = self.settings.language();
        let hint = activity_hint(input_samples);

        let mut parts = vec![ContentPart::Text(prompts::scene_user_prompt(
            frames.len(),
            hint.as_deref(),
            behavior_context,
        ))];
        for frame in frames {
            parts.push(ContentPart::PngImage(frame.png_bytes.clone()));
        }

        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(prompts::scene_system_prompt(language)),
                ChatMessage::user_parts(parts),
            ],
            max_tokens: Some(4096),
            temperature: Some(0.2),
            json_response: false,
        };

        let reply = match self.llm.chat(request).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!("scene extraction call failed: {err}");
                return Vec::new();
            }
        };

        let scenes = parse_scenes(&reply.content, frames);
        info!(
            "scene extraction: {} frames in, {} scenes out",
            frames.len(),
            scenes.len()
        );
        scenes
    }
}

/// Folds keyboard/mouse samples into one textual hint line. Returns `None`
/// when the batch had no input activity.
fn activity_hint(input_samples: &[RawSample]) -> Option<String> {
    if input_samples.is_empty() {
        return None;
    }

    let mut keyboard: u64 = 0;
    let mut mouse: u64 = 0;
    for sample in input_samples {
        match sample.kind {
            SampleKind::Keyboard { count } => keyboard += u64::from(count),
            SampleKind::Mouse { count } => mouse += u64::from(count),
            SampleKind::Screenshot { .. } => {}
        }
    }

    Some(format!(
        "{keyboard} keyboard events and {mouse} mouse events across {} samples",
        input_samples.len()
    ))
}

/// Decodes the reply and resolves each scene's 0-based screenshot index back
/// to the real frame. A non-array top level means zero scenes; a bad index
/// skips only that scene.
fn parse_scenes(content: &str, frames: &[CaptureFrame]) -> Vec<Scene> {
    let value = match parse_json_reply(content) {
        Ok(value) => value,
        Err(err) => {
            warn!("scene reply not decodable: {err}");
            return Vec::new();
        }
    };

    let Some(items) = value.as_array() else {
        warn!("scene reply top level is not a list, treating as empty");
        return Vec::new();
    };

    let mut scenes = Vec::new();
    for item in items {
        let Some(index) = screenshot_index(item) else {
            warn!("scene item missing screenshot_index, skipping");
            continue;
        };
        let Some(frame) = frames.get(index) else {
            warn!(
                "scene references screenshot {index} but batch has {}, skipping",
                frames.len()
            );
            continue;
        };

        scenes.push(Scene {
            screenshot_phash: frame.phash.clone(),
            timestamp: frame.timestamp,
            visual_summary: string_field(item, "visual_summary"),
            detected_text: string_field(item, "detected_text"),
            ui_elements: string_list_field(item, "ui_elements"),
            inferred_activity: string_field(item, "inferred_activity"),
            focus_areas: string_list_field(item, "focus_areas"),
        });
    }

    scenes
}

fn screenshot_index(item: &Value) -> Option<usize> {
    match item.get("screenshot_index")? {
        Value::Number(number) => number.as_u64().map(|n| n as usize),
        Value::String(raw) => raw.trim().parse::<usize>().ok(),
        _ => None,
    }
}

fn string_field(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn string_list_field(item: &Value, key: &str) -> Vec<String> {
    item.get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlm};
    use crate::settings::{PipelineSettings, SettingsStore};
    use chrono::{TimeZone, Utc};

    fn frames(n: usize) -> Vec<CaptureFrame> {
        (0..n)
            .map(|i| CaptureFrame {
                phash: format!("hash-{i}"),
                timestamp: Utc.with_ymd_and_hms(2026, 8, 26, 10, 0, i as u32).unwrap(),
                png_bytes: vec![0; 4],
            })
            .collect()
    }

    fn extractor(llm: Arc<MockLlm>) -> SceneExtractor {
        let settings = Arc::new(SettingsStore::ephemeral(PipelineSettings::default()));
        SceneExtractor::new(llm, settings)
    }

    #[tokio::test]
    async fn enriches_scenes_with_frame_hash_and_timestamp() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"[
                {"screenshot_index": 0, "visual_summary": "editor open", "inferred_activity": "coding"},
                {"screenshot_index": 2, "visual_summary": "browser", "inferred_activity": "reading docs"}
            ]"#,
        );

        let frames = frames(3);
        let scenes = extractor(llm).extract(&frames, &[], None).await;

        assert_eq!(scenes.len(), 2);
        assert_eq!(scenes[0].screenshot_phash, "hash-0");
        assert_eq!(scenes[1].screenshot_phash, "hash-2");
        assert_eq!(scenes[1].timestamp, frames[2].timestamp);
        assert_eq!(scenes[1].inferred_activity, "reading docs");
    }

    #[tokio::test]
    async fn out_of_range_and_malformed_indices_skip_only_that_scene() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"[
                {"screenshot_index": 5, "visual_summary": "ghost", "inferred_activity": "none"},
                {"screenshot_index": "1", "visual_summary": "ok", "inferred_activity": "typing"},
                {"visual_summary": "no index", "inferred_activity": "none"}
            ]"#,
        );

        let frames = frames(2);
        let scenes = extractor(llm).extract(&frames, &[], None).await;

        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].screenshot_phash, "hash-1");
    }

    #[tokio::test]
    async fn non_list_top_level_yields_empty_not_error() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply(r#"{"scenes": []}"#);

        let scenes = extractor(llm).extract(&frames(1), &[], None).await;
        assert!(scenes.is_empty());
    }

    #[tokio::test]
    async fn llm_failure_yields_empty() {
        let llm = Arc::new(MockLlm::new());
        llm.push_failure(LlmError::Network("connection refused".into()));

        let scenes = extractor(llm).extract(&frames(1), &[], None).await;
        assert!(scenes.is_empty());
    }

    #[tokio::test]
    async fn input_samples_fold_into_hint() {
        let now = Utc::now();
        let hint = activity_hint(&[
            RawSample::keyboard(now, 10),
            RawSample::keyboard(now, 5),
            RawSample::mouse(now, 7),
        ])
        .unwrap();

        assert!(hint.contains("15 keyboard"));
        assert!(hint.contains("7 mouse"));
    }
}
