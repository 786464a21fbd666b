//! Prompt templates for every LLM call the pipeline makes, in each supported
//! output language. Templates are plain format strings; the structured parts
//! of the contract (index bases, JSON shapes) live in the extractors that
//! parse the replies, and the wording here must stay in sync with them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Zh,
}

impl Language {
    pub fn from_code(code: &str) -> Self {
        match code {
            "zh" | "zh-CN" | "zh-Hans" => Language::Zh,
            _ => Language::En,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Zh => "zh",
        }
    }

    fn output_clause(&self) -> &'static str {
        match self {
            Language::En => "Write all titles and descriptions in English.",
            Language::Zh => "所有标题和描述请使用中文。",
        }
    }
}

pub fn scene_system_prompt(language: Language) -> String {
    format!(
        "You are a screen activity analyst. You receive a sequence of desktop \
         screenshots and describe what the user is doing in each one. \
         Respond with a JSON array only. Each element must be an object with: \
         \"screenshot_index\" (0-based index into the screenshots you were shown), \
         \"visual_summary\", \"detected_text\", \"ui_elements\" (array of strings), \
         \"inferred_activity\", \"focus_areas\" (array of strings). \
         Near-identical consecutive screenshots may share one element. {}",
        language.output_clause()
    )
}

pub fn scene_user_prompt(
    frame_count: usize,
    activity_hint: Option<&str>,
    behavior_context: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Describe each of the {frame_count} screenshots below. They were captured \
         in chronological order from one user's screen."
    );
    if let Some(hint) = activity_hint {
        prompt.push_str("\nInput activity during this period: ");
        prompt.push_str(hint);
    }
    if let Some(context) = behavior_context {
        prompt.push_str("\nBehavior classification context: ");
        prompt.push_str(context);
    }
    prompt
}

pub fn event_aggregation_prompt(language: Language, indexed_list: &str) -> String {
    format!(
        "Below is a numbered list of fine-grained user actions observed on screen. \
         Group related consecutive actions into higher-level events. \
         Respond with a JSON object {{\"events\": [...]}}; each event has \
         \"title\", \"description\", and \"action_indices\" listing the 1-based \
         numbers of the actions it covers. Every event needs at least one index; \
         leave actions out rather than inventing events. {}\n\nActions:\n{}",
        language.output_clause(),
        indexed_list
    )
}

pub fn activity_aggregation_prompt(language: Language, indexed_list: &str) -> String {
    format!(
        "Below is a numbered list of events from a user's working session. \
         Merge related events into broader activity blocks. \
         Respond with a JSON object {{\"activities\": [...]}}; each activity has \
         \"title\", \"description\", and \"event_indices\" listing the 1-based \
         numbers of the events it covers. {}\n\nEvents:\n{}",
        language.output_clause(),
        indexed_list
    )
}

pub fn todo_extraction_prompt(language: Language, indexed_list: &str) -> String {
    format!(
        "Below is a numbered list of user actions observed on screen. Identify \
         concrete open tasks the user created, received, or left unfinished. \
         Respond with a JSON object {{\"todos\": [...]}}; each todo has \"title\", \
         \"description\", \"keywords\" (array of strings), and \"action_indices\" \
         listing the 1-based numbers of the actions it was seen in. Return an \
         empty list when nothing qualifies. {}\n\nActions:\n{}",
        language.output_clause(),
        indexed_list
    )
}

pub fn knowledge_extraction_prompt(language: Language, indexed_list: &str) -> String {
    format!(
        "Below is a numbered list of user actions observed on screen. Extract \
         durable knowledge worth remembering: facts read, decisions made, \
         references consulted. Respond with a JSON object \
         {{\"knowledge\": [...]}}; each item has \"title\", \"description\", \
         \"keywords\" (array of strings), and \"action_indices\" listing the \
         1-based numbers of the actions it came from. Return an empty list when \
         nothing qualifies. {}\n\nActions:\n{}",
        language.output_clause(),
        indexed_list
    )
}

pub fn review_prompt(
    language: Language,
    entity_label: &str,
    records_json: &str,
    sources_json: Option<&str>,
) -> String {
    let mut prompt = format!(
        "You are reviewing {entity_label} records produced by an automated \
         extraction step. Check them for factual grounding, temporal coherence \
         and clarity. Respond with a JSON object: \"is_valid\" (boolean), \
         \"issues\" (array of strings), \"suggestions\" (array of strings), and \
         optionally \"revised_content\" — an array with exactly one object per \
         input record, in the same order, each carrying improved \"title\" and \
         \"description\". Omit \"revised_content\" if no rewrite is needed. {}\n\n\
         Records:\n{records_json}",
        language.output_clause()
    );
    if let Some(sources) = sources_json {
        prompt.push_str("\n\nSource records they were derived from:\n");
        prompt.push_str(sources);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_codes_round_trip() {
        assert_eq!(Language::from_code("zh"), Language::Zh);
        assert_eq!(Language::from_code("en"), Language::En);
        assert_eq!(Language::from_code("fr"), Language::En);
        assert_eq!(Language::Zh.code(), "zh");
    }

    #[test]
    fn prompts_carry_language_clause() {
        let prompt = event_aggregation_prompt(Language::Zh, "1. something");
        assert!(prompt.contains("中文"));
        assert!(prompt.contains("1. something"));
    }
}
