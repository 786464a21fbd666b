use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock};

use crate::prompts::Language;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatcherSettings {
    /// Batch fires once this many samples have accumulated (state permitting).
    pub count_threshold: usize,
    /// Hard cap; reaching it forces a flush regardless of state.
    pub max_batch_size: usize,
    /// Batch fires this long after the first unflushed sample arrived.
    pub time_threshold_secs: u64,
    /// A batch stuck in processing longer than this is discarded.
    pub processing_timeout_secs: u64,
}

impl Default for BatcherSettings {
    fn default() -> Self {
        Self {
            count_threshold: 50,
            max_batch_size: 200,
            time_threshold_secs: 60,
            processing_timeout_secs: 720,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorSettings {
    pub interval_secs: u64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".into(),
            model: "qwen2.5vl".into(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    pub language: Language,
    pub batcher: BatcherSettings,
    pub events: AggregatorSettings,
    pub todos: AggregatorSettings,
    pub knowledge: AggregatorSettings,
    pub activities: AggregatorSettings,
    pub llm: LlmSettings,
    /// Byte budget for the in-memory frame cache before spilling/evicting.
    pub frame_cache_budget_bytes: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            language: Language::En,
            batcher: BatcherSettings::default(),
            events: AggregatorSettings {
                interval_secs: 600,
                window_secs: 3600,
            },
            todos: AggregatorSettings {
                interval_secs: 900,
                window_secs: 3600,
            },
            knowledge: AggregatorSettings {
                interval_secs: 900,
                window_secs: 3600,
            },
            activities: AggregatorSettings {
                interval_secs: 1800,
                window_secs: 10800,
            },
            llm: LlmSettings::default(),
            frame_cache_budget_bytes: 64 * 1024 * 1024,
        }
    }
}

/// File-backed settings with in-process overrides. Aggregators read the
/// language through this store on every cycle, so a runtime change takes
/// effect on the next tick without a restart.
pub struct SettingsStore {
    path: Option<PathBuf>,
    data: RwLock<PipelineSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            PipelineSettings::default()
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// Settings held only in memory; used by tests and embedded hosts.
    pub fn ephemeral(settings: PipelineSettings) -> Self {
        Self {
            path: None,
            data: RwLock::new(settings),
        }
    }

    pub fn snapshot(&self) -> PipelineSettings {
        self.data.read().unwrap().clone()
    }

    pub fn language(&self) -> Language {
        self.data.read().unwrap().language
    }

    pub fn set_language(&self, language: Language) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.language = language;
        self.persist(&guard)
    }

    pub fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut PipelineSettings),
    {
        let mut guard = self.data.write().unwrap();
        mutate(&mut guard);
        self.persist(&guard)
    }

    fn persist(&self, data: &PipelineSettings) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write settings to {}", path.display()))
    }
}
