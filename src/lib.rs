//! Screen-activity observation pipeline: raw capture samples are batched,
//! described by a vision model, then progressively aggregated into events,
//! activities, todos and knowledge, with an LLM review gate in front of every
//! persist.

pub mod aggregate;
pub mod capture;
pub mod db;
pub mod extract;
pub mod llm;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod prompts;
pub mod settings;
pub mod supervise;

pub use db::Database;
pub use pipeline::{Pipeline, PipelineStats};
pub use settings::{PipelineSettings, SettingsStore};
