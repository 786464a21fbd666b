use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::aggregate::{
    ActivityAggregator, AggregatorRunner, EventAggregator, KnowledgeAggregator, StatsSnapshot,
    TodoAggregator,
};
use crate::capture::{BatcherConfig, BatcherMetrics, FrameCache, ReadyBatch, ScreenshotBatcher};
use crate::db::Database;
use crate::extract::SceneExtractor;
use crate::llm::LlmClient;
use crate::models::{Action, RawSample, Scene};
use crate::notify::{ChangeNotifier, EntityKind, RecordChange};
use crate::settings::SettingsStore;
use crate::supervise::LlmGate;

/// How often the batch worker re-checks the batcher without a new arrival,
/// so the time trigger fires during input lulls.
const BATCHER_POLL_SECS: u64 = 5;

/// Everything wired together: explicit construction, no hidden globals. The
/// host hands samples in; the pipeline owns batching, extraction, the four
/// aggregators and their schedulers.
pub struct Pipeline {
    db: Database,
    settings: Arc<SettingsStore>,
    cache: Arc<FrameCache>,
    batcher: Arc<ScreenshotBatcher>,
    notifier: Arc<dyn ChangeNotifier>,
    scene_extractor: Arc<SceneExtractor>,
    events: Arc<EventAggregator>,
    todos: Arc<TodoAggregator>,
    knowledge: Arc<KnowledgeAggregator>,
    activities: Arc<ActivityAggregator>,
    pause_tx: watch::Sender<bool>,
    behavior_context: Arc<Mutex<Option<String>>>,
    batch_tx: Option<mpsc::UnboundedSender<ReadyBatch>>,
    worker: Option<JoinHandle<()>>,
    runners: Vec<AggregatorRunner>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub batcher: BatcherMetrics,
    pub events: StatsSnapshot,
    pub todos: StatsSnapshot,
    pub knowledge: StatsSnapshot,
    pub activities: StatsSnapshot,
}

impl Pipeline {
    pub fn new(
        db: Database,
        llm: Arc<dyn LlmClient>,
        settings: Arc<SettingsStore>,
        notifier: Arc<dyn ChangeNotifier>,
        spill_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let snapshot = settings.snapshot();
        let cache = Arc::new(FrameCache::new(snapshot.frame_cache_budget_bytes, spill_dir)?);
        let batcher = Arc::new(ScreenshotBatcher::new(
            BatcherConfig::from(&snapshot.batcher),
            cache.clone(),
        ));
        let scene_extractor = Arc::new(SceneExtractor::new(llm.clone(), settings.clone()));

        let events = Arc::new(EventAggregator::new(
            db.clone(),
            llm.clone(),
            settings.clone(),
            Arc::new(LlmGate::events(llm.clone(), settings.clone())),
            notifier.clone(),
        ));
        let todos = Arc::new(TodoAggregator::new(
            db.clone(),
            llm.clone(),
            settings.clone(),
            Arc::new(LlmGate::todos(llm.clone(), settings.clone())),
            notifier.clone(),
        ));
        let knowledge = Arc::new(KnowledgeAggregator::new(
            db.clone(),
            llm.clone(),
            settings.clone(),
            Arc::new(LlmGate::knowledge(llm.clone(), settings.clone())),
            notifier.clone(),
        ));
        let activities = Arc::new(ActivityAggregator::new(
            db.clone(),
            llm.clone(),
            settings.clone(),
            Arc::new(LlmGate::activities(llm.clone(), settings.clone())),
            notifier.clone(),
        ));

        let (pause_tx, _) = watch::channel(false);

        Ok(Self {
            db,
            settings,
            cache,
            batcher,
            notifier,
            scene_extractor,
            events,
            todos,
            knowledge,
            activities,
            pause_tx,
            behavior_context: Arc::new(Mutex::new(None)),
            batch_tx: None,
            worker: None,
            runners: Vec::new(),
        })
    }

    /// Spawns the batch worker and the four aggregator schedulers.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            warn!("pipeline already started");
            return;
        }

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        self.batch_tx = Some(batch_tx);
        self.worker = Some(tokio::spawn(batch_worker(
            batch_rx,
            self.batcher.clone(),
            self.scene_extractor.clone(),
            self.db.clone(),
            self.notifier.clone(),
            self.cache.clone(),
            self.behavior_context.clone(),
        )));

        let snapshot = self.settings.snapshot();
        self.runners = vec![
            spawn_runner(
                "event",
                snapshot.events.interval_secs,
                self.pause_tx.subscribe(),
                self.events.clone(),
                |agg| Box::pin(async move { agg.run_cycle().await }),
            ),
            spawn_runner(
                "todo",
                snapshot.todos.interval_secs,
                self.pause_tx.subscribe(),
                self.todos.clone(),
                |agg| Box::pin(async move { agg.run_cycle().await }),
            ),
            spawn_runner(
                "knowledge",
                snapshot.knowledge.interval_secs,
                self.pause_tx.subscribe(),
                self.knowledge.clone(),
                |agg| Box::pin(async move { agg.run_cycle().await }),
            ),
            spawn_runner(
                "activity",
                snapshot.activities.interval_secs,
                self.pause_tx.subscribe(),
                self.activities.clone(),
                |agg| Box::pin(async move { agg.run_cycle().await }),
            ),
        ];

        info!("pipeline started");
    }

    /// Hash and cache a PNG screenshot, then feed its sample to the batcher.
    /// Hashing is CPU-bound and runs on the blocking pool.
    pub async fn ingest_frame(&self, png_bytes: Vec<u8>, timestamp: DateTime<Utc>) -> Result<()> {
        let cache = self.cache.clone();
        let phash = tokio::task::spawn_blocking(move || cache.store(png_bytes))
            .await
            .context("frame hashing worker join failed")??;

        self.ingest_sample(RawSample::screenshot(timestamp, phash));
        Ok(())
    }

    /// Single entry point for pre-hashed samples and input-activity events.
    pub fn ingest_sample(&self, sample: RawSample) {
        if let Some(batch) = self.batcher.push_sample(sample) {
            self.dispatch(batch);
        }
    }

    pub fn ingest_keyboard(&self, timestamp: DateTime<Utc>, count: u32) {
        self.ingest_sample(RawSample::keyboard(timestamp, count));
    }

    pub fn ingest_mouse(&self, timestamp: DateTime<Utc>, count: u32) {
        self.ingest_sample(RawSample::mouse(timestamp, count));
    }

    /// Free-form hint (focus mode, meeting in progress) forwarded to scene
    /// extraction; applies from the next batch on.
    pub fn set_behavior_context(&self, context: Option<String>) {
        *self.behavior_context.lock().expect("behavior context lock") = context;
    }

    /// Skip aggregator ticks (system sleep); the tasks stay alive.
    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
        info!("pipeline paused");
    }

    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
        info!("pipeline resumed");
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            batcher: self.batcher.metrics(),
            events: self.events.stats.snapshot(),
            todos: self.todos.stats.snapshot(),
            knowledge: self.knowledge.stats.snapshot(),
            activities: self.activities.stats.snapshot(),
        }
    }

    /// Drains buffered samples into one final batch, lets the worker finish
    /// its queue, then stops every background task.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(batch) = self.batcher.flush() {
            self.dispatch(batch);
        }

        // Closing the channel lets the worker drain remaining batches and exit.
        self.batch_tx = None;
        if let Some(worker) = self.worker.take() {
            worker.await.context("batch worker failed to join")?;
        }

        for runner in &mut self.runners {
            runner.stop().await?;
        }
        self.runners.clear();

        info!("pipeline shut down");
        Ok(())
    }

    fn dispatch(&self, batch: ReadyBatch) {
        match &self.batch_tx {
            Some(tx) => {
                let generation = batch.generation;
                if tx.send(batch).is_err() {
                    error!("batch worker gone, dropping batch");
                    self.batcher.complete_batch(generation);
                }
            }
            None => {
                warn!("pipeline not started, dropping batch");
                self.batcher.complete_batch(batch.generation);
            }
        }
    }
}

fn spawn_runner<A>(
    name: &'static str,
    interval_secs: u64,
    pause_rx: watch::Receiver<bool>,
    aggregator: Arc<A>,
    cycle: fn(
        Arc<A>,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<crate::aggregate::CycleOutcome>> + Send>,
    >,
) -> AggregatorRunner
where
    A: Send + Sync + 'static + HasStats,
{
    AggregatorRunner::spawn(
        name,
        Duration::from_secs(interval_secs),
        pause_rx,
        move || {
            let aggregator = aggregator.clone();
            async move {
                let stats = aggregator.stats();
                match cycle(aggregator).await {
                    Ok(outcome) => {
                        stats.record_cycle(&outcome);
                        Ok(outcome)
                    }
                    Err(err) => {
                        stats.record_failure();
                        Err(err)
                    }
                }
            }
        },
    )
}

/// Lets the runner wrapper update counters without knowing the tier type.
pub trait HasStats {
    fn stats(&self) -> Arc<crate::aggregate::AggregatorStats>;
}

macro_rules! impl_has_stats {
    ($ty:ty) => {
        impl HasStats for $ty {
            fn stats(&self) -> Arc<crate::aggregate::AggregatorStats> {
                self.stats.clone()
            }
        }
    };
}

impl_has_stats!(EventAggregator);
impl_has_stats!(TodoAggregator);
impl_has_stats!(KnowledgeAggregator);
impl_has_stats!(ActivityAggregator);

/// Consumes ready batches sequentially: scenes out of the LLM, one action per
/// scene into the store, frames dropped from the cache, batch completed. Also
/// polls the batcher so the time trigger fires without fresh arrivals.
async fn batch_worker(
    mut batch_rx: mpsc::UnboundedReceiver<ReadyBatch>,
    batcher: Arc<ScreenshotBatcher>,
    scene_extractor: Arc<SceneExtractor>,
    db: Database,
    notifier: Arc<dyn ChangeNotifier>,
    cache: Arc<FrameCache>,
    behavior_context: Arc<Mutex<Option<String>>>,
) {
    let mut poll_ticker = tokio::time::interval(Duration::from_secs(BATCHER_POLL_SECS));
    poll_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_batch = batch_rx.recv() => {
                let Some(batch) = maybe_batch else {
                    info!("batch channel closed, worker exiting");
                    break;
                };
                let context = behavior_context.lock().expect("behavior context lock").clone();
                handle_batch(batch, context, &batcher, &scene_extractor, &db, &notifier, &cache)
                    .await;
            }
            _ = poll_ticker.tick() => {
                if let Some(batch) = batcher.poll() {
                    let context = behavior_context.lock().expect("behavior context lock").clone();
                    handle_batch(batch, context, &batcher, &scene_extractor, &db, &notifier, &cache)
                        .await;
                }
            }
        }
    }
}

async fn handle_batch(
    batch: ReadyBatch,
    behavior_context: Option<String>,
    batcher: &ScreenshotBatcher,
    scene_extractor: &SceneExtractor,
    db: &Database,
    notifier: &Arc<dyn ChangeNotifier>,
    cache: &FrameCache,
) {
    let scenes = scene_extractor
        .extract(&batch.frames, &batch.input_samples, behavior_context.as_deref())
        .await;

    for scene in &scenes {
        let action = action_from_scene(scene);
        match db.upsert_action(&action).await {
            Ok(()) => {
                notifier.notify(RecordChange::created(EntityKind::Action, action.id.clone()));
            }
            Err(err) => warn!("failed to persist action from scene: {err:?}"),
        }
    }

    for frame in &batch.frames {
        cache.discard(&frame.phash);
    }

    batcher.complete_batch(batch.generation);
}

fn action_from_scene(scene: &Scene) -> Action {
    let title = if scene.inferred_activity.trim().is_empty() {
        "Unrecognized activity".to_string()
    } else {
        scene.inferred_activity.clone()
    };

    let mut description = scene.visual_summary.clone();
    if !scene.focus_areas.is_empty() {
        description.push_str(" Focus: ");
        description.push_str(&scene.focus_areas.join(", "));
    }

    Action::new(
        title,
        description,
        scene.timestamp,
        scene.timestamp,
        vec![scene.screenshot_phash.clone()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ContentPart, MessageContent, MockLlm};
    use crate::notify::LogNotifier;
    use crate::settings::{PipelineSettings, SettingsStore};
    use chrono::Duration as ChronoDuration;

    fn test_settings() -> PipelineSettings {
        let mut settings = PipelineSettings::default();
        settings.batcher.count_threshold = 2;
        settings
    }

    #[tokio::test]
    async fn batch_flows_to_persisted_actions() {
        let _ = env_logger::builder().is_test(true).try_init();
        let db = Database::in_memory().unwrap();
        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"[
                {"screenshot_index": 0, "visual_summary": "terminal with tests",
                 "inferred_activity": "running tests", "focus_areas": ["test output"]},
                {"screenshot_index": 1, "visual_summary": "editor",
                 "inferred_activity": "editing code"}
            ]"#,
        );

        let settings = Arc::new(SettingsStore::ephemeral(test_settings()));
        let mut pipeline = Pipeline::new(
            db.clone(),
            llm,
            settings,
            Arc::new(LogNotifier),
            None,
        )
        .unwrap();
        pipeline.start();

        let now = Utc::now();
        pipeline.cache.store_keyed("h0".into(), vec![1; 8]);
        pipeline.cache.store_keyed("h1".into(), vec![2; 8]);
        pipeline.ingest_sample(RawSample::screenshot(now - ChronoDuration::seconds(5), "h0"));
        pipeline.ingest_sample(RawSample::screenshot(now, "h1"));

        pipeline.shutdown().await.unwrap();

        let actions = db
            .get_actions_in_timeframe(now - ChronoDuration::hours(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].title, "running tests");
        assert!(actions[0].description.contains("Focus: test output"));
        assert_eq!(actions[0].source_ids, vec!["h0".to_string()]);

        // Extracted frames are gone from the cache.
        assert!(pipeline.cache.lookup("h0").is_none());
        assert_eq!(pipeline.stats().batcher.batches_emitted, 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_partial_buffers() {
        let db = Database::in_memory().unwrap();
        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"[{"screenshot_index": 0, "visual_summary": "mail client",
                 "inferred_activity": "reading email"}]"#,
        );

        let settings = Arc::new(SettingsStore::ephemeral(PipelineSettings::default()));
        let mut pipeline = Pipeline::new(
            db.clone(),
            llm,
            settings,
            Arc::new(LogNotifier),
            None,
        )
        .unwrap();
        pipeline.start();

        let now = Utc::now();
        pipeline.cache.store_keyed("h0".into(), vec![3; 8]);
        // One sample: below the count threshold, no trigger fires.
        pipeline.ingest_sample(RawSample::screenshot(now, "h0"));

        pipeline.shutdown().await.unwrap();

        let actions = db
            .get_actions_in_timeframe(now - ChronoDuration::hours(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].title, "reading email");
    }

    #[tokio::test]
    async fn behavior_context_reaches_the_extraction_prompt() {
        let db = Database::in_memory().unwrap();
        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"[{"screenshot_index": 0, "visual_summary": "ide",
                 "inferred_activity": "coding"}]"#,
        );

        let settings = Arc::new(SettingsStore::ephemeral(test_settings()));
        let mut pipeline = Pipeline::new(
            db,
            llm.clone(),
            settings,
            Arc::new(LogNotifier),
            None,
        )
        .unwrap();
        pipeline.start();
        pipeline.set_behavior_context(Some("deep-focus session".into()));

        let now = Utc::now();
        pipeline.cache.store_keyed("h0".into(), vec![1; 8]);
        pipeline.cache.store_keyed("h1".into(), vec![2; 8]);
        pipeline.ingest_sample(RawSample::screenshot(now, "h0"));
        pipeline.ingest_sample(RawSample::screenshot(now, "h1"));

        pipeline.shutdown().await.unwrap();

        let calls = llm.calls();
        assert!(!calls.is_empty());
        let prompt = match &calls[0].messages[1].content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::Text(text) => text.clone(),
                ContentPart::PngImage(_) => String::new(),
            },
            MessageContent::Text(text) => text.clone(),
        };
        assert!(prompt.contains("deep-focus session"));
    }
}
