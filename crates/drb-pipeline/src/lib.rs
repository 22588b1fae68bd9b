//! Pipeline orchestration: research capture, filtering, enhancement,
//! publication, podcast compilation, and voicing.
//!
//! One run walks the stages sequentially; within the filter stage,
//! articles are classified one at a time so external-API load stays
//! bounded and "first match wins" stays deterministic when a batch
//! contains near-duplicates of itself.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use drb_adapters::{
    ArticleSource, RelevanceClassifier, SimilarityCandidate, SimilarityClassifier, StoryEnhancer,
    TranscriptComposer, VoiceSynthesizer,
};
use drb_core::{
    Article, PodcastTranscript, ResearchSnapshot, Story, StoryInput, StoryPatch, StoryRef,
};
use drb_storage::{
    DateRangeQuery, KvBackend, PodcastStore, ResearchStore, StoreError, StoryStore,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "drb-pipeline";

/// Tunable policy for one deployment. Everything here is overridable from
/// the environment; the thresholds are policy constants, not magic values
/// buried in the engine.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Articles are rejected when relevance confidence falls below this.
    pub relevance_threshold: f64,
    /// Articles are rejected when flagged similar with confidence above this.
    pub similarity_threshold: f64,
    /// How many days of published stories feed the similarity corpus.
    pub corpus_window_days: u32,
    /// Hard cap on the similarity corpus, applied after the day window.
    pub corpus_max_stories: usize,
    /// How many days of published stories one episode covers.
    pub podcast_window_days: u32,
    pub show_name: String,
    pub scheduler_enabled: bool,
    pub run_cron_morning: String,
    pub run_cron_evening: String,
    /// Width of the research cleanup sweep beyond the retention boundary.
    pub research_cleanup_scan_days: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: 0.6,
            similarity_threshold: 0.6,
            corpus_window_days: 7,
            corpus_max_stories: 50,
            podcast_window_days: 1,
            show_name: "Daily Research Brief".to_string(),
            scheduler_enabled: false,
            run_cron_morning: "0 0 6 * * *".to_string(),
            run_cron_evening: "0 0 18 * * *".to_string(),
            research_cleanup_scan_days: 30,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            relevance_threshold: env_parse("DRB_RELEVANCE_THRESHOLD", defaults.relevance_threshold),
            similarity_threshold: env_parse(
                "DRB_SIMILARITY_THRESHOLD",
                defaults.similarity_threshold,
            ),
            corpus_window_days: env_parse("DRB_CORPUS_WINDOW_DAYS", defaults.corpus_window_days),
            corpus_max_stories: env_parse("DRB_CORPUS_MAX_STORIES", defaults.corpus_max_stories),
            podcast_window_days: env_parse("DRB_PODCAST_WINDOW_DAYS", defaults.podcast_window_days),
            show_name: std::env::var("DRB_SHOW_NAME").unwrap_or(defaults.show_name),
            scheduler_enabled: std::env::var("DRB_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            run_cron_morning: std::env::var("DRB_RUN_CRON_1").unwrap_or(defaults.run_cron_morning),
            run_cron_evening: std::env::var("DRB_RUN_CRON_2").unwrap_or(defaults.run_cron_evening),
            research_cleanup_scan_days: env_parse(
                "DRB_CLEANUP_SCAN_DAYS",
                defaults.research_cleanup_scan_days,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Why each article in a batch ended up in or out of the story corpus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterSummary {
    pub considered: usize,
    pub accepted: usize,
    pub known_link: usize,
    pub irrelevant: usize,
    pub duplicate: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub accepted: Vec<Story>,
    pub summary: FilterSummary,
}

/// Turns a batch of raw articles into new story records. Rejections:
/// already known by link, off-topic, or duplicate of recent published
/// coverage. A classifier failure skips that article and never aborts the
/// batch; retries belong to the collaborator's transport layer.
pub struct FilterEngine<'a> {
    store: &'a StoryStore,
    relevance: &'a dyn RelevanceClassifier,
    similarity: &'a dyn SimilarityClassifier,
    config: &'a PipelineConfig,
}

impl<'a> FilterEngine<'a> {
    pub fn new(
        store: &'a StoryStore,
        relevance: &'a dyn RelevanceClassifier,
        similarity: &'a dyn SimilarityClassifier,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            store,
            relevance,
            similarity,
            config,
        }
    }

    /// Fetched once per batch, not per article.
    async fn published_corpus(&self, now: DateTime<Utc>) -> Result<Vec<Story>, StoreError> {
        let today = now.date_naive();
        let start = today - Duration::days(i64::from(self.config.corpus_window_days) - 1);
        self.store
            .query_by_date_range(
                start,
                today,
                DateRangeQuery {
                    published_only: true,
                    limit: Some(self.config.corpus_max_stories),
                    ..DateRangeQuery::default()
                },
            )
            .await
    }

    pub async fn run(&self, articles: &[Article]) -> Result<FilterOutcome> {
        let corpus = self.published_corpus(Utc::now()).await?;
        let candidates: Vec<SimilarityCandidate> =
            corpus.iter().map(SimilarityCandidate::from).collect();

        let mut outcome = FilterOutcome::default();
        outcome.summary.considered = articles.len();

        for article in articles {
            if self.store.exists(&article.link).await? {
                outcome.summary.known_link += 1;
                continue;
            }

            let relevance = match self
                .relevance
                .classify(&article.headline, &article.summary)
                .await
            {
                Ok(verdict) => verdict,
                Err(err) => {
                    warn!(link = %article.link, %err, "relevance call failed; skipping article");
                    outcome.summary.failed += 1;
                    continue;
                }
            };
            if !relevance.is_relevant || relevance.confidence < self.config.relevance_threshold {
                outcome.summary.irrelevant += 1;
                continue;
            }

            let similarity = match self.similarity.classify(article, &candidates).await {
                Ok(verdict) => verdict,
                Err(err) => {
                    warn!(link = %article.link, %err, "similarity call failed; skipping article");
                    outcome.summary.failed += 1;
                    continue;
                }
            };
            if similarity.is_similar && similarity.confidence > self.config.similarity_threshold {
                outcome.summary.duplicate += 1;
                continue;
            }

            match self.store.add(StoryInput::from(article)).await {
                Ok(_) => {}
                Err(StoreError::DuplicateLink(_)) => {
                    // Lost the race against another writer; already handled.
                    outcome.summary.known_link += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            let story = self.store.get_by_link(&article.link).await?;
            outcome.accepted.push(story);
            outcome.summary.accepted += 1;
        }

        Ok(outcome)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PodcastStageOutcome {
    pub date: String,
    pub created: bool,
    pub stories_covered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VoiceStageOutcome {
    Attached { audio_url: String },
    AlreadyVoiced,
    NoTranscript,
    NoSynthesizer,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub articles_captured: usize,
    pub filter: FilterSummary,
    pub enhanced: usize,
    pub enhance_failures: usize,
    pub published: usize,
    pub podcast: Option<PodcastStageOutcome>,
    pub voice: VoiceStageOutcome,
}

/// External services, grouped so a pipeline can be wired for production
/// (remote clients) or offline runs (fixtures + local classifiers) in one
/// place. Voicing is optional; everything else is required.
pub struct Collaborators {
    pub source: Box<dyn ArticleSource>,
    pub relevance: Box<dyn RelevanceClassifier>,
    pub similarity: Box<dyn SimilarityClassifier>,
    pub enhancer: Box<dyn StoryEnhancer>,
    pub composer: Box<dyn TranscriptComposer>,
    pub voice: Option<Box<dyn VoiceSynthesizer>>,
}

pub struct Pipeline {
    config: PipelineConfig,
    stories: StoryStore,
    research: ResearchStore,
    podcasts: PodcastStore,
    collaborators: Collaborators,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        backend: Arc<dyn KvBackend>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            config,
            stories: StoryStore::new(backend.clone()),
            research: ResearchStore::new(backend.clone()),
            podcasts: PodcastStore::new(backend),
            collaborators,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stories(&self) -> &StoryStore {
        &self.stories
    }

    pub fn podcasts(&self) -> &PodcastStore {
        &self.podcasts
    }

    /// Capture today's batch from the article source into the research
    /// cache. Returns how many articles were captured.
    pub async fn run_research(&self) -> Result<usize> {
        let articles = self
            .collaborators
            .source
            .fetch_batch()
            .await
            .context("fetching research batch")?;
        let snapshot = ResearchSnapshot {
            last_updated: Utc::now(),
            source: self.collaborators.source.source_id().to_string(),
            articles,
        };
        let count = snapshot.articles.len();
        self.research
            .put_snapshot(Utc::now().date_naive(), &snapshot)
            .await
            .context("storing research snapshot")?;
        info!(count, "captured research batch");
        Ok(count)
    }

    /// Run the filter over today's research snapshot. A missing snapshot
    /// is an empty result, not an error.
    pub async fn run_filter(&self) -> Result<FilterOutcome> {
        let today = Utc::now().date_naive();
        let Some(snapshot) = self
            .research
            .snapshot(today)
            .await
            .context("loading research snapshot")?
        else {
            info!("no research snapshot for today; nothing to filter");
            return Ok(FilterOutcome::default());
        };

        let engine = FilterEngine::new(
            &self.stories,
            &*self.collaborators.relevance,
            &*self.collaborators.similarity,
            &self.config,
        );
        let outcome = engine.run(&snapshot.articles).await?;
        info!(
            accepted = outcome.summary.accepted,
            known_link = outcome.summary.known_link,
            irrelevant = outcome.summary.irrelevant,
            duplicate = outcome.summary.duplicate,
            failed = outcome.summary.failed,
            "filter stage complete"
        );
        Ok(outcome)
    }

    /// Enhance every story still waiting for it. Per-story failures are
    /// logged and counted, never fatal to the stage.
    pub async fn run_enhance(&self) -> Result<(usize, usize)> {
        let pending = self.stories.unedited_unpublished().await?;
        let mut enhanced = 0;
        let mut failures = 0;
        for story in pending {
            match self.collaborators.enhancer.enhance(&story).await {
                Ok(enhancement) => {
                    let patch = StoryPatch {
                        headline: Some(enhancement.headline),
                        summary: Some(enhancement.summary),
                        body: Some(enhancement.body),
                        tags: Some(enhancement.tags),
                        images: (!enhancement.images.is_empty()).then_some(enhancement.images),
                    };
                    self.stories.mark_edited(&story.link, patch).await?;
                    enhanced += 1;
                }
                Err(err) => {
                    warn!(link = %story.link, %err, "enhancement failed; story stays unedited");
                    failures += 1;
                }
            }
        }
        Ok((enhanced, failures))
    }

    /// Publish everything that has been enhanced. Publication is
    /// idempotent in the store, so re-running this stage is harmless.
    pub async fn run_publish(&self) -> Result<usize> {
        let ready = self.stories.edited_unpublished().await?;
        let count = ready.len();
        for story in ready {
            self.stories.mark_published(&story.link).await?;
        }
        Ok(count)
    }

    /// Compile today's episode from recently published stories. With an
    /// existing transcript and `override_existing == false`, the stored
    /// transcript is returned untouched.
    pub async fn run_podcast(&self, override_existing: bool) -> Result<PodcastStageOutcome> {
        let today = Utc::now().date_naive();
        if let Some(existing) = self.podcasts.get(today).await? {
            if !override_existing {
                return Ok(PodcastStageOutcome {
                    date: drb_core::date_key(today),
                    created: false,
                    stories_covered: existing.stories.len(),
                });
            }
        }

        let start = today - Duration::days(i64::from(self.config.podcast_window_days) - 1);
        let stories = self
            .stories
            .query_by_date_range(
                start,
                today,
                DateRangeQuery {
                    published_only: true,
                    ..DateRangeQuery::default()
                },
            )
            .await?;
        if stories.is_empty() {
            info!("no published stories in the window; skipping episode");
            return Ok(PodcastStageOutcome {
                date: drb_core::date_key(today),
                created: false,
                stories_covered: 0,
            });
        }

        let script = self
            .collaborators
            .composer
            .compose(&stories)
            .await
            .context("composing transcript")?;
        let transcript = PodcastTranscript {
            intro: script.intro,
            segments: script.segments,
            outro: script.outro,
            stories: stories.iter().map(StoryRef::from).collect(),
            date_created: Utc::now(),
            audio_url: None,
        };
        self.podcasts.put(today, &transcript).await?;
        Ok(PodcastStageOutcome {
            date: drb_core::date_key(today),
            created: true,
            stories_covered: transcript.stories.len(),
        })
    }

    /// Voice today's transcript if a synthesizer is configured and the
    /// transcript has no audio yet.
    pub async fn run_voice(&self) -> Result<VoiceStageOutcome> {
        let Some(voice) = &self.collaborators.voice else {
            return Ok(VoiceStageOutcome::NoSynthesizer);
        };
        let today = Utc::now().date_naive();
        let Some(transcript) = self.podcasts.get(today).await? else {
            return Ok(VoiceStageOutcome::NoTranscript);
        };
        if transcript.audio_url.is_some() {
            return Ok(VoiceStageOutcome::AlreadyVoiced);
        }

        let audio_url = voice
            .synthesize(&transcript.spoken_text())
            .await
            .context("synthesizing episode audio")?;
        self.podcasts.attach_audio_url(today, &audio_url).await?;
        Ok(VoiceStageOutcome::Attached { audio_url })
    }

    /// One full sequential pass over every stage.
    pub async fn run_once(&self, override_podcast: bool) -> Result<PipelineRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "pipeline run starting");

        let articles_captured = self.run_research().await?;
        let filter = self.run_filter().await?.summary;
        let (enhanced, enhance_failures) = self.run_enhance().await?;
        let published = self.run_publish().await?;
        let podcast = Some(self.run_podcast(override_podcast).await?);
        let voice = self.run_voice().await?;

        let summary = PipelineRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            articles_captured,
            filter,
            enhanced,
            enhance_failures,
            published,
            podcast,
            voice,
        };
        info!(%run_id, published = summary.published, "pipeline run finished");
        Ok(summary)
    }

    /// Manual maintenance: delete research snapshots past retention.
    pub async fn run_research_cleanup(&self) -> Result<usize> {
        let removed = self
            .research
            .cleanup(
                Utc::now().date_naive(),
                self.config.research_cleanup_scan_days,
            )
            .await?;
        info!(removed, "research cleanup complete");
        Ok(removed)
    }
}

/// Cron-driven full runs. Disabled unless the config opts in.
pub async fn build_scheduler(pipeline: Arc<Pipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let crons = [
        pipeline.config().run_cron_morning.clone(),
        pipeline.config().run_cron_evening.clone(),
    ];
    let mut seen = HashSet::new();
    for cron in crons {
        if !seen.insert(cron.clone()) {
            continue;
        }
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once(false).await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled run complete"),
                    Err(err) => warn!(%err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        scheduler.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(scheduler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use drb_adapters::{
        AdapterError, ComposedScript, Enhancement, RelevanceVerdict, SimilarityVerdict,
        TemplateComposer,
    };
    use drb_storage::MemoryKv;
    use std::collections::HashMap;

    fn article(link: &str, headline: &str) -> Article {
        Article {
            headline: headline.to_string(),
            summary: format!("{headline} summary"),
            link: link.to_string(),
            source: "research-wire".to_string(),
            date_found: Utc::now(),
            content: None,
            images: Vec::new(),
            date_posted: None,
            body: None,
        }
    }

    /// Relevance verdicts scripted per headline; unknown headlines fail
    /// like a broken service call.
    struct ScriptedRelevance(HashMap<String, RelevanceVerdict>);

    impl ScriptedRelevance {
        fn new(entries: &[(&str, bool, f64)]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|(headline, is_relevant, confidence)| {
                        (
                            headline.to_string(),
                            RelevanceVerdict {
                                is_relevant: *is_relevant,
                                confidence: *confidence,
                                reason: "scripted".to_string(),
                            },
                        )
                    })
                    .collect(),
            )
        }
    }

    #[async_trait]
    impl RelevanceClassifier for ScriptedRelevance {
        async fn classify(
            &self,
            headline: &str,
            _summary: &str,
        ) -> Result<RelevanceVerdict, AdapterError> {
            self.0
                .get(headline)
                .cloned()
                .ok_or_else(|| AdapterError::Message(format!("no script for {headline}")))
        }
    }

    /// Similarity verdicts scripted per headline; anything unscripted is
    /// judged fresh.
    struct ScriptedSimilarity(HashMap<String, SimilarityVerdict>);

    impl ScriptedSimilarity {
        fn fresh() -> Self {
            Self(HashMap::new())
        }

        fn with(mut self, headline: &str, is_similar: bool, confidence: f64) -> Self {
            self.0.insert(
                headline.to_string(),
                SimilarityVerdict {
                    is_similar,
                    confidence,
                    similar_to_index: is_similar.then_some(0),
                    reason: "scripted".to_string(),
                },
            );
            self
        }
    }

    #[async_trait]
    impl SimilarityClassifier for ScriptedSimilarity {
        async fn classify(
            &self,
            article: &Article,
            _candidates: &[SimilarityCandidate],
        ) -> Result<SimilarityVerdict, AdapterError> {
            Ok(self.0.get(&article.headline).cloned().unwrap_or(SimilarityVerdict {
                is_similar: false,
                confidence: 0.1,
                similar_to_index: None,
                reason: "scripted fresh".to_string(),
            }))
        }
    }

    struct StaticSource(Vec<Article>);

    #[async_trait]
    impl ArticleSource for StaticSource {
        fn source_id(&self) -> &str {
            "research-wire"
        }

        async fn fetch_batch(&self) -> Result<Vec<Article>, AdapterError> {
            Ok(self.0.clone())
        }
    }

    struct EchoEnhancer;

    #[async_trait]
    impl StoryEnhancer for EchoEnhancer {
        async fn enhance(&self, story: &Story) -> Result<Enhancement, AdapterError> {
            Ok(Enhancement {
                headline: story.headline.clone(),
                summary: story.summary.clone(),
                body: format!("{} — full write-up.", story.summary),
                tags: vec!["research".to_string()],
                reason: "echo".to_string(),
                images: Vec::new(),
            })
        }
    }

    struct StaticVoice;

    #[async_trait]
    impl VoiceSynthesizer for StaticVoice {
        async fn synthesize(&self, _text: &str) -> Result<String, AdapterError> {
            Ok("https://audio.example/episode.mp3".to_string())
        }
    }

    struct FailingComposer;

    #[async_trait]
    impl TranscriptComposer for FailingComposer {
        async fn compose(&self, _stories: &[Story]) -> Result<ComposedScript, AdapterError> {
            Err(AdapterError::Message("composer offline".to_string()))
        }
    }

    fn store() -> StoryStore {
        StoryStore::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn relevance_threshold_is_reject_below() {
        let store = store();
        let config = PipelineConfig::default();
        let relevance = ScriptedRelevance::new(&[
            ("At threshold", true, 0.6),
            ("Below threshold", true, 0.59),
        ]);
        let similarity = ScriptedSimilarity::fresh();
        let engine = FilterEngine::new(&store, &relevance, &similarity, &config);

        let outcome = engine
            .run(&[
                article("https://ex.org/at", "At threshold"),
                article("https://ex.org/below", "Below threshold"),
            ])
            .await
            .unwrap();

        assert_eq!(outcome.summary.accepted, 1);
        assert_eq!(outcome.summary.irrelevant, 1);
        assert_eq!(outcome.accepted[0].link, "https://ex.org/at");
    }

    #[tokio::test]
    async fn similarity_threshold_is_reject_above() {
        let store = store();
        let config = PipelineConfig::default();
        let relevance = ScriptedRelevance::new(&[
            ("Borderline dup", true, 0.9),
            ("Clear dup", true, 0.9),
        ]);
        let similarity = ScriptedSimilarity::fresh()
            .with("Borderline dup", true, 0.6)
            .with("Clear dup", true, 0.61);
        let engine = FilterEngine::new(&store, &relevance, &similarity, &config);

        let outcome = engine
            .run(&[
                article("https://ex.org/borderline", "Borderline dup"),
                article("https://ex.org/clear", "Clear dup"),
            ])
            .await
            .unwrap();

        // Exactly 0.6 is not "above"; 0.61 is.
        assert_eq!(outcome.summary.accepted, 1);
        assert_eq!(outcome.summary.duplicate, 1);
        assert_eq!(outcome.accepted[0].link, "https://ex.org/borderline");
    }

    #[tokio::test]
    async fn batch_of_three_keeps_only_the_fresh_relevant_article() {
        let store = store();
        let config = PipelineConfig::default();
        store
            .add(StoryInput::from(&article("https://ex.org/a", "Already known")))
            .await
            .unwrap();

        let relevance = ScriptedRelevance::new(&[
            ("Fresh and strong", true, 0.9),
            ("Weak relevance", true, 0.3),
        ]);
        let similarity = ScriptedSimilarity::fresh();
        let engine = FilterEngine::new(&store, &relevance, &similarity, &config);

        let outcome = engine
            .run(&[
                article("https://ex.org/a", "Already known"),
                article("https://ex.org/b", "Fresh and strong"),
                article("https://ex.org/c", "Weak relevance"),
            ])
            .await
            .unwrap();

        assert_eq!(outcome.summary.considered, 3);
        assert_eq!(outcome.summary.known_link, 1);
        assert_eq!(outcome.summary.irrelevant, 1);
        assert_eq!(outcome.summary.accepted, 1);

        let story = store.get_by_link("https://ex.org/b").await.unwrap();
        assert!(!story.published);
        assert!(!story.edited);
        assert_eq!(outcome.accepted[0].id, story.id);
    }

    #[tokio::test]
    async fn classifier_failure_skips_the_article_not_the_batch() {
        let store = store();
        let config = PipelineConfig::default();
        // "No script" headline makes the relevance call fail.
        let relevance = ScriptedRelevance::new(&[("Works fine", true, 0.8)]);
        let similarity = ScriptedSimilarity::fresh();
        let engine = FilterEngine::new(&store, &relevance, &similarity, &config);

        let outcome = engine
            .run(&[
                article("https://ex.org/broken", "No script"),
                article("https://ex.org/fine", "Works fine"),
            ])
            .await
            .unwrap();

        assert_eq!(outcome.summary.failed, 1);
        assert_eq!(outcome.summary.accepted, 1);
        assert!(store.exists("https://ex.org/fine").await.unwrap());
        assert!(!store.exists("https://ex.org/broken").await.unwrap());
    }

    fn full_pipeline(backend: Arc<MemoryKv>, articles: Vec<Article>) -> Pipeline {
        let relevance = ScriptedRelevance::new(
            &articles
                .iter()
                .map(|a| (a.headline.as_str(), true, 0.9))
                .collect::<Vec<_>>(),
        );
        Pipeline::new(
            PipelineConfig::default(),
            backend,
            Collaborators {
                source: Box::new(StaticSource(articles)),
                relevance: Box::new(relevance),
                similarity: Box::new(ScriptedSimilarity::fresh()),
                enhancer: Box::new(EchoEnhancer),
                composer: Box::new(TemplateComposer::new("Daily Research Brief")),
                voice: Some(Box::new(StaticVoice)),
            },
        )
    }

    #[tokio::test]
    async fn full_run_reaches_a_voiced_episode() {
        let backend = Arc::new(MemoryKv::new());
        let pipeline = full_pipeline(
            backend,
            vec![
                article("https://ex.org/a", "Alpha result"),
                article("https://ex.org/b", "Beta result"),
            ],
        );

        let summary = pipeline.run_once(false).await.unwrap();
        assert_eq!(summary.articles_captured, 2);
        assert_eq!(summary.filter.accepted, 2);
        assert_eq!(summary.enhanced, 2);
        assert_eq!(summary.published, 2);
        assert_eq!(summary.podcast.as_ref().unwrap().stories_covered, 2);
        assert!(matches!(summary.voice, VoiceStageOutcome::Attached { .. }));

        let story = pipeline.stories().get_by_link("https://ex.org/a").await.unwrap();
        assert!(story.edited);
        assert!(story.published);
        assert!(story.date_published.is_some());

        let transcript = pipeline
            .podcasts()
            .get(Utc::now().date_naive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transcript.stories.len(), 2);
        assert!(transcript.audio_url.is_some());
    }

    #[tokio::test]
    async fn second_run_is_idempotent_end_to_end() {
        let backend = Arc::new(MemoryKv::new());
        let pipeline = full_pipeline(backend, vec![article("https://ex.org/a", "Alpha result")]);

        let first = pipeline.run_once(false).await.unwrap();
        assert_eq!(first.filter.accepted, 1);
        let stamped = pipeline
            .stories()
            .get_by_link("https://ex.org/a")
            .await
            .unwrap()
            .date_published;

        let second = pipeline.run_once(false).await.unwrap();
        assert_eq!(second.filter.known_link, 1);
        assert_eq!(second.filter.accepted, 0);
        assert!(!second.podcast.as_ref().unwrap().created);
        assert_eq!(second.voice, VoiceStageOutcome::AlreadyVoiced);
        assert_eq!(
            pipeline
                .stories()
                .get_by_link("https://ex.org/a")
                .await
                .unwrap()
                .date_published,
            stamped
        );
    }

    #[tokio::test]
    async fn podcast_override_regenerates_for_the_same_date() {
        let backend = Arc::new(MemoryKv::new());
        let pipeline = full_pipeline(
            backend,
            vec![
                article("https://ex.org/a", "Alpha result"),
                article("https://ex.org/b", "Beta result"),
            ],
        );
        pipeline.run_once(false).await.unwrap();

        let kept = pipeline.run_podcast(false).await.unwrap();
        assert!(!kept.created);

        let regenerated = pipeline.run_podcast(true).await.unwrap();
        assert!(regenerated.created);
        assert_eq!(regenerated.stories_covered, 2);

        // Regeneration replaces the transcript, which also drops the old
        // audio attachment until the voice stage runs again.
        let transcript = pipeline
            .podcasts()
            .get(Utc::now().date_naive())
            .await
            .unwrap()
            .unwrap();
        assert!(transcript.audio_url.is_none());
    }

    #[tokio::test]
    async fn podcast_with_no_published_stories_is_an_empty_success() {
        let backend = Arc::new(MemoryKv::new());
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            backend,
            Collaborators {
                source: Box::new(StaticSource(Vec::new())),
                relevance: Box::new(ScriptedRelevance::new(&[])),
                similarity: Box::new(ScriptedSimilarity::fresh()),
                enhancer: Box::new(EchoEnhancer),
                composer: Box::new(FailingComposer),
                voice: None,
            },
        );

        let outcome = pipeline.run_podcast(false).await.unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.stories_covered, 0);

        let voice = pipeline.run_voice().await.unwrap();
        assert_eq!(voice, VoiceStageOutcome::NoSynthesizer);
    }
}
