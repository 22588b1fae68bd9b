//! Collaborator contracts + fixture-first local implementations.
//!
//! The pipeline consumes every external service through a trait seam:
//! article sourcing, relevance and similarity classification, story
//! enhancement, transcript composition, and voice synthesis. Local
//! implementations (keyword rules, string similarity, templates, JSON
//! fixtures) keep the whole pipeline runnable offline; the `remote` module
//! speaks JSON over HTTP to the hosted service.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drb_core::{Article, Story, TranscriptSegment};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;

pub const CRATE_NAME: &str = "drb-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("malformed response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

/// Topical-fit judgment for a single article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceVerdict {
    pub is_relevant: bool,
    pub confidence: f64,
    pub reason: String,
}

/// Duplicate-coverage judgment against a corpus of published stories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityVerdict {
    pub is_similar: bool,
    pub confidence: f64,
    #[serde(default)]
    pub similar_to_index: Option<usize>,
    pub reason: String,
}

/// Corpus entry handed to the similarity classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityCandidate {
    pub headline: String,
    pub summary: String,
    #[serde(default)]
    pub date_published: Option<DateTime<Utc>>,
}

impl From<&Story> for SimilarityCandidate {
    fn from(story: &Story) -> Self {
        Self {
            headline: story.headline.clone(),
            summary: story.summary.clone(),
            date_published: story.date_published,
        }
    }
}

/// Enhancement output for one story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enhancement {
    pub headline: String,
    pub summary: String,
    pub body: String,
    pub tags: Vec<String>,
    pub reason: String,
    #[serde(default)]
    pub images: Vec<String>,
}

/// Script parts for one episode; the caller attaches the story snapshots
/// and creation date when persisting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedScript {
    pub intro: String,
    pub segments: Vec<TranscriptSegment>,
    pub outro: String,
}

#[async_trait]
pub trait ArticleSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_batch(&self) -> Result<Vec<Article>, AdapterError>;
}

#[async_trait]
pub trait RelevanceClassifier: Send + Sync {
    async fn classify(
        &self,
        headline: &str,
        summary: &str,
    ) -> Result<RelevanceVerdict, AdapterError>;
}

#[async_trait]
pub trait SimilarityClassifier: Send + Sync {
    async fn classify(
        &self,
        article: &Article,
        candidates: &[SimilarityCandidate],
    ) -> Result<SimilarityVerdict, AdapterError>;
}

#[async_trait]
pub trait StoryEnhancer: Send + Sync {
    async fn enhance(&self, story: &Story) -> Result<Enhancement, AdapterError>;
}

#[async_trait]
pub trait TranscriptComposer: Send + Sync {
    async fn compose(&self, stories: &[Story]) -> Result<ComposedScript, AdapterError>;
}

#[async_trait]
pub trait VoiceSynthesizer: Send + Sync {
    /// Returns the hosted audio URL for the rendered transcript text.
    async fn synthesize(&self, text: &str) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone, Deserialize)]
struct TopicRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    topics: Vec<TopicRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct TopicRule {
    topic: String,
    contains_any: Vec<String>,
}

/// Keyword-rule relevance classifier driven by `topics.yaml`. Confidence
/// grows with the number of distinct topics matched, capped below 1.0 so
/// the verdict never claims certainty.
pub struct KeywordRelevance {
    topics: Vec<TopicRule>,
}

impl KeywordRelevance {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let parsed: TopicRulesFile = serde_yaml::from_str(yaml).context("parsing topic rules")?;
        Ok(Self {
            topics: parsed.topics,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("reading topic rules {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }

    fn matched_topics(&self, text: &str) -> Vec<&str> {
        let lower = text.to_ascii_lowercase();
        self.topics
            .iter()
            .filter(|rule| {
                rule.contains_any
                    .iter()
                    .any(|needle| lower.contains(&needle.to_ascii_lowercase()))
            })
            .map(|rule| rule.topic.as_str())
            .collect()
    }
}

#[async_trait]
impl RelevanceClassifier for KeywordRelevance {
    async fn classify(
        &self,
        headline: &str,
        summary: &str,
    ) -> Result<RelevanceVerdict, AdapterError> {
        let combined = format!("{headline} {summary}");
        let matched = self.matched_topics(&combined);
        if matched.is_empty() {
            return Ok(RelevanceVerdict {
                is_relevant: false,
                confidence: 0.9,
                reason: "no tracked topic keywords present".to_string(),
            });
        }
        let confidence = (0.5 + 0.2 * matched.len() as f64).min(0.95);
        Ok(RelevanceVerdict {
            is_relevant: true,
            confidence,
            reason: format!("matched topics: {}", matched.join(", ")),
        })
    }
}

/// String-similarity classifier over headline + summary. A cheap stand-in
/// for the hosted classifier with the same verdict shape.
pub struct JaroWinklerSimilarity {
    /// Score at or above which two stories count as the same coverage.
    pub match_threshold: f64,
}

impl Default for JaroWinklerSimilarity {
    fn default() -> Self {
        Self {
            match_threshold: 0.9,
        }
    }
}

impl JaroWinklerSimilarity {
    fn score(article: &Article, candidate: &SimilarityCandidate) -> f64 {
        let headline = jaro_winkler(
            &article.headline.to_ascii_lowercase(),
            &candidate.headline.to_ascii_lowercase(),
        );
        let summary = jaro_winkler(
            &article.summary.to_ascii_lowercase(),
            &candidate.summary.to_ascii_lowercase(),
        );
        (headline * 0.7) + (summary * 0.3)
    }
}

#[async_trait]
impl SimilarityClassifier for JaroWinklerSimilarity {
    async fn classify(
        &self,
        article: &Article,
        candidates: &[SimilarityCandidate],
    ) -> Result<SimilarityVerdict, AdapterError> {
        let mut best: Option<(usize, f64)> = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let score = Self::score(article, candidate);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((index, score));
            }
        }

        match best {
            None => Ok(SimilarityVerdict {
                is_similar: false,
                confidence: 0.0,
                similar_to_index: None,
                reason: "empty corpus".to_string(),
            }),
            Some((index, score)) => {
                let is_similar = score >= self.match_threshold;
                Ok(SimilarityVerdict {
                    is_similar,
                    confidence: score,
                    similar_to_index: is_similar.then_some(index),
                    reason: format!("best headline/summary match scored {score:.2}"),
                })
            }
        }
    }
}

/// Deterministic episode script builder used when no generation service is
/// configured.
pub struct TemplateComposer {
    pub show_name: String,
}

impl TemplateComposer {
    pub fn new(show_name: impl Into<String>) -> Self {
        Self {
            show_name: show_name.into(),
        }
    }
}

#[async_trait]
impl TranscriptComposer for TemplateComposer {
    async fn compose(&self, stories: &[Story]) -> Result<ComposedScript, AdapterError> {
        if stories.is_empty() {
            return Err(AdapterError::Message(
                "cannot compose an episode from zero stories".to_string(),
            ));
        }

        let intro = format!(
            "Welcome to {}. Today we cover {} stories from the research wire.",
            self.show_name,
            stories.len()
        );
        let last = stories.len() - 1;
        let segments = stories
            .iter()
            .enumerate()
            .map(|(index, story)| TranscriptSegment {
                headline: story.headline.clone(),
                content: format!(
                    "{}. {}",
                    story.headline,
                    story.body.as_deref().unwrap_or(&story.summary)
                ),
                transition: (index < last).then(|| "Next up.".to_string()),
            })
            .collect();
        let outro = format!("That is all for today's {}. See you tomorrow.", self.show_name);

        Ok(ComposedScript {
            intro,
            segments,
            outro,
        })
    }
}

/// Offline enhancer: keeps the classifier-approved headline and summary,
/// scaffolds a body, and tags via the same topic rules the relevance
/// classifier uses.
#[derive(Default)]
pub struct TemplateEnhancer {
    topics: Option<KeywordRelevance>,
}

impl TemplateEnhancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic_rules(rules: KeywordRelevance) -> Self {
        Self {
            topics: Some(rules),
        }
    }
}

#[async_trait]
impl StoryEnhancer for TemplateEnhancer {
    async fn enhance(&self, story: &Story) -> Result<Enhancement, AdapterError> {
        let body = story
            .body
            .clone()
            .unwrap_or_else(|| format!("{}\n\n{}", story.headline, story.summary));
        let tags = self
            .topics
            .as_ref()
            .map(|rules| {
                rules
                    .matched_topics(&format!("{} {}", story.headline, story.summary))
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Enhancement {
            headline: story.headline.clone(),
            summary: story.summary.clone(),
            body,
            tags,
            reason: "template enhancement; no generation service configured".to_string(),
            images: story.images.clone(),
        })
    }
}

/// A captured batch of articles, stored as a JSON fixture on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBatch {
    pub source_id: String,
    pub captured_at: DateTime<Utc>,
    pub articles: Vec<Article>,
}

pub fn load_fixture_batch(path: impl AsRef<Path>) -> Result<FixtureBatch> {
    let path = path.as_ref();
    let data =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Article source backed by a fixture file; stands in for the scraping
/// service during tests and offline runs.
pub struct FixtureSource {
    batch: FixtureBatch,
}

impl FixtureSource {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            batch: load_fixture_batch(path)?,
        })
    }

    pub fn from_batch(batch: FixtureBatch) -> Self {
        Self { batch }
    }
}

#[async_trait]
impl ArticleSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.batch.source_id
    }

    async fn fetch_batch(&self) -> Result<Vec<Article>, AdapterError> {
        Ok(self.batch.articles.clone())
    }
}

pub mod remote {
    //! HTTP clients for the hosted classification/generation/voicing
    //! service. Timeouts and retries live here, in the transport layer;
    //! callers see a single failed result after the budget is spent.

    use std::time::Duration;

    use async_trait::async_trait;
    use drb_core::{Article, Story};
    use reqwest::StatusCode;
    use serde::{de::DeserializeOwned, Deserialize, Serialize};
    use tracing::{debug, info_span, Instrument};

    use super::{
        AdapterError, ArticleSource, ComposedScript, Enhancement, RelevanceClassifier,
        RelevanceVerdict, SimilarityCandidate, SimilarityClassifier, SimilarityVerdict,
        StoryEnhancer, TranscriptComposer, VoiceSynthesizer,
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RetryDisposition {
        Retryable,
        NonRetryable,
    }

    pub fn classify_status(status: StatusCode) -> RetryDisposition {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }

    pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct BackoffPolicy {
        pub max_retries: usize,
        pub base_delay: Duration,
        pub max_delay: Duration,
    }

    impl Default for BackoffPolicy {
        fn default() -> Self {
            Self {
                max_retries: 3,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
            }
        }
    }

    impl BackoffPolicy {
        pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
            let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
            let delay = self.base_delay.saturating_mul(factor);
            delay.min(self.max_delay)
        }
    }

    #[derive(Debug, Clone)]
    pub struct RemoteConfig {
        pub base_url: String,
        pub timeout: Duration,
        pub user_agent: Option<String>,
        pub backoff: BackoffPolicy,
    }

    impl RemoteConfig {
        pub fn new(base_url: impl Into<String>) -> Self {
            Self {
                base_url: base_url.into(),
                timeout: Duration::from_secs(30),
                user_agent: None,
                backoff: BackoffPolicy::default(),
            }
        }
    }

    /// One client implements every collaborator trait; each concern maps
    /// to a service route.
    #[derive(Clone)]
    pub struct RemoteClient {
        client: reqwest::Client,
        base_url: String,
        backoff: BackoffPolicy,
    }

    #[derive(Debug, Serialize)]
    struct RelevanceRequest<'a> {
        headline: &'a str,
        summary: &'a str,
    }

    #[derive(Debug, Serialize)]
    struct SimilarityRequest<'a> {
        headline: &'a str,
        summary: &'a str,
        date: chrono::DateTime<chrono::Utc>,
        candidates: &'a [SimilarityCandidate],
    }

    #[derive(Debug, Serialize)]
    struct VoiceRequest<'a> {
        text: &'a str,
    }

    #[derive(Debug, Deserialize)]
    struct VoiceResponse {
        audio_url: String,
    }

    impl RemoteClient {
        pub fn new(config: RemoteConfig) -> Result<Self, AdapterError> {
            let mut builder = reqwest::Client::builder()
                .gzip(true)
                .brotli(true)
                .timeout(config.timeout);
            if let Some(user_agent) = &config.user_agent {
                builder = builder.user_agent(user_agent.clone());
            }
            let client = builder.build()?;
            Ok(Self {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                backoff: config.backoff,
            })
        }

        async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
            &self,
            route: &str,
            request: &Req,
        ) -> Result<Resp, AdapterError> {
            let url = format!("{}/{}", self.base_url, route.trim_start_matches('/'));
            let span = info_span!("collaborator_call", route);

            async {
                let mut last_transport_error: Option<reqwest::Error> = None;
                for attempt in 0..=self.backoff.max_retries {
                    match self.client.post(&url).json(request).send().await {
                        Ok(resp) => {
                            let status = resp.status();
                            if status.is_success() {
                                let value: serde_json::Value = resp.json().await?;
                                return Ok(serde_json::from_value(value)?);
                            }
                            if classify_status(status) == RetryDisposition::Retryable
                                && attempt < self.backoff.max_retries
                            {
                                debug!(route, %status, attempt, "retrying after status");
                                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                                continue;
                            }
                            return Err(AdapterError::Status {
                                status: status.as_u16(),
                                url: url.clone(),
                            });
                        }
                        Err(err) => {
                            if classify_reqwest_error(&err) == RetryDisposition::Retryable
                                && attempt < self.backoff.max_retries
                            {
                                debug!(route, %err, attempt, "retrying after transport error");
                                last_transport_error = Some(err);
                                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                                continue;
                            }
                            return Err(AdapterError::Transport(err));
                        }
                    }
                }
                Err(AdapterError::Transport(
                    last_transport_error.expect("retry loop captures a transport error"),
                ))
            }
            .instrument(span)
            .await
        }
    }

    #[async_trait]
    impl ArticleSource for RemoteClient {
        fn source_id(&self) -> &str {
            "remote-research"
        }

        async fn fetch_batch(&self) -> Result<Vec<Article>, AdapterError> {
            self.post_json("research", &serde_json::json!({})).await
        }
    }

    #[async_trait]
    impl RelevanceClassifier for RemoteClient {
        async fn classify(
            &self,
            headline: &str,
            summary: &str,
        ) -> Result<RelevanceVerdict, AdapterError> {
            self.post_json("relevance", &RelevanceRequest { headline, summary })
                .await
        }
    }

    #[async_trait]
    impl SimilarityClassifier for RemoteClient {
        async fn classify(
            &self,
            article: &Article,
            candidates: &[SimilarityCandidate],
        ) -> Result<SimilarityVerdict, AdapterError> {
            self.post_json(
                "similarity",
                &SimilarityRequest {
                    headline: &article.headline,
                    summary: &article.summary,
                    date: article.date_found,
                    candidates,
                },
            )
            .await
        }
    }

    #[async_trait]
    impl StoryEnhancer for RemoteClient {
        async fn enhance(&self, story: &Story) -> Result<Enhancement, AdapterError> {
            self.post_json("enhance", story).await
        }
    }

    #[async_trait]
    impl TranscriptComposer for RemoteClient {
        async fn compose(&self, stories: &[Story]) -> Result<ComposedScript, AdapterError> {
            self.post_json("compose", &stories).await
        }
    }

    #[async_trait]
    impl VoiceSynthesizer for RemoteClient {
        async fn synthesize(&self, text: &str) -> Result<String, AdapterError> {
            let resp: VoiceResponse = self.post_json("voice", &VoiceRequest { text }).await?;
            Ok(resp.audio_url)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const RULES: &str = r#"
version: 1
topics:
  - topic: machine-learning
    contains_any: ["neural", "transformer", "LLM"]
  - topic: robotics
    contains_any: ["robot", "actuator"]
"#;

    fn article(headline: &str, summary: &str) -> Article {
        Article {
            headline: headline.to_string(),
            summary: summary.to_string(),
            link: "https://ex.org/a".to_string(),
            source: "example-journal".to_string(),
            date_found: Utc::now(),
            content: None,
            images: Vec::new(),
            date_posted: None,
            body: None,
        }
    }

    fn story(headline: &str, summary: &str) -> Story {
        let link = format!("https://ex.org/{headline}");
        Story {
            id: Story::id_for_link(&link),
            headline: headline.to_string(),
            summary: summary.to_string(),
            link,
            source: "example-journal".to_string(),
            date_added: Utc::now(),
            edited: true,
            published: true,
            date_published: Some(Utc::now()),
            body: None,
            tags: Vec::new(),
            images: Vec::new(),
        }
    }

    #[tokio::test]
    async fn keyword_relevance_distinguishes_topics() {
        let classifier = KeywordRelevance::from_yaml_str(RULES).unwrap();

        let hit = classifier
            .classify("New transformer benchmark", "A neural approach")
            .await
            .unwrap();
        assert!(hit.is_relevant);
        assert!(hit.confidence >= 0.6);
        assert!(hit.reason.contains("machine-learning"));

        let miss = classifier
            .classify("Local bakery expands", "Sourdough output doubles")
            .await
            .unwrap();
        assert!(!miss.is_relevant);
    }

    #[tokio::test]
    async fn jaro_winkler_flags_near_duplicates_with_index() {
        let classifier = JaroWinklerSimilarity::default();
        let corpus = vec![
            SimilarityCandidate::from(&story("Quantum chip ships", "A quantum milestone")),
            SimilarityCandidate::from(&story(
                "Transformer models shrink",
                "Distillation results improve",
            )),
        ];

        let dup = classifier
            .classify(
                &article("Transformer models shrink fast", "Distillation results improve"),
                &corpus,
            )
            .await
            .unwrap();
        assert!(dup.is_similar);
        assert_eq!(dup.similar_to_index, Some(1));
        assert!(dup.confidence > 0.9);

        let fresh = classifier
            .classify(
                &article("Fusion startup raises round", "New magnet design"),
                &corpus,
            )
            .await
            .unwrap();
        assert!(!fresh.is_similar);
        assert_eq!(fresh.similar_to_index, None);

        let empty = classifier
            .classify(&article("Anything", "At all"), &[])
            .await
            .unwrap();
        assert!(!empty.is_similar);
        assert_eq!(empty.confidence, 0.0);
    }

    #[tokio::test]
    async fn template_composer_covers_every_story_in_order() {
        let composer = TemplateComposer::new("Daily Research Brief");
        let stories = vec![story("Alpha", "First"), story("Beta", "Second")];

        let script = composer.compose(&stories).await.unwrap();
        assert_eq!(script.segments.len(), 2);
        assert_eq!(script.segments[0].headline, "Alpha");
        assert!(script.segments[0].transition.is_some());
        assert!(script.segments[1].transition.is_none());
        assert!(script.intro.contains("2 stories"));

        let err = composer.compose(&[]).await.unwrap_err();
        assert!(matches!(err, AdapterError::Message(_)));
    }

    #[tokio::test]
    async fn template_enhancer_scaffolds_body_and_tags() {
        let rules = KeywordRelevance::from_yaml_str(RULES).unwrap();
        let enhancer = TemplateEnhancer::with_topic_rules(rules);
        let mut subject = story("Robot hand milestone", "A new actuator design");
        subject.body = None;

        let enhancement = enhancer.enhance(&subject).await.unwrap();
        assert!(enhancement.body.contains("Robot hand milestone"));
        assert_eq!(enhancement.tags, vec!["robotics".to_string()]);
    }

    #[test]
    fn backoff_delays_are_exponential_and_capped() {
        let policy = remote::BackoffPolicy {
            max_retries: 5,
            base_delay: std::time::Duration::from_millis(100),
            max_delay: std::time::Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), std::time::Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), std::time::Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), std::time::Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), std::time::Duration::from_millis(350));
    }
}
