//! Core domain model for the Daily Research Brief pipeline.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "drb-core";

/// Storage date keys are calendar days, formatted `YYYY-MM-DD`.
pub const DATE_KEY_FORMAT: &str = "%Y-%m-%d";

/// Raw article captured by the research source. Immutable once captured;
/// superseded by the next day's batch rather than updated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub headline: String,
    pub summary: String,
    pub link: String,
    pub source: String,
    pub date_found: DateTime<Utc>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub date_posted: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Durable story record. The link is the natural identity: at most one
/// story ever exists per distinct link, and the id is derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: Uuid,
    pub headline: String,
    pub summary: String,
    pub link: String,
    pub source: String,
    pub date_added: DateTime<Utc>,
    pub edited: bool,
    pub published: bool,
    #[serde(default)]
    pub date_published: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl Story {
    /// Stable id for a link: v5 UUID in the URL namespace, so the same
    /// link always maps to the same record id.
    pub fn id_for_link(link: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, link.as_bytes())
    }
}

/// Fields supplied when a story is first created, before any enhancement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryInput {
    pub headline: String,
    pub summary: String,
    pub link: String,
    pub source: String,
    #[serde(default)]
    pub images: Vec<String>,
}

impl From<&Article> for StoryInput {
    fn from(article: &Article) -> Self {
        Self {
            headline: article.headline.clone(),
            summary: article.summary.clone(),
            link: article.link.clone(),
            source: article.source.clone(),
            images: article.images.clone(),
        }
    }
}

/// Enhancement payload applied to an existing story. `None` fields leave
/// the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryPatch {
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub images: Option<Vec<String>>,
}

/// Denormalized story snapshot embedded in a transcript, so the episode
/// remains readable even if the corpus changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryRef {
    pub headline: String,
    pub summary: String,
    pub link: String,
    #[serde(default)]
    pub date_published: Option<DateTime<Utc>>,
}

impl From<&Story> for StoryRef {
    fn from(story: &Story) -> Self {
        Self {
            headline: story.headline.clone(),
            summary: story.summary.clone(),
            link: story.link.clone(),
            date_published: story.date_published,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub headline: String,
    pub content: String,
    #[serde(default)]
    pub transition: Option<String>,
}

/// One podcast episode script. Keyed by the calendar date it was created,
/// not by the date range of the stories it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodcastTranscript {
    pub intro: String,
    pub segments: Vec<TranscriptSegment>,
    pub outro: String,
    pub stories: Vec<StoryRef>,
    pub date_created: DateTime<Utc>,
    #[serde(default)]
    pub audio_url: Option<String>,
}

impl PodcastTranscript {
    /// Flat text rendering handed to the voice synthesizer.
    pub fn spoken_text(&self) -> String {
        let mut parts = vec![self.intro.clone()];
        for segment in &self.segments {
            parts.push(segment.content.clone());
            if let Some(transition) = &segment.transition {
                parts.push(transition.clone());
            }
        }
        parts.push(self.outro.clone());
        parts.join("\n\n")
    }
}

/// One day's captured research batch. A cache with bounded retention, not
/// a system of record; stories are the durable output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSnapshot {
    pub articles: Vec<Article>,
    pub last_updated: DateTime<Utc>,
    pub source: String,
}

pub fn date_key(date: NaiveDate) -> String {
    date.format(DATE_KEY_FORMAT).to_string()
}

pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(key, DATE_KEY_FORMAT).ok()
}

/// Every calendar day in `[start, end]` inclusive, oldest first. Empty when
/// the range is inverted.
pub fn days_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = start;
    while day <= end {
        days.push(day);
        match day.checked_add_signed(Duration::days(1)) {
            Some(next) => day = next,
            None => break,
        }
    }
    days
}
