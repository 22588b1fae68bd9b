//! Key-value backed stores for stories, research snapshots, and podcast
//! transcripts.
//!
//! The hosting backend offers namespaced get/set/delete with optional
//! per-key expiry and nothing else: no transactions, no secondary indexes,
//! no listing. Every index the stores need (link map, per-day buckets,
//! published/unpublished sets) is maintained by hand on every write. A
//! crash between the individual key writes of one logical mutation can
//! leave those indexes out of step with the records; reads therefore treat
//! dangling index entries and unparseable records as absent instead of
//! failing.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use drb_core::{
    date_key, days_between, PodcastTranscript, ResearchSnapshot, Story, StoryInput, StoryPatch,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "drb-storage";

pub const STORY_NAMESPACE: &str = "stories";
pub const RESEARCH_NAMESPACE: &str = "research";
pub const PODCAST_NAMESPACE: &str = "podcasts";

const UNPUBLISHED_INDEX_KEY: &str = "index:unpublished";
const PUBLISHED_INDEX_KEY: &str = "index:published";

/// Research snapshots are a cache, not a system of record.
pub const RESEARCH_RETENTION_DAYS: u32 = 14;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a story already exists for link {0}")]
    DuplicateLink(String),
    #[error("no record for {0}")]
    NotFound(String),
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Contract the hosting key-value service offers the stores. Values are
/// opaque JSON documents; shape validation happens on read, in the stores.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<JsonValue>>;

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: JsonValue,
        ttl: Option<Duration>,
    ) -> StoreResult<()>;

    async fn delete(&self, namespace: &str, key: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: JsonValue,
    expires_at: Option<Instant>,
}

/// In-process backend used by tests and offline runs. Expiry is lazy:
/// entries past their deadline are treated as absent on read.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<(String, String), MemoryEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<JsonValue>> {
        let entries = self.entries.read().await;
        let entry = entries.get(&(namespace.to_string(), key.to_string()));
        Ok(entry
            .filter(|e| e.expires_at.map_or(true, |at| at > Instant::now()))
            .map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: JsonValue,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            (namespace.to_string(), key.to_string()),
            MemoryEntry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        entries.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct FileEntry {
    key: String,
    value: JsonValue,
    /// Epoch seconds; expiry is enforced on read.
    expires_at: Option<i64>,
}

/// Directory-backed backend for local deployments. One file per key,
/// hash-addressed so arbitrary keys (links contain slashes) stay valid
/// filenames, written via temp file + atomic rename.
#[derive(Debug, Clone)]
pub struct FileKv {
    root: PathBuf,
}

impl FileKv {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.root.join(namespace).join(format!("{digest}.json"))
    }
}

#[async_trait]
impl KvBackend for FileKv {
    async fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<JsonValue>> {
        let path = self.path_for(namespace, key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let entry: FileEntry = match serde_json::from_slice(&data) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(namespace, key, %err, "dropping unreadable backend file");
                return Ok(None);
            }
        };
        if let Some(expires_at) = entry.expires_at {
            if expires_at <= Utc::now().timestamp() {
                let _ = fs::remove_file(&path).await;
                return Ok(None);
            }
        }
        Ok(Some(entry.value))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: JsonValue,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let path = self.path_for(namespace, key);
        let parent = path.parent().expect("backend path always has a parent");
        fs::create_dir_all(parent).await?;

        let entry = FileEntry {
            key: key.to_string(),
            value,
            expires_at: ttl.map(|d| Utc::now().timestamp() + d.as_secs() as i64),
        };
        let bytes = serde_json::to_vec(&entry)?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> StoreResult<()> {
        match fs::remove_file(self.path_for(namespace, key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

async fn read_record<T: DeserializeOwned>(
    kv: &dyn KvBackend,
    namespace: &str,
    key: &str,
) -> StoreResult<Option<T>> {
    match kv.get(namespace, key).await? {
        None => Ok(None),
        Some(value) => match serde_json::from_value(value) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(namespace, key, %err, "dropping unparseable record");
                Ok(None)
            }
        },
    }
}

async fn write_record<T: Serialize>(
    kv: &dyn KvBackend,
    namespace: &str,
    key: &str,
    record: &T,
    ttl: Option<Duration>,
) -> StoreResult<()> {
    let value = serde_json::to_value(record)?;
    kv.set(namespace, key, value, ttl).await
}

fn story_key(id: Uuid) -> String {
    format!("story:{id}")
}

fn link_key(link: &str) -> String {
    format!("link:{link}")
}

fn day_key(day: NaiveDate) -> String {
    format!("date:{}", date_key(day))
}

/// Owns story records, the link -> id mapping, and all status/date indexes.
/// All status mutation goes through here; nothing else flips the `edited`
/// or `published` flags.
#[derive(Clone)]
pub struct StoryStore {
    kv: Arc<dyn KvBackend>,
}

/// Options for [`StoryStore::query_by_date_range`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DateRangeQuery {
    pub published_only: bool,
    pub unpublished_only: bool,
    pub limit: Option<usize>,
}

impl StoryStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv }
    }

    /// Create a story for a link that has never been seen. Returns the
    /// assigned id; the record starts unedited and unpublished, indexed
    /// under its creation day.
    pub async fn add(&self, input: StoryInput) -> StoreResult<Uuid> {
        if self.exists(&input.link).await? {
            return Err(StoreError::DuplicateLink(input.link));
        }

        let id = Story::id_for_link(&input.link);
        let story = Story {
            id,
            headline: input.headline,
            summary: input.summary,
            link: input.link,
            source: input.source,
            date_added: Utc::now(),
            edited: false,
            published: false,
            date_published: None,
            body: None,
            tags: Vec::new(),
            images: input.images,
        };

        write_record(&*self.kv, STORY_NAMESPACE, &story_key(id), &story, None).await?;
        self.kv
            .set(
                STORY_NAMESPACE,
                &link_key(&story.link),
                JsonValue::String(id.to_string()),
                None,
            )
            .await?;
        self.add_to_set(&day_key(story.date_added.date_naive()), id)
            .await?;
        self.add_to_set(UNPUBLISHED_INDEX_KEY, id).await?;
        Ok(id)
    }

    pub async fn get_by_link(&self, link: &str) -> StoreResult<Story> {
        let Some(id) = self.id_for_link(link).await? else {
            return Err(StoreError::NotFound(link.to_string()));
        };
        match self.story_by_id(id).await? {
            Some(story) => Ok(story),
            None => {
                warn!(link, %id, "link index points at a missing story record");
                Err(StoreError::NotFound(link.to_string()))
            }
        }
    }

    /// Cheap membership test against the link index; used as a pre-filter
    /// before any classification work.
    pub async fn exists(&self, link: &str) -> StoreResult<bool> {
        Ok(self.id_for_link(link).await?.is_some())
    }

    /// Apply enhancement output and flip `edited` on. The flag only moves
    /// forward; a later patch never clears it.
    pub async fn mark_edited(&self, link: &str, patch: StoryPatch) -> StoreResult<Story> {
        let mut story = self.get_by_link(link).await?;
        if let Some(headline) = patch.headline {
            story.headline = headline;
        }
        if let Some(summary) = patch.summary {
            story.summary = summary;
        }
        if let Some(body) = patch.body {
            story.body = Some(body);
        }
        if let Some(tags) = patch.tags {
            story.tags = tags;
        }
        if let Some(images) = patch.images {
            story.images = images;
        }
        story.edited = true;
        write_record(
            &*self.kv,
            STORY_NAMESPACE,
            &story_key(story.id),
            &story,
            None,
        )
        .await?;
        Ok(story)
    }

    /// Publish a story. Idempotent: a second call (or a call for an
    /// unknown link) is a no-op, so orchestrator retries are harmless and
    /// the first `date_published` wins.
    pub async fn mark_published(&self, link: &str) -> StoreResult<()> {
        let Some(id) = self.id_for_link(link).await? else {
            debug!(link, "publish skipped: unknown link");
            return Ok(());
        };
        let Some(mut story) = self.story_by_id(id).await? else {
            warn!(link, %id, "publish skipped: link index points at a missing record");
            return Ok(());
        };
        if story.published {
            debug!(link, "publish skipped: already published");
            return Ok(());
        }
        if !story.edited {
            warn!(link, "publishing a story that was never enhanced");
        }

        story.published = true;
        story.date_published = Some(Utc::now());
        write_record(&*self.kv, STORY_NAMESPACE, &story_key(id), &story, None).await?;
        self.remove_from_set(UNPUBLISHED_INDEX_KEY, id).await?;
        self.add_to_set(PUBLISHED_INDEX_KEY, id).await?;
        Ok(())
    }

    /// Union of the per-day buckets covering `[start, end]` inclusive,
    /// deduplicated, optionally intersected with the published or
    /// unpublished index, sorted newest first.
    pub async fn query_by_date_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        query: DateRangeQuery,
    ) -> StoreResult<Vec<Story>> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for day in days_between(start, end) {
            for id in self.read_id_set(&day_key(day)).await? {
                if seen.insert(id) {
                    ids.push(id);
                }
            }
        }

        if query.published_only || query.unpublished_only {
            let index_key = if query.published_only {
                PUBLISHED_INDEX_KEY
            } else {
                UNPUBLISHED_INDEX_KEY
            };
            let members: HashSet<Uuid> = self.read_id_set(index_key).await?.into_iter().collect();
            ids.retain(|id| members.contains(id));
        }

        let mut stories = self.load_stories(&ids).await?;
        if query.published_only {
            stories.sort_by(|a, b| b.date_published.cmp(&a.date_published));
        } else {
            stories.sort_by(|a, b| b.date_added.cmp(&a.date_added));
        }
        if let Some(limit) = query.limit {
            stories.truncate(limit);
        }
        Ok(stories)
    }

    /// Unpublished stories still waiting for enhancement, newest first.
    pub async fn unedited_unpublished(&self) -> StoreResult<Vec<Story>> {
        self.status_view(UNPUBLISHED_INDEX_KEY, Some(false)).await
    }

    /// Enhanced stories ready to publish, newest first.
    pub async fn edited_unpublished(&self) -> StoreResult<Vec<Story>> {
        self.status_view(UNPUBLISHED_INDEX_KEY, Some(true)).await
    }

    pub async fn published(&self) -> StoreResult<Vec<Story>> {
        self.status_view(PUBLISHED_INDEX_KEY, None).await
    }

    async fn status_view(
        &self,
        index_key: &str,
        edited: Option<bool>,
    ) -> StoreResult<Vec<Story>> {
        let ids = self.read_id_set(index_key).await?;
        let mut stories = self.load_stories(&ids).await?;
        if let Some(edited) = edited {
            stories.retain(|s| s.edited == edited);
        }
        stories.sort_by(|a, b| b.date_added.cmp(&a.date_added));
        Ok(stories)
    }

    async fn id_for_link(&self, link: &str) -> StoreResult<Option<Uuid>> {
        match self.kv.get(STORY_NAMESPACE, &link_key(link)).await? {
            None => Ok(None),
            Some(JsonValue::String(raw)) => match raw.parse() {
                Ok(id) => Ok(Some(id)),
                Err(_) => {
                    warn!(link, raw = %raw, "dropping malformed link index entry");
                    Ok(None)
                }
            },
            Some(other) => {
                warn!(link, ?other, "dropping malformed link index entry");
                Ok(None)
            }
        }
    }

    async fn story_by_id(&self, id: Uuid) -> StoreResult<Option<Story>> {
        read_record(&*self.kv, STORY_NAMESPACE, &story_key(id)).await
    }

    async fn load_stories(&self, ids: &[Uuid]) -> StoreResult<Vec<Story>> {
        let mut stories = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.story_by_id(id).await? {
                Some(story) => stories.push(story),
                None => warn!(%id, "index references an id with no backing record"),
            }
        }
        Ok(stories)
    }

    async fn read_id_set(&self, key: &str) -> StoreResult<Vec<Uuid>> {
        let raw: Option<Vec<String>> = read_record(&*self.kv, STORY_NAMESPACE, key).await?;
        Ok(raw
            .unwrap_or_default()
            .into_iter()
            .filter_map(|s| match s.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(key, entry = %s, "dropping malformed id set entry");
                    None
                }
            })
            .collect())
    }

    async fn add_to_set(&self, key: &str, id: Uuid) -> StoreResult<()> {
        let mut ids = self.read_id_set(key).await?;
        if !ids.contains(&id) {
            ids.push(id);
        }
        self.write_id_set(key, &ids).await
    }

    async fn remove_from_set(&self, key: &str, id: Uuid) -> StoreResult<()> {
        let mut ids = self.read_id_set(key).await?;
        ids.retain(|&existing| existing != id);
        self.write_id_set(key, &ids).await
    }

    async fn write_id_set(&self, key: &str, ids: &[Uuid]) -> StoreResult<()> {
        let raw: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        write_record(&*self.kv, STORY_NAMESPACE, key, &raw, None).await
    }
}

/// Date-keyed cache of raw research batches with bounded retention.
#[derive(Clone)]
pub struct ResearchStore {
    kv: Arc<dyn KvBackend>,
    retention_days: u32,
}

impl ResearchStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            kv,
            retention_days: RESEARCH_RETENTION_DAYS,
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub async fn put_snapshot(&self, day: NaiveDate, snapshot: &ResearchSnapshot) -> StoreResult<()> {
        let ttl = Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60);
        write_record(
            &*self.kv,
            RESEARCH_NAMESPACE,
            &date_key(day),
            snapshot,
            Some(ttl),
        )
        .await
    }

    pub async fn snapshot(&self, day: NaiveDate) -> StoreResult<Option<ResearchSnapshot>> {
        read_record(&*self.kv, RESEARCH_NAMESPACE, &date_key(day)).await
    }

    /// Manual maintenance sweep for backends whose expiry is advisory.
    /// Scans `scan_days` of keys beyond the retention boundary and deletes
    /// whatever is still there. Returns the number of snapshots removed.
    pub async fn cleanup(&self, today: NaiveDate, scan_days: u32) -> StoreResult<usize> {
        let newest_stale = today - chrono::Duration::days(i64::from(self.retention_days) + 1);
        let oldest_scanned =
            newest_stale - chrono::Duration::days(i64::from(scan_days.saturating_sub(1)));
        let mut removed = 0;
        for day in days_between(oldest_scanned, newest_stale) {
            let key = date_key(day);
            if self.kv.get(RESEARCH_NAMESPACE, &key).await?.is_some() {
                self.kv.delete(RESEARCH_NAMESPACE, &key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// One transcript per calendar date of creation. The date a transcript was
/// created is not the date range of the stories it covers.
#[derive(Clone)]
pub struct PodcastStore {
    kv: Arc<dyn KvBackend>,
}

impl PodcastStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv }
    }

    pub async fn put(&self, day: NaiveDate, transcript: &PodcastTranscript) -> StoreResult<()> {
        write_record(&*self.kv, PODCAST_NAMESPACE, &date_key(day), transcript, None).await
    }

    pub async fn get(&self, day: NaiveDate) -> StoreResult<Option<PodcastTranscript>> {
        read_record(&*self.kv, PODCAST_NAMESPACE, &date_key(day)).await
    }

    /// Attach the hosted audio URL once voicing completes. The URL moves
    /// from absent to present exactly once; later calls leave the stored
    /// value untouched.
    pub async fn attach_audio_url(
        &self,
        day: NaiveDate,
        audio_url: &str,
    ) -> StoreResult<PodcastTranscript> {
        let Some(mut transcript) = self.get(day).await? else {
            return Err(StoreError::NotFound(date_key(day)));
        };
        if transcript.audio_url.is_some() {
            debug!(day = %date_key(day), "audio url already attached; keeping existing value");
            return Ok(transcript);
        }
        transcript.audio_url = Some(audio_url.to_string());
        self.put(day, &transcript).await?;
        Ok(transcript)
    }
}
