//! File-backed adapters for the compiler's ports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use compiler::CompileRequest;
use packet::text::surface_key;
use packet::{
    BoundaryNote, CanonicalSegment, DictionaryEntry, DictionaryLookup, KeyValueStore, LookupError,
    PacketSource, SegmentId, SegmentSource, SourceError, SourceRef, WorkRequest,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Segment source
// ---------------------------------------------------------------------------

/// On-disk layout of one work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkFile {
    #[serde(default)]
    pub title: Option<String>,
    pub segments: Vec<SegmentRecord>,
    #[serde(default)]
    pub boundaries: Vec<BoundaryNote>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub translation: Option<String>,
}

/// Reads works from JSON files.
///
/// `root` is either a single work file or a directory holding
/// `<work>.json` / `<work>.<edition>.json`.
#[derive(Debug, Clone)]
pub struct FileSegmentSource {
    root: PathBuf,
    provider: String,
}

impl FileSegmentSource {
    pub fn new(root: impl Into<PathBuf>, provider: impl Into<String>) -> Self {
        Self { root: root.into(), provider: provider.into() }
    }

    pub fn path_for(&self, work: &WorkRequest) -> PathBuf {
        if self.root.is_file() {
            return self.root.clone();
        }
        let name = match &work.edition {
            Some(edition) => format!("{}.{edition}.json", work.work_id),
            None => format!("{}.json", work.work_id),
        };
        self.root.join(name)
    }

    pub async fn read(&self, work: &WorkRequest) -> Result<WorkFile, SourceError> {
        let path = self.path_for(work);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(path.display().to_string()));
            }
            Err(err) => return Err(SourceError::Unavailable(format!("{}: {err}", path.display()))),
        };
        serde_json::from_str(&text)
            .map_err(|e| SourceError::Malformed(format!("{}: {e}", path.display())))
    }

    /// Reads the work file once and turns it into a full compile request:
    /// segments, boundary notes and title.
    pub async fn request(&self, work: &WorkRequest) -> Result<CompileRequest, SourceError> {
        let file = self.read(work).await?;
        let segments = self.canonical(work, file.segments)?;
        Ok(CompileRequest {
            source: PacketSource {
                provider: self.provider.clone(),
                work_id: work.work_id.clone(),
                edition: work.edition.clone(),
                title: file.title,
            },
            segments,
            boundaries: file.boundaries,
        })
    }

    fn canonical(
        &self,
        work: &WorkRequest,
        records: Vec<SegmentRecord>,
    ) -> Result<Vec<CanonicalSegment>, SourceError> {
        let segments = records
            .into_iter()
            .enumerate()
            .map(|(i, record)| -> Result<CanonicalSegment, SourceError> {
                let segment_id = SegmentId::new(record.id).ok_or_else(|| {
                    SourceError::Malformed(format!("segment {} has a blank id", i + 1))
                })?;
                Ok(CanonicalSegment {
                    source_ref: SourceRef {
                        provider: self.provider.clone(),
                        work_id: work.work_id.clone(),
                        segment_id,
                    },
                    order: u32::try_from(i + 1).unwrap_or(u32::MAX),
                    source_text: record.text,
                    reference_translation: record.translation.filter(|t| !t.trim().is_empty()),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(work = %work.work_id, segments = segments.len(), "work loaded");
        Ok(segments)
    }
}

#[async_trait]
impl SegmentSource for FileSegmentSource {
    async fn fetch(&self, work: &WorkRequest) -> Result<Vec<CanonicalSegment>, SourceError> {
        let file = self.read(work).await?;
        self.canonical(work, file.segments)
    }

    fn provider(&self) -> &str {
        &self.provider
    }
}

// ---------------------------------------------------------------------------
// Dictionary
// ---------------------------------------------------------------------------

/// Dictionary loaded once from a JSON object mapping surface forms to entries.
#[derive(Debug, Default)]
pub struct FileDictionary {
    entries: BTreeMap<String, DictionaryEntry>,
}

impl FileDictionary {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read dictionary {}", path.display()))?;
        let raw: BTreeMap<String, DictionaryEntry> = serde_json::from_str(&text)
            .with_context(|| format!("invalid dictionary {}", path.display()))?;
        Ok(Self::from_entries(raw))
    }

    pub fn from_entries(raw: BTreeMap<String, DictionaryEntry>) -> Self {
        let entries = raw.into_iter().map(|(k, v)| (surface_key(&k), v)).collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DictionaryLookup for FileDictionary {
    async fn lookup(&self, surface: &str) -> Result<Option<DictionaryEntry>, LookupError> {
        Ok(self.entries.get(&surface_key(surface)).cloned())
    }
}

// ---------------------------------------------------------------------------
// JSON-file key-value store
// ---------------------------------------------------------------------------

/// A [`KeyValueStore`] persisted as one JSON object, rewritten on every write.
///
/// Write failures are logged and the in-memory value is kept.
#[derive(Debug)]
pub struct JsonFileStore<V> {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, V>>,
}

impl<V: Clone + Serialize + DeserializeOwned> JsonFileStore<V> {
    /// Opens `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("invalid store file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Ok(Self { path, entries: RwLock::new(entries) })
    }

    fn persist(&self, entries: &BTreeMap<String, V>) {
        let written = serde_json::to_string_pretty(entries)
            .map_err(std::io::Error::from)
            .and_then(|json| {
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&self.path, json)
            });
        if let Err(err) = written {
            warn!(path = %self.path.display(), error = %err, "failed to persist store");
        }
    }
}

impl<V> KeyValueStore<V> for JsonFileStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    fn get(&self, key: &str) -> Option<V> {
        let map = self.entries.read().unwrap_or_else(|p| p.into_inner());
        map.get(key).cloned()
    }

    fn set(&self, key: &str, value: V) {
        let mut map = self.entries.write().unwrap_or_else(|p| p.into_inner());
        map.insert(key.to_string(), value);
        self.persist(&map);
    }

    fn set_many(&self, entries: Vec<(String, V)>) {
        let mut map = self.entries.write().unwrap_or_else(|p| p.into_inner());
        map.extend(entries);
        self.persist(&map);
    }
}
