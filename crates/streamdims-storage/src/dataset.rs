//! Immutable, run-addressed dataset snapshots.
//!
//! Every write lands in `<root>/.staging/<uuid>/` first and only becomes visible
//! through a single directory rename. The processed `LATEST` pointer is replaced
//! by rename as well, under the publish lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use streamdims_core::{ProcessedSnapshot, RawItem, ResumePoint, RunId};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::tables;

const SCHEMA_VERSION: u32 = 1;
const LATEST_POINTER: &str = "LATEST";
const LOCK_FILE: &str = ".publish.lock";
const STAGING_DIR: &str = ".staging";
const LOCK_WAIT: Duration = Duration::from_secs(10);
const STALE_LOCK_AGE: Duration = Duration::from_secs(300);
/// Staging directories untouched for this long belong to runs that died.
pub const STALE_STAGING_AGE: Duration = Duration::from_secs(3_600);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no processed snapshot has been published yet")]
    NoDataAvailable,
    #[error("snapshot {0} already exists and is never overwritten")]
    SnapshotExists(RunId),
    #[error("snapshot {run_id} failed integrity check: {reason}")]
    Corrupt { run_id: String, reason: String },
    #[error("timed out waiting for publish lock {}", .0.display())]
    LockTimeout(PathBuf),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Raw,
    Processed,
}

impl SnapshotKind {
    fn dir_name(&self) -> &'static str {
        match self {
            SnapshotKind::Raw => "raw",
            SnapshotKind::Processed => "processed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: RunId,
    pub kind: SnapshotKind,
    pub written_at: DateTime<Utc>,
    /// False for raw snapshots of runs that stopped before fetching finished.
    pub complete: bool,
    #[serde(default)]
    pub resume_point: Option<ResumePoint>,
    pub counts: BTreeMap<String, usize>,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone)]
pub struct PublishedSnapshot {
    pub run_id: RunId,
    pub kind: SnapshotKind,
    pub path: PathBuf,
    pub manifest: SnapshotManifest,
}

/// A fully written snapshot that readers cannot see yet.
///
/// Dropping it without calling [`StagedSnapshot::publish`] leaves the store exactly
/// as it was; the staging directory is swept later.
#[derive(Debug)]
pub struct StagedSnapshot {
    store: DatasetStore,
    staging_dir: PathBuf,
    manifest: SnapshotManifest,
}

impl StagedSnapshot {
    pub fn run_id(&self) -> RunId {
        self.manifest.run_id
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub async fn publish(self) -> Result<PublishedSnapshot, StoreError> {
        self.store.publish(self.staging_dir, self.manifest).await
    }

    pub async fn discard(self) -> Result<(), StoreError> {
        fs::remove_dir_all(&self.staging_dir)
            .await
            .with_context(|| format!("removing {}", self.staging_dir.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
    publish_guard: Arc<Mutex<()>>,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            publish_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn kind_dir(&self, kind: SnapshotKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    fn snapshot_dir(&self, kind: SnapshotKind, run_id: RunId) -> PathBuf {
        self.kind_dir(kind).join(run_id.to_string())
    }

    async fn new_staging_dir(&self) -> Result<PathBuf, StoreError> {
        let dir = self.root.join(STAGING_DIR).join(Uuid::new_v4().to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating staging directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Persist the raw items of one run. `resume_point` marks the snapshot incomplete.
    pub async fn write_raw(
        &self,
        run_id: RunId,
        items: &[RawItem],
        resume_point: Option<ResumePoint>,
    ) -> Result<PublishedSnapshot, StoreError> {
        let staging_dir = self.new_staging_dir().await?;

        let parquet_path = staging_dir.join("items.parquet");
        tables::write_raw_items_parquet(&parquet_path, items)?;
        let json = serde_json::to_vec_pretty(items).context("serializing raw items")?;
        write_synced(&staging_dir.join("items.json"), &json).await?;

        let mut counts = BTreeMap::new();
        for item in items {
            *counts.entry(item.kind.as_str().to_string()).or_default() += 1;
        }

        let manifest = SnapshotManifest {
            schema_version: SCHEMA_VERSION,
            run_id,
            kind: SnapshotKind::Raw,
            written_at: Utc::now(),
            complete: resume_point.is_none(),
            resume_point,
            counts,
            files: vec![
                manifest_entry("items", &staging_dir, &parquet_path).await?,
                manifest_entry("items_json", &staging_dir, &staging_dir.join("items.json")).await?,
            ],
        };
        write_manifest(&staging_dir, &manifest).await?;
        self.publish(staging_dir, manifest).await
    }

    /// Write every file of a processed snapshot into staging without publishing it.
    pub async fn stage_processed(
        &self,
        snapshot: &ProcessedSnapshot,
    ) -> Result<StagedSnapshot, StoreError> {
        let staging_dir = self.new_staging_dir().await?;

        let videos_path = staging_dir.join("videos.parquet");
        let tags_path = staging_dir.join("video_tags.parquet");
        let rollups_path = staging_dir.join("category_rollups.parquet");
        let document_path = staging_dir.join("snapshot.json");

        tables::write_videos_parquet(&videos_path, &snapshot.rows)?;
        tables::write_video_tags_parquet(&tags_path, &snapshot.rows)?;
        tables::write_rollups_parquet(&rollups_path, &snapshot.rollups)?;
        let document = serde_json::to_vec_pretty(snapshot).context("serializing processed snapshot")?;
        write_synced(&document_path, &document).await?;

        let counts = BTreeMap::from([
            ("videos".to_string(), snapshot.rows.len()),
            (
                "channels".to_string(),
                snapshot.rows.iter().filter(|r| r.channel.is_some()).count(),
            ),
            ("categories".to_string(), snapshot.rollups.len()),
            ("rejected".to_string(), snapshot.rejected.len()),
        ]);

        let manifest = SnapshotManifest {
            schema_version: SCHEMA_VERSION,
            run_id: snapshot.run_id,
            kind: SnapshotKind::Processed,
            written_at: Utc::now(),
            complete: true,
            resume_point: None,
            counts,
            files: vec![
                manifest_entry("videos", &staging_dir, &videos_path).await?,
                manifest_entry("video_tags", &staging_dir, &tags_path).await?,
                manifest_entry("category_rollups", &staging_dir, &rollups_path).await?,
                manifest_entry("snapshot", &staging_dir, &document_path).await?,
            ],
        };
        write_manifest(&staging_dir, &manifest).await?;

        Ok(StagedSnapshot {
            store: self.clone(),
            staging_dir,
            manifest,
        })
    }

    pub async fn write_processed(
        &self,
        snapshot: &ProcessedSnapshot,
    ) -> Result<PublishedSnapshot, StoreError> {
        self.stage_processed(snapshot).await?.publish().await
    }

    async fn publish(
        &self,
        staging_dir: PathBuf,
        manifest: SnapshotManifest,
    ) -> Result<PublishedSnapshot, StoreError> {
        let _guard = self.publish_guard.lock().await;
        let _lock = PublishLock::acquire(&self.root).await?;

        let kind_dir = self.kind_dir(manifest.kind);
        let final_dir = self.snapshot_dir(manifest.kind, manifest.run_id);
        fs::create_dir_all(&kind_dir)
            .await
            .with_context(|| format!("creating {}", kind_dir.display()))?;
        if fs::try_exists(&final_dir)
            .await
            .with_context(|| format!("checking {}", final_dir.display()))?
        {
            return Err(StoreError::SnapshotExists(manifest.run_id));
        }

        fs::rename(&staging_dir, &final_dir).await.with_context(|| {
            format!(
                "atomically renaming staged snapshot {} -> {}",
                staging_dir.display(),
                final_dir.display()
            )
        })?;

        if manifest.kind == SnapshotKind::Processed {
            self.advance_latest(manifest.run_id).await?;
        }

        info!(
            run_id = %manifest.run_id,
            kind = manifest.kind.dir_name(),
            path = %final_dir.display(),
            "published snapshot"
        );
        Ok(PublishedSnapshot {
            run_id: manifest.run_id,
            kind: manifest.kind,
            path: final_dir,
            manifest,
        })
    }

    /// Move the latest pointer forward. An older run finishing late never moves it back.
    async fn advance_latest(&self, run_id: RunId) -> Result<(), StoreError> {
        if let Some(current) = self.latest_processed_id().await? {
            if current >= run_id {
                warn!(%run_id, %current, "latest pointer already at a newer run");
                return Ok(());
            }
        }

        let kind_dir = self.kind_dir(SnapshotKind::Processed);
        let temp_path = kind_dir.join(format!(".{}.{}.tmp", LATEST_POINTER, Uuid::new_v4()));
        write_synced(&temp_path, run_id.to_string().as_bytes()).await?;
        let pointer = kind_dir.join(LATEST_POINTER);
        if let Err(err) = fs::rename(&temp_path, &pointer).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(anyhow::Error::new(err)
                .context(format!("replacing {}", pointer.display()))
                .into());
        }
        Ok(())
    }

    pub async fn latest_processed_id(&self) -> Result<Option<RunId>, StoreError> {
        let pointer = self.kind_dir(SnapshotKind::Processed).join(LATEST_POINTER);
        let text = match fs::read_to_string(&pointer).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading {}", pointer.display()))
                    .into())
            }
        };
        let run_id = text.trim().parse::<RunId>().map_err(|e| StoreError::Corrupt {
            run_id: text.trim().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(run_id))
    }

    pub async fn read_latest_processed(&self) -> Result<ProcessedSnapshot, StoreError> {
        let run_id = self
            .latest_processed_id()
            .await?
            .ok_or(StoreError::NoDataAvailable)?;
        self.read_processed(run_id).await
    }

    /// Read a published processed snapshot, checking its document against the manifest.
    pub async fn read_processed(&self, run_id: RunId) -> Result<ProcessedSnapshot, StoreError> {
        let dir = self.snapshot_dir(SnapshotKind::Processed, run_id);
        let corrupt = |reason: String| StoreError::Corrupt {
            run_id: run_id.to_string(),
            reason,
        };

        let manifest = read_manifest(&dir).await?;
        let entry = manifest
            .files
            .iter()
            .find(|f| f.name == "snapshot")
            .ok_or_else(|| corrupt("manifest lists no snapshot document".into()))?;
        let path = dir.join(&entry.path);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if Self::sha256_hex(&bytes) != entry.sha256 {
            return Err(corrupt(format!("checksum mismatch for {}", entry.path)));
        }
        serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))
    }

    pub async fn list_processed(&self) -> Result<Vec<RunId>, StoreError> {
        self.list_runs(SnapshotKind::Processed).await
    }

    /// Manifest of the newest raw snapshot, complete or not.
    pub async fn latest_raw_manifest(&self) -> Result<Option<SnapshotManifest>, StoreError> {
        let runs = self.list_runs(SnapshotKind::Raw).await?;
        match runs.last() {
            Some(run_id) => Ok(Some(
                read_manifest(&self.snapshot_dir(SnapshotKind::Raw, *run_id)).await?,
            )),
            None => Ok(None),
        }
    }

    pub async fn read_raw_items(&self, run_id: RunId) -> Result<Vec<RawItem>, StoreError> {
        let path = self.snapshot_dir(SnapshotKind::Raw, run_id).join("items.json");
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            run_id: run_id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn list_runs(&self, kind: SnapshotKind) -> Result<Vec<RunId>, StoreError> {
        let dir = self.kind_dir(kind);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading {}", dir.display()))
                    .into())
            }
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            if let Some(run_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<RunId>().ok())
            {
                runs.push(run_id);
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// Remove staging directories left behind by runs that never published.
    ///
    /// Only directories idle for [`STALE_STAGING_AGE`] are removed, so a run that is
    /// still writing (possibly in another process) keeps its staging directory.
    pub async fn sweep_staging(&self) -> Result<usize, StoreError> {
        self.sweep_staging_older_than(STALE_STAGING_AGE).await
    }

    /// Like [`DatasetStore::sweep_staging`] with an explicit idle threshold.
    pub async fn sweep_staging_older_than(&self, min_age: Duration) -> Result<usize, StoreError> {
        let _guard = self.publish_guard.lock().await;
        let dir = self.root.join(STAGING_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading {}", dir.display()))
                    .into())
            }
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let path = entry.path();
            let Some(idle) = idle_for(&path).await else {
                continue;
            };
            if idle < min_age {
                continue;
            }
            match fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(
                        path = %path.display(),
                        idle_secs = idle.as_secs(),
                        "removed stale staging directory"
                    );
                    removed += 1;
                }
                // Published (renamed away) between listing and removal.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("removing {}", path.display()))
                        .into())
                }
            }
        }
        Ok(removed)
    }
}

/// Cross-process advisory lock held for the duration of one publish.
///
/// The lock file carries the holder's pid and a token; release only removes a
/// file that still carries this holder's token.
struct PublishLock {
    path: PathBuf,
    token: String,
}

impl PublishLock {
    async fn acquire(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root)
            .await
            .with_context(|| format!("creating {}", root.display()))?;
        let path = root.join(LOCK_FILE);
        let token = format!("{} {}\n", std::process::id(), Uuid::new_v4());
        let deadline = tokio::time::Instant::now() + LOCK_WAIT;

        loop {
            match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    if let Err(err) = file.write_all(token.as_bytes()).await {
                        let _ = fs::remove_file(&path).await;
                        return Err(anyhow::Error::new(err)
                            .context(format!("writing {}", path.display()))
                            .into());
                    }
                    return Ok(Self { path, token });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path).await && take_over_stale_lock(&path).await? {
                        continue;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout(path));
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("opening {}", path.display()))
                        .into())
                }
            }
        }
    }
}

impl Drop for PublishLock {
    fn drop(&mut self) {
        // A holder that outlived the stale age may have been taken over.
        if std::fs::read_to_string(&self.path).is_ok_and(|held| held == self.token) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Move a stale lock out of the way. The rename is atomic, so of several
/// processes racing here exactly one moves any given lock file. If the file moved
/// turns out to be fresh (another process already replaced the stale one), it is
/// linked back in place and `false` is returned.
async fn take_over_stale_lock(path: &Path) -> Result<bool, StoreError> {
    let parked = path.with_extension(format!("lock.{}.stale", Uuid::new_v4()));
    match fs::rename(path, &parked).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("moving stale lock {}", path.display()))
                .into())
        }
    }

    let taken = if lock_is_stale(&parked).await {
        warn!(path = %path.display(), "removed stale publish lock");
        true
    } else if let Err(err) = fs::hard_link(&parked, path).await {
        // Someone created a new lock meanwhile; theirs stands.
        if err.kind() != std::io::ErrorKind::AlreadyExists {
            warn!(path = %path.display(), error = %err, "could not restore live publish lock");
        }
        false
    } else {
        false
    };
    let _ = fs::remove_file(&parked).await;
    Ok(taken)
}

/// Time since anything in `dir` (or `dir` itself) was last modified.
async fn idle_for(dir: &Path) -> Option<Duration> {
    let mut newest = fs::metadata(dir).await.ok()?.modified().ok()?;
    if let Ok(mut entries) = fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(modified) = entry.metadata().await.ok().and_then(|m| m.modified().ok()) {
                newest = newest.max(modified);
            }
        }
    }
    Some(SystemTime::now().duration_since(newest).unwrap_or(Duration::ZERO))
}

async fn lock_is_stale(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > STALE_LOCK_AGE)
        .unwrap_or(false)
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", path.display()))?;
    Ok(())
}

async fn write_manifest(dir: &Path, manifest: &SnapshotManifest) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(manifest).context("serializing snapshot manifest")?;
    write_synced(&dir.join("manifest.json"), &bytes).await
}

async fn read_manifest(dir: &Path) -> Result<SnapshotManifest, StoreError> {
    let path = dir.join("manifest.json");
    let bytes = fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        run_id: dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        reason: e.to_string(),
    })
}

async fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<ManifestFile, StoreError> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: DatasetStore::sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
