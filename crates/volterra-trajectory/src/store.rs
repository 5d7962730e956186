//! Frame persistence.
//!
//! Frames are immutable once stored: a second `put` for the same
//! (trajectory, timestep) leaves the stored record untouched and reports
//! [`PutOutcome::AlreadyPresent`].

use crate::codec::{decode_frame, encode_frame};
use crate::error::{TrajectoryError, TrajectoryResult};
use crate::frame::TrajectoryFrame;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

const FRAME_EXTENSION: &str = "frame";

/// Result of storing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The frame was written.
    Stored,
    /// A record already existed for this key.
    AlreadyPresent,
}

/// Storage of binary frame records keyed by (trajectory id, timestep).
#[async_trait]
pub trait FrameStore: Send + Sync {
    /// Stores a frame unless one is already present for its timestep.
    async fn put(&self, trajectory_id: &str, frame: &TrajectoryFrame) -> TrajectoryResult<PutOutcome>;

    /// Loads a stored frame.
    async fn get(&self, trajectory_id: &str, timestep: u64) -> TrajectoryResult<Option<TrajectoryFrame>>;

    /// Returns true if a frame is stored for the key.
    async fn exists(&self, trajectory_id: &str, timestep: u64) -> TrajectoryResult<bool>;

    /// Lists stored timesteps in ascending order.
    async fn timesteps(&self, trajectory_id: &str) -> TrajectoryResult<Vec<u64>>;
}

/// Rejects ids that could escape the store root.
fn validate_key(trajectory_id: &str) -> TrajectoryResult<()> {
    let valid = !trajectory_id.is_empty()
        && trajectory_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TrajectoryError::InvalidKey(trajectory_id.to_string()))
    }
}

/// File-system store laid out as `<root>/<trajectoryId>/<timestep>.frame`.
#[derive(Debug, Clone)]
pub struct FsFrameStore {
    root: PathBuf,
}

impl FsFrameStore {
    /// Creates a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, trajectory_id: &str) -> TrajectoryResult<PathBuf> {
        validate_key(trajectory_id)?;
        Ok(self.root.join(trajectory_id))
    }

    fn path(&self, trajectory_id: &str, timestep: u64) -> TrajectoryResult<PathBuf> {
        Ok(self
            .dir(trajectory_id)?
            .join(format!("{timestep}.{FRAME_EXTENSION}")))
    }
}

#[async_trait]
impl FrameStore for FsFrameStore {
    async fn put(&self, trajectory_id: &str, frame: &TrajectoryFrame) -> TrajectoryResult<PutOutcome> {
        let path = self.path(trajectory_id, frame.timestep)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(PutOutcome::AlreadyPresent);
        }

        let dir = self.dir(trajectory_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let bytes = encode_frame(frame)?;
        let tmp = dir.join(format!(
            ".{}.{}.tmp",
            frame.timestep,
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&tmp, &bytes).await?;

        // A concurrent writer may have landed first; keep its record.
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&tmp).await?;
            return Ok(PutOutcome::AlreadyPresent);
        }
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            trajectory_id = %trajectory_id,
            timestep = frame.timestep,
            bytes = bytes.len(),
            "Frame stored"
        );
        Ok(PutOutcome::Stored)
    }

    async fn get(&self, trajectory_id: &str, timestep: u64) -> TrajectoryResult<Option<TrajectoryFrame>> {
        let path = self.path(trajectory_id, timestep)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => decode_frame(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, trajectory_id: &str, timestep: u64) -> TrajectoryResult<bool> {
        let path = self.path(trajectory_id, timestep)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn timesteps(&self, trajectory_id: &str) -> TrajectoryResult<Vec<u64>> {
        let dir = self.dir(trajectory_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut timesteps = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FRAME_EXTENSION) {
                continue;
            }
            if let Some(ts) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                timesteps.insert(ts);
            }
        }

        Ok(timesteps.into_iter().collect())
    }
}

/// In-memory store holding encoded records.
#[derive(Debug, Default)]
pub struct MemoryFrameStore {
    records: RwLock<HashMap<String, HashMap<u64, Vec<u8>>>>,
}

impl MemoryFrameStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FrameStore for MemoryFrameStore {
    async fn put(&self, trajectory_id: &str, frame: &TrajectoryFrame) -> TrajectoryResult<PutOutcome> {
        validate_key(trajectory_id)?;
        let bytes = encode_frame(frame)?;

        let mut records = self.records.write();
        let frames = records.entry(trajectory_id.to_string()).or_default();
        if frames.contains_key(&frame.timestep) {
            return Ok(PutOutcome::AlreadyPresent);
        }
        frames.insert(frame.timestep, bytes);
        Ok(PutOutcome::Stored)
    }

    async fn get(&self, trajectory_id: &str, timestep: u64) -> TrajectoryResult<Option<TrajectoryFrame>> {
        validate_key(trajectory_id)?;
        let records = self.records.read();
        records
            .get(trajectory_id)
            .and_then(|frames| frames.get(&timestep))
            .map(|bytes| decode_frame(bytes))
            .transpose()
    }

    async fn exists(&self, trajectory_id: &str, timestep: u64) -> TrajectoryResult<bool> {
        validate_key(trajectory_id)?;
        Ok(self
            .records
            .read()
            .get(trajectory_id)
            .is_some_and(|frames| frames.contains_key(&timestep)))
    }

    async fn timesteps(&self, trajectory_id: &str) -> TrajectoryResult<Vec<u64>> {
        validate_key(trajectory_id)?;
        let mut timesteps: Vec<u64> = self
            .records
            .read()
            .get(trajectory_id)
            .map(|frames| frames.keys().copied().collect())
            .unwrap_or_default();
        timesteps.sort_unstable();
        Ok(timesteps)
    }
}
