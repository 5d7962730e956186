//! Remote trajectory import over SSH.
//!
//! The import fetches the remote file or directory into a staging folder and
//! hands the files to [`TrajectoryIngestor::ingest`], so an import produces
//! exactly the chunk jobs a direct upload would.

use super::trajectory::{IngestRequest, TrajectoryIngestor};
use crate::error::{JobError, JobResult};
use crate::job::{JobContext, JobEnvelope, JobPayload, QueueKind};
use crate::plugin::CommandRunner;
use crate::worker::JobHandler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Connection details for one saved SSH target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConnection {
    pub id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

/// Looks up saved connections.
#[async_trait]
pub trait SshConnectionDirectory: Send + Sync {
    /// Connection `connection_id` if `user_id` may use it.
    async fn resolve(&self, connection_id: &str, user_id: &str) -> JobResult<Option<SshConnection>>;
}

/// Fixed set of connections, keyed by id and owned by one user each.
#[derive(Debug, Clone, Default)]
pub struct StaticConnectionDirectory {
    connections: HashMap<String, (String, SshConnection)>,
}

impl StaticConnectionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, user_id: impl Into<String>, connection: SshConnection) -> Self {
        self.connections
            .insert(connection.id.clone(), (user_id.into(), connection));
        self
    }
}

#[async_trait]
impl SshConnectionDirectory for StaticConnectionDirectory {
    async fn resolve(&self, connection_id: &str, user_id: &str) -> JobResult<Option<SshConnection>> {
        Ok(self
            .connections
            .get(connection_id)
            .filter(|(owner, _)| owner == user_id)
            .map(|(_, connection)| connection.clone()))
    }
}

/// Copies a remote path into a local directory.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Returns the local path of the fetched file or directory.
    async fn fetch(&self, connection: &SshConnection, remote_path: &str, dest_dir: &Path) -> JobResult<PathBuf>;
}

/// [`RemoteFetcher`] that shells out to `scp`.
pub struct ScpFetcher {
    runner: Arc<dyn CommandRunner>,
    scp_path: PathBuf,
}

impl ScpFetcher {
    pub fn new(runner: Arc<dyn CommandRunner>, scp_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            scp_path: scp_path.into(),
        }
    }

    fn args(connection: &SshConnection, remote_path: &str, dest: &Path) -> Vec<String> {
        let mut args = vec![
            "-r".to_string(),
            "-B".to_string(),
            "-P".to_string(),
            connection.port.to_string(),
        ];
        if let Some(identity) = &connection.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }
        args.push(format!("{}@{}:{}", connection.username, connection.host, remote_path));
        args.push(dest.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl RemoteFetcher for ScpFetcher {
    async fn fetch(&self, connection: &SshConnection, remote_path: &str, dest_dir: &Path) -> JobResult<PathBuf> {
        let name = remote_name(remote_path)?;
        let dest = dest_dir.join(name);
        let args = Self::args(connection, remote_path, &dest);
        self.runner
            .execute(&self.scp_path, &args, dest_dir)
            .await?
            .into_result()?;
        Ok(dest)
    }
}

/// Last component of a remote path; the root is refused.
fn remote_name(remote_path: &str) -> JobResult<&str> {
    remote_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .ok_or_else(|| JobError::validation(format!("refusing to import '{remote_path}'")))
}

/// Regular files under `path`, sorted.
fn collect_files(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry_path = entry?.path();
            if entry_path.is_dir() {
                stack.push(entry_path);
            } else if entry_path.is_file() {
                files.push(entry_path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Imports a remote trajectory and schedules its ingestion.
pub struct SshImportProcessor {
    directory: Arc<dyn SshConnectionDirectory>,
    fetcher: Arc<dyn RemoteFetcher>,
    ingestor: TrajectoryIngestor,
    staging_root: PathBuf,
}

impl SshImportProcessor {
    pub fn new(
        directory: Arc<dyn SshConnectionDirectory>,
        fetcher: Arc<dyn RemoteFetcher>,
        ingestor: TrajectoryIngestor,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            directory,
            fetcher,
            ingestor,
            staging_root: staging_root.into(),
        }
    }
}

#[async_trait]
impl JobHandler for SshImportProcessor {
    fn kind(&self) -> QueueKind {
        QueueKind::SshImport
    }

    async fn handle(&self, envelope: &JobEnvelope, ctx: &JobContext) -> JobResult<Option<serde_json::Value>> {
        let JobPayload::SshImport(job) = &envelope.payload else {
            return Err(JobError::validation("expected an SSH import job"));
        };

        let connection = self
            .directory
            .resolve(&job.ssh_connection_id, &job.user_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("ssh connection {}", job.ssh_connection_id)))?;
        let name = job
            .name
            .clone()
            .unwrap_or_else(|| remote_name(&job.remote_path).unwrap_or("import").to_string());

        let staging = self.staging_root.join(ctx.job_id.as_str());
        tokio::fs::create_dir_all(&staging).await?;

        let result = async {
            let local = self.fetcher.fetch(&connection, &job.remote_path, &staging).await?;
            let sources = tokio::task::spawn_blocking(move || collect_files(&local))
                .await
                .map_err(|e| JobError::Internal(format!("file walk failed: {e}")))??;

            self.ingestor
                .ingest(IngestRequest {
                    team_id: envelope.team_id.clone(),
                    trajectory_id: None,
                    name,
                    folder_id: job.folder_id.clone(),
                    sources,
                    session_id: envelope.session_id.clone(),
                })
                .await
        }
        .await;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            warn!(staging = %staging.display(), error = %e, "Failed to clean import staging");
        }

        let receipt = result?;
        info!(
            connection = %connection.host,
            remote_path = %job.remote_path,
            trajectory_id = %receipt.trajectory_id,
            frames = receipt.total_frames,
            "SSH import scheduled"
        );
        Ok(Some(serde_json::to_value(receipt)?))
    }
}
