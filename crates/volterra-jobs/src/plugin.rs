//! External executables: analysis plugins, the rasterizer and `scp`.

use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Captured result of one command run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true on exit code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Converts a nonzero exit into [`JobError::Execution`].
    pub fn into_result(self) -> JobResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(JobError::execution(self.code, self.stderr.trim()))
        }
    }
}

/// Runs an executable to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, command: &Path, args: &[String], cwd: &Path) -> JobResult<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn execute(&self, command: &Path, args: &[String], cwd: &Path) -> JobResult<CommandOutput> {
        debug!(command = %command.display(), ?args, cwd = %cwd.display(), "Running command");

        let output = Command::new(command)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| JobError::execution(None, format!("failed to start {}: {e}", command.display())))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Plugin executables by slug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Analysis plugin slug to executable path.
    #[serde(default)]
    pub registry: HashMap<String, PathBuf>,

    /// Rasterizer executable.
    #[serde(default)]
    pub rasterizer: Option<PathBuf>,

    /// `scp` used by SSH imports.
    #[serde(default = "default_scp_path")]
    pub scp_path: PathBuf,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            registry: HashMap::new(),
            rasterizer: None,
            scp_path: default_scp_path(),
        }
    }
}

fn default_scp_path() -> PathBuf {
    PathBuf::from("scp")
}

/// Resolves plugin slugs to executables.
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, PathBuf>,
    rasterizer: Option<PathBuf>,
    scp_path: PathBuf,
}

impl PluginRegistry {
    pub fn from_config(config: &PluginsConfig) -> Self {
        Self {
            plugins: config.registry.clone(),
            rasterizer: config.rasterizer.clone(),
            scp_path: config.scp_path.clone(),
        }
    }

    /// Registers a plugin.
    pub fn with_plugin(mut self, slug: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.plugins.insert(slug.into(), path.into());
        self
    }

    /// Sets the rasterizer executable.
    pub fn with_rasterizer(mut self, path: impl Into<PathBuf>) -> Self {
        self.rasterizer = Some(path.into());
        self
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.plugins.contains_key(slug)
    }

    /// Executable for `slug`.
    pub fn resolve(&self, slug: &str) -> JobResult<&Path> {
        self.plugins
            .get(slug)
            .map(PathBuf::as_path)
            .ok_or_else(|| JobError::validation(format!("unknown plugin '{slug}'")))
    }

    pub fn rasterizer(&self) -> JobResult<&Path> {
        self.rasterizer
            .as_deref()
            .ok_or_else(|| JobError::Configuration("no rasterizer executable configured".into()))
    }

    pub fn scp_path(&self) -> &Path {
        if self.scp_path.as_os_str().is_empty() {
            Path::new("scp")
        } else {
            &self.scp_path
        }
    }

    /// Registered slugs, sorted.
    pub fn slugs(&self) -> Vec<&str> {
        let mut slugs: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        slugs.sort_unstable();
        slugs
    }
}

/// Flattens a JSON object into `--key value` arguments, keys in order.
///
/// `true` becomes a bare flag; `false` and `null` are omitted; arrays are
/// comma-joined; nested objects are passed as JSON.
pub fn config_to_args(config: &serde_json::Value) -> Vec<String> {
    use serde_json::Value;

    let Value::Object(map) = config else {
        return Vec::new();
    };

    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    let mut args = Vec::new();
    for key in keys {
        let flag = format!("--{key}");
        match &map[key] {
            Value::Null | Value::Bool(false) => {}
            Value::Bool(true) => args.push(flag),
            Value::String(s) => args.extend([flag, s.clone()]),
            Value::Number(n) => args.extend([flag, n.to_string()]),
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                args.extend([flag, joined]);
            }
            object @ Value::Object(_) => args.extend([flag, object.to_string()]),
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_to_args() {
        let args = config_to_args(&json!({
            "cutoff": 3.5,
            "mode": "fcc",
            "verbose": true,
            "quiet": false,
            "skip": null,
            "types": [1, 2],
        }));
        assert_eq!(
            args,
            vec!["--cutoff", "3.5", "--mode", "fcc", "--types", "1,2", "--verbose"]
        );
        assert!(config_to_args(&json!("scalar")).is_empty());
    }

    #[test]
    fn test_registry_resolution() {
        let registry = PluginRegistry::default()
            .with_plugin("cna", "/opt/plugins/cna")
            .with_plugin("dxa", "/opt/plugins/dxa");

        assert_eq!(registry.resolve("cna").unwrap(), Path::new("/opt/plugins/cna"));
        assert!(matches!(registry.resolve("ptm"), Err(JobError::Validation(_))));
        assert!(matches!(registry.rasterizer(), Err(JobError::Configuration(_))));
        assert_eq!(registry.slugs(), vec!["cna", "dxa"]);
        assert_eq!(registry.scp_path(), Path::new("scp"));
    }

    #[test]
    fn test_output_into_result() {
        let ok = CommandOutput { code: Some(0), ..Default::default() };
        assert!(ok.into_result().is_ok());

        let failed = CommandOutput {
            code: Some(2),
            stdout: String::new(),
            stderr: "bad frame\n".into(),
        };
        match failed.into_result() {
            Err(JobError::Execution { code, stderr }) => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "bad frame");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = ProcessRunner
            .execute(
                Path::new("sh"),
                &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
                dir.path(),
            )
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_missing_executable_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessRunner
            .execute(Path::new("/nonexistent/volterra-plugin"), &[], dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Execution { code: None, .. }));
    }
}
