//! Package binary
//!
//! The external CLI that inspects and processes `.spkg` packages, plus the
//! token exchange its `process` command needs. Only the documented contract is
//! relied on:
//!
//! - `<binary> block-range-info <path>` prints a JSON object on stdout
//! - `<binary> process <path>` signals success through its exit status

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{PipelineError, PipelineResult};
use crate::storage::ObjectStore;

/// Environment variable the binary reads its processing token from.
pub const TOKEN_ENV_VAR: &str = "SUBSTREAMS_API_TOKEN";

const BLOCK_RANGE_INFO_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait PackageBinary: Send + Sync {
    /// Raw stdout of `block-range-info`.
    async fn block_range_info(&self, package_path: &Path) -> PipelineResult<String>;

    async fn process(&self, package_path: &Path, token: &str) -> PipelineResult<()>;
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue_token(&self) -> PipelineResult<String>;
}

/// Where to fetch the binary from when it is not installed locally
#[derive(Clone)]
pub struct BinarySource {
    pub store: Arc<dyn ObjectStore>,
    pub key: String,
}

pub struct MessariCli {
    path: PathBuf,
    source: Option<BinarySource>,
    process_timeout: Duration,
    install_lock: Mutex<()>,
}

impl MessariCli {
    pub fn new(path: impl Into<PathBuf>, process_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            source: None,
            process_timeout,
            install_lock: Mutex::new(()),
        }
    }

    pub fn with_source(mut self, source: BinarySource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Download the binary if it is missing. Concurrent jobs share one download.
    async fn ensure_installed(&self) -> PipelineResult<()> {
        let _guard = self.install_lock.lock().await;

        if tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }

        let Some(source) = &self.source else {
            return Err(PipelineError::Configuration(format!(
                "package binary not found at {}",
                self.path.display()
            )));
        };

        info!(key = %source.key, path = %self.path.display(), "Installing package binary");

        let staging = self.path.with_extension("download");
        source
            .store
            .download_to(&source.key, &staging)
            .await
            .map_err(PipelineError::storage)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755)).await?;
        }

        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    async fn run(
        &self,
        args: &[&str],
        envs: &[(&str, &str)],
        timeout: Duration,
    ) -> PipelineResult<String> {
        self.ensure_installed().await?;

        let command = format!("{} {}", self.path.display(), args.join(" "));
        debug!(%command, "Running package binary");

        let mut cmd = Command::new(&self.path);
        cmd.args(args)
            .envs(envs.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(PipelineError::CommandTimeout {
                    command,
                    timeout_secs: timeout.as_secs(),
                })
            },
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(PipelineError::ExternalCommand {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl PackageBinary for MessariCli {
    #[instrument(skip(self))]
    async fn block_range_info(&self, package_path: &Path) -> PipelineResult<String> {
        let path = package_path.to_string_lossy();
        self.run(&["block-range-info", &path], &[], BLOCK_RANGE_INFO_TIMEOUT)
            .await
    }

    #[instrument(skip(self, token))]
    async fn process(&self, package_path: &Path, token: &str) -> PipelineResult<()> {
        let path = package_path.to_string_lossy();
        self.run(
            &["process", &path],
            &[(TOKEN_ENV_VAR, token)],
            self.process_timeout,
        )
        .await
        .map(|_| ())
    }
}

/// Exchanges the substreams API key for a short-lived processing token
pub struct SubstreamsAuth {
    client: Client,
    auth_uri: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
}

impl SubstreamsAuth {
    pub fn new(client: Client, auth_uri: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            auth_uri: auth_uri.into(),
            api_key,
        }
    }
}

#[async_trait]
impl TokenIssuer for SubstreamsAuth {
    #[instrument(skip(self))]
    async fn issue_token(&self) -> PipelineResult<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| PipelineError::Authentication("SUBSTREAMS_API_KEY is not set".into()))?;

        let response = self
            .client
            .post(&self.auth_uri)
            .json(&json!({ "api_key": api_key }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PipelineError::Authentication(e.to_string()))?;

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Authentication(format!("invalid token response: {}", e)))?;

        if body.token.is_empty() {
            return Err(PipelineError::Authentication(
                "token endpoint returned no token".into(),
            ));
        }

        Ok(body.token)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("messari");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_block_range_info_returns_stdout() {
        let dir = TempDir::new().unwrap();
        let path = write_script(&dir, r#"echo '{"start_block": 1, "stop_block": 5}'"#);
        let cli = MessariCli::new(path, Duration::from_secs(5));

        let out = cli.block_range_info(Path::new("pkg.spkg")).await.unwrap();
        assert!(out.contains("stop_block"));
    }

    #[tokio::test]
    async fn test_process_passes_token_in_child_env() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("token");
        let path = write_script(
            &dir,
            &format!(r#"printf "%s" "$SUBSTREAMS_API_TOKEN" > {}"#, marker.display()),
        );
        let cli = MessariCli::new(path, Duration::from_secs(5));

        cli.process(Path::new("pkg.spkg"), "tok-123").await.unwrap();
        assert_eq!(std::fs::read_to_string(marker).unwrap(), "tok-123");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_external_command_failure() {
        let dir = TempDir::new().unwrap();
        let path = write_script(&dir, "echo boom >&2; exit 3");
        let cli = MessariCli::new(path, Duration::from_secs(5));

        let err = cli.process(Path::new("pkg.spkg"), "t").await.unwrap_err();
        match err {
            PipelineError::ExternalCommand { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_process_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let path = write_script(&dir, "sleep 30");
        let cli = MessariCli::new(path, Duration::from_millis(200));

        let err = cli.process(Path::new("pkg.spkg"), "t").await.unwrap_err();
        assert!(matches!(err, PipelineError::CommandTimeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_without_source_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let cli = MessariCli::new(dir.path().join("absent"), Duration::from_secs(1));

        let err = cli.block_range_info(Path::new("pkg.spkg")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
