//! Docker implementation of the container runtime
//!
//! Interactive sessions and image import go through the `docker` CLI on a
//! PTY; the rest uses the engine API over the local socket.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, StopContainerOptions};
use bollard::image::{PushImageOptions, RemoveImageOptions, TagImageOptions};
use bollard::Docker;
use futures::TryStreamExt;
use tokio::process::Command;
use tracing::{debug, error, info};

use super::{ContainerRuntime, InteractiveRun, StopOutcome};
use crate::error::{HarnessError, Result};
use crate::tty::{PtyShell, Shell};

/// Seconds to wait for the Docker API before giving up
const API_TIMEOUT_SECS: u64 = 120;

/// Docker engine accessed through its CLI and API
pub struct DockerRuntime {
    /// Path to docker binary
    docker_path: String,
    api: Docker,
}

impl DockerRuntime {
    /// Connect to the engine, at `socket` or the local default
    pub async fn new(socket: Option<&str>) -> Result<Self> {
        let docker_path = which::which("docker")
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| "/usr/bin/docker".to_string());

        let api = match socket {
            Some(path) => {
                Docker::connect_with_socket(path, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
            None => Docker::connect_with_local_defaults()?,
        };

        let version = api.version().await?;
        info!(
            docker_path = %docker_path,
            engine_version = %version.version.unwrap_or_default(),
            "Docker runtime initialized"
        );

        Ok(Self { docker_path, api })
    }

    /// `docker run` arguments for an interactive container
    fn run_args(spec: &InteractiveRun) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-it".to_string()];
        if spec.remove_on_exit {
            args.push("--rm".to_string());
        }
        args.push(format!("--entrypoint={}", spec.entrypoint));
        if spec.privileged {
            args.push("--privileged".to_string());
        }
        args.push(format!("--name={}", spec.name));
        args.push(spec.image.clone());
        args
    }

    fn attach_args(name: &str) -> Vec<String> {
        vec!["start".to_string(), "-ia".to_string(), name.to_string()]
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn import_image(&self, archive: &Path, name: &str) -> Result<()> {
        let command = format!("docker import {} {}", archive.display(), name);

        let output = Command::new(&self.docker_path)
            .arg("import")
            .arg(archive)
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| HarnessError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr.trim(), "Image import failed");
            return Err(HarnessError::CommandFailed {
                command,
                status: output.status.code().unwrap_or(-1),
            });
        }

        Ok(())
    }

    async fn run_interactive(&self, spec: &InteractiveRun) -> Result<Box<dyn Shell>> {
        let args = Self::run_args(spec);
        debug!(args = ?args, "Starting interactive container");
        Ok(Box::new(PtyShell::spawn(&self.docker_path, &args)?))
    }

    async fn attach_interactive(&self, name: &str) -> Result<Box<dyn Shell>> {
        let args = Self::attach_args(name);
        debug!(args = ?args, "Attaching to container");
        Ok(Box::new(PtyShell::spawn(&self.docker_path, &args)?))
    }

    async fn container_pid(&self, name: &str) -> Option<u32> {
        let details = match self
            .api
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => details,
            Err(e) => {
                debug!(container = %name, error = %e, "Container inspect failed");
                return None;
            }
        };

        // A stopped container reports pid 0
        details
            .state
            .and_then(|state| state.pid)
            .filter(|pid| *pid > 0)
            .and_then(|pid| u32::try_from(pid).ok())
    }

    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<StopOutcome> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.api.stop_container(name, Some(options)).await {
            Ok(()) => Ok(StopOutcome::Stopped),
            Err(e) => match HarnessError::from(e) {
                HarnessError::NotFound(_) => Ok(StopOutcome::AlreadyStopped),
                other => Err(other),
            },
        }
    }

    async fn remove_image(&self, name: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        let removed = self.api.remove_image(name, Some(options), None).await?;
        debug!(image = %name, layers = removed.len(), "Image removed");
        Ok(())
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<()> {
        let options = TagImageOptions { repo, tag };
        self.api.tag_image(source, Some(options)).await?;
        Ok(())
    }

    async fn push_image(&self, repo: &str, tag: &str) -> Result<()> {
        let options = PushImageOptions { tag };
        let progress = self
            .api
            .push_image(repo, Some(options), None)
            .try_collect::<Vec<_>>()
            .await?;

        // Registry failures arrive as stream items, not HTTP errors
        if let Some(message) = progress.into_iter().find_map(|info| info.error) {
            return Err(HarnessError::Runtime(message));
        }

        Ok(())
    }
}
