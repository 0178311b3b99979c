//! Container runtime boundary
//!
//! Everything the harness needs from the container engine:
//! - Importing the image under test
//! - Starting containers with an interactive shell attached
//! - Looking up container process ids
//! - Stopping containers and removing, tagging and pushing images

mod docker;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::tty::Shell;

pub use docker::DockerRuntime;

/// How to launch the device under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractiveRun {
    pub name: String,
    pub image: String,
    /// Shell used as entrypoint so networking can be set up before init runs
    pub entrypoint: String,
    pub privileged: bool,
    /// Remove the container once it stops
    pub remove_on_exit: bool,
}

impl InteractiveRun {
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            entrypoint: "/bin/bash".to_string(),
            privileged: true,
            remove_on_exit: true,
        }
    }
}

/// Result of asking the runtime to stop a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// Not running or not present
    AlreadyStopped,
}

/// Container engine operations used by the harness
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Import a root filesystem archive as image `name`
    async fn import_image(&self, archive: &Path, name: &str) -> Result<()>;

    /// Create and start a container with an interactive terminal attached
    async fn run_interactive(&self, spec: &InteractiveRun) -> Result<Box<dyn Shell>>;

    /// Start an existing container and attach to its terminal
    async fn attach_interactive(&self, name: &str) -> Result<Box<dyn Shell>>;

    /// OS pid of a running container, `None` when it cannot be determined
    async fn container_pid(&self, name: &str) -> Option<u32>;

    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<StopOutcome>;

    /// Force-remove an image; `NotFound` when it does not exist
    async fn remove_image(&self, name: &str) -> Result<()>;

    /// Tag `source` as `repo:tag`
    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<()>;

    async fn push_image(&self, repo: &str, tag: &str) -> Result<()>;
}
