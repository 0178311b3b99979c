//! Host-side virtual link management
//!
//! The two containers are joined by a plain veth pair instead of a runtime
//! network, so there is no bridge on the host between them.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::models::VirtualLink;

/// Link operations in the host network namespace
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Create `link` as a veth pair
    async fn create_veth_pair(&self, link: &VirtualLink) -> Result<()>;

    /// Move interface `name` into the network namespace of process `pid`
    async fn move_to_netns(&self, name: &str, pid: u32) -> Result<()>;

    async fn link_exists(&self, name: &str) -> Result<bool>;

    async fn delete_link(&self, name: &str) -> Result<()>;
}

/// `ip` (iproute2) backed implementation
pub struct IpRoute2 {
    ip_path: String,
}

impl IpRoute2 {
    pub fn new() -> Self {
        let ip_path = which::which("ip")
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| "/sbin/ip".to_string());

        Self { ip_path }
    }

    /// Run `ip args..` with output discarded and return its exit code
    async fn run(&self, args: &[&str]) -> Result<i32> {
        debug!(args = ?args, "ip");

        let status = Command::new(&self.ip_path)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| HarnessError::Spawn {
                command: format!("ip {}", args.join(" ")),
                source,
            })?;

        Ok(status.code().unwrap_or(-1))
    }

    async fn run_checked(&self, args: &[&str]) -> Result<()> {
        match self.run(args).await? {
            0 => Ok(()),
            status => Err(HarnessError::CommandFailed {
                command: format!("ip {}", args.join(" ")),
                status,
            }),
        }
    }
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostNetwork for IpRoute2 {
    async fn create_veth_pair(&self, link: &VirtualLink) -> Result<()> {
        self.run_checked(&[
            "link",
            "add",
            link.client_end.as_str(),
            "type",
            "veth",
            "peer",
            "name",
            link.dut_end.as_str(),
        ])
        .await?;

        info!(
            client_end = %link.client_end,
            dut_end = %link.dut_end,
            "veth pair created"
        );
        Ok(())
    }

    async fn move_to_netns(&self, name: &str, pid: u32) -> Result<()> {
        let pid = pid.to_string();
        self.run_checked(&["link", "set", "netns", pid.as_str(), name]).await
    }

    async fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.run(&["link", "show", name]).await? == 0)
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        self.run_checked(&["link", "del", name]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_route2_creation() {
        let ip = IpRoute2::new();
        assert!(!ip.ip_path.is_empty());
    }

    #[tokio::test]
    async fn test_missing_link_does_not_exist() {
        let ip = IpRoute2::new();
        if which::which("ip").is_err() {
            return;
        }
        let exists = ip.link_exists("sanity-nolink0").await.unwrap();
        assert!(!exists);
    }
}
