//! Configuration module for the sanity harness
//!
//! Supports configuration via:
//! - YAML/TOML config files (`config/sanity.*`, `/etc/sanity/config.*`)
//! - An explicit file passed on the command line
//! - Environment variables (with SANITY__ prefix)

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Also append JSON logs to this file
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Exit non-zero unless every check passed
    #[serde(default)]
    pub strict_exit_code: bool,

    /// What to do with the image after an all-pass run
    #[serde(default)]
    pub push: PushPolicy,

    /// Image under test
    #[serde(default)]
    pub image: ImageConfig,

    /// Container names and prompts
    #[serde(default)]
    pub containers: ContainersConfig,

    /// Virtual link between the containers
    #[serde(default)]
    pub network: NetworkConfig,

    /// Check parameters
    #[serde(default)]
    pub checks: ChecksConfig,

    /// Wait bounds, in seconds
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Publish behaviour after all checks pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PushPolicy {
    /// Prompt on stdin
    #[default]
    Ask,
    Always,
    Never,
}

impl std::str::FromStr for PushPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ask" => Ok(PushPolicy::Ask),
            "always" => Ok(PushPolicy::Always),
            "never" => Ok(PushPolicy::Never),
            other => Err(format!("unknown push policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Root filesystem archive produced by the build
    #[serde(default = "default_image_file")]
    pub file: PathBuf,

    /// Name the archive is imported under
    #[serde(default = "default_image_name")]
    pub name: String,

    /// Registry the image is published to
    #[serde(default = "default_registry")]
    pub registry: String,

    /// Docker socket path (local defaults when unset)
    #[serde(default)]
    pub docker_socket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainersConfig {
    /// Name given to the device under test
    #[serde(default = "default_dut_name")]
    pub dut: String,

    /// Pre-created client container
    #[serde(default = "default_client_name")]
    pub client: String,

    /// Shell prompt of the freshly started device
    #[serde(default = "default_dut_prompt")]
    pub dut_prompt: String,

    /// Shell prompt of the client container
    #[serde(default = "default_client_prompt")]
    pub client_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// veth end moved into the client
    #[serde(default = "default_client_veth")]
    pub client_veth: String,

    /// veth end moved into the device
    #[serde(default = "default_dut_veth")]
    pub dut_veth: String,

    /// Name the device expects for its LAN interface
    #[serde(default = "default_dut_interface")]
    pub dut_interface: String,

    /// Host address reachable from the client (docker0)
    #[serde(default = "default_host_bridge_addr")]
    pub host_bridge_addr: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksConfig {
    /// Address prefix a DHCP lease must fall in
    #[serde(default = "default_dhcp_prefix")]
    pub dhcp_prefix: String,

    /// Host name resolved by the DNS check
    #[serde(default = "default_dns_host")]
    pub dns_host: String,

    /// Ports the firewall must let through
    #[serde(default = "default_allow_list")]
    pub allow_list: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_dut_ready")]
    pub dut_ready_secs: u64,

    #[serde(default = "default_client_ready")]
    pub client_ready_secs: u64,

    /// Wait for the marker right after PS1 is set
    #[serde(default = "default_marker")]
    pub marker_secs: u64,

    #[serde(default = "default_command")]
    pub setup_command_secs: u64,

    #[serde(default = "default_dhclient")]
    pub dhclient_secs: u64,

    #[serde(default = "default_command")]
    pub check_secs: u64,

    /// Passed to `netcat -w`
    #[serde(default = "default_port_probe")]
    pub port_probe_secs: u64,

    #[serde(default = "default_command")]
    pub stop_container_secs: u64,

    #[serde(default = "default_marker")]
    pub session_close_secs: u64,
}

impl TimeoutConfig {
    pub fn dut_ready(&self) -> Duration {
        Duration::from_secs(self.dut_ready_secs)
    }

    pub fn client_ready(&self) -> Duration {
        Duration::from_secs(self.client_ready_secs)
    }

    pub fn marker(&self) -> Duration {
        Duration::from_secs(self.marker_secs)
    }

    pub fn setup_command(&self) -> Duration {
        Duration::from_secs(self.setup_command_secs)
    }

    pub fn dhclient(&self) -> Duration {
        Duration::from_secs(self.dhclient_secs)
    }

    pub fn check(&self) -> Duration {
        Duration::from_secs(self.check_secs)
    }

    pub fn session_close(&self) -> Duration {
        Duration::from_secs(self.session_close_secs)
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_image_file() -> PathBuf {
    PathBuf::from("tmp/deploy/images/genericx86-64/simple-firewall-genericx86-64.tar.bz2")
}

fn default_image_name() -> String {
    "simple-firewall".to_string()
}

fn default_registry() -> String {
    "localhost:5000".to_string()
}

fn default_dut_name() -> String {
    "simple-firewall".to_string()
}

fn default_client_name() -> String {
    "debian".to_string()
}

fn default_dut_prompt() -> String {
    r"bash-[0-9.]+#".to_string()
}

fn default_client_prompt() -> String {
    "root@.*:/#".to_string()
}

fn default_client_veth() -> String {
    "test-veth0".to_string()
}

fn default_dut_veth() -> String {
    "test-veth1".to_string()
}

fn default_dut_interface() -> String {
    "enp2s0".to_string()
}

fn default_host_bridge_addr() -> Ipv4Addr {
    Ipv4Addr::new(172, 17, 0, 1)
}

fn default_dhcp_prefix() -> String {
    "192.168.10.".to_string()
}

fn default_dns_host() -> String {
    "yahoo.com".to_string()
}

fn default_allow_list() -> PathBuf {
    PathBuf::from("layers/simple-firewall/recipes-core/firewall-data/files/ports.allow")
}

fn default_dut_ready() -> u64 {
    20
}

fn default_client_ready() -> u64 {
    10
}

fn default_marker() -> u64 {
    5
}

fn default_command() -> u64 {
    10
}

fn default_dhclient() -> u64 {
    60
}

fn default_port_probe() -> u64 {
    3
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            file: default_image_file(),
            name: default_image_name(),
            registry: default_registry(),
            docker_socket: None,
        }
    }
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            dut: default_dut_name(),
            client: default_client_name(),
            dut_prompt: default_dut_prompt(),
            client_prompt: default_client_prompt(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            client_veth: default_client_veth(),
            dut_veth: default_dut_veth(),
            dut_interface: default_dut_interface(),
            host_bridge_addr: default_host_bridge_addr(),
        }
    }
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            dhcp_prefix: default_dhcp_prefix(),
            dns_host: default_dns_host(),
            allow_list: default_allow_list(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dut_ready_secs: default_dut_ready(),
            client_ready_secs: default_client_ready(),
            marker_secs: default_marker(),
            setup_command_secs: default_command(),
            dhclient_secs: default_dhclient(),
            check_secs: default_command(),
            port_probe_secs: default_port_probe(),
            stop_container_secs: default_command(),
            session_close_secs: default_marker(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            strict_exit_code: false,
            push: PushPolicy::default(),
            image: ImageConfig::default(),
            containers: ContainersConfig::default(),
            network: NetworkConfig::default(),
            checks: ChecksConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from files and environment variables
    pub fn load(extra_file: Option<&Path>) -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&HarnessConfig::default())?)
            .add_source(config::File::with_name("config/sanity").required(false))
            .add_source(config::File::with_name("/etc/sanity/config").required(false));

        if let Some(path) = extra_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            // Override with environment variables (SANITY_ prefix)
            .add_source(
                config::Environment::with_prefix("SANITY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let harness_config: HarnessConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        harness_config.validate()?;

        Ok(harness_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.image.name.is_empty() {
            anyhow::bail!("Image name cannot be empty");
        }

        if self.containers.dut == self.containers.client {
            anyhow::bail!("Device and client containers must have different names");
        }

        if self.network.client_veth == self.network.dut_veth {
            anyhow::bail!("veth endpoints must have different names");
        }

        // Linux caps interface names at 15 bytes
        for name in [
            &self.network.client_veth,
            &self.network.dut_veth,
            &self.network.dut_interface,
        ] {
            if name.is_empty() || name.len() > 15 {
                anyhow::bail!("Invalid interface name: {:?}", name);
            }
        }

        for pattern in [&self.containers.dut_prompt, &self.containers.client_prompt] {
            regex::Regex::new(pattern)
                .with_context(|| format!("Invalid prompt pattern: {}", pattern))?;
        }

        let t = &self.timeouts;
        if [
            t.dut_ready_secs,
            t.client_ready_secs,
            t.marker_secs,
            t.setup_command_secs,
            t.dhclient_secs,
            t.check_secs,
            t.port_probe_secs,
        ]
        .contains(&0)
        {
            anyhow::bail!("Timeouts cannot be 0");
        }

        if t.port_probe_secs >= t.check_secs {
            anyhow::bail!("Port probe timeout must be shorter than the check timeout");
        }

        Ok(())
    }

    /// Registry reference the image is pushed as
    pub fn registry_reference(&self) -> String {
        format!("{}/{}", self.image.registry, self.image.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::default();
        assert_eq!(config.image.name, "simple-firewall");
        assert_eq!(config.containers.client, "debian");
        assert_eq!(config.network.host_bridge_addr, Ipv4Addr::new(172, 17, 0, 1));
        assert_eq!(config.timeouts.dhclient(), Duration::from_secs(60));
        assert_eq!(config.push, PushPolicy::Ask);
        assert!(!config.strict_exit_code);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_registry_reference() {
        let config = HarnessConfig::default();
        assert_eq!(config.registry_reference(), "localhost:5000/simple-firewall");
    }

    #[test]
    fn test_validation() {
        let mut config = HarnessConfig::default();
        config.network.dut_veth = config.network.client_veth.clone();
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.network.dut_interface = "an-interface-name-too-long".to_string();
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.timeouts.check_secs = 0;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.containers.client_prompt = "root@(".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_push_policy_parse() {
        assert_eq!("ALWAYS".parse::<PushPolicy>(), Ok(PushPolicy::Always));
        assert_eq!("never".parse::<PushPolicy>(), Ok(PushPolicy::Never));
        assert!("sometimes".parse::<PushPolicy>().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(
            &path,
            "strict_exit_code = true\npush = \"never\"\n[checks]\ndns_host = \"example.org\"\n",
        )
        .unwrap();

        let config = HarnessConfig::load(Some(&path)).unwrap();
        assert!(config.strict_exit_code);
        assert_eq!(config.push, PushPolicy::Never);
        assert_eq!(config.checks.dns_host, "example.org");
        assert_eq!(config.checks.dhcp_prefix, "192.168.10.");
    }
}
