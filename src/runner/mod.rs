//! The sanity run pipeline
//!
//! Import → start device → start client → link → configure device →
//! configure client → checks → exit. A failing stage skips straight to exit;
//! exit always runs cleanup.

mod checks;
#[cfg(test)]
pub(crate) mod fakes;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::models::{CheckKind, CleanupWarning, PublishOutcome, RunSummary, Tally, VirtualLink};
use crate::network::HostNetwork;
use crate::registry::{Confirm, Publisher};
use crate::runtime::{ContainerRuntime, InteractiveRun, StopOutcome};
use crate::tty::{self, Shell};

pub use checks::{test_dhcp, test_dns, test_ports};

/// Pipeline stages that can abort the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    StartDevice,
    StartClient,
    Link,
    SetupDevice,
    SetupClient,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::StartDevice => "start-device",
            Stage::StartClient => "start-client",
            Stage::Link => "link",
            Stage::SetupDevice => "setup-device",
            Stage::SetupClient => "setup-client",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage failure, with the operator-facing reason
#[derive(Debug)]
struct Abort {
    stage: Stage,
    reason: &'static str,
    source: HarnessError,
}

trait AbortExt<T> {
    fn abort(self, stage: Stage, reason: &'static str) -> std::result::Result<T, Abort>;
}

impl<T> AbortExt<T> for Result<T> {
    fn abort(self, stage: Stage, reason: &'static str) -> std::result::Result<T, Abort> {
        self.map_err(|source| Abort {
            stage,
            reason,
            source,
        })
    }
}

/// Resources owned by a single run
struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    dut: Option<Box<dyn Shell>>,
    client: Option<Box<dyn Shell>>,
    tally: Tally,
    aborted_at: Option<Stage>,
    warnings: Vec<CleanupWarning>,
}

impl RunContext {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            dut: None,
            client: None,
            tally: Tally::new(),
            aborted_at: None,
            warnings: Vec::new(),
        }
    }
}

/// Drives one sanity run against injected collaborators
pub struct SanityRunner {
    config: HarnessConfig,
    runtime: Box<dyn ContainerRuntime>,
    network: Box<dyn HostNetwork>,
    confirm: Box<dyn Confirm>,
    ctx: RunContext,
}

impl SanityRunner {
    pub fn new(
        config: HarnessConfig,
        runtime: Box<dyn ContainerRuntime>,
        network: Box<dyn HostNetwork>,
        confirm: Box<dyn Confirm>,
    ) -> Self {
        Self {
            config,
            runtime,
            network,
            confirm,
            ctx: RunContext::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    /// Run every stage, then exit. Never fails: problems end up in the summary.
    pub async fn run(mut self) -> RunSummary {
        let span = info_span!("sanity", run_id = %self.ctx.run_id);

        async move {
            if let Err(abort) = self.pipeline().await {
                error!(stage = %abort.stage, error = %abort.source, "{}. Exiting.", abort.reason);
                self.ctx.aborted_at = Some(abort.stage);
            }
            self.exit_test().await
        }
        .instrument(span)
        .await
    }

    async fn pipeline(&mut self) -> std::result::Result<(), Abort> {
        // A failed import surfaces when the device fails to start
        let _ = self.import_image().await;

        self.start_device_under_test()
            .await
            .abort(Stage::StartDevice, "Issue with simple-firewall container")?;
        self.start_client()
            .await
            .abort(Stage::StartClient, "Issue with client container")?;
        self.link_containers().await?;
        self.setup_device()
            .await
            .abort(Stage::SetupDevice, "Failed to setup simple-firewall container")?;
        self.setup_client()
            .await
            .abort(Stage::SetupClient, "Failed to setup client container")?;

        info!("Running tests...");
        self.run_checks().await;
        Ok(())
    }

    /// Load the image archive into the runtime. Failure is logged, not fatal.
    pub async fn import_image(&self) -> Result<()> {
        let image = &self.config.image;
        info!(file = %image.file.display(), image = %image.name, "Importing image into Docker");

        let result = self.runtime.import_image(&image.file, &image.name).await;
        if let Err(e) = &result {
            error!(error = %e, "Failed to import image");
        }
        result
    }

    /// Boot the device with a shell entrypoint and install the marker prompt.
    /// The session is kept even if it never becomes ready, so cleanup closes it.
    pub async fn start_device_under_test(&mut self) -> Result<()> {
        info!(container = %self.config.containers.dut, "Starting simple-firewall container");

        let spec = InteractiveRun::new(&self.config.containers.dut, &self.config.image.name);
        let shell = self.runtime.run_interactive(&spec).await?;
        let shell = self.ctx.dut.insert(shell);

        let ready = prompt_regex(&self.config.containers.dut_prompt)?;
        shell.expect(&ready, self.config.timeouts.dut_ready()).await?;
        tty::install_marker(shell.as_mut(), self.config.timeouts.marker()).await
    }

    /// Start the existing client container and install the marker prompt
    pub async fn start_client(&mut self) -> Result<()> {
        info!(container = %self.config.containers.client, "Starting client container");

        let shell = self
            .runtime
            .attach_interactive(&self.config.containers.client)
            .await?;
        let shell = self.ctx.client.insert(shell);

        // The prompt is printed twice on attach
        let ready = prompt_regex(&self.config.containers.client_prompt)?;
        let timeout = self.config.timeouts.client_ready();
        shell.expect(&ready, timeout).await?;
        shell.expect(&ready, timeout).await?;
        tty::install_marker(shell.as_mut(), self.config.timeouts.marker()).await
    }

    /// OS pid of a container, `None` if it is not running or unknown
    pub async fn get_container_pid(&self, name: &str) -> Option<u32> {
        self.runtime.container_pid(name).await
    }

    /// Join the containers with a veth pair
    async fn link_containers(&mut self) -> std::result::Result<(), Abort> {
        info!("Creating veth pair to connect our containers");

        let link = self.virtual_link();
        let containers = &self.config.containers;

        self.network
            .create_veth_pair(&link)
            .await
            .abort(Stage::Link, "Failed to create veth pair")?;

        let pid = self
            .get_container_pid(&containers.client)
            .await
            .ok_or_else(|| HarnessError::NotFound(containers.client.clone()))
            .abort(Stage::Link, "Unable to get client pid")?;
        self.network
            .move_to_netns(&link.client_end, pid)
            .await
            .abort(Stage::Link, "Failed to move veth into client container")?;

        let pid = self
            .get_container_pid(&containers.dut)
            .await
            .ok_or_else(|| HarnessError::NotFound(containers.dut.clone()))
            .abort(Stage::Link, "Unable to get simple-firewall pid")?;
        self.network
            .move_to_netns(&link.dut_end, pid)
            .await
            .abort(Stage::Link, "Failed to move veth into simple-firewall container")?;

        Ok(())
    }

    /// Rename the device's link to what the firewall expects, then boot it
    pub async fn setup_device(&mut self) -> Result<()> {
        info!("Setup simple-firewall and execute /sbin/init");

        let network = &self.config.network;
        let shell = session(&mut self.ctx.dut, &self.config.containers.dut)?;

        let rename = format!(
            "ip link set dev {} name {}",
            network.dut_veth, network.dut_interface
        );
        tty::run_command(shell, &rename, self.config.timeouts.setup_command()).await?;

        // init takes over the console, no prompt follows
        shell.send_line("/sbin/init").await
    }

    /// Drop the runtime's resolv.conf and lease an address from the device
    pub async fn setup_client(&mut self) -> Result<()> {
        info!("Setting up client container");

        let timeouts = &self.config.timeouts;
        let shell = session(&mut self.ctx.client, &self.config.containers.client)?;

        tty::run_command(shell, "umount /etc/resolv.conf", timeouts.setup_command()).await?;
        let dhclient = format!("dhclient -q {}", self.config.network.client_veth);
        tty::run_command(shell, &dhclient, timeouts.dhclient()).await?;
        Ok(())
    }

    async fn run_checks(&mut self) {
        let config = &self.config;
        let tally = &mut self.ctx.tally;
        let Some(client) = self.ctx.client.as_mut() else {
            return;
        };

        let passed = test_dhcp(client.as_mut(), config).await;
        record(tally, CheckKind::Dhcp, passed);

        let passed = test_dns(client.as_mut(), config).await;
        record(tally, CheckKind::Dns, passed);

        let passed = test_ports(client.as_mut(), config).await;
        record(tally, CheckKind::Ports, passed);
    }

    /// Tear down everything this run may have created. Safe to call at any
    /// point and more than once; returns the problems it could not fix.
    pub async fn cleanup(&mut self) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();
        let close_timeout = self.config.timeouts.session_close();

        // Sessions go before their containers
        let sessions = [
            ("simple-firewall", self.ctx.dut.take()),
            ("client", self.ctx.client.take()),
        ];
        for (label, session) in sessions {
            if let Some(mut shell) = session {
                if let Err(e) = shell.close(close_timeout).await {
                    warnings.push(CleanupWarning {
                        step: format!("close {} session", label),
                        message: e.to_string(),
                        remediation: None,
                    });
                }
            }
        }

        let containers = [
            self.config.containers.client.clone(),
            self.config.containers.dut.clone(),
        ];
        for name in containers {
            if let Some(warning) = self.stop_container(&name).await {
                warnings.push(warning);
            }
        }

        if let Some(warning) = self.cleanup_image().await {
            warnings.push(warning);
        }

        if let Some(warning) = self.remove_veth_pair().await {
            warnings.push(warning);
        }

        for warning in &warnings {
            warn!(
                step = %warning.step,
                error = %warning.message,
                remediation = ?warning.remediation,
                "Cleanup incomplete"
            );
        }

        self.ctx.warnings.extend(warnings.iter().cloned());
        warnings
    }

    async fn stop_container(&self, name: &str) -> Option<CleanupWarning> {
        let timeout = std::time::Duration::from_secs(self.config.timeouts.stop_container_secs);

        match self.runtime.stop_container(name, timeout).await {
            Ok(StopOutcome::Stopped) => {
                info!(container = %name, "Stopped container");
                None
            }
            Ok(StopOutcome::AlreadyStopped) => None,
            Err(e) => Some(CleanupWarning {
                step: format!("stop {} container", name),
                message: e.to_string(),
                remediation: Some(format!("docker stop {}", name)),
            }),
        }
    }

    async fn cleanup_image(&self) -> Option<CleanupWarning> {
        let name = &self.config.image.name;

        match self.runtime.remove_image(name).await {
            Ok(()) => None,
            Err(e) if e.is_not_found() => None,
            Err(e) => Some(CleanupWarning {
                step: "remove image".to_string(),
                message: e.to_string(),
                remediation: Some(format!(
                    "Manually remove the {} image before running the test again",
                    name
                )),
            }),
        }
    }

    /// Stopping the containers normally destroys the pair; this handles runs
    /// that failed before both ends left the host namespace.
    async fn remove_veth_pair(&self) -> Option<CleanupWarning> {
        let link = self.virtual_link();

        for end in [&link.client_end, &link.dut_end] {
            match self.network.link_exists(end).await {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    return Some(veth_warning(end, e));
                }
            }

            if let Err(e) = self.network.delete_link(end).await {
                return Some(veth_warning(end, e));
            }
            info!(link = %end, "Removed veth pair");
        }

        None
    }

    /// Publish on an all-pass run, clean up and summarize
    pub async fn exit_test(&mut self) -> RunSummary {
        let publish = if self.ctx.tally.all_passed() {
            Publisher::new(
                self.runtime.as_ref(),
                &self.config.image.name,
                self.config.registry_reference(),
            )
            .offer(self.config.push, self.confirm.as_mut())
            .await
        } else {
            PublishOutcome::NotOffered
        };

        self.cleanup().await;

        let tally = self.ctx.tally.clone();
        RunSummary {
            run_id: self.ctx.run_id,
            started_at: self.ctx.started_at,
            finished_at: Utc::now(),
            skipped: tally.skipped(),
            passed: tally.passed(),
            failed: tally.failed(),
            checks: tally,
            publish,
            warnings: self.ctx.warnings.clone(),
            aborted_at: self.ctx.aborted_at.map(|stage| stage.to_string()),
        }
    }

    fn virtual_link(&self) -> VirtualLink {
        VirtualLink {
            client_end: self.config.network.client_veth.clone(),
            dut_end: self.config.network.dut_veth.clone(),
        }
    }
}

fn record(tally: &mut Tally, kind: CheckKind, passed: bool) {
    tally.record(kind, passed);
    if passed {
        info!(check = %kind, "{} test PASSED", kind);
    } else {
        info!(check = %kind, "{} test FAILED", kind);
    }
}

fn session<'a>(slot: &'a mut Option<Box<dyn Shell>>, name: &str) -> Result<&'a mut dyn Shell> {
    match slot {
        Some(shell) => Ok(shell.as_mut()),
        None => Err(HarnessError::NotFound(format!("no session for {}", name))),
    }
}

fn prompt_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| HarnessError::Runtime(format!("bad prompt pattern: {}", e)))
}

fn veth_warning(end: &str, error: HarnessError) -> CleanupWarning {
    CleanupWarning {
        step: "remove veth pair".to_string(),
        message: error.to_string(),
        remediation: Some(format!(
            "Manually delete the veth pair with 'ip link del {}' before running the test again",
            end
        )),
    }
}
