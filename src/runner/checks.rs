//! Checks run from the client shell
//!
//! Each check reports pass/fail; none of them can abort the run.

use std::net::Ipv4Addr;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::error::Result;
use crate::models::AllowList;
use crate::tty::{self, Shell};

/// The client leased an address from the device's DHCP server
pub async fn test_dhcp(shell: &mut dyn Shell, config: &HarnessConfig) -> bool {
    let command = dhcp_command(&config.network.client_veth, &config.checks.dhcp_prefix);
    command_succeeds(shell, &command, config).await
}

/// The client resolves a public name through the device
pub async fn test_dns(shell: &mut dyn Shell, config: &HarnessConfig) -> bool {
    let command = format!("host {}", config.checks.dns_host);
    command_succeeds(shell, &command, config).await
}

/// Every allow-listed port on the host is reachable from the client
pub async fn test_ports(shell: &mut dyn Shell, config: &HarnessConfig) -> bool {
    let allow_list = match AllowList::load(&config.checks.allow_list).await {
        Ok(list) => list,
        Err(e) => {
            error!(error = %e, "Unable to read ports.allow file");
            return false;
        }
    };

    let mut passed = true;
    for &port in allow_list.ports() {
        match probe_port(shell, config, port).await {
            Ok(true) => debug!(port, "Port reachable"),
            Ok(false) => {
                info!(port, "Failed to access port");
                passed = false;
            }
            Err(e) => {
                warn!(port, error = %e, "Port probe did not complete");
                passed = false;
            }
        }
    }

    passed
}

async fn command_succeeds(shell: &mut dyn Shell, command: &str, config: &HarnessConfig) -> bool {
    match tty::run_command(shell, command, config.timeouts.check()).await {
        Ok(status) => {
            debug!(command = %command, status, "Check command finished");
            status == 0
        }
        Err(e) => {
            warn!(command = %command, error = %e, "Check command did not complete");
            false
        }
    }
}

/// Listen on the host side of `port` and let the client try to connect
async fn probe_port(shell: &mut dyn Shell, config: &HarnessConfig, port: u16) -> Result<bool> {
    let addr = config.network.host_bridge_addr;

    // A port we cannot listen on is not proven reachable, even if another
    // process answers on it
    let listener = match TcpListener::bind((addr, port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(%addr, port, error = %e, "Could not listen on host port");
            return Ok(false);
        }
    };
    let acceptor = tokio::spawn(async move {
        while listener.accept().await.is_ok() {}
    });

    let command = netcat_command(addr, port, config.timeouts.port_probe_secs);
    let status = tty::run_command(shell, &command, config.timeouts.check()).await;

    acceptor.abort();
    let _ = acceptor.await;

    Ok(status? == 0)
}

fn dhcp_command(interface: &str, prefix: &str) -> String {
    format!(
        "ip address show {} | grep -q '{}'",
        interface,
        prefix.replace('.', r"\.")
    )
}

fn netcat_command(addr: Ipv4Addr, port: u16, wait_secs: u64) -> String {
    format!("netcat -z -w {} {} {}", wait_secs, addr, port)
}
