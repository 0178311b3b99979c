//! In-memory stand-ins for the container runtime, the shells and the host
//! network, so the pipeline can run without Docker or root.

use std::collections::{BTreeSet, HashMap};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::error::{HarnessError, Result};
use crate::models::VirtualLink;
use crate::network::HostNetwork;
use crate::runtime::{ContainerRuntime, InteractiveRun, StopOutcome};
use crate::tty::{take_match, Shell};

/// Maps a command line to the exit status the shell reports, `None` = no prompt
pub type Responder = Arc<dyn Fn(&str) -> Option<i32> + Send + Sync>;

pub const DUT_BANNER: &str = "bash-4.4# ";
/// The client prints its prompt twice on attach
pub const CLIENT_BANNER: &str = "root@4f2a9c:/# \r\nroot@4f2a9c:/# ";

/// Every command succeeds, port probes really connect
pub fn healthy() -> Responder {
    Arc::new(|line: &str| match netcat_target(line) {
        Some(addr) => Some(probe(addr)),
        None if line == "/sbin/init" => None,
        None => Some(0),
    })
}

/// Like [`healthy`] but port probes answer from `open`, without connecting
pub fn ports_open(open: Vec<u16>) -> Responder {
    Arc::new(move |line: &str| match netcat_target(line) {
        Some(addr) => Some(if open.contains(&addr.port()) { 0 } else { 1 }),
        None if line == "/sbin/init" => None,
        None => Some(0),
    })
}

/// `n` distinct loopback ports that nothing is listening on right now
pub fn free_ports<const N: usize>() -> [u16; N] {
    let listeners: Vec<std::net::TcpListener> = (0..N)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let mut ports = [0; N];
    for (port, listener) in ports.iter_mut().zip(&listeners) {
        *port = listener.local_addr().unwrap().port();
    }
    ports
}

/// `netcat -z -w N ADDR PORT` -> ADDR:PORT
fn netcat_target(line: &str) -> Option<SocketAddr> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["netcat", "-z", "-w", _, addr, port] => format!("{}:{}", addr, port).parse().ok(),
        _ => None,
    }
}

fn probe(addr: SocketAddr) -> i32 {
    match TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// Scripted shell: replies to each line with an echo and a marker prompt
pub struct FakeShell {
    pending: String,
    responder: Responder,
    sent: Arc<Mutex<Vec<String>>>,
    last_match: Option<String>,
    alive: bool,
}

impl FakeShell {
    pub fn new(banner: &str, responder: Responder, sent: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            pending: banner.to_string(),
            responder,
            sent,
            last_match: None,
            alive: true,
        }
    }

    /// A process that died right away, e.g. `docker run` of a missing image
    pub fn dead(sent: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            alive: false,
            ..Self::new("Unable to find image\r\n", Arc::new(|_: &str| None), sent)
        }
    }
}

#[async_trait]
impl Shell for FakeShell {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        if !self.alive {
            return Err(HarnessError::Io(std::io::ErrorKind::BrokenPipe.into()));
        }
        self.sent.lock().unwrap().push(line.to_string());

        if line == "exit" {
            self.alive = false;
            return Ok(());
        }

        self.pending.push_str(line);
        self.pending.push_str("\r\n");
        if line.starts_with("PS1=") {
            self.pending.push_str("__rc=0__# ");
        } else if let Some(status) = (self.responder)(line) {
            self.pending.push_str(&format!("__rc={}__# ", status));
        }
        Ok(())
    }

    async fn expect(&mut self, pattern: &Regex, timeout: Duration) -> Result<String> {
        if let Some(matched) = take_match(&mut self.pending, pattern) {
            self.last_match = Some(matched.clone());
            return Ok(matched);
        }
        if !self.alive {
            return Err(HarnessError::Eof {
                pattern: pattern.to_string(),
            });
        }
        Err(HarnessError::Timeout {
            pattern: pattern.to_string(),
            timeout,
        })
    }

    fn last_match(&self) -> Option<&str> {
        self.last_match.as_deref()
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    async fn close(&mut self, _timeout: Duration) -> Result<()> {
        if self.alive {
            self.send_line("exit").await?;
        }
        Ok(())
    }
}

struct RuntimeState {
    images: BTreeSet<String>,
    running: BTreeSet<String>,
    pushed: Vec<String>,
    attached: Vec<String>,
    sent: HashMap<String, Arc<Mutex<Vec<String>>>>,
    dut_banner: String,
    client_banner: String,
    responder: Responder,
    fail_import: bool,
    fail_push: bool,
    fail_remove: bool,
    hide_pids: bool,
}

/// Container runtime kept in memory. Clones share state.
#[derive(Clone)]
pub struct FakeRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::with_responder(healthy())
    }

    pub fn with_responder(responder: Responder) -> Self {
        Self {
            state: Arc::new(Mutex::new(RuntimeState {
                images: BTreeSet::new(),
                running: BTreeSet::new(),
                pushed: Vec::new(),
                attached: Vec::new(),
                sent: HashMap::new(),
                dut_banner: DUT_BANNER.to_string(),
                client_banner: CLIENT_BANNER.to_string(),
                responder,
                fail_import: false,
                fail_push: false,
                fail_remove: false,
                hide_pids: false,
            })),
        }
    }

    pub fn add_image(&self, name: &str) {
        self.state.lock().unwrap().images.insert(name.to_string());
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.state.lock().unwrap().images.contains(name)
    }

    pub fn images(&self) -> Vec<String> {
        self.state.lock().unwrap().images.iter().cloned().collect()
    }

    pub fn running(&self) -> Vec<String> {
        self.state.lock().unwrap().running.iter().cloned().collect()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.state.lock().unwrap().pushed.clone()
    }

    pub fn attached(&self) -> Vec<String> {
        self.state.lock().unwrap().attached.clone()
    }

    /// Lines sent to the shell of container `name`
    pub fn sent(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .sent
            .get(name)
            .map(|lines| lines.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// The device boots without ever showing its prompt
    pub fn silent_dut(&self) {
        self.state.lock().unwrap().dut_banner = "booting...\r\n".to_string();
    }

    /// The client shows its prompt only once on attach
    pub fn single_client_prompt(&self) {
        self.state.lock().unwrap().client_banner = "root@4f2a9c:/# ".to_string();
    }

    pub fn fail_import(&self) {
        self.state.lock().unwrap().fail_import = true;
    }

    pub fn fail_push(&self) {
        self.state.lock().unwrap().fail_push = true;
    }

    pub fn fail_remove(&self) {
        self.state.lock().unwrap().fail_remove = true;
    }

    pub fn hide_pids(&self) {
        self.state.lock().unwrap().hide_pids = true;
    }

    fn sent_log(state: &mut RuntimeState, name: &str) -> Arc<Mutex<Vec<String>>> {
        state.sent.entry(name.to_string()).or_default().clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn import_image(&self, archive: &Path, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_import {
            return Err(HarnessError::CommandFailed {
                command: format!("docker import {} {}", archive.display(), name),
                status: 1,
            });
        }
        state.images.insert(name.to_string());
        Ok(())
    }

    async fn run_interactive(&self, spec: &InteractiveRun) -> Result<Box<dyn Shell>> {
        let mut state = self.state.lock().unwrap();
        let sent = Self::sent_log(&mut state, &spec.name);

        if !state.images.contains(&spec.image) {
            return Ok(Box::new(FakeShell::dead(sent)));
        }

        state.running.insert(spec.name.clone());
        Ok(Box::new(FakeShell::new(
            &state.dut_banner,
            state.responder.clone(),
            sent,
        )))
    }

    async fn attach_interactive(&self, name: &str) -> Result<Box<dyn Shell>> {
        let mut state = self.state.lock().unwrap();
        let sent = Self::sent_log(&mut state, name);
        state.attached.push(name.to_string());
        state.running.insert(name.to_string());
        Ok(Box::new(FakeShell::new(
            &state.client_banner,
            state.responder.clone(),
            sent,
        )))
    }

    async fn container_pid(&self, name: &str) -> Option<u32> {
        let state = self.state.lock().unwrap();
        if state.hide_pids {
            return None;
        }
        state
            .running
            .iter()
            .position(|running| running == name)
            .map(|idx| 1000 + idx as u32)
    }

    async fn stop_container(&self, name: &str, _timeout: Duration) -> Result<StopOutcome> {
        if self.state.lock().unwrap().running.remove(name) {
            Ok(StopOutcome::Stopped)
        } else {
            Ok(StopOutcome::AlreadyStopped)
        }
    }

    async fn remove_image(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remove {
            return Err(HarnessError::Runtime("image is in use".to_string()));
        }
        if state.images.remove(name) {
            Ok(())
        } else {
            Err(HarnessError::NotFound(format!("No such image: {}", name)))
        }
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.images.contains(source) {
            return Err(HarnessError::NotFound(format!("No such image: {}", source)));
        }
        state.images.insert(format!("{}:{}", repo, tag));
        Ok(())
    }

    async fn push_image(&self, repo: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_push {
            return Err(HarnessError::Runtime("connection refused".to_string()));
        }
        state.pushed.push(format!("{}:{}", repo, tag));
        Ok(())
    }
}

#[derive(Default)]
struct NetworkState {
    /// Interfaces present in the host namespace
    host_links: BTreeSet<String>,
    /// Interface -> pid it was moved to
    moved: HashMap<String, u32>,
    peers: HashMap<String, String>,
    fail_delete: bool,
}

/// Host namespace kept in memory. Clones share state.
#[derive(Clone, Default)]
pub struct FakeNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host_links(&self) -> Vec<String> {
        self.state.lock().unwrap().host_links.iter().cloned().collect()
    }

    pub fn moved(&self) -> HashMap<String, u32> {
        self.state.lock().unwrap().moved.clone()
    }

    /// Leave a veth pair behind, as an aborted earlier run would
    pub fn add_stale_pair(&self, a: &str, b: &str) {
        let mut state = self.state.lock().unwrap();
        state.host_links.insert(a.to_string());
        state.host_links.insert(b.to_string());
        state.peers.insert(a.to_string(), b.to_string());
        state.peers.insert(b.to_string(), a.to_string());
    }

    pub fn fail_delete(&self) {
        self.state.lock().unwrap().fail_delete = true;
    }
}

#[async_trait]
impl HostNetwork for FakeNetwork {
    async fn create_veth_pair(&self, link: &VirtualLink) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.host_links.contains(&link.client_end) || state.host_links.contains(&link.dut_end) {
                return Err(HarnessError::CommandFailed {
                    command: format!("ip link add {} type veth peer name {}", link.client_end, link.dut_end),
                    status: 2,
                });
            }
        }
        self.add_stale_pair(&link.client_end, &link.dut_end);
        Ok(())
    }

    async fn move_to_netns(&self, name: &str, pid: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.host_links.remove(name) {
            return Err(HarnessError::CommandFailed {
                command: format!("ip link set netns {} {}", pid, name),
                status: 1,
            });
        }
        state.moved.insert(name.to_string(), pid);
        Ok(())
    }

    async fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().host_links.contains(name))
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_delete || !state.host_links.remove(name) {
            return Err(HarnessError::CommandFailed {
                command: format!("ip link del {}", name),
                status: 1,
            });
        }
        // Deleting one end of a veth pair deletes its peer
        if let Some(peer) = state.peers.remove(name) {
            state.host_links.remove(&peer);
            state.peers.remove(&peer);
        }
        Ok(())
    }
}
