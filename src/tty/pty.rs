//! Pseudo-terminal backed shell
//!
//! The container runtime CLI insists on a real terminal for `-it`, so the
//! child gets the slave side of a PTY as its controlling terminal while we
//! keep the master. A reader thread forwards master output over a channel.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::pty::{openpty, OpenptyResult};
use regex::Regex;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{take_match, Shell};
use crate::error::{HarnessError, Result};

const READ_CHUNK: usize = 4096;

/// Interactive process attached to a PTY
pub struct PtyShell {
    /// Human readable command line, for errors
    command: String,
    child: Child,
    writer: File,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Unconsumed output
    buffer: String,
    /// Bytes of a UTF-8 sequence split across reads
    partial: Vec<u8>,
    last_match: Option<String>,
    /// Cleared once the reader sees end of output
    alive: bool,
}

impl PtyShell {
    /// Spawn `program args..` with the PTY slave as its terminal
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let command_line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        let spawn_err = |source: std::io::Error| HarnessError::Spawn {
            command: command_line.clone(),
            source,
        };

        let OpenptyResult { master, slave } =
            openpty(None, None).map_err(|e| spawn_err(std::io::Error::from(e)))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::from(clone_fd(&slave).map_err(spawn_err)?))
            .stdout(Stdio::from(clone_fd(&slave).map_err(spawn_err)?))
            .stderr(Stdio::from(slave))
            .kill_on_drop(true);

        // SAFETY: only async-signal-safe libc calls between fork and exec.
        // stdio is already redirected to the slave when this runs.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(spawn_err)?;
        // The slave copies held by `command` close here, so EOF reaches the master
        drop(command);

        let writer = File::from(master);
        let mut reader = writer.try_clone().map_err(spawn_err)?;
        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        // EIO once the slave side is gone
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            })
            .map_err(spawn_err)?;

        debug!(command = %command_line, pid = ?child.id(), "Spawned interactive session");

        Ok(Self {
            command: command_line,
            child,
            writer,
            output: rx,
            buffer: String::new(),
            partial: Vec::new(),
            last_match: None,
            alive: true,
        })
    }

}

/// Append the complete UTF-8 prefix of `bytes` to `out`, leaving a trailing
/// partial sequence in `bytes` for the next read. Invalid bytes become U+FFFD.
fn decode_utf8(bytes: &mut Vec<u8>, out: &mut String) {
    loop {
        match std::str::from_utf8(bytes) {
            Ok(text) => {
                out.push_str(text);
                bytes.clear();
                return;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&bytes[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        bytes.drain(..valid + bad);
                    }
                    None => {
                        bytes.drain(..valid);
                        return;
                    }
                }
            }
        }
    }
}

fn clone_fd(fd: &OwnedFd) -> std::io::Result<OwnedFd> {
    fd.try_clone()
}

#[async_trait]
impl Shell for PtyShell {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        trace!(command = %self.command, line = %line, "send");
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    async fn expect(&mut self, pattern: &Regex, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(matched) = take_match(&mut self.buffer, pattern) {
                trace!(pattern = %pattern, matched = %matched, "expect matched");
                self.last_match = Some(matched.clone());
                return Ok(matched);
            }

            match tokio::time::timeout_at(deadline, self.output.recv()).await {
                Ok(Some(chunk)) => {
                    self.partial.extend_from_slice(&chunk);
                    decode_utf8(&mut self.partial, &mut self.buffer);
                }
                Ok(None) => {
                    self.alive = false;
                    return Err(HarnessError::Eof {
                        pattern: pattern.to_string(),
                    });
                }
                Err(_) => {
                    debug!(
                        pattern = %pattern,
                        pending = %self.buffer,
                        "expect timed out"
                    );
                    return Err(HarnessError::Timeout {
                        pattern: pattern.to_string(),
                        timeout,
                    });
                }
            }
        }
    }

    fn last_match(&self) -> Option<&str> {
        self.last_match.as_deref()
    }

    fn is_alive(&mut self) -> bool {
        if !self.alive {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            _ => {
                self.alive = false;
                false
            }
        }
    }

    async fn close(&mut self, timeout: Duration) -> Result<()> {
        if self.is_alive() {
            // The shell may already be gone; a failed write is fine
            let _ = self.send_line("exit").await;
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                debug!(command = %self.command, status = ?status.ok(), "Session exited");
            }
            Err(_) => {
                warn!(command = %self.command, "Session did not exit, killing it");
                self.child.kill().await?;
            }
        }

        self.alive = false;
        Ok(())
    }
}
