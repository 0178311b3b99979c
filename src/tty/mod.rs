//! Interactive shell sessions inside containers
//!
//! A [`Shell`] is a line-oriented conversation with an interactive process:
//! send a line, then wait for a pattern to show up in its output. The
//! harness swaps the shell prompt for an exit-status marker so every command
//! reports how it ended.

mod pty;

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{HarnessError, Result};

pub use pty::PtyShell;

/// Shell assignment that turns the prompt into the exit-status marker
pub const MARKER_PS1: &str = "PS1='__rc=$?__# '";

/// Matches the marker prompt and captures the exit status
pub static EXIT_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__rc=(\d+)__# ").expect("static regex"));

/// An interactive shell connection
#[async_trait]
pub trait Shell: Send {
    /// Write one line of input
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// Wait until `pattern` matches the pending output; returns the matched text.
    /// Output up to the end of the match is consumed.
    async fn expect(&mut self, pattern: &Regex, timeout: Duration) -> Result<String>;

    /// Text matched by the last successful `expect`
    fn last_match(&self) -> Option<&str>;

    fn is_alive(&mut self) -> bool;

    /// Ask the shell to exit, then make sure the process is gone
    async fn close(&mut self, timeout: Duration) -> Result<()>;
}

/// Parse the exit status out of a marker prompt
pub fn parse_exit_status(text: &str) -> Option<i32> {
    EXIT_MARKER
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Install the marker prompt and wait for the first one
pub async fn install_marker(shell: &mut dyn Shell, timeout: Duration) -> Result<()> {
    shell.send_line(MARKER_PS1).await?;
    shell.expect(&EXIT_MARKER, timeout).await?;
    Ok(())
}

/// Wait for the next marker and return the exit status it carries
pub async fn expect_exit_status(shell: &mut dyn Shell, timeout: Duration) -> Result<i32> {
    let matched = shell.expect(&EXIT_MARKER, timeout).await?;
    parse_exit_status(&matched)
        .ok_or_else(|| HarnessError::Runtime(format!("unparseable prompt marker: {:?}", matched)))
}

/// Run a command and return its exit status
pub async fn run_command(shell: &mut dyn Shell, command: &str, timeout: Duration) -> Result<i32> {
    shell.send_line(command).await?;
    expect_exit_status(shell, timeout).await
}

/// Search `buffer` for `pattern`; on a match, drain through the end of the
/// match and return the matched text.
pub(crate) fn take_match(buffer: &mut String, pattern: &Regex) -> Option<String> {
    let (end, text) = {
        let m = pattern.find(buffer)?;
        (m.end(), m.as_str().to_string())
    };
    buffer.drain(..end);
    Some(text)
}
