//! Data models for the sanity harness
//!
//! This module defines the test tally, the port allow-list, the virtual link
//! and the run summary reported at exit.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{HarnessError, Result};

// ============================================================================
// Checks
// ============================================================================

/// The checks run from the client container
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Dhcp,
    Dns,
    Ports,
}

impl CheckKind {
    pub const ALL: [CheckKind; 3] = [CheckKind::Dhcp, CheckKind::Dns, CheckKind::Ports];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Dhcp => "DHCP",
            CheckKind::Dns => "DNS",
            CheckKind::Ports => "PORTS",
        }
    }
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Skipped,
    Passed,
    Failed,
}

/// Per-check results for a run. Every check starts out skipped.
#[derive(Debug, Clone, Serialize)]
pub struct Tally {
    results: BTreeMap<CheckKind, CheckStatus>,
}

impl Tally {
    pub const TOTAL: usize = CheckKind::ALL.len();

    pub fn new() -> Self {
        Self {
            results: CheckKind::ALL
                .iter()
                .map(|kind| (*kind, CheckStatus::Skipped))
                .collect(),
        }
    }

    /// Record the outcome of a check, replacing any earlier outcome
    pub fn record(&mut self, kind: CheckKind, passed: bool) {
        let status = if passed {
            CheckStatus::Passed
        } else {
            CheckStatus::Failed
        };
        self.results.insert(kind, status);
    }

    pub fn status(&self, kind: CheckKind) -> CheckStatus {
        self.results
            .get(&kind)
            .copied()
            .unwrap_or(CheckStatus::Skipped)
    }

    fn count(&self, status: CheckStatus) -> usize {
        self.results.values().filter(|s| **s == status).count()
    }

    pub fn skipped(&self) -> usize {
        self.count(CheckStatus::Skipped)
    }

    pub fn passed(&self) -> usize {
        self.count(CheckStatus::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(CheckStatus::Failed)
    }

    pub fn all_passed(&self) -> bool {
        self.passed() == Self::TOTAL
    }
}

impl Default for Tally {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Allow-list
// ============================================================================

/// Ports the firewall is expected to let through, in file order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    ports: Vec<u16>,
}

impl AllowList {
    /// Parse one port per line; surrounding whitespace and blank lines are ignored
    pub fn parse(contents: &str) -> Result<Self> {
        let mut ports = Vec::new();

        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let port = line.parse::<u16>().map_err(|_| {
                HarnessError::AllowList(format!("line {}: invalid port {:?}", lineno + 1, line))
            })?;
            ports.push(port);
        }

        Ok(Self { ports })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            HarnessError::AllowList(format!("unable to read {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}

// ============================================================================
// Virtual link
// ============================================================================

/// A veth pair: one end per container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualLink {
    /// End moved into the client namespace
    pub client_end: String,
    /// End moved into the device namespace
    pub dut_end: String,
}

// ============================================================================
// Run summary
// ============================================================================

/// Non-fatal problem hit during teardown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    pub step: String,
    pub message: String,
    /// What the operator should do by hand
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    /// Not every check passed
    NotOffered,
    Declined,
    Pushed,
    Failed,
}

/// Everything reported once the run is over
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub skipped: usize,
    pub passed: usize,
    pub failed: usize,
    pub checks: Tally,
    pub publish: PublishOutcome,
    pub warnings: Vec<CleanupWarning>,
    /// Stage that aborted the pipeline, if any
    pub aborted_at: Option<String>,
}

impl RunSummary {
    pub fn all_passed(&self) -> bool {
        self.checks.all_passed()
    }
}
