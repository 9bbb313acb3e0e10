//! Test execution phase
//!
//! Runs the per-task (or project default) test command with a bounded
//! timeout, captures output, and parses a summary. The parser understands
//! cargo's `test result:` line and a generic `N passed`/`N failed` shape;
//! anything else falls back to exit-code-only reporting.

use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::info;

use crate::error::{NecroError, Result};

use super::guard::WorkspaceGuard;

/// Parsed outcome of one test run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub command: String,
    pub exit_code: i32,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    #[serde(default)]
    pub failed_test_details: Vec<String>,
    pub stdout: String,
    pub stderr: String,
}

impl TestReport {
    pub fn all_passed(&self) -> bool {
        self.exit_code == 0 && self.failed == 0
    }
}

static CARGO_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"test result: \w+\. (?P<passed>\d+) passed; (?P<failed>\d+) failed; (?P<ignored>\d+) ignored",
    )
    .expect("cargo summary regex")
});

static GENERIC_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<passed>\d+) passed(?:[,;]\s*(?P<failed>\d+) failed)?").expect("generic regex")
});

static FAILED_TEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^test (?P<name>\S+) \.\.\. FAILED$").expect("failed test regex"));

/// Run the test command through `sh -c` inside the workspace.
pub async fn run_tests(
    guard: &WorkspaceGuard,
    workdir: &Path,
    command: &str,
    timeout: Duration,
) -> Result<TestReport> {
    guard.check_command(command)?;
    info!(command, timeout_secs = timeout.as_secs(), "running tests");

    let output = tokio::time::timeout(
        timeout,
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .output(),
    )
    .await
    .map_err(|_| NecroError::TestTimeout {
        timeout_secs: timeout.as_secs(),
    })??;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let exit_code = output.status.code().unwrap_or(-1);

    Ok(parse_report(command, exit_code, stdout, stderr))
}

/// Parse captured output into a structured report.
pub fn parse_report(command: &str, exit_code: i32, stdout: String, stderr: String) -> TestReport {
    let combined = format!("{stdout}\n{stderr}");

    let mut passed = 0;
    let mut failed = 0;
    let mut skipped = 0;
    let mut matched = false;

    // Cargo can print one summary per test binary; sum them.
    for caps in CARGO_SUMMARY.captures_iter(&combined) {
        matched = true;
        passed += caps["passed"].parse::<u32>().unwrap_or(0);
        failed += caps["failed"].parse::<u32>().unwrap_or(0);
        skipped += caps["ignored"].parse::<u32>().unwrap_or(0);
    }

    if !matched {
        if let Some(caps) = GENERIC_SUMMARY.captures(&combined) {
            matched = true;
            passed = caps["passed"].parse().unwrap_or(0);
            failed = caps
                .name("failed")
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
        }
    }

    if !matched && exit_code != 0 {
        // No recognizable summary; count the run itself as the failure.
        failed = 1;
    }

    let failed_test_details: Vec<String> = FAILED_TEST
        .captures_iter(&combined)
        .map(|caps| caps["name"].to_string())
        .collect();

    TestReport {
        command: command.to_string(),
        exit_code,
        total: passed + failed + skipped,
        passed,
        failed,
        skipped,
        failed_test_details,
        stdout,
        stderr,
    }
}
