//! Run reports.
//!
//! Every invocation ends in exactly one [`RunOutcome`], logged on one line
//! and saved under `runs/<key>` so `status` can show the last result.

use crate::utils::errors::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Success,
    SuccessWithPendingMirror,
    /// Another run held the lock
    Skipped,
    Failed,
}

impl RunOutcome {
    fn severity(self) -> u8 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::SuccessWithPendingMirror => 1,
            RunOutcome::Skipped => 2,
            RunOutcome::Failed => 3,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunOutcome::Success => "SUCCESS",
            RunOutcome::SuccessWithPendingMirror => "SUCCESS_WITH_PENDING_MIRROR",
            RunOutcome::Skipped => "SKIPPED",
            RunOutcome::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: String,
    pub source_id: Option<String>,
    pub outcome: RunOutcome,
    pub reason: Option<String>,
    pub exit_code: u8,
    pub artifact: Option<String>,
    pub destination: Option<String>,
    pub delivered: Vec<(String, String)>,
    /// (artifact, mirror, reason) for this run's own artifact
    pub pending: Vec<(String, String, String)>,
    /// Earlier artifacts retried by a backup run and still pending; they do
    /// not change the outcome
    #[serde(default)]
    pub still_pending: Vec<(String, String, String)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Mode-specific payload (status document, export report, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RunReport {
    pub fn new(mode: &str, source_id: Option<&str>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            mode: mode.to_string(),
            source_id: source_id.map(str::to_string),
            outcome: RunOutcome::Success,
            reason: None,
            exit_code: 0,
            artifact: None,
            destination: None,
            delivered: Vec::new(),
            pending: Vec::new(),
            still_pending: Vec::new(),
            started_at,
            finished_at: started_at,
            details: None,
        }
    }

    /// Store key: the last report per (source, mode).
    pub fn key(&self) -> String {
        format!("{}.{}", self.source_id.as_deref().unwrap_or("engine"), self.mode)
    }

    /// Settle the outcome from what was recorded so far.
    pub fn succeed(mut self) -> Self {
        if self.pending.is_empty() {
            self.outcome = RunOutcome::Success;
            self.exit_code = 0;
        } else {
            self.outcome = RunOutcome::SuccessWithPendingMirror;
            self.exit_code = 10;
            self.reason = Some(format!("{} mirror delivery(ies) pending", self.pending.len()));
        }
        self.finished_at = Utc::now();
        self
    }

    pub fn fail(mut self, err: &EngineError) -> Self {
        self.outcome = match err {
            EngineError::LockContention { .. } => RunOutcome::Skipped,
            _ => RunOutcome::Failed,
        };
        self.exit_code = err.exit_code();
        self.reason = Some(err.to_string());
        self.finished_at = Utc::now();
        self
    }

    /// The single terminal log line of a run.
    pub fn log(&self) {
        let source = self.source_id.as_deref().unwrap_or("-");
        let reason = self.reason.as_deref().unwrap_or("");
        let artifact = self.artifact.as_deref().unwrap_or("-");
        let elapsed_ms = (self.finished_at - self.started_at).num_milliseconds();
        match self.outcome {
            RunOutcome::Success => info!(
                source = %source, mode = %self.mode, artifact = %artifact, elapsed_ms,
                "Run finished: {}", self.outcome
            ),
            RunOutcome::SuccessWithPendingMirror | RunOutcome::Skipped => warn!(
                source = %source, mode = %self.mode, artifact = %artifact, elapsed_ms,
                "Run finished: {} ({})", self.outcome, reason
            ),
            RunOutcome::Failed => error!(
                source = %source, mode = %self.mode, elapsed_ms,
                "Run finished: {} ({})", self.outcome, reason
            ),
        }
    }
}

/// Process exit status for a set of reports: the most severe one wins.
pub fn exit_code(reports: &[RunReport]) -> u8 {
    reports
        .iter()
        .max_by_key(|r| r.outcome.severity())
        .map(|r| r.exit_code)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_mirror_outcome() {
        let mut report = RunReport::new("full", Some("src"), Utc::now());
        report.pending.push(("F1".into(), "usb".into(), "unplugged".into()));
        let report = report.succeed();

        assert_eq!(report.outcome, RunOutcome::SuccessWithPendingMirror);
        assert_eq!(report.exit_code, 10);
        assert_eq!(report.outcome.to_string(), "SUCCESS_WITH_PENDING_MIRROR");
    }

    #[test]
    fn test_older_pending_mirrors_do_not_change_outcome() {
        let mut report = RunReport::new("full", Some("src"), Utc::now());
        report
            .still_pending
            .push(("F0".into(), "usb".into(), "unplugged".into()));
        let report = report.succeed();

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.exit_code, 0);
    }

    #[test]
    fn test_lock_contention_is_skipped() {
        let report = RunReport::new("full", Some("src"), Utc::now())
            .fail(&EngineError::LockContention { key: "src.full".into() });
        assert_eq!(report.outcome, RunOutcome::Skipped);
        assert_eq!(report.exit_code, 5);
    }

    #[test]
    fn test_most_severe_exit_code_wins() {
        let ok = RunReport::new("full", Some("a"), Utc::now()).succeed();
        let failed = RunReport::new("full", Some("b"), Utc::now())
            .fail(&EngineError::NoDestinationAvailable { tried: vec![] });
        assert_eq!(exit_code(&[ok.clone(), failed]), 3);
        assert_eq!(exit_code(&[ok]), 0);
        assert_eq!(exit_code(&[]), 0);
    }
}
