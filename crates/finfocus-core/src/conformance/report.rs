use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finfocus_proto::CommMode;

use crate::error::ErrorKind;

use super::{Category, SUITE_NAME};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub category: Category,
    pub status: TestStatus,
    pub duration_ms: u64,
    /// Failure detail or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The plugin process, not the plugin's answer, caused this outcome.
    #[serde(default)]
    pub infrastructure: bool,
}

impl TestResult {
    pub(crate) fn pass(name: &str, category: Category, duration: Duration) -> Self {
        Self::new(name, category, TestStatus::Pass, duration, None, false)
    }

    pub(crate) fn fail(
        name: &str,
        category: Category,
        duration: Duration,
        detail: String,
        infrastructure: bool,
    ) -> Self {
        Self::new(name, category, TestStatus::Fail, duration, Some(detail), infrastructure)
    }

    pub(crate) fn skip(
        name: &str,
        category: Category,
        reason: impl Into<String>,
        infrastructure: bool,
    ) -> Self {
        let reason = Some(reason.into());
        Self::new(name, category, TestStatus::Skip, Duration::ZERO, reason, infrastructure)
    }


    fn new(
        name: &str,
        category: Category,
        status: TestStatus,
        duration: Duration,
        error: Option<String>,
        infrastructure: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            category,
            status,
            duration_ms: millis(duration),
            error,
            infrastructure,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Results caused by the plugin process itself (start failure, crash).
    pub errors: usize,
}

impl Summary {
    pub fn tally(results: &[TestResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for result in results {
            match result.status {
                TestStatus::Pass => summary.passed += 1,
                TestStatus::Fail => summary.failed += 1,
                TestStatus::Skip => summary.skipped += 1,
            }
            if result.infrastructure {
                summary.errors += 1;
            }
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMeta {
    pub path: PathBuf,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub protocol_version: Option<String>,
    pub comm_mode: CommMode,
}

/// Why the suite could not run at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one suite run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformanceReport {
    suite: String,
    plugin: PluginMeta,
    results: Vec<TestResult>,
    summary: Summary,
    duration_ms: u64,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    suite_error: Option<SuiteError>,
}

impl ConformanceReport {
    pub(crate) fn new(
        plugin: PluginMeta,
        results: Vec<TestResult>,
        duration: Duration,
        timestamp: DateTime<Utc>,
        suite_error: Option<SuiteError>,
    ) -> Self {
        let summary = Summary::tally(&results);
        Self {
            suite: SUITE_NAME.to_string(),
            plugin,
            results,
            summary,
            duration_ms: millis(duration),
            timestamp,
            suite_error,
        }
    }

    pub fn suite(&self) -> &str {
        &self.suite
    }

    pub fn plugin(&self) -> &PluginMeta {
        &self.plugin
    }

    /// Results in declared order.
    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn suite_error(&self) -> Option<&SuiteError> {
        self.suite_error.as_ref()
    }

    /// Worst outcome of the run:
    ///
    /// - 3: the plugin speaks an incompatible protocol
    /// - 2: the plugin crashed, could not be reached, or timed out its handshake
    /// - 1: at least one case failed
    /// - 0: everything passed (skips allowed)
    pub fn exit_code(&self) -> i32 {
        if let Some(error) = &self.suite_error {
            return match error.kind {
                ErrorKind::ProtocolMismatch => 3,
                _ => 2,
            };
        }
        let crashed = self
            .results
            .iter()
            .any(|r| r.infrastructure && r.status == TestStatus::Fail);
        if crashed {
            2
        } else if self.summary.failed > 0 {
            1
        } else {
            0
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> PluginMeta {
        PluginMeta {
            path: PathBuf::from("/bin/plugin"),
            name: "plugin".into(),
            version: Some("1.0.0".into()),
            protocol_version: Some("1.0.0".into()),
            comm_mode: CommMode::Tcp,
        }
    }

    fn report(results: Vec<TestResult>, suite_error: Option<SuiteError>) -> ConformanceReport {
        ConformanceReport::new(meta(), results, Duration::from_millis(40), Utc::now(), suite_error)
    }

    #[test]
    fn summary_tallies_statuses_and_infrastructure() {
        let results = vec![
            TestResult::pass("a", Category::Protocol, Duration::from_millis(3)),
            TestResult::fail("b", Category::Cost, Duration::ZERO, "bad".into(), false),
            TestResult::skip("c", Category::Cost, "no creds", false),
            TestResult::skip("d", Category::Error, "crashed", true),
        ];
        let summary = Summary::tally(&results);
        assert_eq!(
            summary,
            Summary {
                total: 4,
                passed: 1,
                failed: 1,
                skipped: 2,
                errors: 1
            }
        );
    }

    #[test]
    fn exit_code_reflects_worst_outcome() {
        let pass = TestResult::pass("a", Category::Protocol, Duration::ZERO);
        assert_eq!(report(vec![pass.clone()], None).exit_code(), 0);

        let skip = TestResult::skip("s", Category::DryRun, "capability not advertised", false);
        assert_eq!(report(vec![pass.clone(), skip], None).exit_code(), 0);

        let fail = TestResult::fail("b", Category::Cost, Duration::ZERO, "bad".into(), false);
        assert_eq!(report(vec![pass.clone(), fail.clone()], None).exit_code(), 1);

        let crash = TestResult::fail("c", Category::Cost, Duration::ZERO, "gone".into(), true);
        assert_eq!(report(vec![fail, crash], None).exit_code(), 2);

        let mismatch = SuiteError {
            kind: ErrorKind::ProtocolMismatch,
            message: "v2".into(),
        };
        assert_eq!(report(Vec::new(), Some(mismatch)).exit_code(), 3);

        let timeout = SuiteError {
            kind: ErrorKind::HandshakeTimeout,
            message: "slow".into(),
        };
        assert_eq!(report(Vec::new(), Some(timeout)).exit_code(), 2);
    }

    #[test]
    fn json_round_trip_preserves_summary() {
        let original = report(
            vec![
                TestResult::pass("a", Category::Protocol, Duration::from_millis(7)),
                TestResult::skip("b", Category::Recommendation, "suite timeout expired", false),
            ],
            None,
        );
        let json = serde_json::to_string(&original).unwrap();
        let parsed: ConformanceReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(*parsed.summary(), Summary::tally(parsed.results()));
        assert_eq!(parsed.results()[0].duration(), Duration::from_millis(7));
    }
}
