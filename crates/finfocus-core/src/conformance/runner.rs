use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use chrono::Utc;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::PluginClient;
use crate::error::{ErrorKind, HostError};
use crate::manifest::PluginManifest;
use crate::supervisor::{PluginProcess, ProcessState, Supervisor};

use super::cases::{CaseContext, CaseFailure, TestCase, battery, default_sample_resource};
use super::report::{ConformanceReport, PluginMeta, SuiteError, TestResult, TestStatus};
use super::{SuiteConfig, Verbosity};

const SUITE_TIMEOUT_REASON: &str = "suite timeout expired";

const EXIT_SETTLE: Duration = Duration::from_millis(500);

/// Run the selected battery against the plugin binary at `binary`.
///
/// Never fails: a plugin that cannot be started yields a report whose
/// selected cases are all skipped and whose `suite_error` says why.
pub async fn run_suite(binary: &Path, config: &SuiteConfig) -> ConformanceReport {
    let started = StdInstant::now();
    let timestamp = Utc::now();
    let deadline = Instant::now() + config.timeout;

    let cases: Vec<TestCase> = battery()
        .into_iter()
        .filter(|case| config.selects(case.category, case.name))
        .collect();
    info!(
        plugin = %binary.display(),
        mode = %config.mode,
        cases = cases.len(),
        timeout = ?config.timeout,
        "starting conformance suite"
    );

    let manifest = PluginManifest::for_binary(binary);
    let mut meta = PluginMeta {
        path: binary.to_path_buf(),
        name: manifest.name.clone(),
        version: None,
        protocol_version: None,
        comm_mode: config.mode,
    };

    let supervisor = Supervisor::new(config.supervisor.clone());
    let cancel = CancellationToken::new();
    let start = timeout_at(deadline, supervisor.start(&manifest, config.mode, &cancel)).await;

    let process = match start {
        Ok(Ok(process)) => process,
        Ok(Err(e)) => {
            warn!(plugin = %binary.display(), error = %e, "plugin could not be started");
            let error = SuiteError {
                kind: e.kind(),
                message: e.to_string(),
            };
            return skipped_report(meta, &cases, error, started, timestamp);
        }
        Err(_elapsed) => {
            cancel.cancel();
            warn!(plugin = %binary.display(), "suite timeout expired while starting plugin");
            let error = SuiteError {
                kind: ErrorKind::Timeout,
                message: format!("{SUITE_TIMEOUT_REASON} while starting the plugin"),
            };
            return skipped_report(meta, &cases, error, started, timestamp);
        }
    };

    if let Some(info) = process.info() {
        meta.name = info.name.clone();
        meta.version = Some(info.version.clone());
        meta.protocol_version = Some(info.spec_version.clone());
    }

    let results = run_cases(&process, &cases, config, deadline).await;
    process.stop().await;

    let report = ConformanceReport::new(meta, results, started.elapsed(), timestamp, None);
    let summary = report.summary();
    info!(
        plugin = %binary.display(),
        passed = summary.passed,
        failed = summary.failed,
        skipped = summary.skipped,
        errors = summary.errors,
        duration = ?report.duration(),
        "conformance suite finished"
    );
    report
}

fn skipped_report(
    meta: PluginMeta,
    cases: &[TestCase],
    error: SuiteError,
    started: StdInstant,
    timestamp: chrono::DateTime<Utc>,
) -> ConformanceReport {
    let reason = format!("plugin unavailable: {}", error.message);
    let results = cases
        .iter()
        .map(|case| TestResult::skip(case.name, case.category, reason.clone(), true))
        .collect();
    ConformanceReport::new(meta, results, started.elapsed(), timestamp, Some(error))
}

async fn run_cases(
    process: &Arc<PluginProcess>,
    cases: &[TestCase],
    config: &SuiteConfig,
    deadline: Instant,
) -> Vec<TestResult> {
    let client = PluginClient::new(Arc::clone(process));
    let resource = config.sample_resource.clone().unwrap_or_else(default_sample_resource);
    let info = process.info().cloned();
    let mut crashed = false;
    let mut results = Vec::with_capacity(cases.len());

    for case in cases {
        if !crashed && process.state() == ProcessState::Crashed {
            crashed = true;
        }
        if crashed {
            results.push(TestResult::skip(case.name, case.category, "plugin crashed", true));
            continue;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            results.push(TestResult::skip(case.name, case.category, SUITE_TIMEOUT_REASON, false));
            continue;
        }

        if let Some(reason) = case.precondition.unmet(info.as_ref()) {
            debug!(case = case.name, %reason, "skipping case");
            results.push(TestResult::skip(case.name, case.category, reason, false));
            continue;
        }

        let budget = config.case_timeout.min(remaining);
        let ctx = CaseContext {
            client: client.clone(),
            info: info.clone(),
            resource: resource.clone(),
            budget,
        };
        debug!(case = case.name, category = %case.category, ?budget, "running case");

        let case_started = StdInstant::now();
        let outcome = timeout(budget, (case.run)(ctx)).await;
        let elapsed = case_started.elapsed();
        let gone = match &outcome {
            Ok(Err(CaseFailure::Unexpected(error))) if error.is_infrastructure() => {
                exited(process).await
            }
            _ => process.state().is_terminal(),
        };

        let result = match outcome {
            Ok(Ok(())) => TestResult::pass(case.name, case.category, elapsed),
            Ok(Err(CaseFailure::Assertion(detail))) => {
                TestResult::fail(case.name, case.category, elapsed, detail, gone)
            }
            Ok(Err(CaseFailure::Unexpected(error))) => {
                let infrastructure = gone || error.is_infrastructure();
                let detail = describe(&error);
                TestResult::fail(case.name, case.category, elapsed, detail, infrastructure)

            }
            Err(_elapsed) => TestResult::fail(
                case.name,
                case.category,
                elapsed,
                format!("timed out after {budget:?}"),
                gone,
            ),
        };
        if gone {
            warn!(case = case.name, state = %process.state(), "plugin exited during case");
            crashed = true;
        }
        log_result(&result, config.verbosity);
        results.push(result);
    }
    results
}

/// Give a process whose channel just died a moment to be reaped.
async fn exited(process: &PluginProcess) -> bool {
    let mut state = process.watch_state();
    timeout(EXIT_SETTLE, state.wait_for(|s| s.is_terminal()))
        .await
        .is_ok_and(|waited| waited.is_ok())
}

fn describe(error: &HostError) -> String {
    format!("{}: {error}", error.kind())
}

fn log_result(result: &TestResult, verbosity: Verbosity) {
    match result.status {
        TestStatus::Fail => warn!(
            case = %result.name,
            category = %result.category,
            detail = result.error.as_deref().unwrap_or(""),
            "case failed"
        ),
        TestStatus::Pass if verbosity >= Verbosity::Verbose => info!(
            case = %result.name,
            category = %result.category,
            duration_ms = result.duration_ms,
            "case passed"
        ),
        TestStatus::Skip if verbosity >= Verbosity::Verbose => info!(
            case = %result.name,
            reason = result.error.as_deref().unwrap_or(""),
            "case skipped"
        ),
        _ => debug!(case = %result.name, status = %result.status, "case finished"),
    }
}
