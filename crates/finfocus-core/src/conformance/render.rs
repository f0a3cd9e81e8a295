//! Report renderers. Each is a pure function of the report.

use std::fmt::Write as _;

use super::Verbosity;
use super::report::{ConformanceReport, TestStatus};

/// Human-readable table. `Quiet` prints the summary line only.
pub fn render_table(report: &ConformanceReport, verbosity: Verbosity) -> String {
    let mut out = String::new();
    let plugin = report.plugin();
    let summary = report.summary();

    if verbosity > Verbosity::Quiet {
        let _ = writeln!(out, "Plugin: {}", plugin.name);
        let _ = writeln!(out, "  Path:      {}", plugin.path.display());
        let _ = writeln!(out, "  Version:   {}", plugin.version.as_deref().unwrap_or("-"));
        let _ = writeln!(out, "  Protocol:  {}", plugin.protocol_version.as_deref().unwrap_or("-"));
        let _ = writeln!(out, "  Transport: {}", plugin.comm_mode);
        if let Some(error) = report.suite_error() {
            let _ = writeln!(out, "  Error:     [{}] {}", error.kind, error.message);
        }
        let _ = writeln!(out);

        let results = report.results();
        if !results.is_empty() {
            let name_w = results.iter().map(|r| r.name.len()).max().unwrap_or(4).max(4);
            let cat_w = results
                .iter()
                .map(|r| r.category.to_string().len())
                .max()
                .unwrap_or(8)
                .max(8);
            let status_w = 6;

            let _ = writeln!(
                out,
                "{:<name_w$}  {:<cat_w$}  {:<status_w$}  {:>8}",
                "TEST", "CATEGORY", "STATUS", "TIME"
            );
            let _ = writeln!(
                out,
                "{:-<name_w$}  {:-<cat_w$}  {:-<status_w$}  {:->8}",
                "", "", "", ""
            );
            for result in results {
                let status = match (result.status, result.infrastructure) {
                    (TestStatus::Fail, true) => "ERROR".to_string(),
                    (status, _) => status.to_string().to_uppercase(),
                };
                let _ = writeln!(
                    out,
                    "{:<name_w$}  {:<cat_w$}  {:<status_w$}  {:>6}ms",
                    result.name,
                    result.category.to_string(),
                    status,
                    result.duration_ms,
                );
                let show_detail = match result.status {
                    TestStatus::Fail => true,
                    TestStatus::Skip => verbosity >= Verbosity::Verbose,
                    TestStatus::Pass => false,
                };
                if let Some(detail) = result.error.as_deref().filter(|_| show_detail) {
                    for line in detail.lines() {
                        let _ = writeln!(out, "    {line}");
                    }
                }
            }
            let _ = writeln!(out);
        }
    }

    let _ = writeln!(
        out,
        "{} tests: {} passed, {} failed, {} skipped, {} errors ({:.2}s)",
        summary.total,
        summary.passed,
        summary.failed,
        summary.skipped,
        summary.errors,
        report.duration().as_secs_f64(),
    );
    out
}

/// Machine-readable report, pretty-printed.
pub fn render_json(report: &ConformanceReport) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

/// JUnit XML with one `testsuite` and one `testcase` per result.
pub fn render_junit(report: &ConformanceReport) -> String {
    let summary = report.summary();
    let seconds = |ms: u64| format!("{:.3}", ms as f64 / 1000.0);
    // Attribute counts track the child elements: infrastructure failures are
    // `<error>`, every skip is `<skipped>`.
    let count = |status: TestStatus, infrastructure: bool| {
        report
            .results()
            .iter()
            .filter(|r| r.status == status && r.infrastructure == infrastructure)
            .count()
    };
    let failures = count(TestStatus::Fail, false);
    let errors = count(TestStatus::Fail, true);

    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        out,
        concat!(
            "<testsuites name=\"{}\" tests=\"{}\" failures=\"{}\" ",
            "skipped=\"{}\" errors=\"{}\" time=\"{}\">",
        ),
        xml_escape(report.suite()),
        summary.total,
        failures,
        summary.skipped,
        errors,
        seconds(report.duration().as_millis() as u64),
    );
    let _ = writeln!(
        out,
        concat!(
            "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" ",
            "skipped=\"{}\" errors=\"{}\" time=\"{}\" timestamp=\"{}\">",
        ),
        xml_escape(&report.plugin().name),
        summary.total,
        failures,
        summary.skipped,
        errors,
        seconds(report.duration().as_millis() as u64),
        report.timestamp().format("%Y-%m-%dT%H:%M:%S"),
    );

    if let Some(error) = report.suite_error() {
        let _ = writeln!(out, "    <properties>");
        let _ = writeln!(
            out,
            "      <property name=\"suite_error\" value=\"{}\"/>",
            xml_escape(&format!("{}: {}", error.kind, error.message))
        );
        let _ = writeln!(out, "    </properties>");
    }

    for result in report.results() {
        let open = format!(
            "    <testcase name=\"{}\" classname=\"{}\" time=\"{}\"",
            xml_escape(&result.name),
            result.category,
            seconds(result.duration_ms),
        );
        let detail = xml_escape(result.error.as_deref().unwrap_or(""));
        match result.status {
            TestStatus::Pass => {
                let _ = writeln!(out, "{open}/>");
            }
            TestStatus::Fail => {
                let element = if result.infrastructure { "error" } else { "failure" };
                let _ = writeln!(out, "{open}>");
                let _ = writeln!(out, "      <{element} message=\"{detail}\">{detail}</{element}>");
                let _ = writeln!(out, "    </testcase>");
            }
            TestStatus::Skip => {
                let _ = writeln!(out, "{open}>");
                let _ = writeln!(out, "      <skipped message=\"{detail}\"/>");
                let _ = writeln!(out, "    </testcase>");
            }
        }
    }

    let _ = writeln!(out, "  </testsuite>");
    let _ = writeln!(out, "</testsuites>");
    out
}

fn xml_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use chrono::Utc;
    use finfocus_proto::CommMode;

    use super::*;
    use crate::conformance::Category;
    use crate::conformance::report::{PluginMeta, SuiteError, TestResult};
    use crate::error::ErrorKind;

    fn sample() -> ConformanceReport {
        ConformanceReport::new(
            PluginMeta {
                path: PathBuf::from("/opt/finfocus-plugin-aws"),
                name: "aws".into(),
                version: Some("1.2.0".into()),
                protocol_version: Some("1.0.0".into()),
                comm_mode: CommMode::Tcp,
            },
            vec![
                TestResult::pass("identity_responds", Category::Protocol, Duration::from_millis(4)),
                TestResult::fail(
                    "projected_cost_shape",
                    Category::Cost,
                    Duration::from_millis(9),
                    "currency \"usd\" is not <ISO>".into(),
                    false,
                ),
                TestResult::skip("dry_run_field_mappings", Category::DryRun, "no dry_run", false),
            ],
            Duration::from_millis(1500),
            Utc::now(),
            None,
        )
    }

    #[test]
    fn table_lists_every_case_and_summary() {
        let table = render_table(&sample(), Verbosity::Normal);
        assert!(table.contains("identity_responds"));
        assert!(table.contains("FAIL"));
        assert!(table.contains("currency \"usd\" is not <ISO>"));
        assert!(!table.contains("no dry_run"), "skip reasons are verbose-only");
        assert!(table.contains("3 tests: 1 passed, 1 failed, 1 skipped, 0 errors"));
    }

    #[test]
    fn quiet_table_is_summary_only() {
        let table = render_table(&sample(), Verbosity::Quiet);
        assert_eq!(table.lines().count(), 1);
        assert!(table.starts_with("3 tests:"));
    }

    #[test]
    fn verbose_table_shows_skip_reasons() {
        let table = render_table(&sample(), Verbosity::Verbose);
        assert!(table.contains("no dry_run"));
    }

    #[test]
    fn json_summary_matches_results() {
        let json = render_json(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["suite"], "finfocus-plugin-conformance");
        assert_eq!(value["summary"]["total"], 3);
        assert_eq!(value["summary"]["failed"], 1);
        assert_eq!(value["results"][2]["category"], "dryrun");
        assert_eq!(value["results"][2]["status"], "skip");
    }

    #[test]
    fn junit_escapes_and_counts() {
        let xml = render_junit(&sample());
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("tests=\"3\" failures=\"1\" skipped=\"1\""));
        assert!(xml.contains("classname=\"cost\""));
        assert!(xml.contains("&quot;usd&quot; is not &lt;ISO&gt;"));
        assert!(xml.contains("<skipped message=\"no dry_run\"/>"));
        assert_eq!(xml.matches("<testcase ").count(), 3);
    }

    #[test]
    fn junit_counts_match_elements() {
        let report = ConformanceReport::new(
            sample().plugin().clone(),
            vec![
                TestResult::pass("identity_responds", Category::Protocol, Duration::from_millis(3)),
                TestResult::fail(
                    "projected_cost_shape",
                    Category::Cost,
                    Duration::from_millis(5),
                    "negative monthly cost".into(),
                    false,
                ),
                TestResult::fail(
                    "projected_cost_deterministic",
                    Category::Cost,
                    Duration::from_millis(7),
                    "unavailable: plugin exited".into(),
                    true,
                ),
                TestResult::skip(
                    "unknown_resource_has_no_data",
                    Category::Error,
                    "plugin crashed",
                    true,
                ),

                TestResult::skip("dry_run_field_mappings", Category::DryRun, "no dry_run", false),
            ],
            Duration::from_millis(20),
            Utc::now(),
            None,
        );
        let xml = render_junit(&report);
        let attrs = "tests=\"5\" failures=\"1\" skipped=\"2\" errors=\"1\"";
        assert_eq!(xml.matches(attrs).count(), 2, "both suite elements carry the counts:\n{xml}");
        assert_eq!(xml.matches("<failure ").count(), 1);
        assert_eq!(xml.matches("<error ").count(), 1);
        assert_eq!(xml.matches("<skipped ").count(), 2);
    }

    #[test]
    fn junit_records_suite_error() {
        let report = ConformanceReport::new(
            sample().plugin().clone(),
            Vec::new(),
            Duration::ZERO,
            Utc::now(),
            Some(SuiteError {
                kind: ErrorKind::HandshakeTimeout,
                message: "no PORT line".into(),
            }),
        );
        let xml = render_junit(&report);
        assert!(xml.contains("handshake_timeout: no PORT line"));
    }
}
