//! Output formatters for run reports
//!
//! Provides table, JSON, CSV and one-line summary output.

use anyhow::{Context, Result};
use std::str::FromStr;

use crate::models::{RunReport, TestError};

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Ok(OutputFormat::JsonPretty),
            "csv" => Ok(OutputFormat::Csv),
            "summary" => Ok(OutputFormat::Summary),
            other => anyhow::bail!("unknown output format '{other}' (table, json, json-pretty, csv, summary)"),
        }
    }
}

/// Report formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    /// Render a finished run
    pub fn format_report(&self, report: &RunReport) -> Result<String> {
        match self.format {
            OutputFormat::Table => Ok(self.format_report_table(report)),
            OutputFormat::Json => serde_json::to_string(report).context("Failed to serialize report"),
            OutputFormat::JsonPretty => {
                serde_json::to_string_pretty(report).context("Failed to serialize report")
            }
            OutputFormat::Csv => format_report_csv(report),
            OutputFormat::Summary => Ok(self.format_report_brief(report)),
        }
    }

    fn format_report_table(&self, report: &RunReport) -> String {
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        output.push_str(&format!("║  Run {:56} ║\n", report.id));
        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        for error in &report.errors {
            output.push_str(&format!("║  {} {}\n", self.fail_marker(), error.path));
            output.push_str(&format!("║      {}\n", describe(error)));
        }
        if !report.errors.is_empty() {
            output.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        }

        let fail_str = if self.colorize && report.failed() > 0 {
            format!("\x1b[31m{:3}\x1b[0m", report.failed())
        } else {
            format!("{:3}", report.failed())
        };
        output.push_str(&format!(
            "║  Total: {:3} | Pass: {:3} | Fail: {} | Duration: {:8}ms    ║\n",
            report.total,
            report.passed(),
            fail_str,
            report.duration_ms
        ));
        output.push_str(&format!(
            "║  Started: {:50} ║\n",
            report.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        output
    }

    fn format_report_brief(&self, report: &RunReport) -> String {
        let status = if report.is_success() { "PASS" } else { "FAIL" };
        format!(
            "{status} {}/{} passed in {}ms",
            report.passed(),
            report.total,
            report.duration_ms
        )
    }

    fn fail_marker(&self) -> &'static str {
        if self.colorize {
            "\x1b[31m✗ FAIL\x1b[0m"
        } else {
            "✗ FAIL"
        }
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn describe(error: &TestError) -> String {
    let attempts = if error.attempts == 1 {
        "1 attempt".to_string()
    } else {
        format!("{} attempts", error.attempts)
    };
    format!("{} ({attempts})", error.error)
}

/// One row per failed test
fn format_report_csv(report: &RunReport) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["run_id", "path", "attempts", "kind", "error"])?;

    for error in &report.errors {
        let kind = serde_json::to_value(&error.error)
            .ok()
            .and_then(|value| value["kind"].as_str().map(str::to_string))
            .unwrap_or_default();
        writer.write_record([
            report.id.clone(),
            error.path.clone(),
            error.attempts.to_string(),
            kind,
            error.error.to_string(),
        ])?;
    }

    let bytes = writer.into_inner().context("Failed to flush CSV output")?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::WorkerError;
    use crate::models::ErrorPayload;
    use chrono::Utc;

    fn report() -> RunReport {
        RunReport::new(
            Utc::now(),
            42,
            3,
            Some(vec![TestError::new(
                "/t/login.tst",
                4,
                WorkerError::TestFailed(ErrorPayload::new("Error", "expected \"a\", got \"b\"")),
            )]),
        )
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("TABLE".parse::<OutputFormat>().unwrap(), OutputFormat::Table);
        assert!("unknown".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_table_lists_failures() {
        let output = ResultFormatter::new(OutputFormat::Table)
            .no_color()
            .format_report(&report())
            .unwrap();
        assert!(output.contains("✗ FAIL /t/login.tst"));
        assert!(output.contains("4 attempts"));
        assert!(output.contains("Pass:   2"));
        assert!(!output.contains("\x1b["));
    }

    #[test]
    fn test_csv_quotes_fields() {
        let output = ResultFormatter::new(OutputFormat::Csv)
            .format_report(&report())
            .unwrap();
        let mut lines = output.lines();
        assert_eq!(lines.next(), Some("run_id,path,attempts,kind,error"));
        let row = lines.next().unwrap();
        assert!(row.contains(",/t/login.tst,4,test_failed,"));
        assert!(row.contains("\"\"a\"\""));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_json_and_summary() {
        let report = report();
        let json = ResultFormatter::new(OutputFormat::Json)
            .format_report(&report)
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["total"], 3);
        assert_eq!(value["errors"][0]["attempts"], 4);

        let brief = ResultFormatter::new(OutputFormat::Summary)
            .format_report(&report)
            .unwrap();
        assert_eq!(brief, "FAIL 2/3 passed in 42ms");
    }
}
