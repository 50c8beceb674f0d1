//! JSON exporter for scenario reports.
//!
//! Collects scenario results into one document for offline inspection or
//! CI artifacts.

use crate::runner::ScenarioResult;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// Pass/fail totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Complete report export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportExport {
    /// Tool version that produced the report
    pub version: String,

    /// Seeds that were run
    pub seeds: Vec<u64>,

    /// One entry per (seed, scenario) pair
    pub results: Vec<ScenarioResult>,

    pub summary: ExportSummary,
}

impl ReportExport {
    /// Creates a new export container.
    pub fn new(seeds: Vec<u64>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            seeds,
            results: Vec::new(),
            summary: ExportSummary::default(),
        }
    }

    /// Adds a scenario result.
    pub fn add_result(&mut self, result: ScenarioResult) {
        self.summary.total += 1;
        if result.passed {
            self.summary.passed += 1;
        } else {
            self.summary.failed += 1;
        }
        self.results.push(result);
    }

    pub fn all_passed(&self) -> bool {
        self.summary.failed == 0
    }

    /// Serializes to pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = self.to_json()?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScenarioRunner;
    use crate::scenarios::ScenarioId;

    #[test]
    fn test_export_counts_and_serializes() {
        let runner = ScenarioRunner::new(3);
        let mut export = ReportExport::new(vec![3]);
        export.add_result(runner.run(ScenarioId::ChannelBuffer));
        export.add_result(runner.run(ScenarioId::Leak));

        assert_eq!(export.summary, ExportSummary { total: 2, passed: 2, failed: 0 });
        assert!(export.all_passed());

        let json = export.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["results"][0]["scenario"], "channel_buffer");
        assert_eq!(value["results"][1]["failure_kind"], "leak");
        assert!(value["results"][0].get("events").is_none());
    }

    #[test]
    fn test_write_to_file() {
        let path = std::env::temp_dir().join(format!("quiesce-export-{}.json", std::process::id()));
        let path = path.to_string_lossy().to_string();

        let mut export = ReportExport::new(vec![1]);
        export.add_result(ScenarioRunner::new(1).run(ScenarioId::TimerOrder));
        export.write_to_file(&path).unwrap();

        let read: ReportExport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read.results.len(), 1);
        assert_eq!(read.results[0].scenario, ScenarioId::TimerOrder);
        std::fs::remove_file(&path).unwrap();
    }
}
