use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;

use crate::errors::{CloneError, Result};
use crate::project::{CloneResult, Outcome};

#[derive(Debug, Serialize)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Final report for a run: every project's outcome in discovery order plus
/// the summary counts. Written once, at the end.
#[derive(Debug, Serialize)]
pub struct Manifest {
    pub host: String,
    #[serde(flatten)]
    pub summary: Summary,
    pub results: Vec<CloneResult>,
}

impl Manifest {
    /// The run succeeded iff nothing failed; skips alone are fine.
    pub fn is_success(&self) -> bool {
        self.summary.failed == 0
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CloneError::filesystem(path.to_path_buf(), std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        std::fs::write(path, json).map_err(|e| CloneError::filesystem(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Collects results as workers finish, in whatever order that happens, and
/// produces the manifest in discovery order. One slot per discovered
/// project, indexed by discovery position.
pub struct ResultAggregator {
    host: String,
    slots: Mutex<Vec<Option<CloneResult>>>,
}

impl ResultAggregator {
    pub fn new(host: String, total: usize) -> Self {
        ResultAggregator {
            host,
            slots: Mutex::new(vec![None; total]),
        }
    }

    /// Record the terminal outcome for the project at discovery position
    /// `index`. Exactly one call per project.
    pub fn record(&self, index: usize, result: CloneResult) {
        let mut slots = self.slots.lock().unwrap();
        debug_assert!(slots[index].is_none(), "duplicate result for {}", result.project);
        slots[index] = Some(result);
    }

    pub fn finalize(self) -> Manifest {
        let slots = self.slots.into_inner().unwrap();
        let results: Vec<CloneResult> = slots.into_iter().flatten().collect();
        let summary = Summary {
            total: results.len(),
            succeeded: count(&results, Outcome::Succeeded),
            failed: count(&results, Outcome::Failed),
            skipped: count(&results, Outcome::Skipped),
        };
        Manifest {
            host: self.host,
            summary,
            results,
        }
    }
}

fn count(results: &[CloneResult], outcome: Outcome) -> usize {
    results.iter().filter(|r| r.outcome == outcome).count()
}

/// End-of-run summary for humans, to stderr-adjacent stdout in the style of
/// the logging output.
pub fn print_summary(manifest: &Manifest) {
    let style_ok = console::Style::new().green();
    let style_bad = console::Style::new().red().bold();
    let style_skip = console::Style::new().yellow();

    println!(
        "{}: {} total, {} succeeded, {} failed, {} skipped",
        manifest.host,
        manifest.summary.total,
        style_ok.apply_to(manifest.summary.succeeded),
        if manifest.summary.failed > 0 {
            style_bad.apply_to(manifest.summary.failed)
        } else {
            style_ok.apply_to(manifest.summary.failed)
        },
        style_skip.apply_to(manifest.summary.skipped),
    );

    for result in &manifest.results {
        if result.outcome == Outcome::Failed {
            println!(
                "  {} {} ({} attempts): {}",
                style_bad.apply_to("failed"),
                result.project,
                result.attempts,
                result.error.as_deref().unwrap_or("unknown error"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::CloneResult;

    fn ok(name: &str) -> CloneResult {
        CloneResult {
            project: name.to_string(),
            outcome: Outcome::Succeeded,
            attempts: 1,
            duration_ms: 10,
            error_kind: None,
            error: None,
            relocated_from: None,
        }
    }

    fn failed(name: &str) -> CloneResult {
        CloneResult {
            project: name.to_string(),
            outcome: Outcome::Failed,
            attempts: 4,
            duration_ms: 99,
            error_kind: Some(crate::project::ErrorKind::Network),
            error: Some("connection reset".to_string()),
            relocated_from: None,
        }
    }

    #[test]
    fn results_come_out_in_discovery_order() {
        let agg = ResultAggregator::new("gerrit.example.org".into(), 3);
        // Completion order deliberately scrambled.
        agg.record(2, ok("c"));
        agg.record(0, ok("a"));
        agg.record(1, failed("b"));

        let manifest = agg.finalize();
        let names: Vec<&str> = manifest.results.iter().map(|r| r.project.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn counts_always_add_up() {
        let agg = ResultAggregator::new("h".into(), 4);
        agg.record(0, ok("a"));
        agg.record(1, failed("b"));
        agg.record(2, CloneResult::skipped("c", 0));
        agg.record(3, ok("d"));

        let manifest = agg.finalize();
        let s = &manifest.summary;
        assert_eq!(s.total, 4);
        assert_eq!(s.succeeded + s.failed + s.skipped, s.total);
        assert_eq!(s.failed, 1);
        assert_eq!(s.skipped, 1);
        assert!(!manifest.is_success());
    }

    #[test]
    fn success_iff_nothing_failed() {
        let agg = ResultAggregator::new("h".into(), 2);
        agg.record(0, ok("a"));
        agg.record(1, CloneResult::skipped("b", 0));
        assert!(agg.finalize().is_success());
    }

    #[test]
    fn manifest_json_shape() {
        let agg = ResultAggregator::new("gerrit.example.org".into(), 2);
        agg.record(0, ok("a"));
        agg.record(1, failed("b"));
        let manifest = agg.finalize();

        let value: serde_json::Value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["host"], "gerrit.example.org");
        assert_eq!(value["total"], 2);
        assert_eq!(value["results"][0]["project"], "a");
        assert_eq!(value["results"][0]["outcome"], "succeeded");
        // Absent optional fields are omitted, not null.
        assert!(value["results"][0].get("error_kind").is_none());
        assert_eq!(value["results"][1]["error_kind"], "network");
    }

    #[test]
    fn manifest_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clone-manifest.json");
        let agg = ResultAggregator::new("h".into(), 1);
        agg.record(0, ok("a"));
        agg.finalize().write_to(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["succeeded"], 1);
    }
}
