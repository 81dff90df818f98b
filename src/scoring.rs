//! Assertion scoring and verdicts

use serde::Serialize;
use std::fmt;

/// Outcome of one named assertion
#[derive(Debug, Clone, Serialize)]
pub struct AssertionRecord {
    pub description: String,
    pub passed: bool,
    /// What was actually observed, for failed assertions mostly
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Final verdict of a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every assertion passed
    Success,
    /// Not every assertion passed, but at least the declared threshold did
    PartialSuccess,
    /// Below threshold, fatal setup failure or interrupted
    Failure,
}

impl Verdict {
    /// Process exit code for this verdict
    pub fn exit_code(self) -> i32 {
        match self {
            Verdict::Success | Verdict::PartialSuccess => 0,
            Verdict::Failure => 1,
        }
    }

    pub fn is_success(self) -> bool {
        self.exit_code() == 0
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Success => "SUCCESS",
            Verdict::PartialSuccess => "PARTIAL SUCCESS",
            Verdict::Failure => "FAILURE",
        };
        f.write_str(s)
    }
}

/// Everything a scenario run produced
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub assertions: Vec<AssertionRecord>,
    pub passed: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<usize>,
    pub verdict: Verdict,
    /// Set when setup aborted the scenario
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_error: Option<String>,
    pub interrupted: bool,
}

impl ScenarioResult {
    /// `passed/total` as printed in the summary line
    pub fn score(&self) -> String {
        format!("{}/{}", self.passed, self.total)
    }
}

/// Collects assertion outcomes and turns them into a verdict
#[derive(Debug)]
pub struct AssertionScorer {
    scenario: String,
    records: Vec<AssertionRecord>,
}

impl AssertionScorer {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            records: Vec::new(),
        }
    }

    /// Append one outcome
    pub fn record(&mut self, description: impl Into<String>, passed: bool, detail: Option<String>) {
        self.records.push(AssertionRecord {
            description: description.into(),
            passed,
            detail,
        });
    }

    pub fn records(&self) -> &[AssertionRecord] {
        &self.records
    }

    pub fn passed(&self) -> usize {
        self.records.iter().filter(|r| r.passed).count()
    }

    /// Compute the verdict from what has been recorded
    ///
    /// `threshold` is the minimum number of passing assertions that still
    /// counts as a partial success. With no threshold only a clean sweep
    /// succeeds. An empty record set never succeeds.
    pub fn finalize(self, threshold: Option<usize>) -> ScenarioResult {
        let passed = self.passed();
        let total = self.records.len();
        let verdict = if total > 0 && passed == total {
            Verdict::Success
        } else if matches!(threshold, Some(t) if t > 0 && passed >= t) {
            Verdict::PartialSuccess
        } else {
            Verdict::Failure
        };
        ScenarioResult {
            scenario: self.scenario,
            assertions: self.records,
            passed,
            total,
            threshold,
            verdict,
            setup_error: None,
            interrupted: false,
        }
    }

    /// Result for a scenario that never reached its assertion phase
    pub fn aborted(self, threshold: Option<usize>, setup_error: String) -> ScenarioResult {
        let mut result = self.finalize(threshold);
        result.verdict = Verdict::Failure;
        result.setup_error = Some(setup_error);
        result
    }

    /// Result for a scenario stopped by an external interrupt
    pub fn interrupted(self, threshold: Option<usize>) -> ScenarioResult {
        let mut result = self.finalize(threshold);
        result.verdict = Verdict::Failure;
        result.interrupted = true;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer(outcomes: &[bool]) -> AssertionScorer {
        let mut scorer = AssertionScorer::new("test");
        for (i, passed) in outcomes.iter().enumerate() {
            scorer.record(format!("assertion {i}"), *passed, None);
        }
        scorer
    }

    #[test]
    fn test_all_passed_is_success() {
        let result = scorer(&[true, true, true]).finalize(None);
        assert_eq!(result.verdict, Verdict::Success);
        assert_eq!(result.score(), "3/3");
    }

    #[test]
    fn test_threshold_absorbs_partial_failures() {
        // kick scenario: six assertions, four needed
        let result = scorer(&[true, true, false, true, false, true]).finalize(Some(4));
        assert_eq!(result.verdict, Verdict::PartialSuccess);
        assert_eq!(result.verdict.exit_code(), 0);

        let result = scorer(&[true, false, false, true, false, true]).finalize(Some(4));
        assert_eq!(result.verdict, Verdict::Failure);
        assert_eq!(result.verdict.exit_code(), 1);
    }

    #[test]
    fn test_no_threshold_requires_everything() {
        let result = scorer(&[true, true, true, true, false]).finalize(None);
        assert_eq!(result.verdict, Verdict::Failure);
    }

    #[test]
    fn test_empty_is_failure() {
        assert_eq!(scorer(&[]).finalize(Some(0)).verdict, Verdict::Failure);
    }

    #[test]
    fn test_setup_abort_overrides_verdict() {
        let result = scorer(&[]).aborted(Some(3), "no invite code".into());
        assert_eq!(result.verdict, Verdict::Failure);
        assert_eq!(result.setup_error.as_deref(), Some("no invite code"));
    }

    #[test]
    fn test_interrupted_is_failure_even_when_passing() {
        let result = scorer(&[true]).interrupted(None);
        assert_eq!(result.verdict, Verdict::Failure);
        assert!(result.interrupted);
    }
}
