//! Evaluation summary over saved query results
//!
//! Each result's `expected_asset_id` is the ground truth: `Some(id)` means the
//! query derives from `id`, `None` means no reference should be accepted.
//! False accepts are counted separately from false rejects because the two
//! carry very different costs for provenance auditing.

pub mod replay;

pub use replay::{replay, RecordedQuery, RecordedVector, ReplayResult};

use crate::query::{QueryResult, QueryStatus};
use serde::{Deserialize, Serialize};

/// Outcome of one query against its ground truth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    TrueAccept,
    /// Accepted with the wrong top-1, or accepted when nothing was expected
    FalseAccept,
    FalseReject,
    TrueReject,
    Failed,
}

impl Outcome {
    pub fn classify(result: &QueryResult) -> Self {
        match (result.status, result.expected_asset_id.as_deref()) {
            (QueryStatus::Failed, _) => Self::Failed,
            (QueryStatus::Accepted, Some(expected)) => {
                if result.top().map(|c| c.asset_id.as_str()) == Some(expected) {
                    Self::TrueAccept
                } else {
                    Self::FalseAccept
                }
            }
            (QueryStatus::Accepted, None) => Self::FalseAccept,
            (QueryStatus::Rejected, Some(_)) => Self::FalseReject,
            (QueryStatus::Rejected, None) => Self::TrueReject,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub total: usize,
    pub true_accepts: usize,
    pub false_accepts: usize,
    pub false_rejects: usize,
    pub true_rejects: usize,
    pub failures: usize,
    /// True accepts over queries with an expected source
    pub top1_accuracy: f64,
    /// False accepts over all non-failed queries
    pub false_accept_rate: f64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: u64,
}

impl EvaluationSummary {
    pub fn from_results(results: &[QueryResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        if results.is_empty() {
            return summary;
        }

        let mut with_source = 0usize;
        for result in results {
            if result.expected_asset_id.is_some() {
                with_source += 1;
            }
            match Outcome::classify(result) {
                Outcome::TrueAccept => summary.true_accepts += 1,
                Outcome::FalseAccept => summary.false_accepts += 1,
                Outcome::FalseReject => summary.false_rejects += 1,
                Outcome::TrueReject => summary.true_rejects += 1,
                Outcome::Failed => summary.failures += 1,
            }
        }

        if with_source > 0 {
            summary.top1_accuracy = summary.true_accepts as f64 / with_source as f64;
        }
        let decided = summary.total - summary.failures;
        if decided > 0 {
            summary.false_accept_rate = summary.false_accepts as f64 / decided as f64;
        }

        let mut latencies: Vec<u64> = results.iter().map(|r| r.latency_ms).collect();
        latencies.sort_unstable();
        summary.mean_latency_ms =
            latencies.iter().map(|&l| l as f64).sum::<f64>() / latencies.len() as f64;
        summary.p95_latency_ms = percentile(&latencies, 0.95);

        summary
    }
}

/// Nearest-rank percentile of sorted values
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FailureKind, QueryDiagnostics, QueryFailure};
    use crate::ranking::{AggregatedCandidate, ScoreComponents, SeverityTier, TransformCategory};
    use chrono::Utc;
    use uuid::Uuid;

    fn result(status: QueryStatus, top: Option<&str>, expected: Option<&str>, latency_ms: u64) -> QueryResult {
        QueryResult {
            query_id: Uuid::new_v4(),
            asset_id: "q".to_string(),
            candidates: top
                .map(|id| {
                    vec![AggregatedCandidate {
                        asset_id: id.to_string(),
                        components: ScoreComponents::default(),
                        final_score: 0.97,
                        supporting_segments: 4,
                        meets_threshold: true,
                        pre_revalidation_score: None,
                    }]
                })
                .unwrap_or_default(),
            latency_ms,
            status,
            error: (status == QueryStatus::Failed).then(|| QueryFailure {
                kind: FailureKind::Timeout,
                message: "timed out".to_string(),
            }),
            expected_asset_id: expected.map(str::to_string),
            transform: TransformCategory::Unknown,
            tier: SeverityTier::Mild,
            threshold: 0.95,
            diagnostics: QueryDiagnostics::default(),
            trace: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_classification() {
        use QueryStatus::*;
        assert_eq!(Outcome::classify(&result(Accepted, Some("a"), Some("a"), 1)), Outcome::TrueAccept);
        assert_eq!(Outcome::classify(&result(Accepted, Some("b"), Some("a"), 1)), Outcome::FalseAccept);
        assert_eq!(Outcome::classify(&result(Accepted, Some("b"), None, 1)), Outcome::FalseAccept);
        assert_eq!(Outcome::classify(&result(Rejected, None, Some("a"), 1)), Outcome::FalseReject);
        assert_eq!(Outcome::classify(&result(Rejected, None, None, 1)), Outcome::TrueReject);
        assert_eq!(Outcome::classify(&result(Failed, None, Some("a"), 1)), Outcome::Failed);
    }

    #[test]
    fn test_summary() {
        use QueryStatus::*;
        let results = vec![
            result(Accepted, Some("a"), Some("a"), 100),
            result(Accepted, Some("a"), Some("a"), 200),
            result(Accepted, Some("x"), Some("b"), 300),
            result(Rejected, None, Some("c"), 400),
            result(Rejected, None, None, 500),
            result(Failed, None, Some("d"), 2000),
        ];

        let summary = EvaluationSummary::from_results(&results);
        assert_eq!(summary.total, 6);
        assert_eq!(summary.true_accepts, 2);
        assert_eq!(summary.false_accepts, 1);
        assert_eq!(summary.false_rejects, 1);
        assert_eq!(summary.true_rejects, 1);
        assert_eq!(summary.failures, 1);
        assert!((summary.top1_accuracy - 2.0 / 5.0).abs() < 1e-12);
        assert!((summary.false_accept_rate - 1.0 / 5.0).abs() < 1e-12);
        assert!((summary.mean_latency_ms - 3500.0 / 6.0).abs() < 1e-9);
        assert_eq!(summary.p95_latency_ms, 2000);
    }

    #[test]
    fn test_empty() {
        let summary = EvaluationSummary::from_results(&[]);
        assert_eq!(summary, EvaluationSummary::default());
    }
}
