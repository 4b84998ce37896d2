/// Evaluation summary over results produced by the engine
mod common;

use audioprov::evaluation::{EvaluationSummary, Outcome};
use audioprov::query::{QueryEngine, QueryRequest, QueryResult};
use audioprov::ranking::SeverityTier;
use common::*;
use std::sync::Arc;

#[tokio::test]
async fn test_summary_over_engine_results() {
    let index = ScriptedIndex::new()
        .segments(0..4, &[("trackA", 0.97), ("trackB", 0.50)]);
    let engine = QueryEngine::new(Arc::new(MarkerEmbedder::new()), Arc::new(index), test_config())
        .unwrap();
    let input = query_input("query-eval", 4);
    let base = QueryRequest::new().with_severity(SeverityTier::Mild).deterministic();

    let results = vec![
        engine.query(&input, &base.clone().with_expected("trackA")).await,
        engine.query(&input, &base.clone().with_expected("trackB")).await,
        engine.query(&input, &base.clone()).await,
        engine.query(&input, &base.clone().with_topk(0).with_expected("trackA")).await,
    ];

    let outcomes: Vec<Outcome> = results.iter().map(Outcome::classify).collect();
    assert_eq!(
        outcomes,
        vec![
            Outcome::TrueAccept,
            Outcome::FalseAccept,
            Outcome::FalseAccept,
            Outcome::Failed
        ]
    );

    // Saved results reload losslessly for offline summaries
    let json = serde_json::to_string(&results).unwrap();
    let reloaded: Vec<QueryResult> = serde_json::from_str(&json).unwrap();
    let summary = EvaluationSummary::from_results(&reloaded);

    assert_eq!(summary.total, 4);
    assert_eq!(summary.true_accepts, 1);
    assert_eq!(summary.false_accepts, 2);
    assert_eq!(summary.failures, 1);
    assert!((summary.top1_accuracy - 1.0 / 3.0).abs() < 1e-12);
    assert!((summary.false_accept_rate - 2.0 / 3.0).abs() < 1e-12);
}
