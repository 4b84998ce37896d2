//! Query engine: the exposed `query` operation
//!
//! Architecture:
//! - `QueryEngine` owns injected, read-only model/index/cache handles and the
//!   plain configuration values; it never reads files
//! - Each query walks a validated phase state machine, recorded in the
//!   result's `trace`
//! - Every outcome is a complete `QueryResult`; failures carry a
//!   `QueryFailure` and no candidates
mod dispatcher;
mod state;

pub use dispatcher::{
    DispatchError, DispatchPlan, DispatchReport, EarlyTerminationConfig, EarlyTerminationMode,
    FailureStage, ParallelDispatcher, SegmentFailure,
};
pub use state::{QueryPhase, QueryState};

use crate::config::{ConfigValidator, EngineConfig};
use crate::embedding::{EmbeddingCache, EmbeddingClient};
use crate::index::IndexQueryClient;
use crate::ranking::{
    leading_candidate, AggregatedCandidate, AggregationError, Aggregator, FusionMode,
    PolicyTable, RecallEstimator, ReferenceLookup, ResolvedPolicy, SearchPolicy, SeverityTier,
    SimilarityEnforcer, TransformCategory, TransformOptimizer,
};
use crate::segment::{AudioAsset, ScaleId, Segment, Segmenter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("No embeddings extracted: all {failed} segments failed ({detail})")]
    NoEmbeddingsExtracted { failed: usize, detail: String },

    #[error("Aggregation invariant violated: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Query timed out after {elapsed_ms}ms ({completed} segments completed)")]
    Timeout { elapsed_ms: u64, completed: usize },

    #[error("Query cancelled")]
    Cancelled,

    #[error("Invalid phase transition {from:?} -> {to:?}")]
    InvalidTransition { from: QueryPhase, to: QueryPhase },
}

impl QueryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidInput(_) => FailureKind::InvalidInput,
            Self::InvalidConfig(_) => FailureKind::InvalidConfig,
            Self::NoEmbeddingsExtracted { .. } => FailureKind::NoEmbeddingsExtracted,
            Self::Aggregation(_) | Self::InvalidTransition { .. } => FailureKind::Aggregation,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }
}

impl From<DispatchError> for QueryError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Cancelled => Self::Cancelled,
            DispatchError::Aggregation(inner) => Self::Aggregation(inner),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidInput,
    InvalidConfig,
    NoEmbeddingsExtracted,
    Aggregation,
    Timeout,
    Cancelled,
}

/// Serialisable failure carried by a `Failed` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&QueryError> for QueryFailure {
    fn from(e: &QueryError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Accepted,
    Rejected,
    Failed,
}

/// Engine-level query defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefaults {
    pub topk: usize,
    pub timeout_ms: u64,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            topk: 5,
            timeout_ms: 10_000,
        }
    }
}

/// Decoded mono query audio
#[derive(Debug, Clone)]
pub struct QueryInput {
    pub asset: AudioAsset,
    pub samples: Arc<[f32]>,
}

impl QueryInput {
    pub fn new(asset: AudioAsset, samples: impl Into<Arc<[f32]>>) -> Self {
        Self {
            asset,
            samples: samples.into(),
        }
    }

    pub fn from_samples(id: impl Into<String>, samples: Vec<f32>, sample_rate: u32) -> Self {
        let asset = AudioAsset::from_samples(id, &samples, sample_rate);
        Self::new(asset, samples)
    }
}

/// Per-query options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Candidates returned at most (engine default when unset)
    #[serde(default)]
    pub topk: Option<usize>,
    /// Declared transform category
    #[serde(default)]
    pub transform: Option<TransformCategory>,
    /// Declared severity; overrides the category's own
    #[serde(default)]
    pub severity: Option<SeverityTier>,
    /// Evaluation context, echoed in the result
    #[serde(default)]
    pub expected_asset_id: Option<String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// On timeout, aggregate whatever completed instead of failing
    #[serde(default)]
    pub best_effort: bool,
    /// Disable early termination for exactly reproducible runs
    #[serde(default)]
    pub deterministic: bool,
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topk(mut self, topk: usize) -> Self {
        self.topk = Some(topk);
        self
    }

    pub fn with_transform(mut self, transform: TransformCategory) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Declare the transform by free-form label; unknown labels resolve to
    /// `TransformCategory::Unknown`
    pub fn with_transform_label(mut self, label: &str) -> Self {
        self.transform = Some(TransformCategory::from_label(label));
        self
    }

    pub fn with_severity(mut self, severity: SeverityTier) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_expected(mut self, asset_id: impl Into<String>) -> Self {
        self.expected_asset_id = Some(asset_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }
}

/// Dispatch and enforcement details for one query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDiagnostics {
    pub segments_total: usize,
    pub segments_completed: usize,
    pub segments_skipped: usize,
    pub dispatched: usize,
    pub cache_hits: usize,
    #[serde(default)]
    pub segment_failures: Vec<SegmentFailure>,
    pub early_terminated: bool,
    pub timed_out: bool,
    pub escalated: bool,
    pub scales: Vec<ScaleId>,
    pub search_k: usize,
    pub final_k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fusion: Option<FusionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_recall: Option<f64>,
    pub revalidated: usize,
    pub rejected_candidates: usize,
    /// Below-threshold candidates, reported in audit mode only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub near_misses: Vec<AggregatedCandidate>,
}

impl QueryDiagnostics {
    fn record_dispatch(&mut self, report: &DispatchReport) {
        self.segments_total = report.total;
        self.segments_completed = report.completed;
        self.segments_skipped = report.skipped;
        self.dispatched = report.dispatched;
        self.cache_hits = report.cache_hits;
        self.segment_failures = report.failures.clone();
        self.early_terminated = report.early_terminated;
        self.timed_out = report.timed_out;
        self.final_k = report.final_k;
    }
}

/// Outcome of one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: Uuid,
    pub asset_id: String,
    /// Qualifying candidates, best first; empty unless `Accepted`
    pub candidates: Vec<AggregatedCandidate>,
    pub latency_ms: u64,
    pub status: QueryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_asset_id: Option<String>,
    pub transform: TransformCategory,
    pub tier: SeverityTier,
    pub threshold: f32,
    pub diagnostics: QueryDiagnostics,
    pub trace: Vec<QueryPhase>,
    pub completed_at: DateTime<Utc>,
}

impl QueryResult {
    pub fn top(&self) -> Option<&AggregatedCandidate> {
        self.candidates.first()
    }

    pub fn is_accepted(&self) -> bool {
        self.status == QueryStatus::Accepted
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Per-query bookkeeping shared by the success and failure paths
struct QueryContext {
    query_id: Uuid,
    started: Instant,
    state: QueryState,
    resolved: ResolvedPolicy,
    threshold: f32,
    diagnostics: QueryDiagnostics,
}

impl QueryContext {
    fn advance(&mut self, next: QueryPhase) -> Result<(), QueryError> {
        tracing::debug!(query_id = %self.query_id, phase = ?next, "Query phase");
        self.state.advance(next)
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Segment-based similarity query engine
pub struct QueryEngine {
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn IndexQueryClient>,
    cache: Option<Arc<dyn EmbeddingCache>>,
    config: EngineConfig,
    segmenter: Segmenter,
    optimizer: TransformOptimizer,
    aggregator: Aggregator,
    enforcer: SimilarityEnforcer,
    recall: RecallEstimator,
}

impl QueryEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn IndexQueryClient>,
        config: EngineConfig,
    ) -> Result<Self, QueryError> {
        ConfigValidator::validate(&config)
            .map_err(|e| QueryError::InvalidConfig(e.to_string()))?;
        let aggregator = Aggregator::new(config.fusion)
            .map_err(|e| QueryError::InvalidConfig(e.to_string()))?;
        let optimizer = TransformOptimizer::new(
            PolicyTable::new(&config.policies),
            config.enforcement.default_tier,
        );
        let enforcer = SimilarityEnforcer::new(
            config.thresholds,
            config.enforcement.clone(),
            config.revalidation.clone(),
        );

        Ok(Self {
            embedder,
            index,
            cache: None,
            segmenter: Segmenter::new(config.segmentation.clone()),
            optimizer,
            aggregator,
            enforcer,
            recall: RecallEstimator::new(config.recall.clone()),
            config,
        })
    }

    /// Attach a caller-owned segment-embedding cache
    pub fn with_cache(mut self, cache: Arc<dyn EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a query to completion
    pub async fn query(&self, input: &QueryInput, request: &QueryRequest) -> QueryResult {
        self.query_with_cancel(input, request, &CancellationToken::new())
            .await
    }

    /// Run a query that halts outstanding work when `cancel` fires
    pub async fn query_with_cancel(
        &self,
        input: &QueryInput,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> QueryResult {
        let resolved = self.optimizer.resolve(request.transform, request.severity);
        let mut ctx = QueryContext {
            query_id: Uuid::new_v4(),
            started: Instant::now(),
            state: QueryState::new(),
            resolved,
            threshold: self.enforcer.threshold(resolved.tier),
            diagnostics: QueryDiagnostics {
                search_k: resolved.policy.search_k,
                fusion: Some(resolved.policy.fusion),
                ..QueryDiagnostics::default()
            },
        };

        info!(
            query_id = %ctx.query_id,
            asset = %input.asset.id,
            transform = %resolved.category,
            tier = %resolved.tier,
            "Query started"
        );

        let outcome = self.run(&mut ctx, input, request, cancel).await;

        let (candidates, status, error) = match outcome {
            Ok((candidates, accepted)) => {
                let status = if accepted {
                    QueryStatus::Accepted
                } else {
                    QueryStatus::Rejected
                };
                (candidates, status, None)
            }
            Err(e) => {
                if let Err(transition) = ctx.state.advance(QueryPhase::Failed) {
                    warn!(query_id = %ctx.query_id, error = %transition, "Query already terminal");
                }
                warn!(query_id = %ctx.query_id, error = %e, "Query failed");
                (Vec::new(), QueryStatus::Failed, Some(QueryFailure::from(&e)))
            }
        };

        let result = QueryResult {
            query_id: ctx.query_id,
            asset_id: input.asset.id.clone(),
            candidates,
            latency_ms: ctx.elapsed_ms(),
            status,
            error,
            expected_asset_id: request.expected_asset_id.clone(),
            transform: ctx.resolved.category,
            tier: ctx.resolved.tier,
            threshold: ctx.threshold,
            diagnostics: ctx.diagnostics,
            trace: ctx.state.into_trace(),
            completed_at: Utc::now(),
        };

        info!(
            query_id = %result.query_id,
            status = ?result.status,
            top = result.top().map(|c| c.asset_id.as_str()).unwrap_or("-"),
            score = result.top().map(|c| c.final_score).unwrap_or(0.0),
            latency_ms = result.latency_ms,
            "Query finished"
        );

        result
    }

    async fn run(
        &self,
        ctx: &mut QueryContext,
        input: &QueryInput,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<(Vec<AggregatedCandidate>, bool), QueryError> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let topk = request.topk.unwrap_or(self.config.query.topk);
        if topk == 0 {
            return Err(QueryError::InvalidInput("topk must be at least 1".to_string()));
        }
        let timeout = request
            .timeout
            .unwrap_or(Duration::from_millis(self.config.query.timeout_ms));
        let deadline = ctx.started + timeout;
        let policy = ctx.resolved.policy;

        ctx.advance(QueryPhase::Segmenting)?;
        let primary = self
            .segmenter
            .segment(&input.asset, &input.samples)
            .map_err(|e| QueryError::InvalidInput(e.to_string()))?;

        let escalation_scales = &self.config.segmentation.escalation;
        let can_escalate =
            policy.allow_escalation && self.recall.enabled() && !escalation_scales.is_empty();

        let mut segments = primary.clone();
        let mut escalated = false;
        if can_escalate {
            let estimate = self.recall.estimate(ctx.resolved.tier, primary.len());
            ctx.diagnostics.expected_recall = Some(estimate.expected_recall);
            if self.recall.needs_escalation(ctx.resolved.tier, primary.len()) {
                segments.extend(self.escalation_segments(input)?);
                escalated = true;
            }
        }

        let early_termination = self.config.early_termination.enabled && !request.deterministic;
        let dispatcher = self.dispatcher();

        ctx.advance(QueryPhase::Embedding)?;
        ctx.advance(QueryPhase::Dispatching)?;
        let mut report = dispatcher
            .dispatch(
                self.plan(input, segments, &policy, early_termination),
                deadline,
                cancel,
            )
            .await?;
        ctx.advance(dispatch_phase(&report))?;

        if !report.timed_out && !report.evidence.is_empty() && can_escalate && !escalated {
            let consensus = leading_candidate(&report.evidence);
            if self.recall.needs_consensus_escalation(consensus.as_ref()) {
                info!(
                    query_id = %ctx.query_id,
                    leader = consensus.as_ref().map(|c| c.asset_id.as_str()).unwrap_or("-"),
                    "Weak consensus, escalating to additional scales"
                );
                ctx.advance(QueryPhase::Dispatching)?;
                let extra = dispatcher
                    .dispatch(
                        self.plan(input, self.escalation_segments(input)?, &policy, false),
                        deadline,
                        cancel,
                    )
                    .await?;
                report.merge(extra);
                escalated = true;
                ctx.advance(dispatch_phase(&report))?;
            }
        }

        ctx.diagnostics.record_dispatch(&report);
        ctx.diagnostics.escalated = escalated;
        let mut scales: Vec<ScaleId> = report.evidence.iter().map(|e| e.segment_id.scale).collect();
        scales.dedup();
        ctx.diagnostics.scales = scales;

        if report.timed_out && (!request.best_effort || report.evidence.is_empty()) {
            return Err(QueryError::Timeout {
                elapsed_ms: ctx.elapsed_ms(),
                completed: report.completed,
            });
        }
        if report.evidence.is_empty() {
            let detail = report
                .failures
                .first()
                .map(|f| format!("{:?}: {}", f.stage, f.message))
                .unwrap_or_else(|| "no segment completed".to_string());
            return Err(QueryError::NoEmbeddingsExtracted {
                failed: report.failures.len(),
                detail,
            });
        }

        ctx.advance(QueryPhase::Aggregating)?;
        let candidates = self.aggregator.aggregate(&report.evidence, policy.fusion)?;

        ctx.advance(QueryPhase::Enforcing)?;
        let references = ReferenceLookup::new(self.cache.clone(), Arc::clone(&self.index));
        let mut verdict = self
            .enforcer
            .enforce(candidates, ctx.resolved.tier, &report.query_vectors, Some(&references))
            .await?;

        ctx.diagnostics.revalidated = verdict.revalidated;
        ctx.diagnostics.rejected_candidates = verdict.rejected_count;
        ctx.diagnostics.near_misses = std::mem::take(&mut verdict.near_misses);

        verdict.candidates.truncate(topk);
        ctx.advance(if verdict.accepted {
            QueryPhase::Accepted
        } else {
            QueryPhase::Rejected
        })?;

        Ok((verdict.candidates, verdict.accepted))
    }

    fn dispatcher(&self) -> ParallelDispatcher {
        ParallelDispatcher::new(
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            self.cache.clone(),
            self.config.workers.clone(),
            self.config.early_termination.clone(),
        )
    }

    fn plan(
        &self,
        input: &QueryInput,
        segments: Vec<Segment>,
        policy: &SearchPolicy,
        early_termination: bool,
    ) -> DispatchPlan {
        DispatchPlan {
            asset_id: input.asset.id.clone(),
            sample_rate: input.asset.sample_rate,
            samples: Arc::clone(&input.samples),
            segments,
            search_k: policy.search_k,
            emphasis: policy.emphasis,
            early_termination,
        }
    }

    fn escalation_segments(&self, input: &QueryInput) -> Result<Vec<Segment>, QueryError> {
        self.segmenter
            .segment_scales(&input.asset, &input.samples, &self.config.segmentation.escalation)
            .map_err(|e| QueryError::InvalidInput(e.to_string()))
    }
}

fn dispatch_phase(report: &DispatchReport) -> QueryPhase {
    if report.early_terminated || report.timed_out {
        QueryPhase::EarlyTerminated
    } else {
        QueryPhase::FullyDispatched
    }
}
