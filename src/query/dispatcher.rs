//! Bounded fan-out of per-segment embed + search work
//!
//! Architecture:
//! - The coordinating task resolves cache hits, owns every cache write, and
//!   merges results keyed by segment id
//! - Embedding batches run in one `JoinSet` gated by the embedding semaphore;
//!   each embedded segment is handed to a second `JoinSet` of index searches
//!   gated by the index semaphore
//! - The loop races completions against the deadline and the caller's
//!   cancellation token; aborting both sets halts outstanding work
//! - Early termination looks at the consensus of completed segments and
//!   either aborts the remaining work or lowers k for searches not yet started

use crate::embedding::{
    BandEmphasis, CacheKey, EmbeddingBatch, EmbeddingCache, EmbeddingClient, EmbeddingError,
    WorkerConfig,
};
use crate::index::{IndexError, IndexHit, IndexQueryClient};
use crate::ranking::{leading_candidate, AggregationError, CandidateMatch, SegmentEvidence};
use crate::segment::{Segment, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Query cancelled")]
    Cancelled,

    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyTerminationMode {
    /// Abort every outstanding embed and search
    Skip,
    /// Keep going, but searches not yet started use `downgraded_k`
    Downgrade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyTerminationConfig {
    pub enabled: bool,
    /// Fraction of segments that must complete before consensus is checked
    pub min_completed_fraction: f32,
    /// Leader rank-1 ratio that must be exceeded
    pub dominance_ratio: f32,
    /// Leader mean similarity that must be exceeded
    pub min_mean_similarity: f32,
    pub mode: EarlyTerminationMode,
    pub downgraded_k: usize,
}

impl Default for EarlyTerminationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_completed_fraction: 0.5,
            dominance_ratio: 0.8,
            min_mean_similarity: 0.90,
            mode: EarlyTerminationMode::Skip,
            downgraded_k: 5,
        }
    }
}

impl EarlyTerminationConfig {
    fn required_completions(&self, total: usize) -> usize {
        let fraction = self.min_completed_fraction.clamp(0.0, 1.0) as f64;
        ((fraction * total as f64).ceil() as usize).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Embedding,
    Search,
    Worker,
}

/// Non-fatal per-segment failure, surfaced as a diagnostic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFailure {
    pub segment_id: SegmentId,
    pub stage: FailureStage,
    pub message: String,
}

/// Work for one dispatch pass
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    /// Query asset id; also the cache key prefix for its windows
    pub asset_id: String,
    pub sample_rate: u32,
    pub samples: Arc<[f32]>,
    pub segments: Vec<Segment>,
    pub search_k: usize,
    pub emphasis: BandEmphasis,
    pub early_termination: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// Evidence of every successfully searched segment, by segment id
    pub evidence: Vec<SegmentEvidence>,
    /// Embeddings of the query's segments (cached or fresh)
    pub query_vectors: BTreeMap<SegmentId, Vec<f32>>,
    pub failures: Vec<SegmentFailure>,
    pub total: usize,
    /// Searches started
    pub dispatched: usize,
    pub completed: usize,
    pub early_terminated: bool,
    /// Completed searches when early termination fired
    pub terminated_after: Option<usize>,
    /// Segments abandoned by early termination or timeout
    pub skipped: usize,
    pub timed_out: bool,
    pub cache_hits: usize,
    pub final_k: usize,
}

impl DispatchReport {
    /// Fold a later pass (escalation scales) into this report
    pub fn merge(&mut self, other: DispatchReport) {
        self.evidence.extend(other.evidence);
        self.evidence.sort_by_key(|e| e.segment_id);
        self.query_vectors.extend(other.query_vectors);
        self.failures.extend(other.failures);
        self.total += other.total;
        self.dispatched += other.dispatched;
        self.completed += other.completed;
        self.early_terminated |= other.early_terminated;
        self.terminated_after = self.terminated_after.or(other.terminated_after);
        self.skipped += other.skipped;
        self.timed_out |= other.timed_out;
        self.cache_hits += other.cache_hits;
    }
}

struct EmbedOutcome {
    segments: Vec<Segment>,
    result: Result<Vec<Vec<f32>>, EmbeddingError>,
}

struct SearchOutcome {
    segment: Segment,
    k: usize,
    result: Result<Vec<IndexHit>, IndexError>,
}

/// Parallel embed + search dispatcher
///
/// The model, index and cache handles are shared read-only with workers;
/// only the coordinating task writes to the cache.
pub struct ParallelDispatcher {
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn IndexQueryClient>,
    cache: Option<Arc<dyn EmbeddingCache>>,
    workers: WorkerConfig,
    early: EarlyTerminationConfig,
}

impl ParallelDispatcher {
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn IndexQueryClient>,
        cache: Option<Arc<dyn EmbeddingCache>>,
        workers: WorkerConfig,
        early: EarlyTerminationConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            cache,
            workers,
            early,
        }
    }

    /// Run one dispatch pass until every segment settles, early termination
    /// fires, the deadline passes, or `cancel` is triggered
    ///
    /// A timeout is reported through `DispatchReport::timed_out` with the
    /// segments that completed before it; cancellation discards all work.
    pub async fn dispatch(
        &self,
        plan: DispatchPlan,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, DispatchError> {
        let dimension = self.embedder.dimension();
        if self.index.dimension() != dimension {
            return Err(AggregationError::DimensionMismatch {
                expected: dimension,
                actual: self.index.dimension(),
                context: "index dimension differs from embedding model".to_string(),
            }
            .into());
        }

        let mut report = DispatchReport {
            total: plan.segments.len(),
            final_k: plan.search_k,
            ..DispatchReport::default()
        };
        if plan.segments.is_empty() {
            return Ok(report);
        }

        let mut outstanding: BTreeSet<SegmentId> = plan.segments.iter().map(|s| s.id).collect();
        let k = Arc::new(AtomicUsize::new(plan.search_k));
        let embed_permits = Arc::new(Semaphore::new(self.workers.embedding_workers.max(1)));
        let search_permits = Arc::new(Semaphore::new(self.workers.index_workers.max(1)));
        let mut embed_tasks: JoinSet<EmbedOutcome> = JoinSet::new();
        let mut search_tasks: JoinSet<SearchOutcome> = JoinSet::new();

        let mut misses = Vec::new();
        for segment in &plan.segments {
            match self.cached_vector(&plan.asset_id, segment)? {
                Some(vector) => {
                    report.cache_hits += 1;
                    report.dispatched += 1;
                    self.spawn_search(&mut search_tasks, &search_permits, &k, segment.clone(), &vector);
                    report.query_vectors.insert(segment.id, vector);
                }
                None => misses.push(segment.clone()),
            }
        }

        for chunk in misses.chunks(self.workers.embedding_batch_size.max(1)) {
            self.spawn_embed(&mut embed_tasks, &embed_permits, &plan, chunk.to_vec());
        }

        debug!(
            asset = %plan.asset_id,
            model = self.embedder.model_name(),
            segments = report.total,
            cache_hits = report.cache_hits,
            embed_batches = embed_tasks.len(),
            k = plan.search_k,
            "Dispatching segments"
        );

        let mut evidence: Vec<SegmentEvidence> = Vec::with_capacity(report.total);
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        loop {
            if embed_tasks.is_empty() && search_tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    embed_tasks.abort_all();
                    search_tasks.abort_all();
                    info!(asset = %plan.asset_id, "Dispatch cancelled");
                    return Err(DispatchError::Cancelled);
                }

                _ = &mut sleep => {
                    embed_tasks.abort_all();
                    search_tasks.abort_all();
                    report.timed_out = true;
                    warn!(
                        asset = %plan.asset_id,
                        completed = evidence.len(),
                        outstanding = outstanding.len(),
                        "Dispatch deadline reached"
                    );
                    break;
                }

                Some(joined) = embed_tasks.join_next(), if !embed_tasks.is_empty() => {
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(error = %e, "Embedding worker did not complete");
                            continue;
                        }
                    };

                    match outcome.result {
                        Ok(vectors) => {
                            for (segment, vector) in outcome.segments.into_iter().zip(vectors) {
                                self.store(&plan.asset_id, &segment, &vector);
                                report.dispatched += 1;
                                self.spawn_search(&mut search_tasks, &search_permits, &k, segment.clone(), &vector);
                                report.query_vectors.insert(segment.id, vector);
                            }
                        }
                        Err(e) => {
                            warn!(
                                asset = %plan.asset_id,
                                segments = outcome.segments.len(),
                                error = %e,
                                "Embedding batch failed"
                            );
                            for segment in outcome.segments {
                                outstanding.remove(&segment.id);
                                report.failures.push(SegmentFailure {
                                    segment_id: segment.id,
                                    stage: FailureStage::Embedding,
                                    message: e.to_string(),
                                });
                            }
                        }
                    }
                }

                Some(joined) = search_tasks.join_next(), if !search_tasks.is_empty() => {
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(error = %e, "Search worker did not complete");
                            continue;
                        }
                    };
                    outstanding.remove(&outcome.segment.id);

                    match outcome.result {
                        Ok(hits) => {
                            tracing::trace!(
                                segment = %outcome.segment.id,
                                k = outcome.k,
                                hits = hits.len(),
                                "Segment searched"
                            );
                            evidence.push(to_evidence(&outcome.segment, hits));
                        }
                        Err(e) => {
                            warn!(segment = %outcome.segment.id, error = %e, "Segment search failed");
                            report.failures.push(SegmentFailure {
                                segment_id: outcome.segment.id,
                                stage: FailureStage::Search,
                                message: e.to_string(),
                            });
                            continue;
                        }
                    }

                    if plan.early_termination
                        && !report.early_terminated
                        && self.should_terminate(&evidence, report.total, outstanding.len())
                    {
                        report.early_terminated = true;
                        report.terminated_after = Some(evidence.len());
                        match self.early.mode {
                            EarlyTerminationMode::Skip => {
                                embed_tasks.abort_all();
                                search_tasks.abort_all();
                                break;
                            }
                            EarlyTerminationMode::Downgrade => {
                                k.store(self.early.downgraded_k.max(1), Ordering::Relaxed);
                            }
                        }
                    }
                }
            }
        }

        if report.timed_out || (report.early_terminated && self.early.mode == EarlyTerminationMode::Skip) {
            report.skipped = outstanding.len();
        } else {
            // Remaining ids belong to workers that panicked or were aborted
            for segment_id in outstanding {
                report.failures.push(SegmentFailure {
                    segment_id,
                    stage: FailureStage::Worker,
                    message: "worker task did not complete".to_string(),
                });
            }
        }

        evidence.sort_by_key(|e| e.segment_id);
        report.completed = evidence.len();
        report.evidence = evidence;
        report.final_k = k.load(Ordering::Relaxed);
        report.failures.sort_by_key(|f| f.segment_id);

        debug!(
            asset = %plan.asset_id,
            completed = report.completed,
            failed = report.failures.len(),
            skipped = report.skipped,
            early_terminated = report.early_terminated,
            timed_out = report.timed_out,
            "Dispatch pass finished"
        );

        Ok(report)
    }

    fn should_terminate(&self, evidence: &[SegmentEvidence], total: usize, remaining: usize) -> bool {
        if !self.early.enabled || remaining == 0 {
            return false;
        }
        if evidence.len() < self.early.required_completions(total) {
            return false;
        }

        match leading_candidate(evidence) {
            Some(leader)
                if leader.rank1_ratio > self.early.dominance_ratio
                    && leader.mean_similarity > self.early.min_mean_similarity =>
            {
                info!(
                    leader = %leader.asset_id,
                    rank1_ratio = leader.rank1_ratio,
                    mean_similarity = leader.mean_similarity,
                    completed = evidence.len(),
                    remaining,
                    mode = ?self.early.mode,
                    "Early termination"
                );
                true
            }
            _ => false,
        }
    }

    fn cached_vector(&self, asset_id: &str, segment: &Segment) -> Result<Option<Vec<f32>>, DispatchError> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };

        let key = CacheKey::new(asset_id, segment.id.scale, segment.id.index);
        let vector = match cache.get(&key) {
            Ok(Some(vector)) => vector,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(segment = %segment.id, error = %e, "Cache read failed, embedding afresh");
                return Ok(None);
            }
        };

        let dimension = self.embedder.dimension();
        if vector.len() != dimension {
            return Err(AggregationError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
                context: format!("cached embedding for {} {}", asset_id, segment.id),
            }
            .into());
        }
        Ok(Some(vector))
    }

    fn store(&self, asset_id: &str, segment: &Segment, vector: &[f32]) {
        if let Some(cache) = &self.cache {
            let key = CacheKey::new(asset_id, segment.id.scale, segment.id.index);
            if let Err(e) = cache.put(&key, vector) {
                warn!(segment = %segment.id, error = %e, "Cache write failed");
            }
        }
    }

    fn spawn_embed(
        &self,
        tasks: &mut JoinSet<EmbedOutcome>,
        permits: &Arc<Semaphore>,
        plan: &DispatchPlan,
        segments: Vec<Segment>,
    ) {
        let embedder = Arc::clone(&self.embedder);
        let permits = Arc::clone(permits);
        let samples = Arc::clone(&plan.samples);
        let sample_rate = plan.sample_rate;
        let emphasis = plan.emphasis;

        tasks.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return EmbedOutcome {
                        segments,
                        result: Err(EmbeddingError::ModelUnavailable(
                            "embedding pool closed".to_string(),
                        )),
                    };
                }
            };

            let batch = EmbeddingBatch {
                sample_rate,
                emphasis,
                clips: segments.iter().map(|s| s.samples(&samples)).collect(),
            };
            let result = embedder.embed_checked(&batch).await;
            drop(batch);

            EmbedOutcome { segments, result }
        });
    }

    fn spawn_search(
        &self,
        tasks: &mut JoinSet<SearchOutcome>,
        permits: &Arc<Semaphore>,
        k: &Arc<AtomicUsize>,
        segment: Segment,
        vector: &[f32],
    ) {
        let index = Arc::clone(&self.index);
        let permits = Arc::clone(permits);
        let k = Arc::clone(k);
        let vector = vector.to_vec();

        tasks.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return SearchOutcome {
                        segment,
                        k: 0,
                        result: Err(IndexError::Unavailable("search pool closed".to_string())),
                    };
                }
            };

            // Read after acquiring the permit so a downgrade reaches queued work
            let k = k.load(Ordering::Relaxed);
            let result = index.search(&vector, k).await;
            SearchOutcome { segment, k, result }
        });
    }
}

fn to_evidence(segment: &Segment, hits: Vec<IndexHit>) -> SegmentEvidence {
    let matches = hits
        .into_iter()
        .enumerate()
        .map(|(position, hit)| CandidateMatch {
            segment_id: segment.id,
            asset_id: hit.asset_id,
            similarity: hit.similarity,
            rank: position as u32 + 1,
            segment_ref: Some(hit.segment_ref),
        })
        .collect();

    SegmentEvidence {
        segment_id: segment.id,
        weight: segment.weight,
        matches,
    }
}
