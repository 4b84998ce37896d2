/// Persisted segment-embedding cache shared across engine runs
mod common;

use audioprov::embedding::{CacheKey, EmbeddingCache, SqliteEmbeddingCache};
use audioprov::query::{QueryEngine, QueryRequest, QueryStatus};
use common::*;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_second_query_served_from_sqlite_cache() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("cache").join("embeddings.db");
    let cache = Arc::new(SqliteEmbeddingCache::open(&db_path).unwrap());

    let embedder = Arc::new(MarkerEmbedder::new());
    let index = Arc::new(ScriptedIndex::new().segments(0..4, &[("trackA", 0.97)]));
    let engine = QueryEngine::new(embedder.clone(), index, test_config())
        .unwrap()
        .with_cache(cache.clone());

    let input = query_input("query-cached", 4);
    let request = QueryRequest::new().deterministic();

    let first = engine.query(&input, &request).await;
    assert_eq!(first.status, QueryStatus::Accepted);
    assert_eq!(first.diagnostics.cache_hits, 0);
    let calls_after_first = embedder.calls();
    assert!(calls_after_first > 0);

    let stats = cache.stats().unwrap();
    assert_eq!(stats.entries, 4);
    assert_eq!(stats.assets, 1);

    let second = engine.query(&input, &request).await;
    assert_eq!(second.status, QueryStatus::Accepted);
    assert_eq!(second.diagnostics.cache_hits, 4);
    assert_eq!(embedder.calls(), calls_after_first);
    assert_eq!(second.candidates, first.candidates);
}

#[test]
fn test_cache_survives_reopen_and_purge() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("embeddings.db");

    {
        let cache = SqliteEmbeddingCache::open(&db_path).unwrap();
        for window in 0..3 {
            cache
                .put(&CacheKey::new("ref-1", PRIMARY, window), &one_hot(window as usize))
                .unwrap();
        }
        cache
            .put(&CacheKey::new("ref-2", PRIMARY, 0), &one_hot(5))
            .unwrap();
    }

    let cache = SqliteEmbeddingCache::open(&db_path).unwrap();
    let vectors = cache.asset_vectors("ref-1", PRIMARY).unwrap();
    let windows: Vec<u32> = vectors.iter().map(|(w, _)| *w).collect();
    assert_eq!(windows, vec![0, 1, 2]);
    assert_eq!(vectors[2].1, one_hot(2));

    assert_eq!(cache.purge(Some("ref-1")).unwrap(), 3);
    assert!(cache.get(&CacheKey::new("ref-1", PRIMARY, 0)).unwrap().is_none());
    assert_eq!(cache.stats().unwrap().entries, 1);
}
