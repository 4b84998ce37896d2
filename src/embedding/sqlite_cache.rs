//! Persisted segment-embedding cache backed by SQLite
//!
//! Vectors are stored as zstd-compressed little-endian f32 blobs with a
//! BLAKE3 checksum of the raw bytes. An entry that fails to decode or verify
//! is logged and reported as a miss.

use super::cache::{CacheError, CacheKey, EmbeddingCache};
use crate::segment::ScaleId;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::path::Path;

type CachePool = Pool<SqliteConnectionManager>;

/// SQLite-backed embedding cache
pub struct SqliteEmbeddingCache {
    pool: CachePool,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub assets: usize,
    pub stored_bytes: u64,
}

impl SqliteEmbeddingCache {
    /// Open (or create) a cache database
    pub fn open(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::Io {
                source: e,
                context: format!("Failed to create cache directory: {:?}", parent),
            })?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| CacheError::Pool(e.to_string()))?;

        {
            let conn = pool.get().map_err(|e| CacheError::Pool(e.to_string()))?;
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
        }

        let cache = Self { pool };
        cache.migrate()?;
        Ok(cache)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, CacheError> {
        self.pool.get().map_err(|e| CacheError::Pool(e.to_string()))
    }

    fn migrate(&self) -> Result<(), CacheError> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM _migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;
            if version > current_version {
                tracing::info!("Applying cache migration {}", version);
                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }

    /// Remove cached vectors (all, or one asset's)
    pub fn purge(&self, asset_id: Option<&str>) -> Result<usize, CacheError> {
        let conn = self.conn()?;
        let removed = match asset_id {
            Some(asset_id) => conn.execute(
                "DELETE FROM segment_embeddings WHERE asset_id = ?1",
                params![asset_id],
            )?,
            None => conn.execute("DELETE FROM segment_embeddings", [])?,
        };
        tracing::info!(removed, asset = ?asset_id, "Purged embedding cache");
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let conn = self.conn()?;
        let (entries, assets, bytes): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT asset_id), COALESCE(SUM(LENGTH(vector)), 0)
             FROM segment_embeddings",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(CacheStats {
            entries: entries as usize,
            assets: assets as usize,
            stored_bytes: bytes as u64,
        })
    }
}

impl EmbeddingCache for SqliteEmbeddingCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>, CacheError> {
        let conn = self.conn()?;
        let row: Option<(i64, String, Vec<u8>)> = conn
            .query_row(
                "SELECT dimension, checksum, vector FROM segment_embeddings
                 WHERE asset_id = ?1 AND scale_ms = ?2 AND window_index = ?3",
                params![&key.asset_id, key.scale.0, key.window_index],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        Ok(row.and_then(|(dimension, checksum, blob)| {
            decode_vector(&blob, &checksum, dimension as usize).or_else(|| {
                tracing::warn!(
                    asset = %key.asset_id,
                    scale = %key.scale,
                    window = key.window_index,
                    "Corrupt cache entry treated as miss"
                );
                None
            })
        }))
    }

    fn put(&self, key: &CacheKey, vector: &[f32]) -> Result<(), CacheError> {
        let (blob, checksum) = encode_vector(vector)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO segment_embeddings
                (asset_id, scale_ms, window_index, dimension, checksum, vector, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(asset_id, scale_ms, window_index) DO UPDATE SET
                dimension = excluded.dimension,
                checksum = excluded.checksum,
                vector = excluded.vector",
            params![
                &key.asset_id,
                key.scale.0,
                key.window_index,
                vector.len() as i64,
                checksum,
                blob,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    fn asset_vectors(
        &self,
        asset_id: &str,
        scale: ScaleId,
    ) -> Result<Vec<(u32, Vec<f32>)>, CacheError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT window_index, dimension, checksum, vector FROM segment_embeddings
             WHERE asset_id = ?1 AND scale_ms = ?2
             ORDER BY window_index",
        )?;

        let rows = stmt.query_map(params![asset_id, scale.0], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;

        let mut vectors = Vec::new();
        for row in rows {
            let (window_index, dimension, checksum, blob) = row?;
            match decode_vector(&blob, &checksum, dimension as usize) {
                Some(vector) => vectors.push((window_index, vector)),
                None => tracing::warn!(
                    asset = asset_id,
                    scale = %scale,
                    window = window_index,
                    "Skipping corrupt cache entry"
                ),
            }
        }
        Ok(vectors)
    }

    fn len(&self) -> Result<usize, CacheError> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM segment_embeddings", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn encode_vector(vector: &[f32]) -> Result<(Vec<u8>, String), CacheError> {
    let raw: Vec<u8> = vector.iter().flat_map(|x| x.to_le_bytes()).collect();
    let checksum = blake3::hash(&raw).to_hex().to_string();
    let compressed = zstd::encode_all(&raw[..], 3).map_err(|e| CacheError::Io {
        source: e,
        context: "Failed to compress embedding".to_string(),
    })?;
    Ok((compressed, checksum))
}

fn decode_vector(blob: &[u8], checksum: &str, dimension: usize) -> Option<Vec<f32>> {
    let raw = zstd::decode_all(blob).ok()?;
    if raw.len() != dimension * 4 || blake3::hash(&raw).to_hex().as_str() != checksum {
        return None;
    }
    Some(
        raw.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// Cache migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    CREATE TABLE segment_embeddings (
        asset_id TEXT NOT NULL,
        scale_ms INTEGER NOT NULL,
        window_index INTEGER NOT NULL,
        dimension INTEGER NOT NULL,
        checksum TEXT NOT NULL,
        vector BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (asset_id, scale_ms, window_index)
    );

    CREATE INDEX idx_segment_embeddings_asset ON segment_embeddings(asset_id, scale_ms);
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip_and_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache").join("embeddings.db");
        let key = CacheKey::new("track-1", ScaleId(3000), 4);

        {
            let cache = SqliteEmbeddingCache::open(&path).unwrap();
            assert_eq!(cache.get(&key).unwrap(), None);
            cache.put(&key, &[0.25, -0.5, 0.75]).unwrap();
            cache.put(&key, &[0.25, -0.5, 0.75]).unwrap();
            assert_eq!(cache.len().unwrap(), 1);
        }

        let cache = SqliteEmbeddingCache::open(&path).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(vec![0.25, -0.5, 0.75]));

        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.assets, 1);
    }

    #[test]
    fn test_corrupt_entry_is_miss() {
        let temp = TempDir::new().unwrap();
        let cache = SqliteEmbeddingCache::open(&temp.path().join("e.db")).unwrap();
        let key = CacheKey::new("t", ScaleId(1500), 0);
        cache.put(&key, &[1.0, 0.0]).unwrap();

        let conn = cache.conn().unwrap();
        conn.execute("UPDATE segment_embeddings SET checksum = 'bogus'", [])
            .unwrap();

        assert_eq!(cache.get(&key).unwrap(), None);
        assert!(cache.asset_vectors("t", ScaleId(1500)).unwrap().is_empty());
    }

    #[test]
    fn test_purge_by_asset() {
        let temp = TempDir::new().unwrap();
        let cache = SqliteEmbeddingCache::open(&temp.path().join("e.db")).unwrap();
        for w in 0..3 {
            cache.put(&CacheKey::new("a", ScaleId(3000), w), &[w as f32]).unwrap();
            cache.put(&CacheKey::new("b", ScaleId(3000), w), &[w as f32]).unwrap();
        }

        assert_eq!(cache.purge(Some("a")).unwrap(), 3);
        assert_eq!(cache.len().unwrap(), 3);
        assert_eq!(
            cache.asset_vectors("b", ScaleId(3000)).unwrap(),
            vec![(0, vec![0.0]), (1, vec![1.0]), (2, vec![2.0])]
        );
    }
}
