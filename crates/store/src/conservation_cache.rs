//! Cross-run cache of per-residue conservation scores.
//!
//! Sequences are grouped into bucket files by a content hash; a bucket is
//! a newline-delimited list of JSON records. Entries are immutable, so a
//! lost update between concurrent writers only costs a future cache miss.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::error::Result;
use crate::fs::write_atomic;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    /// Full sequence, kept to disambiguate hash collisions.
    sequence: String,
    scores: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct ConservationCache {
    directory: PathBuf,
}

impl ConservationCache {
    /// Cache rooted at a directory, typically one per conservation mode.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn bucket_path(&self, sequence: &str) -> PathBuf {
        let digest = Sha256::digest(sequence.as_bytes());
        self.directory.join(format!("{}.jsonl", hex::encode(digest)))
    }

    /// Return the stored scores for a sequence, or `None` on a miss.
    /// Collisions inside a bucket are resolved by sequence equality.
    pub async fn lookup(&self, sequence: &str) -> Result<Option<Vec<f64>>> {
        let entries = self.read_bucket(&self.bucket_path(sequence)).await?;
        for entry in entries {
            if entry.sequence == sequence {
                debug!(sequence_length = sequence.len(), "Conservation cache hit");
                return Ok(Some(entry.scores));
            }
        }
        Ok(None)
    }

    /// Store scores for a sequence unless it is already present. The
    /// bucket is re-read before the rewrite to merge concurrent writers;
    /// the rewrite itself is atomic.
    pub async fn store(&self, sequence: &str, scores: &[f64]) -> Result<()> {
        let path = self.bucket_path(sequence);
        let mut entries = self.read_bucket(&path).await?;
        if entries.iter().any(|entry| entry.sequence == sequence) {
            return Ok(());
        }
        entries.push(CacheEntry {
            sequence: sequence.to_string(),
            // Negative values mean "no signal" on the source scale.
            scores: scores.iter().map(|score| score.max(0.0)).collect(),
        });

        fs::create_dir_all(&self.directory).await?;
        let mut content = Vec::new();
        for entry in &entries {
            serde_json::to_writer(&mut content, entry)?;
            content.push(b'\n');
        }
        write_atomic(&path, &content).await?;
        info!(
            sequence_length = sequence.len(),
            bucket = %path.display(),
            "Conservation scores cached"
        );
        Ok(())
    }

    async fn read_bucket(&self, path: &Path) -> Result<Vec<CacheEntry>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in content.lines().filter(|line| !line.trim().is_empty()) {
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let cache = ConservationCache::new(dir.path());

        assert!(cache.lookup("MKT").await.unwrap().is_none());
        cache.store("MKT", &[1.0, 0.5, 0.25]).await.unwrap();

        let scores = cache.lookup("MKT").await.unwrap().unwrap();
        assert_eq!(scores, vec![1.0, 0.5, 0.25]);
    }

    #[tokio::test]
    async fn test_repeated_lookups_identical() {
        let dir = TempDir::new().unwrap();
        let cache = ConservationCache::new(dir.path());
        cache.store("MKT", &[0.9, 0.1, 0.0]).await.unwrap();

        let first = cache.lookup("MKT").await.unwrap().unwrap();
        let second = cache.lookup("MKT").await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_negative_scores_clamped_to_zero() {
        let dir = TempDir::new().unwrap();
        let cache = ConservationCache::new(dir.path());
        cache.store("MKT", &[-5.0, 0.5, -0.1]).await.unwrap();

        let scores = cache.lookup("MKT").await.unwrap().unwrap();
        assert_eq!(scores, vec![0.0, 0.5, 0.0]);
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = ConservationCache::new(dir.path());
        cache.store("MKT", &[1.0]).await.unwrap();
        cache.store("MKT", &[9.0]).await.unwrap();

        // First write wins; entries are immutable.
        assert_eq!(cache.lookup("MKT").await.unwrap().unwrap(), vec![1.0]);
    }

    #[tokio::test]
    async fn test_bucket_collision_resolved_by_sequence() {
        let dir = TempDir::new().unwrap();
        let cache = ConservationCache::new(dir.path());
        cache.store("MKT", &[1.0, 2.0, 3.0]).await.unwrap();

        // Force a second sequence into the same bucket file to simulate
        // a hash collision; the lookup must still distinguish them.
        let bucket = cache.bucket_path("MKT");
        let mut content = fs::read_to_string(&bucket).await.unwrap();
        content.push_str("{\"sequence\":\"AAA\",\"scores\":[7.0,7.0,7.0]}\n");
        fs::write(&bucket, content).await.unwrap();

        let colliding = cache.read_bucket(&bucket).await.unwrap();
        assert_eq!(colliding.len(), 2);
        assert_eq!(
            cache.lookup("MKT").await.unwrap().unwrap(),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[tokio::test]
    async fn test_unknown_sequence_with_existing_buckets_misses() {
        let dir = TempDir::new().unwrap();
        let cache = ConservationCache::new(dir.path());
        cache.store("MKT", &[1.0, 2.0, 3.0]).await.unwrap();
        assert!(cache.lookup("TKM").await.unwrap().is_none());
    }
}
