//! Receiver-side resume markers.
//!
//! Each in-flight received file lives in the partial directory as two
//! files keyed by transfer id: `<id>.part` (pre-allocated to the declared
//! size) and `<id>.resume.json`. The marker records the SHA-256 of every
//! verified chunk, so on restart the partial file can be re-validated chunk
//! by chunk before anything is trusted.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use stork_crypto::integrity::{chunk_len, digest_eq, hash_range};
use stork_crypto::persist::{read_json, write_json};
use tracing::{debug, warn};
use uuid::Uuid;

const MARKER_SUFFIX: &str = ".resume.json";
const PART_SUFFIX: &str = ".part";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub file_hash: String,
    /// Hex SHA-256 of each chunk that was verified and written.
    pub chunk_hashes: BTreeMap<u32, String>,
    /// Length of the gap-free prefix of written chunks.
    pub contiguous: u32,
    pub last_write: DateTime<Utc>,
    pub peer_id: Option<String>,
    /// Set when finalize found a hash mismatch; the partial is kept but
    /// never resumed.
    pub failed: bool,
}

impl ResumeState {
    pub fn new(
        transfer_id: Uuid,
        file_name: &str,
        total_size: u64,
        chunk_size: u64,
        total_chunks: u32,
        file_hash: &str,
        peer_id: Option<String>,
    ) -> Self {
        Self {
            transfer_id,
            file_name: file_name.to_string(),
            total_size,
            chunk_size,
            total_chunks,
            file_hash: file_hash.to_ascii_lowercase(),
            chunk_hashes: BTreeMap::new(),
            contiguous: 0,
            last_write: Utc::now(),
            peer_id,
            failed: false,
        }
    }

    /// Same file, same chunking.
    pub fn matches(&self, file_name: &str, file_hash: &str, total_size: u64, chunk_size: u64) -> bool {
        self.file_name == file_name
            && digest_eq(&self.file_hash, file_hash)
            && self.total_size == total_size
            && self.chunk_size == chunk_size
    }

    /// Record a verified chunk. Returns false if it was already recorded
    /// with the same hash.
    pub fn record_chunk(&mut self, index: u32, hash: &str) -> bool {
        let hash = hash.to_ascii_lowercase();
        if self.chunk_hashes.get(&index) == Some(&hash) {
            return false;
        }
        self.chunk_hashes.insert(index, hash);
        while self.chunk_hashes.contains_key(&self.contiguous) {
            self.contiguous += 1;
        }
        self.last_write = Utc::now();
        true
    }

    pub fn chunk_hash(&self, index: u32) -> Option<&str> {
        self.chunk_hashes.get(&index).map(String::as_str)
    }

    pub fn is_complete(&self) -> bool {
        self.contiguous >= self.total_chunks
    }

    pub fn missing_chunks(&self) -> u32 {
        self.total_chunks.saturating_sub(self.chunk_hashes.len() as u32)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: TimeDelta) -> bool {
        now - self.last_write > max_age
    }

    /// Re-hash every recorded chunk range of `part`. Any mismatch or short
    /// read means the partial file cannot be trusted.
    pub async fn validate(&self, part: &Path) -> io::Result<bool> {
        let meta = match tokio::fs::metadata(part).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        if meta.len() != self.total_size {
            debug!(transfer_id = %self.transfer_id, "Partial file has the wrong size");
            return Ok(false);
        }

        for (&index, expected) in &self.chunk_hashes {
            if index >= self.total_chunks {
                return Ok(false);
            }
            let offset = index as u64 * self.chunk_size;
            let len = chunk_len(self.total_size, self.chunk_size, index);
            let actual = match hash_range(part, offset, len).await {
                Ok(h) => h,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e),
            };
            if !digest_eq(&actual, expected) {
                warn!(transfer_id = %self.transfer_id, chunk = index, "Recorded chunk no longer matches");
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn save(&self, dir: &Path) -> io::Result<()> {
        write_json(&marker_path(dir, self.transfer_id), self)
    }

    pub fn load(dir: &Path, transfer_id: Uuid) -> io::Result<Option<Self>> {
        read_json(&marker_path(dir, transfer_id))
    }
}

pub fn marker_path(dir: &Path, transfer_id: Uuid) -> PathBuf {
    dir.join(format!("{transfer_id}{MARKER_SUFFIX}"))
}

pub fn part_path(dir: &Path, transfer_id: Uuid) -> PathBuf {
    dir.join(format!("{transfer_id}{PART_SUFFIX}"))
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete both the marker and the partial file of `transfer_id`.
pub async fn discard(dir: &Path, transfer_id: Uuid) -> io::Result<()> {
    remove_if_exists(&part_path(dir, transfer_id)).await?;
    remove_if_exists(&marker_path(dir, transfer_id)).await
}

pub async fn remove_marker(dir: &Path, transfer_id: Uuid) -> io::Result<()> {
    remove_if_exists(&marker_path(dir, transfer_id)).await
}

/// What sits in the partial directory.
#[derive(Debug, Default)]
pub struct PartialScan {
    pub markers: Vec<ResumeState>,
    /// `.part` files with no readable marker.
    pub orphans: Vec<Uuid>,
}

pub async fn scan(dir: &Path) -> io::Result<PartialScan> {
    let mut out = PartialScan::default();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e),
    };

    let mut parts = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(id) = name.strip_suffix(MARKER_SUFFIX).and_then(|s| Uuid::parse_str(s).ok()) {
            match ResumeState::load(dir, id) {
                Ok(Some(state)) => out.markers.push(state),
                Ok(None) => {}
                Err(e) => warn!(file = %name, error = %e, "Unreadable resume marker"),
            }
        } else if let Some(id) = name.strip_suffix(PART_SUFFIX).and_then(|s| Uuid::parse_str(s).ok()) {
            parts.push(id);
        }
    }

    out.orphans = parts
        .into_iter()
        .filter(|id| !out.markers.iter().any(|m| m.transfer_id == *id))
        .collect();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use stork_crypto::integrity::checksum_bytes;

    use super::*;

    fn state(size: u64, chunk: u64) -> ResumeState {
        let chunks = stork_crypto::integrity::total_chunks(size, chunk);
        ResumeState::new(Uuid::new_v4(), "a.bin", size, chunk, chunks, "AB", None)
    }

    #[test]
    fn contiguous_prefix_tracks_gaps() {
        let mut s = state(40, 10);
        assert!(s.record_chunk(0, "h0"));
        assert!(s.record_chunk(2, "h2"));
        assert_eq!(s.contiguous, 1);
        assert!(!s.record_chunk(2, "H2"));
        assert!(s.record_chunk(1, "h1"));
        assert_eq!(s.contiguous, 3);
        assert!(!s.is_complete());
        assert_eq!(s.missing_chunks(), 1);
        s.record_chunk(3, "h3");
        assert!(s.is_complete());
    }

    #[test]
    fn matching_ignores_hash_case() {
        let s = state(40, 10);
        assert!(s.matches("a.bin", "ab", 40, 10));
        assert!(!s.matches("a.bin", "ab", 40, 20));
        assert!(!s.matches("b.bin", "ab", 40, 10));
    }

    #[test]
    fn staleness() {
        let mut s = state(10, 10);
        let now = Utc::now();
        s.last_write = now - TimeDelta::hours(200);
        assert!(s.is_stale(now, TimeDelta::hours(168)));
        s.last_write = now;
        assert!(!s.is_stale(now, TimeDelta::hours(168)));
    }

    #[tokio::test]
    async fn validate_detects_corrupted_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = state(20, 10);
        let part = part_path(dir.path(), s.transfer_id);

        let mut data = vec![1u8; 10];
        data.extend_from_slice(&[2u8; 10]);
        std::fs::write(&part, &data).unwrap();
        s.record_chunk(0, &checksum_bytes(&data[..10]));
        s.record_chunk(1, &checksum_bytes(&data[10..]));
        assert!(s.validate(&part).await.unwrap());

        data[15] ^= 0xFF;
        std::fs::write(&part, &data).unwrap();
        assert!(!s.validate(&part).await.unwrap());

        std::fs::write(&part, &data[..5]).unwrap();
        assert!(!s.validate(&part).await.unwrap());

        std::fs::remove_file(&part).unwrap();
        assert!(!s.validate(&part).await.unwrap());
    }

    #[tokio::test]
    async fn scan_finds_markers_and_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let s = state(10, 10);
        s.save(dir.path()).unwrap();
        std::fs::write(part_path(dir.path(), s.transfer_id), [0u8; 10]).unwrap();

        let orphan = Uuid::new_v4();
        std::fs::write(part_path(dir.path(), orphan), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let found = scan(dir.path()).await.unwrap();
        assert_eq!(found.markers, vec![s.clone()]);
        assert_eq!(found.orphans, vec![orphan]);

        discard(dir.path(), s.transfer_id).await.unwrap();
        discard(dir.path(), s.transfer_id).await.unwrap();
        assert!(ResumeState::load(dir.path(), s.transfer_id).unwrap().is_none());
    }
}
