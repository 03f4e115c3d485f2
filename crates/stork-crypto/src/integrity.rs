//! SHA-256 hashing of chunks, byte ranges and whole files.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// Read buffer for streaming hashes (4 MB).
const HASH_BUF_SIZE: usize = 4 * 1024 * 1024;

/// Hex SHA-256 of a byte slice.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex SHA-256 of a whole file, streamed.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of `len` bytes starting at `offset`.
///
/// Fails with `UnexpectedEof` if the file is shorter than the range.
pub async fn hash_range(path: &Path, offset: u64, len: u64) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut hasher = Sha256::new();
    let mut remaining = len;
    let mut buf = vec![0u8; HASH_BUF_SIZE.min(len as usize).max(1)];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..want]).await?;
        hasher.update(&buf[..want]);
        remaining -= want as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Number of chunks needed to tile `size` bytes: `ceil(size / chunk_size)`.
/// A zero-length file has zero chunks.
pub fn total_chunks(size: u64, chunk_size: u64) -> u32 {
    if size == 0 || chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size) as u32
}

/// Length of chunk `index`; the last chunk may be shorter.
pub fn chunk_len(size: u64, chunk_size: u64, index: u32) -> u64 {
    let offset = index as u64 * chunk_size;
    if offset >= size {
        return 0;
    }
    (size - offset).min(chunk_size)
}

/// Constant-time comparison of two hex digests.
pub fn digest_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b)
        .fold(0u8, |acc, (x, y)| acc | (x.to_ascii_lowercase() ^ y.to_ascii_lowercase()))
        == 0
}
