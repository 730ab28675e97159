//! SHA-256 content hashing, rendered as uppercase hex.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::NetworkError;

const READ_BUF: usize = 64 * 1024;

/// Hash a whole file on the calling thread.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = StreamHasher::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// Hash a whole file on the blocking pool so the runtime is never stalled.
pub async fn sha256_file_async(path: PathBuf) -> Result<String, NetworkError> {
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| NetworkError::Transport(format!("Hash worker failed: {e}")))?
        .map_err(NetworkError::from)
}

/// Uppercase hex SHA-256 of an in-memory buffer.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(bytes))
}

/// Compare two hex digests ignoring case.
pub fn hashes_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Incremental hasher fed chunk by chunk while bytes arrive.
#[derive(Default)]
pub struct StreamHasher {
    inner: Sha256,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    /// Consume the hasher and return the uppercase hex digest.
    pub fn finish(self) -> String {
        hex::encode_upper(self.inner.finalize())
    }
}
