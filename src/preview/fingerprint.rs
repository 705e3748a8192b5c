//! Content fingerprints used as disk cache keys

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use log::debug;
use lru::LruCache;

use super::error::PreviewError;

const READ_CHUNK: usize = 64 * 1024;
const DEFAULT_MEMO_CAPACITY: usize = 512;

/// Hex digest of a file's bytes. Identical bytes give identical
/// fingerprints, whatever the path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of an in-memory buffer.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("{:x}", md5::compute(bytes)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct MemoKey {
    path: PathBuf,
    modified: Option<SystemTime>,
    len: u64,
}

/// Streams files through md5 and remembers results per
/// `(path, mtime, size)` for the session.
pub struct ContentHasher {
    memo: Mutex<LruCache<MemoKey, Fingerprint>>,
}

impl ContentHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMO_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            memo: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Fingerprint the file at `path`.
    pub fn hash(&self, path: &Path) -> Result<Fingerprint, PreviewError> {
        let meta = std::fs::metadata(path).map_err(|e| PreviewError::io(path, e))?;
        let key = MemoKey {
            path: path.to_path_buf(),
            modified: meta.modified().ok(),
            len: meta.len(),
        };

        if let Some(hit) = self
            .memo
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
        {
            return Ok(hit.clone());
        }

        let fingerprint = hash_file(path)?;
        debug!("Fingerprint {fingerprint} for {path:?}");

        self.memo
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .put(key, fingerprint.clone());
        Ok(fingerprint)
    }

    /// Number of memoized fingerprints.
    #[must_use]
    pub fn memo_len(&self) -> usize {
        self.memo
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_file(path: &Path) -> Result<Fingerprint, PreviewError> {
    let mut file = File::open(path).map_err(|e| PreviewError::io(path, e))?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(PreviewError::io(path, e)),
        };
        context.consume(&buf[..n]);
    }

    Ok(Fingerprint(format!("{:x}", context.compute())))
}
