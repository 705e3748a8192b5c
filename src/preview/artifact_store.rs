//! Persistent content-addressed artifact cache
//!
//! Layout: `<root>/<category>/<fingerprint>_<subkey>.<ext>`. Keys derive
//! from immutable content, so concurrent writers of one key write identical
//! bytes and the store needs no locking of its own.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use log::{debug, info, warn};
use walkdir::WalkDir;

use super::error::PreviewError;
use super::fingerprint::Fingerprint;

/// Skip persisting artifacts larger than this (~3 MB, one raster page).
pub const DEFAULT_MAX_ARTIFACT_BYTES: usize = 3_000_000;

/// Category for rendered document pages.
pub const PAGES_CATEGORY: &str = "pages";
/// Category for downscaled single-image previews.
pub const IMAGES_CATEGORY: &str = "images";

/// Fraction of the size limit a sweep trims the cache down to.
const SWEEP_TARGET_PERCENT: u64 = 80;

/// Identifies one cached artifact.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub fingerprint: Fingerprint,
    pub category: String,
    pub sub_key: String,
    pub kind: String,
}

impl ArtifactKey {
    pub fn new(
        fingerprint: Fingerprint,
        category: impl Into<String>,
        sub_key: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            fingerprint,
            category: category.into(),
            sub_key: sub_key.into(),
            kind: kind.into(),
        }
    }

    /// Key of a rendered document page.
    #[must_use]
    pub fn page(fingerprint: Fingerprint, sub_key: impl Into<String>) -> Self {
        Self::new(fingerprint, PAGES_CATEGORY, sub_key, "png")
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.{}",
            self.fingerprint,
            sanitize_component(&self.sub_key),
            sanitize_component(&self.kind)
        )
    }
}

/// A cache hit: where it lives and its bytes.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// What `put` did with the bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Stored(PathBuf),
    SkippedOversized,
    Failed,
}

/// Result of a size sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned_files: usize,
    pub total_bytes: u64,
    pub removed_files: usize,
    pub removed_bytes: u64,
}

pub struct ArtifactStore {
    root: PathBuf,
    max_artifact_bytes: usize,
    // Paths whose write failed this session; never retried.
    failed: Mutex<HashSet<PathBuf>>,
}

impl ArtifactStore {
    pub fn new(root: PathBuf, max_artifact_bytes: usize) -> Result<Self, PreviewError> {
        fs::create_dir_all(&root).map_err(|e| PreviewError::io(&root, e))?;

        Ok(Self {
            root,
            max_artifact_bytes,
            failed: Mutex::new(HashSet::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn max_artifact_bytes(&self) -> usize {
        self.max_artifact_bytes
    }

    #[must_use]
    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(sanitize_component(&key.category))
            .join(key.file_name())
    }

    #[must_use]
    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Read a cached artifact if present. Never decodes anything.
    #[must_use]
    pub fn try_get(&self, key: &ArtifactKey) -> Option<Artifact> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => {
                debug!("Artifact cache hit: {path:?}");
                Some(Artifact { path, bytes })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                debug!("Artifact cache unreadable {path:?}: {e}");
                None
            }
        }
    }

    /// Best-effort write. Oversized artifacts are skipped; failures are
    /// logged and remembered, never surfaced.
    pub fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> PutOutcome {
        if bytes.len() > self.max_artifact_bytes {
            debug!(
                "Skipping artifact {} ({} bytes > {} limit)",
                key.file_name(),
                bytes.len(),
                self.max_artifact_bytes
            );
            return PutOutcome::SkippedOversized;
        }

        let path = self.path_for(key);
        if self
            .failed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&path)
        {
            return PutOutcome::Failed;
        }

        match write_atomically(&path, bytes) {
            Ok(()) => {
                debug!("Stored artifact {path:?} ({} bytes)", bytes.len());
                PutOutcome::Stored(path)
            }
            Err(e) => {
                warn!("{e}");
                self.failed
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert(path);
                PutOutcome::Failed
            }
        }
    }

    /// Trim the cache to 80% of `max_total_bytes` when it exceeds the limit,
    /// deleting the oldest artifacts first.
    pub fn sweep(&self, max_total_bytes: u64) -> SweepStats {
        let mut files: Vec<(PathBuf, u64, SystemTime)> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((entry.into_path(), meta.len(), modified))
            })
            .collect();

        let mut stats = SweepStats {
            scanned_files: files.len(),
            total_bytes: files.iter().map(|(_, len, _)| len).sum(),
            ..SweepStats::default()
        };

        if stats.total_bytes <= max_total_bytes {
            return stats;
        }

        let target = max_total_bytes / 100 * SWEEP_TARGET_PERCENT;
        let mut remaining = stats.total_bytes;
        files.sort_by_key(|(_, _, modified)| *modified);

        for (path, len, _) in files {
            if remaining <= target {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    remaining = remaining.saturating_sub(len);
                    stats.removed_files += 1;
                    stats.removed_bytes += len;
                }
                Err(e) => debug!("Cache sweep could not remove {path:?}: {e}"),
            }
        }

        info!(
            "Cache sweep removed {} files ({} bytes) from {:?}",
            stats.removed_files, stats.removed_bytes, self.root
        );
        stats
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), PreviewError> {
    let cache_write = |source: std::io::Error| PreviewError::CacheWrite {
        path: path.to_path_buf(),
        source,
    };

    let dir = path
        .parent()
        .ok_or_else(|| cache_write(std::io::Error::other("artifact path has no parent")))?;
    fs::create_dir_all(dir).map_err(cache_write)?;

    // Readers never see a partial file: write beside the target, then rename.
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(cache_write)?;
    tmp.write_all(bytes).map_err(cache_write)?;
    tmp.persist(path).map_err(|e| cache_write(e.error))?;
    Ok(())
}

fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fp() -> Fingerprint {
        Fingerprint::of_bytes(b"some document")
    }

    #[test]
    fn path_layout_is_category_then_fingerprint_subkey() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf(), 1024).unwrap();
        let key = ArtifactKey::page(fp(), "3");

        let expected = dir
            .path()
            .join("pages")
            .join(format!("{}_3.png", fp().as_str()));
        assert_eq!(store.path_for(&key), expected);
    }

    #[test]
    fn put_then_get() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf(), 1024).unwrap();
        let key = ArtifactKey::page(fp(), "0");

        assert!(store.try_get(&key).is_none());
        assert!(matches!(store.put(&key, b"png bytes"), PutOutcome::Stored(_)));

        let artifact = store.try_get(&key).unwrap();
        assert_eq!(artifact.bytes, b"png bytes");
        assert!(store.contains(&key));
    }

    #[test]
    fn oversized_artifacts_are_skipped() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf(), 4).unwrap();
        let key = ArtifactKey::page(fp(), "0");

        assert_eq!(store.put(&key, b"too large"), PutOutcome::SkippedOversized);
        assert!(!store.path_for(&key).exists());
        assert!(!dir.path().join("pages").exists());
    }

    #[test]
    fn failed_writes_are_not_retried() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf(), 1024).unwrap();
        // A plain file where the category directory should be.
        fs::write(dir.path().join("pages"), b"blocker").unwrap();
        let key = ArtifactKey::page(fp(), "1");

        assert_eq!(store.put(&key, b"data"), PutOutcome::Failed);

        fs::remove_file(dir.path().join("pages")).unwrap();
        assert_eq!(store.put(&key, b"data"), PutOutcome::Failed);
        assert!(!store.path_for(&key).exists());
    }

    #[test]
    fn sub_keys_cannot_escape_category() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf(), 1024).unwrap();
        let key = ArtifactKey::new(fp(), "pages", "../evil", "png");

        let path = store.path_for(&key);
        assert_eq!(path.parent().unwrap(), dir.path().join("pages"));
    }

    #[test]
    fn sweep_trims_oldest_first() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf(), 1024).unwrap();

        for i in 0..5 {
            let key = ArtifactKey::page(fp(), i.to_string());
            store.put(&key, &[0u8; 100]);
            std::thread::sleep(std::time::Duration::from_millis(15));
        }

        let stats = store.sweep(300);
        assert_eq!(stats.scanned_files, 5);
        assert_eq!(stats.total_bytes, 500);
        // Down to at most 240 bytes: three oldest go.
        assert_eq!(stats.removed_files, 3);
        assert!(!store.contains(&ArtifactKey::page(fp(), "0")));
        assert!(store.contains(&ArtifactKey::page(fp(), "4")));
    }

    #[test]
    fn sweep_under_limit_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf(), 1024).unwrap();
        store.put(&ArtifactKey::page(fp(), "0"), &[1u8; 10]);

        let stats = store.sweep(1_000);
        assert_eq!(stats.removed_files, 0);
        assert_eq!(stats.total_bytes, 10);
    }
}
