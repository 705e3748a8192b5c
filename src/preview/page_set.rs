//! An open multi-page document: decoder handle, its lock, and the pages

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flume::Receiver;
use log::{debug, info, warn};

use super::decoder::DocumentDecoder;
use super::env::PreviewEnv;
use super::error::PreviewError;
use super::fingerprint::Fingerprint;
use super::page::{DocumentPage, PageEvent, PageSetShared, PageUpdate};
use super::result::Fidelity;

pub struct DocumentPageSet {
    path: PathBuf,
    shared: Arc<PageSetShared>,
    pages: Vec<DocumentPage>,
    events: Receiver<PageEvent>,
}

impl DocumentPageSet {
    /// Open `path` with `decoder` and lay out one unloaded page per document
    /// page, every page sized like page 0.
    pub fn open(
        path: &Path,
        decoder: &dyn DocumentDecoder,
        env: Arc<PreviewEnv>,
        fidelity: Fidelity,
    ) -> Result<Self, PreviewError> {
        let fingerprint = if env.config().page_cache_enabled {
            match env.hasher().hash(path) {
                Ok(fp) => Some(fp),
                Err(e) => {
                    warn!("Page cache disabled for {path:?}: {e}");
                    None
                }
            }
        } else {
            None
        };

        let mut handle = decoder.open(path)?;
        let page_count = handle.page_count();
        if page_count == 0 {
            handle.close();
            return Err(PreviewError::decode(format!("{path:?} has no pages")));
        }
        let first_size = match handle.page_size(0) {
            Ok(size) => size,
            Err(e) => {
                handle.close();
                return Err(e);
            }
        };

        info!(
            "Opened {path:?} with {} decoder: {page_count} pages, {}x{}",
            decoder.name(),
            first_size.width,
            first_size.height
        );

        let (events_tx, events_rx) = flume::unbounded();
        let max_edge = env.config().max_edge(fidelity);
        let shared = Arc::new(PageSetShared {
            env,
            fidelity,
            max_edge,
            fingerprint,
            handle: Mutex::new(Some(handle)),
            events: events_tx,
            closed: AtomicBool::new(false),
        });

        let pages = (0..page_count)
            .map(|index| DocumentPage::new(index, first_size, Arc::clone(&shared)))
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            shared,
            pages,
            events: events_rx,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn fidelity(&self) -> Fidelity {
        self.shared.fidelity
    }

    #[must_use]
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.shared.fingerprint.as_ref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    #[must_use]
    pub fn page(&self, index: usize) -> Option<&DocumentPage> {
        self.pages.get(index)
    }

    #[must_use]
    pub fn pages(&self) -> &[DocumentPage] {
        &self.pages
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Finalize every completion that arrived so far. Call from the
    /// presentation thread; this is where bitmaps get built.
    pub fn poll(&self) -> Vec<PageUpdate> {
        self.events
            .try_iter()
            .filter_map(|event| self.finalize(event))
            .collect()
    }

    /// Block until at least one completion arrives (or `timeout` passes),
    /// then finalize everything pending. Stale completions are dropped, so
    /// the result may be empty even before the timeout.
    pub fn wait_for_updates(&self, timeout: Duration) -> Vec<PageUpdate> {
        let Ok(first) = self.events.recv_timeout(timeout) else {
            return Vec::new();
        };
        let mut updates: Vec<PageUpdate> = self.finalize(first).into_iter().collect();
        updates.extend(self.poll());
        updates
    }

    /// Load pages inside `visible`, unload the rest. Returns how many loads
    /// were started.
    pub fn sync_viewport(&self, visible: Range<usize>) -> usize {
        let mut started = 0;
        for page in &self.pages {
            if visible.contains(&page.index()) {
                if page.load() {
                    started += 1;
                }
            } else {
                page.unload();
            }
        }
        started
    }

    fn finalize(&self, event: PageEvent) -> Option<PageUpdate> {
        if self.is_closed() {
            return None;
        }
        self.pages
            .get(event.index)
            .and_then(|page| page.complete(event.ticket, event.result))
    }

    /// Cancel all pages, drop their bitmaps and close the decoder.
    /// Idempotent; blocks while a page render holds the decoder.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for page in &self.pages {
            page.unload();
        }

        if let Some(mut handle) = self.shared.lock_handle().take() {
            handle.close();
        }
        // Completions already queued would never be polled now.
        let dropped = self.events.drain().count();
        debug!("Closed {:?} ({dropped} pending completions dropped)", self.path);
    }
}

impl Drop for DocumentPageSet {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DocumentPageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentPageSet")
            .field("path", &self.path)
            .field("pages", &self.pages.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::decoder::test_support::{cbz_bytes, png_bytes};
    use crate::preview::decoder::{CbzDecoder, PageSize};
    use crate::preview::env::PreviewConfig;
    use crate::preview::page::{PageSource, PageStatus};
    use std::time::Instant;
    use tempfile::TempDir;

    fn env(cache: &Path) -> Arc<PreviewEnv> {
        Arc::new(PreviewEnv::new(PreviewConfig::with_cache_dir(cache)).unwrap())
    }

    fn write_cbz(dir: &Path, name: &str, pages: usize) -> PathBuf {
        let entries: Vec<(String, Vec<u8>)> = (0..pages)
            .map(|i| (format!("{i:03}.png"), png_bytes(40, 30, (i * 20) as u8)))
            .collect();
        let borrowed: Vec<(&str, Vec<u8>)> = entries
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.clone()))
            .collect();
        let path = dir.join(name);
        std::fs::write(&path, cbz_bytes(&borrowed)).unwrap();
        path
    }

    fn settle(set: &DocumentPageSet, expected: usize) -> Vec<PageUpdate> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut updates = Vec::new();
        while updates.len() < expected && Instant::now() < deadline {
            updates.extend(set.wait_for_updates(Duration::from_millis(100)));
        }
        updates
    }

    #[test]
    fn open_seeds_sizes_from_first_page() {
        let dir = TempDir::new().unwrap();
        let path = write_cbz(dir.path(), "book.cbz", 3);
        let set =
            DocumentPageSet::open(&path, &CbzDecoder, env(&dir.path().join("c")), Fidelity::Quick)
                .unwrap();

        assert_eq!(set.len(), 3);
        assert!(set.pages().iter().all(|p| p.size() == PageSize::new(40, 30)));
        assert!(set.pages().iter().all(|p| p.status() == PageStatus::Unloaded));
        assert!(set.fingerprint().is_some());
    }

    #[test]
    fn empty_archive_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.cbz");
        std::fs::write(&path, cbz_bytes(&[("readme.txt", b"hi".to_vec())])).unwrap();

        let err =
            DocumentPageSet::open(&path, &CbzDecoder, env(&dir.path().join("c")), Fidelity::Quick)
                .unwrap_err();
        assert!(matches!(err, PreviewError::Decode(_)));
    }

    #[test]
    fn second_open_is_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let path = write_cbz(dir.path(), "book.cbz", 2);
        let env = env(&dir.path().join("c"));

        let first =
            DocumentPageSet::open(&path, &CbzDecoder, Arc::clone(&env), Fidelity::Quick).unwrap();
        assert!(first.page(1).unwrap().load());
        let updates = settle(&first, 1);
        assert_eq!(
            updates,
            vec![PageUpdate::Loaded {
                index: 1,
                source: PageSource::Decoder
            }]
        );
        assert!(env.pool().wait_idle(Duration::from_secs(5)));
        first.close();

        let second =
            DocumentPageSet::open(&path, &CbzDecoder, Arc::clone(&env), Fidelity::Quick).unwrap();
        second.page(1).unwrap().load();
        let updates = settle(&second, 1);
        assert_eq!(
            updates,
            vec![PageUpdate::Loaded {
                index: 1,
                source: PageSource::Cache
            }]
        );
        let bitmap = second.page(1).unwrap().bitmap().unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (40, 30));
    }

    #[test]
    fn sync_viewport_loads_visible_and_unloads_others() {
        let dir = TempDir::new().unwrap();
        let path = write_cbz(dir.path(), "book.cbz", 6);
        let set =
            DocumentPageSet::open(&path, &CbzDecoder, env(&dir.path().join("c")), Fidelity::Quick)
                .unwrap();

        assert_eq!(set.sync_viewport(0..3), 3);
        settle(&set, 3);
        assert_eq!(set.page(2).unwrap().status(), PageStatus::Loaded);

        assert_eq!(set.sync_viewport(2..5), 2);
        assert_eq!(set.page(0).unwrap().status(), PageStatus::Unloaded);
        assert_eq!(set.page(2).unwrap().status(), PageStatus::Loaded);
    }

    #[test]
    fn close_is_idempotent_and_stops_loads() {
        let dir = TempDir::new().unwrap();
        let path = write_cbz(dir.path(), "book.cbz", 2);
        let set =
            DocumentPageSet::open(&path, &CbzDecoder, env(&dir.path().join("c")), Fidelity::Quick)
                .unwrap();

        set.close();
        set.close();
        assert!(set.is_closed());
        assert!(!set.page(0).unwrap().load());
        assert!(set.poll().is_empty());
    }
}
