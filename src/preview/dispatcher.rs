//! Request dispatch: cancel the previous request, debounce, classify, render,
//! and publish only the newest result

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use log::{debug, info, warn};

use super::cancel::CancelToken;
use super::classify::{FileClass, classify};
use super::env::PreviewEnv;
use super::error::PreviewError;
use super::listing;
use super::page_set::DocumentPageSet;
use super::renderers;
use super::result::{Fidelity, PreviewResult};

/// Monotonically increasing request number. Higher wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Completion {
    id: RequestId,
    result: PreviewResult,
}

struct InFlight {
    id: RequestId,
    cancel: CancelToken,
}

/// Owned by the presentation thread.
pub struct PreviewDispatcher {
    env: Arc<PreviewEnv>,
    next_id: u64,
    // Newest issued id; workers read it before sending a result.
    latest: Arc<AtomicU64>,
    in_flight: Option<InFlight>,
    current: Option<(RequestId, PreviewResult)>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
}

impl PreviewDispatcher {
    #[must_use]
    pub fn new(env: Arc<PreviewEnv>) -> Self {
        let (completions_tx, completions_rx) = flume::unbounded();
        Self {
            env,
            next_id: 0,
            latest: Arc::new(AtomicU64::new(0)),
            in_flight: None,
            current: None,
            completions_tx,
            completions_rx,
        }
    }

    #[must_use]
    pub fn env(&self) -> &Arc<PreviewEnv> {
        &self.env
    }

    /// Preview `path`. Cancels whatever request is still in flight; the
    /// currently published result stays visible until this one arrives.
    pub fn request(&mut self, path: impl Into<PathBuf>, fidelity: Fidelity) -> RequestId {
        let path = path.into();
        if let Some(previous) = self.in_flight.take() {
            debug!("Request {} superseded", previous.id);
            previous.cancel.cancel();
        }

        let id = self.bump_id();
        let cancel = CancelToken::new();
        self.in_flight = Some(InFlight {
            id,
            cancel: cancel.clone(),
        });

        debug!("Request {id}: {path:?} ({})", fidelity.as_str());

        let env = Arc::clone(&self.env);
        let latest = Arc::clone(&self.latest);
        let tx = self.completions_tx.clone();
        self.env.pool().spawn(move || {
            if !cancel.sleep(env.config().debounce) {
                debug!("Request {id} cancelled during debounce");
                return;
            }

            let result = match build_preview(&env, &path, fidelity, &cancel) {
                Ok(result) => result,
                Err(PreviewError::Cancelled) => {
                    debug!("Request {id} cancelled");
                    return;
                }
                Err(e) => PreviewResult::Error(e.to_string()),
            };

            if cancel.is_cancelled() || latest.load(Ordering::SeqCst) != id.0 {
                debug!("Request {id} finished after being superseded");
                result.dispose();
                return;
            }
            if let Err(flume::SendError(completion)) = tx.send(Completion { id, result }) {
                completion.result.dispose();
            }
        });

        id
    }

    fn bump_id(&mut self) -> RequestId {
        self.next_id += 1;
        self.latest.store(self.next_id, Ordering::SeqCst);
        RequestId(self.next_id)
    }

    /// Drain finished requests. Returns the result if a new one was
    /// published by this call.
    pub fn poll(&mut self) -> Option<&PreviewResult> {
        let mut published = false;
        while let Ok(completion) = self.completions_rx.try_recv() {
            published |= self.accept(completion);
        }
        if published { self.current() } else { None }
    }

    /// Block until the newest request is published or `timeout` passes.
    pub fn wait(&mut self, timeout: Duration) -> Option<&PreviewResult> {
        let deadline = Instant::now() + timeout;
        while self.in_flight.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.completions_rx.recv_timeout(remaining) {
                Ok(completion) => {
                    self.accept(completion);
                }
                Err(_) => return None,
            }
        }
        self.current()
    }

    fn accept(&mut self, completion: Completion) -> bool {
        let Completion { id, result } = completion;
        let is_newest = self
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.id == id && !in_flight.cancel.is_cancelled());

        if !is_newest {
            debug!("Dropping stale result of request {id}");
            self.dispose_later(result);
            return false;
        }

        info!("Request {id} published as {}", result.kind());
        self.in_flight = None;
        if let Some((_, previous)) = self.current.replace((id, result)) {
            self.dispose_later(previous);
        }
        true
    }

    /// Disposal can block on a decoder, so it runs on a worker.
    fn dispose_later(&self, result: PreviewResult) {
        self.env.pool().spawn(move || result.dispose());
    }

    #[must_use]
    pub fn current(&self) -> Option<&PreviewResult> {
        self.current.as_ref().map(|(_, result)| result)
    }

    #[must_use]
    pub fn current_id(&self) -> Option<RequestId> {
        self.current.as_ref().map(|(id, _)| *id)
    }

    /// Whether a request is still waiting to be published.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Cancel the in-flight request and dispose the published result.
    pub fn clear(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel.cancel();
        }
        // Anything still running can no longer match.
        self.bump_id();
        if let Some((_, result)) = self.current.take() {
            self.dispose_later(result);
        }
        for completion in self.completions_rx.drain() {
            self.dispose_later(completion.result);
        }
    }
}

impl Drop for PreviewDispatcher {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Worker side of a request. Renderer failures degrade to metadata; only
/// cancellation propagates.
fn build_preview(
    env: &Arc<PreviewEnv>,
    path: &Path,
    fidelity: Fidelity,
    cancel: &CancelToken,
) -> Result<PreviewResult, PreviewError> {
    if !env.config().preview_enabled {
        return Ok(metadata_or_error(path));
    }

    let class = classify(path, env.decoders());
    debug!("{path:?} classified as {class:?}");
    cancel.checkpoint()?;

    let config = env.config();
    let rendered = match class {
        FileClass::Image => {
            renderers::render_image(env, path, fidelity, cancel).map(PreviewResult::SingleImage)
        }
        FileClass::PagedDocument => open_document(env, path, fidelity, cancel),
        FileClass::Video => renderers::render_video(path).map(PreviewResult::Video),
        FileClass::Text => renderers::render_text(path, config.text_bytes(fidelity))
            .map(PreviewResult::TextOrCode),
        FileClass::Tabular => {
            renderers::render_table(path, config.max_table_rows, config.text_bytes(fidelity))
                .map(PreviewResult::Tabular)
        }
        FileClass::Folder => listing::render_folder(path, config.max_listing_entries, cancel)
            .map(PreviewResult::Folder),
        FileClass::Archive => listing::render_archive(path, config.max_listing_entries, cancel)
            .map(PreviewResult::Archive),
        FileClass::Unsupported => return Ok(metadata_or_error(path)),
    };

    match rendered {
        Ok(result) => Ok(result),
        Err(PreviewError::Cancelled) => Err(PreviewError::Cancelled),
        Err(e) => {
            warn!("Preview of {path:?} failed, showing metadata: {e}");
            Ok(metadata_or_error(path))
        }
    }
}

fn open_document(
    env: &Arc<PreviewEnv>,
    path: &Path,
    fidelity: Fidelity,
    cancel: &CancelToken,
) -> Result<PreviewResult, PreviewError> {
    let Some(decoder) = env.decoder_for(path) else {
        debug!("No document decoder for {path:?}");
        return Ok(metadata_or_error(path));
    };

    let pages = DocumentPageSet::open(path, decoder.as_ref(), Arc::clone(env), fidelity)?;
    if cancel.is_cancelled() {
        pages.close();
        return Err(PreviewError::Cancelled);
    }
    Ok(PreviewResult::DocumentPages(Arc::new(pages)))
}

fn metadata_or_error(path: &Path) -> PreviewResult {
    match renderers::read_metadata(path) {
        Ok(metadata) => PreviewResult::Metadata(metadata),
        Err(e) => PreviewResult::Error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::env::PreviewConfig;
    use tempfile::TempDir;

    fn dispatcher(cache: &Path, configure: impl FnOnce(&mut PreviewConfig)) -> PreviewDispatcher {
        let mut config = PreviewConfig::with_cache_dir(cache);
        config.debounce = Duration::from_millis(20);
        configure(&mut config);
        PreviewDispatcher::new(Arc::new(PreviewEnv::new(config).unwrap()))
    }

    #[test]
    fn text_file_is_published() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Title\n").unwrap();

        let mut dispatcher = dispatcher(&dir.path().join("c"), |_| {});
        let id = dispatcher.request(&path, Fidelity::Quick);
        let result = dispatcher.wait(Duration::from_secs(5)).unwrap();

        match result {
            PreviewResult::TextOrCode(text) => {
                assert_eq!(text.text, "# Title\n");
                assert_eq!(text.language, Some("markdown"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(dispatcher.current_id(), Some(id));
    }

    #[test]
    fn missing_file_is_error_result() {
        let dir = TempDir::new().unwrap();
        let mut dispatcher = dispatcher(&dir.path().join("c"), |_| {});
        dispatcher.request(dir.path().join("gone.rs"), Fidelity::Quick);

        let result = dispatcher.wait(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, PreviewResult::Error(_)));
    }

    #[test]
    fn binary_text_degrades_to_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weird.txt");
        std::fs::write(&path, b"\0\0\0").unwrap();

        let mut dispatcher = dispatcher(&dir.path().join("c"), |_| {});
        dispatcher.request(&path, Fidelity::Quick);
        let result = dispatcher.wait(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, PreviewResult::Metadata(_)));
    }

    #[test]
    fn disabled_previews_resolve_to_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.rs");
        std::fs::write(&path, "fn main() {}").unwrap();

        let mut dispatcher = dispatcher(&dir.path().join("c"), |c| c.preview_enabled = false);
        dispatcher.request(&path, Fidelity::Full);
        let result = dispatcher.wait(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, PreviewResult::Metadata(m) if m.name == "main.rs"));
    }

    #[test]
    fn folder_is_listed() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("photos");
        std::fs::create_dir_all(folder.join("2024")).unwrap();
        std::fs::write(folder.join("img10.jpg"), b"").unwrap();
        std::fs::write(folder.join("img9.jpg"), b"").unwrap();

        let mut dispatcher = dispatcher(&dir.path().join("c"), |_| {});
        dispatcher.request(&folder, Fidelity::Quick);
        let result = dispatcher.wait(Duration::from_secs(5)).unwrap();

        match result {
            PreviewResult::Folder(listing) => {
                let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
                assert_eq!(names, ["2024", "img9.jpg", "img10.jpg"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn broken_archive_degrades_to_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.zip");
        std::fs::write(&path, b"PK\x03\x04 truncated").unwrap();

        let mut dispatcher = dispatcher(&dir.path().join("c"), |_| {});
        dispatcher.request(&path, Fidelity::Quick);
        let result = dispatcher.wait(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, PreviewResult::Metadata(m) if m.name == "backup.zip"));
    }

    #[test]
    fn pdf_without_decoder_is_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("paper.pdf");
        std::fs::write(&path, b"%PDF-1.7").unwrap();

        let mut dispatcher = dispatcher(&dir.path().join("c"), |_| {});
        dispatcher.request(&path, Fidelity::Quick);
        let result = dispatcher.wait(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, PreviewResult::Metadata(_)));
    }

    #[test]
    fn rapid_requests_publish_only_the_last() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "first").unwrap();
        std::fs::write(&b, "second").unwrap();

        let mut dispatcher = dispatcher(&dir.path().join("c"), |c| {
            c.debounce = Duration::from_millis(200);
        });
        dispatcher.request(&a, Fidelity::Quick);
        let last = dispatcher.request(&b, Fidelity::Quick);

        let result = dispatcher.wait(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, PreviewResult::TextOrCode(t) if t.text == "second"));
        assert_eq!(dispatcher.current_id(), Some(last));

        assert!(dispatcher.env().pool().wait_idle(Duration::from_secs(5)));
        assert!(dispatcher.poll().is_none());
    }

    #[test]
    fn clear_drops_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "text").unwrap();

        let mut dispatcher = dispatcher(&dir.path().join("c"), |_| {});
        dispatcher.request(&path, Fidelity::Quick);
        dispatcher.wait(Duration::from_secs(5)).unwrap();

        dispatcher.request(&path, Fidelity::Quick);
        dispatcher.clear();
        assert!(dispatcher.current().is_none());
        assert!(!dispatcher.is_pending());

        assert!(dispatcher.env().pool().wait_idle(Duration::from_secs(5)));
        assert!(dispatcher.poll().is_none());
    }
}
