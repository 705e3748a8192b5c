//! One page of a multi-page document: lazy bitmap and cache-aware render path

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flume::Sender;
use log::{debug, warn};

use super::artifact_store::{ArtifactKey, PAGES_CATEGORY};
use super::cancel::CancelToken;
use super::decoder::{DocumentHandle, PageSize};
use super::env::PreviewEnv;
use super::error::PreviewError;
use super::fingerprint::Fingerprint;
use super::imaging::{Bitmap, RawImage};
use super::result::Fidelity;

/// Where a page's pixels came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageSource {
    Cache,
    Decoder,
}

/// Observable page state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageStatus {
    Unloaded,
    Loading,
    Loaded,
}

/// A finalized page completion, reported by `DocumentPageSet::poll`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageUpdate {
    Loaded { index: usize, source: PageSource },
    Failed { index: usize, reason: String },
}

impl PageUpdate {
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            PageUpdate::Loaded { index, .. } | PageUpdate::Failed { index, .. } => *index,
        }
    }
}

/// Worker-to-presentation message for one finished load.
pub(crate) struct PageEvent {
    pub index: usize,
    pub ticket: u64,
    pub result: Result<(RawImage, PageSource), PreviewError>,
}

/// State shared by a page set, its pages and their in-flight jobs.
pub(crate) struct PageSetShared {
    pub env: Arc<PreviewEnv>,
    pub fidelity: Fidelity,
    pub max_edge: u32,
    /// `None` when page caching is off or hashing failed.
    pub fingerprint: Option<Fingerprint>,
    /// Every decoder call happens with this lock held. `None` once closed.
    pub handle: Mutex<Option<Box<dyn DocumentHandle>>>,
    pub events: Sender<PageEvent>,
    pub closed: AtomicBool,
}

impl PageSetShared {
    fn artifact_key(&self, index: usize) -> Option<ArtifactKey> {
        let sub_key = match self.fidelity {
            Fidelity::Quick => index.to_string(),
            Fidelity::Full => format!("{index}-full"),
        };
        self.fingerprint
            .clone()
            .map(|fp| ArtifactKey::new(fp, PAGES_CATEGORY, sub_key, self.env.codec().kind()))
    }

    pub(crate) fn lock_handle(&self) -> MutexGuard<'_, Option<Box<dyn DocumentHandle>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum PageState {
    Unloaded,
    Loading { ticket: u64, cancel: CancelToken },
    Loaded(Bitmap),
}

struct PageSlot {
    state: PageState,
    size: PageSize,
    last_error: Option<String>,
    next_ticket: u64,
}

pub struct DocumentPage {
    index: usize,
    shared: Arc<PageSetShared>,
    slot: Mutex<PageSlot>,
}

impl DocumentPage {
    pub(crate) fn new(index: usize, size: PageSize, shared: Arc<PageSetShared>) -> Self {
        Self {
            index,
            shared,
            slot: Mutex::new(PageSlot {
                state: PageState::Unloaded,
                size,
                last_error: None,
                next_ticket: 0,
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, PageSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Seeded from page 0, then the size of the last rendered bitmap.
    #[must_use]
    pub fn size(&self) -> PageSize {
        self.slot().size
    }

    #[must_use]
    pub fn status(&self) -> PageStatus {
        match self.slot().state {
            PageState::Unloaded => PageStatus::Unloaded,
            PageState::Loading { .. } => PageStatus::Loading,
            PageState::Loaded(_) => PageStatus::Loaded,
        }
    }

    #[must_use]
    pub fn bitmap(&self) -> Option<Bitmap> {
        match &self.slot().state {
            PageState::Loaded(bitmap) => Some(bitmap.clone()),
            _ => None,
        }
    }

    /// Reason the most recent load failed, cleared by the next success.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.slot().last_error.clone()
    }

    /// Start loading the bitmap. Returns `false` when already loading,
    /// already loaded, or the document is closed.
    pub fn load(&self) -> bool {
        if self.shared.closed.load(Ordering::SeqCst) {
            return false;
        }

        let mut slot = self.slot();
        if !matches!(slot.state, PageState::Unloaded) {
            return false;
        }

        slot.next_ticket += 1;
        let ticket = slot.next_ticket;
        let cancel = CancelToken::new();
        slot.state = PageState::Loading {
            ticket,
            cancel: cancel.clone(),
        };
        drop(slot);

        let shared = Arc::clone(&self.shared);
        let index = self.index;
        self.shared.env.pool().spawn(move || {
            let result = load_pixels(&shared, index, &cancel);
            if matches!(result, Err(PreviewError::Cancelled)) || cancel.is_cancelled() {
                debug!("Page {index} load cancelled");
                return;
            }
            let _ = shared.events.send(PageEvent {
                index,
                ticket,
                result,
            });
        });
        true
    }

    /// Cancel any in-flight load and drop the bitmap. Idempotent.
    pub fn unload(&self) {
        let mut slot = self.slot();
        if let PageState::Loading { cancel, .. } = &slot.state {
            cancel.cancel();
        }
        slot.state = PageState::Unloaded;
    }

    /// Apply a finished load. Runs on the presentation thread.
    pub(crate) fn complete(
        &self,
        ticket: u64,
        result: Result<(RawImage, PageSource), PreviewError>,
    ) -> Option<PageUpdate> {
        let mut slot = self.slot();
        match &slot.state {
            PageState::Loading {
                ticket: current,
                cancel,
            } if *current == ticket && !cancel.is_cancelled() => {}
            _ => {
                debug!("Discarding stale completion for page {}", self.index);
                return None;
            }
        }

        let (raw, source) = match result {
            Ok(done) => done,
            Err(e) => return Some(self.fail(&mut slot, &e)),
        };

        let cache_copy = (source == PageSource::Decoder && self.shared.fingerprint.is_some())
            .then(|| raw.clone());

        match Bitmap::from_raw(raw) {
            Ok(bitmap) => {
                slot.size = PageSize::new(bitmap.width(), bitmap.height());
                slot.state = PageState::Loaded(bitmap);
                slot.last_error = None;
            }
            Err(e) => return Some(self.fail(&mut slot, &e)),
        }
        drop(slot);

        if let Some(raw) = cache_copy {
            self.persist(raw);
        }

        Some(PageUpdate::Loaded {
            index: self.index,
            source,
        })
    }

    fn fail(&self, slot: &mut PageSlot, err: &PreviewError) -> PageUpdate {
        warn!("Page {} failed to load: {err}", self.index);
        slot.state = PageState::Unloaded;
        slot.last_error = Some(err.to_string());
        PageUpdate::Failed {
            index: self.index,
            reason: err.to_string(),
        }
    }

    /// Encode on a worker and hand the bytes to the store, which drops
    /// anything over its size limit.
    fn persist(&self, raw: RawImage) {
        let Some(key) = self.shared.artifact_key(self.index) else {
            return;
        };
        let env = Arc::clone(&self.shared.env);
        self.shared.env.pool().spawn(move || match env.codec().encode(&raw) {
            Ok(bytes) => {
                env.store().put(&key, &bytes);
            }
            Err(e) => warn!("Could not encode page for cache: {e}"),
        });
    }
}

impl std::fmt::Debug for DocumentPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentPage")
            .field("index", &self.index)
            .field("status", &self.status())
            .finish()
    }
}

/// Worker side of `load`: cache first, then gate, lock and decoder.
fn load_pixels(
    shared: &PageSetShared,
    index: usize,
    cancel: &CancelToken,
) -> Result<(RawImage, PageSource), PreviewError> {
    cancel.checkpoint()?;

    if let Some(key) = shared.artifact_key(index) {
        if let Some(artifact) = shared.env.store().try_get(&key) {
            match shared.env.codec().decode(&artifact.bytes) {
                Ok(raw) => return Ok((raw, PageSource::Cache)),
                Err(e) => debug!("Ignoring unreadable artifact {:?}: {e}", artifact.path),
            }
        }
    }

    cancel.checkpoint()?;
    let _permit = shared.env.gate().acquire(cancel)?;
    cancel.checkpoint()?;

    let mut handle = shared.lock_handle();
    cancel.checkpoint()?;
    let document = handle.as_mut().ok_or(PreviewError::Cancelled)?;
    let raw = document.render_page(index, shared.max_edge)?;
    Ok((raw, PageSource::Decoder))
}
