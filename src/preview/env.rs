//! Shared services every preview draws on: worker pool, decode gate,
//! artifact store, hasher, codec and decoders

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use super::artifact_store::ArtifactStore;
use super::decoder::{CbzDecoder, DocumentDecoder};
use super::error::PreviewError;
use super::fingerprint::ContentHasher;
use super::gate::ConcurrencyGate;
use super::imaging::{ImageCodec, PngCodec};
use super::result::Fidelity;
use super::worker::{WorkerPool, default_worker_count};
use crate::settings::Settings;

/// Tunables of the pipeline, resolved from [`Settings`].
#[derive(Clone, Debug)]
pub struct PreviewConfig {
    pub preview_enabled: bool,
    pub cache_dir: PathBuf,
    pub page_cache_enabled: bool,
    pub max_artifact_bytes: usize,
    pub max_cache_bytes: u64,
    pub decode_concurrency: usize,
    pub debounce: Duration,
    pub quick_max_edge: u32,
    pub full_max_edge: u32,
    pub quick_text_bytes: usize,
    pub full_text_bytes: usize,
    pub max_table_rows: usize,
    pub max_listing_entries: usize,
    /// 0 picks a count from the available cores.
    pub workers: usize,
}

impl PreviewConfig {
    /// Default tunables with the cache rooted at `cache_dir`.
    #[must_use]
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::from(&Settings::default());
        config.cache_dir = cache_dir.into();
        config
    }

    #[must_use]
    pub fn max_edge(&self, fidelity: Fidelity) -> u32 {
        match fidelity {
            Fidelity::Quick => self.quick_max_edge,
            Fidelity::Full => self.full_max_edge,
        }
    }

    #[must_use]
    pub fn text_bytes(&self, fidelity: Fidelity) -> usize {
        match fidelity {
            Fidelity::Quick => self.quick_text_bytes,
            Fidelity::Full => self.full_text_bytes,
        }
    }
}

impl From<&Settings> for PreviewConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            preview_enabled: settings.preview_enabled,
            cache_dir: settings.cache_dir.clone(),
            page_cache_enabled: settings.page_cache_enabled,
            max_artifact_bytes: settings.max_artifact_bytes,
            max_cache_bytes: settings.max_cache_mb.saturating_mul(1024 * 1024),
            decode_concurrency: settings.decode_concurrency,
            debounce: Duration::from_millis(settings.debounce_ms),
            quick_max_edge: settings.quick_max_edge,
            full_max_edge: settings.full_max_edge,
            quick_text_bytes: settings.quick_text_bytes,
            full_text_bytes: settings.full_text_bytes,
            max_table_rows: settings.max_table_rows,
            max_listing_entries: settings.max_listing_entries,
            workers: settings.workers,
        }
    }
}

/// Built once per process and shared behind an `Arc`.
pub struct PreviewEnv {
    config: PreviewConfig,
    pool: WorkerPool,
    gate: ConcurrencyGate,
    store: Arc<ArtifactStore>,
    hasher: ContentHasher,
    codec: Arc<dyn ImageCodec>,
    decoders: Vec<Arc<dyn DocumentDecoder>>,
}

impl PreviewEnv {
    pub fn new(config: PreviewConfig) -> Result<Self, PreviewError> {
        let store = ArtifactStore::new(config.cache_dir.clone(), config.max_artifact_bytes)?;
        let workers = if config.workers == 0 {
            default_worker_count()
        } else {
            config.workers
        };

        debug!(
            "Preview environment: {workers} workers, decode concurrency {}, cache {:?}",
            config.decode_concurrency, config.cache_dir
        );

        Ok(Self {
            pool: WorkerPool::new(workers),
            gate: ConcurrencyGate::new(config.decode_concurrency),
            store: Arc::new(store),
            hasher: ContentHasher::new(),
            codec: Arc::new(PngCodec),
            decoders: vec![Arc::new(CbzDecoder)],
            config,
        })
    }

    /// Environment for the application: builds from settings and trims the
    /// disk cache in the background.
    pub fn from_settings(settings: &Settings) -> Result<Self, PreviewError> {
        let env = Self::new(PreviewConfig::from(settings))?;
        env.sweep_in_background();
        Ok(env)
    }

    /// Use an existing gate, so several environments share one decode budget.
    #[must_use]
    pub fn with_gate(mut self, gate: ConcurrencyGate) -> Self {
        self.gate = gate;
        self
    }

    /// Register a decoder. Later registrations take precedence.
    #[must_use]
    pub fn with_decoder(mut self, decoder: Arc<dyn DocumentDecoder>) -> Self {
        self.decoders.insert(0, decoder);
        self
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn ImageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn sweep_in_background(&self) {
        let store = Arc::clone(&self.store);
        let limit = self.config.max_cache_bytes;
        self.pool.spawn(move || {
            let stats = store.sweep(limit);
            info!(
                "Artifact cache holds {} files ({} bytes) after sweep",
                stats.scanned_files - stats.removed_files,
                stats.total_bytes - stats.removed_bytes
            );
        });
    }

    #[must_use]
    pub fn config(&self) -> &PreviewConfig {
        &self.config
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[must_use]
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    #[must_use]
    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    #[must_use]
    pub fn codec(&self) -> &Arc<dyn ImageCodec> {
        &self.codec
    }

    #[must_use]
    pub fn decoders(&self) -> &[Arc<dyn DocumentDecoder>] {
        &self.decoders
    }

    /// First registered decoder that accepts `path`.
    #[must_use]
    pub fn decoder_for(&self, path: &Path) -> Option<Arc<dyn DocumentDecoder>> {
        self.decoders
            .iter()
            .find(|decoder| decoder.accepts(path))
            .cloned()
    }
}
