//! Preview generation and caching pipeline
//!
//! Selection changes go through [`PreviewDispatcher`]; multi-page documents
//! become a [`DocumentPageSet`] whose pages load lazily on the worker pool,
//! bounded by the shared [`ConcurrencyGate`] and backed by the on-disk
//! [`ArtifactStore`].

pub mod artifact_store;
pub mod cancel;
pub mod classify;
pub mod decoder;
pub mod dispatcher;
pub mod env;
pub mod error;
pub mod fingerprint;
pub mod gate;
pub mod imaging;
pub mod listing;
pub mod page;
pub mod page_set;
pub mod renderers;
pub mod result;
pub mod svg;
pub mod worker;

pub use artifact_store::{
    Artifact, ArtifactKey, ArtifactStore, IMAGES_CATEGORY, PAGES_CATEGORY, PutOutcome, SweepStats,
};
pub use cancel::CancelToken;
pub use classify::{FileClass, classify};
pub use decoder::{CbzDecoder, DocumentDecoder, DocumentHandle, PageSize};
pub use dispatcher::{PreviewDispatcher, RequestId};
pub use env::{PreviewConfig, PreviewEnv};
pub use error::PreviewError;
pub use fingerprint::{ContentHasher, Fingerprint};
pub use gate::{ConcurrencyGate, Permit};
pub use imaging::{Bitmap, ImageCodec, PngCodec, RawImage};
pub use page::{DocumentPage, PageSource, PageStatus, PageUpdate};
pub use page_set::DocumentPageSet;
pub use result::{
    ArchivePreview, FileMetadata, Fidelity, FolderPreview, ImagePreview, ListingEntry,
    PreviewResult, TabularPreview, TextPreview, VideoPreview,
};
pub use worker::WorkerPool;
