//! Preview results handed to the presentation layer

use std::path::PathBuf;
use std::sync::Arc;

use super::error::PreviewError;
use super::imaging::{Bitmap, RawImage};
use super::page_set::DocumentPageSet;

/// Rendering quality of a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Fidelity {
    /// Inline preview pane.
    #[default]
    Quick,
    /// Full-screen preview.
    Full,
}

impl Fidelity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Fidelity::Quick => "quick",
            Fidelity::Full => "full",
        }
    }
}

/// Filesystem facts shown when nothing richer is available.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub size_bytes: u64,
    /// Human readable size, e.g. `1.5 MiB`.
    pub size: String,
    pub extension: Option<String>,
    pub created: Option<String>,
    pub modified: Option<String>,
    pub accessed: Option<String>,
    pub read_only: bool,
}

#[derive(Clone, Debug)]
pub struct ImagePreview {
    pub path: PathBuf,
    pub image: RawImage,
    pub original_width: u32,
    pub original_height: u32,
    /// Served from the artifact cache rather than decoded.
    pub from_cache: bool,
    pub metadata: FileMetadata,
}

impl ImagePreview {
    /// Build the displayable bitmap. Call on the presentation thread.
    pub fn to_bitmap(&self) -> Result<Bitmap, PreviewError> {
        Bitmap::from_raw(self.image.clone())
    }
}

#[derive(Clone, Debug)]
pub struct VideoPreview {
    pub path: PathBuf,
    /// Container name derived from the extension, e.g. `MP4`.
    pub container: String,
    pub metadata: FileMetadata,
}

#[derive(Clone, Debug)]
pub struct TextPreview {
    pub path: PathBuf,
    pub text: String,
    /// Highlighting hint; `None` for plain text.
    pub language: Option<&'static str>,
    pub truncated: bool,
    pub total_bytes: u64,
}

#[derive(Clone, Debug)]
pub struct TabularPreview {
    pub path: PathBuf,
    /// Worksheet shown, for workbooks.
    pub sheet: Option<String>,
    pub sheet_names: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub truncated: bool,
}

impl TabularPreview {
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// One row of a folder or archive listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListingEntry {
    /// File name for folders; path inside the archive for archives.
    pub name: String,
    pub is_dir: bool,
    pub size_bytes: u64,
    pub size: String,
    pub modified: Option<String>,
    pub extension: Option<String>,
}

/// Directory contents, directories first, each group in natural order.
#[derive(Clone, Debug)]
pub struct FolderPreview {
    pub path: PathBuf,
    pub entries: Vec<ListingEntry>,
    /// Entries in the directory, listed or not.
    pub total_entries: usize,
    pub truncated: bool,
}

/// File entries of an archive, by name. Only headers are read.
#[derive(Clone, Debug)]
pub struct ArchivePreview {
    pub path: PathBuf,
    pub entries: Vec<ListingEntry>,
    pub total_entries: usize,
    /// Uncompressed size of every file entry.
    pub total_bytes: u64,
    pub truncated: bool,
}

/// Exactly one kind of preview.
#[derive(Clone, Debug)]
pub enum PreviewResult {
    SingleImage(ImagePreview),
    DocumentPages(Arc<DocumentPageSet>),
    Video(VideoPreview),
    TextOrCode(TextPreview),
    Tabular(TabularPreview),
    Folder(FolderPreview),
    Archive(ArchivePreview),
    Metadata(FileMetadata),
    /// Not even metadata could be read.
    Error(String),
}

impl PreviewResult {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PreviewResult::SingleImage(_) => "image",
            PreviewResult::DocumentPages(_) => "document",
            PreviewResult::Video(_) => "video",
            PreviewResult::TextOrCode(_) => "text",
            PreviewResult::Tabular(_) => "table",
            PreviewResult::Folder(_) => "folder",
            PreviewResult::Archive(_) => "archive",
            PreviewResult::Metadata(_) => "metadata",
            PreviewResult::Error(_) => "error",
        }
    }

    #[must_use]
    pub fn as_pages(&self) -> Option<&Arc<DocumentPageSet>> {
        match self {
            PreviewResult::DocumentPages(pages) => Some(pages),
            _ => None,
        }
    }

    /// Release what the result holds. Page sets close their decoder; other
    /// variants only free memory.
    pub fn dispose(self) {
        if let PreviewResult::DocumentPages(pages) = self {
            pages.close();
        }
    }
}
