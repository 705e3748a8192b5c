//! Document decoder capabilities and the bundled comic-archive decoder

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::debug;
use zip::ZipArchive;

use super::error::PreviewError;
use super::imaging::RawImage;

/// Native page dimensions in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageSize {
    pub width: u32,
    pub height: u32,
}

impl PageSize {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Opens multi-page documents.
pub trait DocumentDecoder: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether this decoder handles the file (by extension).
    fn accepts(&self, path: &Path) -> bool;

    fn open(&self, path: &Path) -> Result<Box<dyn DocumentHandle>, PreviewError>;
}

/// One open document. Callers serialize all access; a handle is only ever
/// used by one thread at a time.
pub trait DocumentHandle: Send {
    fn page_count(&self) -> usize;

    fn page_size(&mut self, index: usize) -> Result<PageSize, PreviewError>;

    /// Render page `index`. The decoder should shrink the result so its
    /// longest edge fits `max_edge`; a decoder that cannot may return the
    /// native resolution.
    fn render_page(&mut self, index: usize, max_edge: u32) -> Result<RawImage, PreviewError>;

    /// Release native resources. Called exactly once.
    fn close(&mut self) {}
}

const CBZ_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// Comic book archives: a zip whose image entries are the pages.
#[derive(Clone, Copy, Debug, Default)]
pub struct CbzDecoder;

impl DocumentDecoder for CbzDecoder {
    fn name(&self) -> &'static str {
        "cbz"
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("cbz"))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn DocumentHandle>, PreviewError> {
        let file = File::open(path).map_err(|e| PreviewError::io(path, e))?;
        let mut archive = ZipArchive::new(BufReader::new(file))?;

        let mut pages = Vec::new();
        for i in 0..archive.len() {
            let entry = archive.by_index(i)?;
            if !entry.is_dir() && is_image_entry(entry.name()) {
                pages.push((entry.name().to_string(), i));
            }
        }
        pages.sort_by(|a, b| natural_cmp(&a.0, &b.0));

        debug!("Opened {path:?} as cbz with {} pages", pages.len());

        Ok(Box::new(CbzHandle {
            archive: Some(archive),
            pages: pages.into_iter().map(|(_, i)| i).collect(),
        }))
    }
}

struct CbzHandle {
    archive: Option<ZipArchive<BufReader<File>>>,
    // Zip entry index of each page, in reading order.
    pages: Vec<usize>,
}

impl CbzHandle {
    fn read_page(&mut self, index: usize) -> Result<Vec<u8>, PreviewError> {
        let entry_index = *self
            .pages
            .get(index)
            .ok_or_else(|| PreviewError::decode(format!("page {index} out of range")))?;
        let archive = self
            .archive
            .as_mut()
            .ok_or_else(|| PreviewError::decode("document already closed"))?;

        let mut entry = archive.by_index(entry_index)?;
        let mut bytes = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| PreviewError::decode(e.to_string()))?;
        Ok(bytes)
    }
}

impl DocumentHandle for CbzHandle {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_size(&mut self, index: usize) -> Result<PageSize, PreviewError> {
        let bytes = self.read_page(index)?;
        let size = imagesize::blob_size(&bytes).map_err(|e| PreviewError::decode(e.to_string()))?;
        Ok(PageSize::new(size.width as u32, size.height as u32))
    }

    fn render_page(&mut self, index: usize, max_edge: u32) -> Result<RawImage, PreviewError> {
        let bytes = self.read_page(index)?;
        let image = image::load_from_memory(&bytes)?;
        RawImage::from_dynamic(image).downscale_to_edge(max_edge)
    }

    fn close(&mut self) {
        self.archive = None;
    }
}

fn is_image_entry(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            CBZ_IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Compare names so that `page2` sorts before `page10`.
pub(crate) fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a_chars = a.chars().peekable();
    let mut b_chars = b.chars().peekable();

    loop {
        match (a_chars.peek().copied(), b_chars.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) if ca.is_ascii_digit() && cb.is_ascii_digit() => {
                let na = take_number(&mut a_chars);
                let nb = take_number(&mut b_chars);
                let by_value = na
                    .trim_start_matches('0')
                    .len()
                    .cmp(&nb.trim_start_matches('0').len())
                    .then_with(|| na.trim_start_matches('0').cmp(nb.trim_start_matches('0')));
                if by_value != Ordering::Equal {
                    return by_value;
                }
            }
            (Some(ca), Some(cb)) => {
                let by_char = ca.to_ascii_lowercase().cmp(&cb.to_ascii_lowercase());
                if by_char != Ordering::Equal {
                    return by_char;
                }
                a_chars.next();
                b_chars.next();
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        digits.push(c);
        chars.next();
    }
    digits
}
