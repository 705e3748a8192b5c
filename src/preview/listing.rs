//! Folder and archive listings
//!
//! Archives are read header by header; nothing is extracted. Zip, tar and
//! gzip-compressed tar are recognised by content, so a misnamed archive
//! still lists.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::NaiveDate;
use flate2::read::GzDecoder;
use log::debug;
use walkdir::WalkDir;

use super::cancel::CancelToken;
use super::decoder::natural_cmp;
use super::error::PreviewError;
use super::renderers::{TIMESTAMP_FORMAT, format_size, format_time};
use super::result::{ArchivePreview, FolderPreview, ListingEntry};

const TAR_MAGIC_OFFSET: usize = 257;
const SIGNATURE_WINDOW: u64 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

/// Whether `prefix` starts like an archive this module can list.
#[must_use]
pub fn is_archive_signature(prefix: &[u8]) -> bool {
    signature_format(prefix).is_some()
}

fn signature_format(prefix: &[u8]) -> Option<ArchiveFormat> {
    if prefix.starts_with(b"PK\x03\x04") || prefix.starts_with(b"PK\x05\x06") {
        return Some(ArchiveFormat::Zip);
    }
    if prefix.starts_with(&[0x1f, 0x8b]) {
        return Some(ArchiveFormat::TarGz);
    }
    match prefix.get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5) {
        Some(b"ustar") => Some(ArchiveFormat::Tar),
        _ => None,
    }
}

fn lower_extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

fn file_entry(name: String, size_bytes: u64, modified: Option<String>) -> ListingEntry {
    ListingEntry {
        extension: lower_extension(&name),
        name,
        is_dir: false,
        size_bytes,
        size: format_size(size_bytes),
        modified,
    }
}

/// List a directory: subdirectories first, then files, each in natural
/// order. At most `max_entries` are kept.
pub fn render_folder(
    path: &Path,
    max_entries: usize,
    cancel: &CancelToken,
) -> Result<FolderPreview, PreviewError> {
    let mut entries = Vec::new();

    for item in WalkDir::new(path)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
    {
        cancel.checkpoint()?;
        let item = match item {
            Ok(item) => item,
            Err(e) if e.depth() == 0 => return Err(PreviewError::io(path, e.into())),
            Err(e) => {
                debug!("Skipping unreadable entry in {path:?}: {e}");
                continue;
            }
        };
        let meta = match item.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                debug!("No metadata for {:?}: {e}", item.path());
                continue;
            }
        };

        let name = item.file_name().to_string_lossy().into_owned();
        if meta.is_dir() {
            entries.push(ListingEntry {
                name,
                is_dir: true,
                size_bytes: 0,
                size: format_size(0),
                modified: format_time(meta.modified()),
                extension: None,
            });
        } else {
            entries.push(file_entry(name, meta.len(), format_time(meta.modified())));
        }
    }

    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| natural_cmp(&a.name, &b.name))
    });

    let total_entries = entries.len();
    entries.truncate(max_entries);
    debug!("Listed {total_entries} entries of {path:?}");

    Ok(FolderPreview {
        path: path.to_path_buf(),
        truncated: total_entries > entries.len(),
        total_entries,
        entries,
    })
}

/// List the file entries of an archive by name, case-insensitively.
pub fn render_archive(
    path: &Path,
    max_entries: usize,
    cancel: &CancelToken,
) -> Result<ArchivePreview, PreviewError> {
    let format = detect_format(path)?;
    let file = File::open(path).map_err(|e| PreviewError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut entries = match format {
        ArchiveFormat::Zip => zip_entries(reader, cancel)?,
        ArchiveFormat::Tar => tar_entries(reader, path, cancel)?,
        ArchiveFormat::TarGz => tar_entries(GzDecoder::new(reader), path, cancel)?,
    };

    entries.sort_by_cached_key(|entry| entry.name.to_lowercase());

    let total_entries = entries.len();
    let total_bytes = entries.iter().map(|entry| entry.size_bytes).sum();
    entries.truncate(max_entries);
    debug!("Listed {total_entries} entries of {format:?} archive {path:?}");

    Ok(ArchivePreview {
        path: path.to_path_buf(),
        truncated: total_entries > entries.len(),
        total_entries,
        total_bytes,
        entries,
    })
}

fn detect_format(path: &Path) -> Result<ArchiveFormat, PreviewError> {
    let file = File::open(path).map_err(|e| PreviewError::io(path, e))?;
    let mut head = Vec::with_capacity(SIGNATURE_WINDOW as usize);
    file.take(SIGNATURE_WINDOW)
        .read_to_end(&mut head)
        .map_err(|e| PreviewError::io(path, e))?;

    signature_format(&head)
        .ok_or_else(|| PreviewError::decode(format!("{path:?} is not a zip or tar archive")))
}

fn zip_entries<R: Read + std::io::Seek>(
    reader: R,
    cancel: &CancelToken,
) -> Result<Vec<ListingEntry>, PreviewError> {
    let mut archive = zip::ZipArchive::new(reader)?;
    let mut entries = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        cancel.checkpoint()?;
        let entry = archive.by_index_raw(index)?;
        if entry.is_dir() {
            continue;
        }
        entries.push(file_entry(
            entry.name().to_string(),
            entry.size(),
            zip_time(entry.last_modified()),
        ));
    }
    Ok(entries)
}

// Zip stores local DOS time; an all-zero stamp is "unknown".
fn zip_time(stamp: zip::DateTime) -> Option<String> {
    NaiveDate::from_ymd_opt(
        i32::from(stamp.year()),
        u32::from(stamp.month()),
        u32::from(stamp.day()),
    )?
    .and_hms_opt(
        u32::from(stamp.hour()),
        u32::from(stamp.minute()),
        u32::from(stamp.second()),
    )
    .map(|time| time.format(TIMESTAMP_FORMAT).to_string())
}

fn tar_entries<R: Read>(
    reader: R,
    path: &Path,
    cancel: &CancelToken,
) -> Result<Vec<ListingEntry>, PreviewError> {
    let mut archive = tar::Archive::new(reader);
    let mut entries = Vec::new();

    for entry in archive.entries().map_err(|e| PreviewError::io(path, e))? {
        cancel.checkpoint()?;
        let entry = entry.map_err(|e| PreviewError::io(path, e))?;
        let header = entry.header();
        if header.entry_type().is_dir() {
            continue;
        }
        let name = entry
            .path()
            .map_err(|e| PreviewError::io(path, e))?
            .to_string_lossy()
            .into_owned();
        let modified = header
            .mtime()
            .ok()
            .and_then(|secs| format_time(Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))));
        entries.push(file_entry(name, entry.size(), modified));
    }
    Ok(entries)
}
