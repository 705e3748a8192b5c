//! Single-shot renderers: image, text/code, tables, video and metadata

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use calamine::{Reader, open_workbook_auto};
use chrono::{DateTime, Local};
use image::ImageReader;
use log::{debug, warn};

use super::artifact_store::{ArtifactKey, IMAGES_CATEGORY};
use super::cancel::CancelToken;
use super::classify::{SNIFF_BYTES, language_for};
use super::env::PreviewEnv;
use super::error::PreviewError;
use super::imaging::RawImage;
use super::svg;
use super::result::{
    FileMetadata, Fidelity, ImagePreview, TabularPreview, TextPreview, VideoPreview,
};

const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn format_time(time: std::io::Result<SystemTime>) -> Option<String> {
    time.ok()
        .map(|t| DateTime::<Local>::from(t).format(TIMESTAMP_FORMAT).to_string())
}

pub(crate) fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

pub fn read_metadata(path: &Path) -> Result<FileMetadata, PreviewError> {
    let meta = fs::metadata(path).map_err(|e| PreviewError::io(path, e))?;
    let size_bytes = if meta.is_dir() { 0 } else { meta.len() };

    Ok(FileMetadata {
        name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string()),
        path: path.to_path_buf(),
        is_dir: meta.is_dir(),
        size_bytes,
        size: format_size(size_bytes),
        extension: path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase()),
        created: format_time(meta.created()),
        modified: format_time(meta.modified()),
        accessed: format_time(meta.accessed()),
        read_only: meta.permissions().readonly(),
    })
}

/// Decode and downscale an image to the fidelity's edge. Downscaled results
/// are cached, so large photos decode once.
pub fn render_image(
    env: &PreviewEnv,
    path: &Path,
    fidelity: Fidelity,
    cancel: &CancelToken,
) -> Result<ImagePreview, PreviewError> {
    let metadata = read_metadata(path)?;
    let max_edge = env.config().max_edge(fidelity);

    // Vector sources rasterise faster than a cache round trip.
    if svg::is_svg(path) {
        cancel.checkpoint()?;
        let rendered = svg::rasterize(path, max_edge)?;
        return Ok(ImagePreview {
            path: path.to_path_buf(),
            image: rendered.image,
            original_width: rendered.intrinsic_width,
            original_height: rendered.intrinsic_height,
            from_cache: false,
            metadata,
        });
    }

    let intrinsic = match imagesize::size(path) {
        Ok(size) => Some((size.width as u32, size.height as u32)),
        Err(e) => {
            debug!("Could not read dimensions of {path:?}: {e}");
            None
        }
    };

    // Only downscaled previews are cached.
    let key = match intrinsic {
        Some((width, height)) if width.max(height) > max_edge => cache_key(env, path, max_edge),
        _ => None,
    };

    cancel.checkpoint()?;
    if let (Some(key), Some((original_width, original_height))) = (&key, intrinsic) {
        if let Some(artifact) = env.store().try_get(key) {
            match env.codec().decode(&artifact.bytes) {
                Ok(image) => {
                    return Ok(ImagePreview {
                        path: path.to_path_buf(),
                        image,
                        original_width,
                        original_height,
                        from_cache: true,
                        metadata,
                    });
                }
                Err(e) => debug!("Ignoring unreadable artifact {:?}: {e}", artifact.path),
            }
        }
    }

    let decoded = ImageReader::open(path)
        .map_err(|e| PreviewError::io(path, e))?
        .with_guessed_format()
        .map_err(|e| PreviewError::io(path, e))?
        .decode()?;
    cancel.checkpoint()?;

    let full = RawImage::from_dynamic(decoded);
    let (original_width, original_height) = (full.width, full.height);
    let image = full.downscale_to_edge(max_edge)?;

    if let Some(key) = key {
        let raw = image.clone();
        let codec = Arc::clone(env.codec());
        let store = Arc::clone(env.store());
        env.pool().spawn(move || match codec.encode(&raw) {
            Ok(bytes) => {
                store.put(&key, &bytes);
            }
            Err(e) => warn!("Could not encode image preview for cache: {e}"),
        });
    }

    Ok(ImagePreview {
        path: path.to_path_buf(),
        image,
        original_width,
        original_height,
        from_cache: false,
        metadata,
    })
}

fn cache_key(env: &PreviewEnv, path: &Path, max_edge: u32) -> Option<ArtifactKey> {
    if !env.config().page_cache_enabled {
        return None;
    }
    match env.hasher().hash(path) {
        Ok(fp) => Some(ArtifactKey::new(
            fp,
            IMAGES_CATEGORY,
            max_edge.to_string(),
            env.codec().kind(),
        )),
        Err(e) => {
            warn!("Image cache disabled for {path:?}: {e}");
            None
        }
    }
}

/// Read at most `limit` bytes and return them as `(bytes, total_size)`.
fn read_head(path: &Path, limit: usize) -> Result<(Vec<u8>, u64), PreviewError> {
    let file = File::open(path).map_err(|e| PreviewError::io(path, e))?;
    let total = file.metadata().map_err(|e| PreviewError::io(path, e))?.len();
    let mut bytes = Vec::with_capacity(limit.min(total as usize));
    file.take(limit as u64)
        .read_to_end(&mut bytes)
        .map_err(|e| PreviewError::io(path, e))?;
    Ok((bytes, total))
}

/// Text and source code, cut at `limit` bytes. Binary content is a decode
/// error.
pub fn render_text(path: &Path, limit: usize) -> Result<TextPreview, PreviewError> {
    let (bytes, total_bytes) = read_head(path, limit)?;
    if bytes[..bytes.len().min(SNIFF_BYTES)].contains(&0) {
        return Err(PreviewError::decode("binary content"));
    }

    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
    Ok(TextPreview {
        path: path.to_path_buf(),
        text: String::from_utf8_lossy(body).into_owned(),
        language: language_for(path),
        truncated: total_bytes > bytes.len() as u64,
        total_bytes,
    })
}

/// Delimited text or a spreadsheet workbook, capped at `max_rows` rows.
pub fn render_table(
    path: &Path,
    max_rows: usize,
    byte_limit: usize,
) -> Result<TabularPreview, PreviewError> {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());

    match ext.as_deref() {
        Some("csv") => render_delimited(path, ',', max_rows, byte_limit),
        Some("tsv") => render_delimited(path, '\t', max_rows, byte_limit),
        _ => render_workbook(path, max_rows),
    }
}

fn render_delimited(
    path: &Path,
    delimiter: char,
    max_rows: usize,
    byte_limit: usize,
) -> Result<TabularPreview, PreviewError> {
    let (bytes, total) = read_head(path, byte_limit)?;
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
    let text = String::from_utf8_lossy(body);
    let (rows, more_rows) = parse_delimited(&text, delimiter, max_rows);

    Ok(TabularPreview {
        path: path.to_path_buf(),
        sheet: None,
        sheet_names: Vec::new(),
        rows,
        truncated: more_rows || total > bytes.len() as u64,
    })
}

/// Split delimited text into rows. Double quotes group fields (and may span
/// lines); `""` inside quotes is a literal quote. Returns the rows and
/// whether more rows followed the cap.
#[must_use]
pub fn parse_delimited(input: &str, delimiter: char, max_rows: usize) -> (Vec<Vec<String>>, bool) {
    let mut rows = Vec::new();
    if max_rows == 0 {
        return (rows, !input.is_empty());
    }

    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => in_quotes = true,
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
                if rows.len() == max_rows {
                    return (rows, chars.peek().is_some());
                }
            }
            c if c == delimiter => row.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    (rows, false)
}

fn render_workbook(path: &Path, max_rows: usize) -> Result<TabularPreview, PreviewError> {
    let mut workbook = open_workbook_auto(path)?;
    let sheet_names = workbook.sheet_names().to_vec();

    let Some(first) = sheet_names.first().cloned() else {
        return Ok(TabularPreview {
            path: path.to_path_buf(),
            sheet: None,
            sheet_names,
            rows: Vec::new(),
            truncated: false,
        });
    };

    let range = workbook.worksheet_range(&first)?;
    let (height, _) = range.get_size();
    let rows = range
        .rows()
        .take(max_rows)
        .map(|row| row.iter().map(ToString::to_string).collect())
        .collect();

    Ok(TabularPreview {
        path: path.to_path_buf(),
        sheet: Some(first),
        sheet_names,
        rows,
        truncated: height > max_rows,
    })
}

/// Playback belongs to the host; a video preview is its metadata.
pub fn render_video(path: &Path) -> Result<VideoPreview, PreviewError> {
    let metadata = read_metadata(path)?;
    let container = metadata
        .extension
        .as_deref()
        .map_or_else(|| "video".to_string(), str::to_ascii_uppercase);

    Ok(VideoPreview {
        path: path.to_path_buf(),
        container,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::env::PreviewConfig;
    use image::{Rgba, RgbaImage};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn metadata_of_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Report.TXT");
        fs::write(&path, vec![b'x'; 2048]).unwrap();

        let meta = read_metadata(&path).unwrap();
        assert_eq!(meta.name, "Report.TXT");
        assert_eq!(meta.size_bytes, 2048);
        assert_eq!(meta.size, "2 KiB");
        assert_eq!(meta.extension.as_deref(), Some("txt"));
        assert!(!meta.is_dir);
        assert_eq!(meta.modified.as_ref().map(String::len), Some(19));
    }

    #[test]
    fn metadata_of_missing_file_is_io_error() {
        let err = read_metadata(Path::new("/no/such/file")).unwrap_err();
        assert!(matches!(err, PreviewError::Io { .. }));
    }

    #[test]
    fn text_is_truncated_at_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.rs");
        fs::write(&path, "fn main() {}\n".repeat(100)).unwrap();

        let preview = render_text(&path, 26).unwrap();
        assert_eq!(preview.text, "fn main() {}\nfn main() {}\n");
        assert!(preview.truncated);
        assert_eq!(preview.total_bytes, 1300);
        assert_eq!(preview.language, Some("rust"));
    }

    #[test]
    fn text_strips_bom() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"\xef\xbb\xbfhello").unwrap();

        let preview = render_text(&path, 1024).unwrap();
        assert_eq!(preview.text, "hello");
        assert!(!preview.truncated);
        assert_eq!(preview.language, None);
    }

    #[test]
    fn binary_text_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, b"abc\0def").unwrap();
        assert!(matches!(
            render_text(&path, 1024),
            Err(PreviewError::Decode(_))
        ));
    }

    #[test]
    fn delimited_parsing_handles_quotes() {
        let input = "name,notes\r\n\"Smith, J\",\"said \"\"hi\"\"\"\nlast,\"multi\nline\"";
        let (rows, more) = parse_delimited(input, ',', 10);
        assert!(!more);
        assert_eq!(
            rows,
            vec![
                vec!["name", "notes"],
                vec!["Smith, J", "said \"hi\""],
                vec!["last", "multi\nline"],
            ]
        );
    }

    #[test]
    fn delimited_parsing_caps_rows() {
        let (rows, more) = parse_delimited("a\tb\nc\td\ne\tf\n", '\t', 2);
        assert_eq!(rows, vec![vec!["a", "b"], vec!["c", "d"]]);
        assert!(more);

        let (rows, more) = parse_delimited("a\nb\n", ',', 2);
        assert_eq!(rows.len(), 2);
        assert!(!more);
    }

    #[test]
    fn csv_file_renders() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("people.csv");
        fs::write(&path, "id,name\n1,Ada\n2,Grace\n3,Linus\n").unwrap();

        let table = render_table(&path, 3, 1024).unwrap();
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.column_count(), 2);
        assert!(table.truncated);
        assert!(table.sheet.is_none());
    }

    #[test]
    fn corrupt_workbook_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.xlsx");
        fs::write(&path, b"not a workbook").unwrap();
        assert!(matches!(
            render_table(&path, 10, 1024),
            Err(PreviewError::Decode(_))
        ));
    }

    #[test]
    fn video_preview_names_container() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mkv");
        fs::write(&path, b"\x1a\x45\xdf\xa3").unwrap();

        let preview = render_video(&path).unwrap();
        assert_eq!(preview.container, "MKV");
        assert_eq!(preview.metadata.size_bytes, 4);
    }

    #[test]
    fn large_images_are_downscaled_and_cached() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.png");
        RgbaImage::from_pixel(64, 32, Rgba([200, 100, 50, 255]))
            .save(&path)
            .unwrap();

        let mut config = PreviewConfig::with_cache_dir(dir.path().join("cache"));
        config.quick_max_edge = 16;
        let env = PreviewEnv::new(config).unwrap();
        let cancel = CancelToken::new();

        let first = render_image(&env, &path, Fidelity::Quick, &cancel).unwrap();
        assert!(!first.from_cache);
        assert_eq!((first.original_width, first.original_height), (64, 32));
        assert_eq!((first.image.width, first.image.height), (16, 8));
        assert!(env.pool().wait_idle(Duration::from_secs(5)));

        let second = render_image(&env, &path, Fidelity::Quick, &cancel).unwrap();
        assert!(second.from_cache);
        assert_eq!((second.image.width, second.image.height), (16, 8));
        assert_eq!(second.to_bitmap().unwrap().width(), 16);
    }

    #[test]
    fn cache_limit_applies_to_encoded_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flat.png");
        RgbaImage::from_pixel(64, 64, Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();

        let mut config = PreviewConfig::with_cache_dir(dir.path().join("cache"));
        config.quick_max_edge = 32;
        // Below the 32x32 RGBA buffer, far above its PNG.
        config.max_artifact_bytes = 1500;
        let env = PreviewEnv::new(config).unwrap();
        let cancel = CancelToken::new();

        let first = render_image(&env, &path, Fidelity::Quick, &cancel).unwrap();
        assert!(first.image.byte_len() > 1500);
        assert!(env.pool().wait_idle(Duration::from_secs(5)));

        let second = render_image(&env, &path, Fidelity::Quick, &cancel).unwrap();
        assert!(second.from_cache, "a small encoding should be cached");
    }

    #[cfg(feature = "svg")]
    #[test]
    fn svg_is_rasterised_to_the_fidelity_edge() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diagram.SVG");
        fs::write(
            &path,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="300" height="100"><circle cx="50" cy="50" r="40"/></svg>"#,
        )
        .unwrap();

        let mut config = PreviewConfig::with_cache_dir(dir.path().join("cache"));
        config.quick_max_edge = 150;
        let env = PreviewEnv::new(config).unwrap();

        let preview = render_image(&env, &path, Fidelity::Quick, &CancelToken::new()).unwrap();
        assert_eq!((preview.original_width, preview.original_height), (300, 100));
        assert_eq!((preview.image.width, preview.image.height), (150, 50));
        assert!(!preview.from_cache);
        assert_eq!(preview.metadata.extension.as_deref(), Some("svg"));
    }

    #[test]
    fn small_images_skip_the_cache() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("icon.png");
        RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255]))
            .save(&path)
            .unwrap();

        let env = PreviewEnv::new(PreviewConfig::with_cache_dir(dir.path().join("cache"))).unwrap();
        let preview = render_image(&env, &path, Fidelity::Full, &CancelToken::new()).unwrap();
        assert_eq!((preview.image.width, preview.image.height), (8, 8));
        assert!(env.pool().wait_idle(Duration::from_secs(5)));
        assert!(!dir.path().join("cache").join("images").exists());
    }

    #[test]
    fn cancelled_render_stops() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("icon.png");
        RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255]))
            .save(&path)
            .unwrap();

        let env = PreviewEnv::new(PreviewConfig::with_cache_dir(dir.path().join("cache"))).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = render_image(&env, &path, Fidelity::Quick, &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }
}
