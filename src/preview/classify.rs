//! Closed file classification: extension first, content signature second

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use super::decoder::DocumentDecoder;
use super::listing::is_archive_signature;

/// How much of a file is read to sniff its type.
pub const SNIFF_BYTES: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileClass {
    Image,
    PagedDocument,
    Video,
    Text,
    Tabular,
    Folder,
    Archive,
    Unsupported,
}

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "tif", "tiff", "ico", "avif", "tga", "pnm", "pbm",
    "pgm", "ppm", "svg",
];
const PAGED_EXTENSIONS: &[&str] = &["pdf", "cbz", "xps", "oxps", "epub"];
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mkv", "webm", "avi", "mov", "wmv", "flv", "mpg", "mpeg", "3gp",
];
const TABULAR_EXTENSIONS: &[&str] = &["csv", "tsv", "xlsx", "xlsm", "xlsb", "xls", "ods"];
const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "tar", "tgz"];

/// Extensions rendered as text, with their highlighting hint.
const TEXT_LANGUAGES: &[(&str, Option<&str>)] = &[
    ("txt", None),
    ("log", None),
    ("ini", Some("ini")),
    ("cfg", Some("ini")),
    ("conf", None),
    ("md", Some("markdown")),
    ("markdown", Some("markdown")),
    ("rs", Some("rust")),
    ("toml", Some("toml")),
    ("cs", Some("csharp")),
    ("c", Some("c")),
    ("h", Some("c")),
    ("cpp", Some("cpp")),
    ("cc", Some("cpp")),
    ("hpp", Some("cpp")),
    ("java", Some("java")),
    ("kt", Some("kotlin")),
    ("go", Some("go")),
    ("py", Some("python")),
    ("rb", Some("ruby")),
    ("js", Some("javascript")),
    ("mjs", Some("javascript")),
    ("ts", Some("typescript")),
    ("tsx", Some("typescript")),
    ("jsx", Some("javascript")),
    ("json", Some("json")),
    ("yaml", Some("yaml")),
    ("yml", Some("yaml")),
    ("xml", Some("xml")),
    ("xaml", Some("xml")),
    ("csproj", Some("xml")),
    ("html", Some("html")),
    ("htm", Some("html")),
    ("css", Some("css")),
    ("scss", Some("css")),
    ("sh", Some("shell")),
    ("bash", Some("shell")),
    ("zsh", Some("shell")),
    ("ps1", Some("powershell")),
    ("sql", Some("sql")),
    ("lua", Some("lua")),
    ("swift", Some("swift")),
];

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

/// Highlighting hint for a text file, from its extension.
#[must_use]
pub fn language_for(path: &Path) -> Option<&'static str> {
    let ext = extension(path)?;
    TEXT_LANGUAGES
        .iter()
        .find(|(known, _)| *known == ext)
        .and_then(|(_, language)| *language)
}

/// Classify `path`. Registered decoders claim paged documents before the
/// built-in extension tables; unknown extensions fall back to sniffing.
#[must_use]
pub fn classify(path: &Path, decoders: &[Arc<dyn DocumentDecoder>]) -> FileClass {
    if path.is_dir() {
        return FileClass::Folder;
    }
    if decoders.iter().any(|decoder| decoder.accepts(path)) {
        return FileClass::PagedDocument;
    }

    if let Some(ext) = extension(path) {
        let ext = ext.as_str();
        if TEXT_LANGUAGES.iter().any(|(known, _)| *known == ext) {
            return FileClass::Text;
        }
        if IMAGE_EXTENSIONS.contains(&ext) {
            return FileClass::Image;
        }
        if PAGED_EXTENSIONS.contains(&ext) {
            return FileClass::PagedDocument;
        }
        if VIDEO_EXTENSIONS.contains(&ext) {
            return FileClass::Video;
        }
        if TABULAR_EXTENSIONS.contains(&ext) {
            return FileClass::Tabular;
        }
        if ARCHIVE_EXTENSIONS.contains(&ext) || is_tar_gz(path) {
            return FileClass::Archive;
        }
    }

    match read_prefix(path) {
        Some(prefix) => sniff(&prefix),
        None => FileClass::Unsupported,
    }
}

fn is_tar_gz(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.to_ascii_lowercase().ends_with(".tar.gz"))
}

fn read_prefix(path: &Path) -> Option<Vec<u8>> {
    let file = File::open(path).ok()?;
    let mut prefix = Vec::with_capacity(SNIFF_BYTES);
    file.take(SNIFF_BYTES as u64)
        .read_to_end(&mut prefix)
        .ok()?;
    Some(prefix)
}

/// Classify by content signature.
#[must_use]
pub fn sniff(prefix: &[u8]) -> FileClass {
    const SIGNATURES: &[(&[u8], FileClass)] = &[
        (b"\x89PNG\r\n\x1a\n", FileClass::Image),
        (b"\xff\xd8\xff", FileClass::Image),
        (b"GIF87a", FileClass::Image),
        (b"GIF89a", FileClass::Image),
        (b"%PDF-", FileClass::PagedDocument),
        (b"\x1a\x45\xdf\xa3", FileClass::Video),
    ];

    if let Some((_, class)) = SIGNATURES.iter().find(|(magic, _)| prefix.starts_with(magic)) {
        return *class;
    }
    if is_archive_signature(prefix) {
        return FileClass::Archive;
    }
    if prefix.len() >= 12 && &prefix[..4] == b"RIFF" {
        match &prefix[8..12] {
            b"WEBP" => return FileClass::Image,
            b"AVI " => return FileClass::Video,
            _ => {}
        }
    }
    if prefix.len() >= 8 && &prefix[4..8] == b"ftyp" {
        return FileClass::Video;
    }
    if looks_like_text(prefix) {
        return FileClass::Text;
    }
    FileClass::Unsupported
}

/// No NUL bytes and valid UTF-8, allowing a code point cut off at the end.
#[must_use]
pub fn looks_like_text(prefix: &[u8]) -> bool {
    if prefix.contains(&0) {
        return false;
    }
    match std::str::from_utf8(prefix) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}
