use anyhow::Context;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "lfpreview";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Off shows file metadata only.
    #[serde(default = "default_true")]
    pub preview_enabled: bool,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_true")]
    pub page_cache_enabled: bool,

    /// Rendered artifacts larger than this are never written to disk.
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: usize,

    #[serde(default = "default_max_cache_mb")]
    pub max_cache_mb: u64,

    /// Document decodes allowed to run at once, across all open documents.
    #[serde(default = "default_decode_concurrency")]
    pub decode_concurrency: usize,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_quick_max_edge")]
    pub quick_max_edge: u32,

    #[serde(default = "default_full_max_edge")]
    pub full_max_edge: u32,

    #[serde(default = "default_quick_text_bytes")]
    pub quick_text_bytes: usize,

    #[serde(default = "default_full_text_bytes")]
    pub full_text_bytes: usize,

    #[serde(default = "default_max_table_rows")]
    pub max_table_rows: usize,

    /// Entries shown for folders and archives.
    #[serde(default = "default_max_listing_entries")]
    pub max_listing_entries: usize,

    /// 0 = pick from available cores
    #[serde(default)]
    pub workers: usize,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

fn default_max_artifact_bytes() -> usize {
    3_000_000
}

fn default_max_cache_mb() -> u64 {
    500
}

fn default_decode_concurrency() -> usize {
    1
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_quick_max_edge() -> u32 {
    1920
}

fn default_full_max_edge() -> u32 {
    4096
}

fn default_quick_text_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_full_text_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_max_table_rows() -> usize {
    1000
}

fn default_max_listing_entries() -> usize {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            preview_enabled: true,
            cache_dir: default_cache_dir(),
            page_cache_enabled: true,
            max_artifact_bytes: default_max_artifact_bytes(),
            max_cache_mb: default_max_cache_mb(),
            decode_concurrency: default_decode_concurrency(),
            debounce_ms: default_debounce_ms(),
            quick_max_edge: default_quick_max_edge(),
            full_max_edge: default_full_max_edge(),
            quick_text_bytes: default_quick_text_bytes(),
            full_text_bytes: default_full_text_bytes(),
            max_table_rows: default_max_table_rows(),
            max_listing_entries: default_max_listing_entries(),
            workers: 0,
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

/// Load settings from `path`, or from the default location. A missing file
/// is created with defaults; an unreadable one is reported and ignored.
pub fn load_settings(path: Option<&Path>) -> Settings {
    let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) => path,
        None => {
            warn!("Could not determine config directory, using default settings");
            return Settings::default();
        }
    };

    if !path.exists() {
        info!("Settings file not found, creating with defaults at {path:?}");
        let settings = Settings::default();
        if let Err(e) = save_settings_to_file(&settings, &path) {
            error!("{e:#}");
        }
        return settings;
    }

    match read_settings(&path) {
        Ok(mut settings) => {
            debug!("Loaded settings from {path:?}");
            if settings.version < CURRENT_VERSION {
                migrate_settings(&mut settings);
                if let Err(e) = save_settings_to_file(&settings, &path) {
                    error!("{e:#}");
                }
            }
            settings
        }
        Err(e) => {
            error!("{e:#}");
            Settings::default()
        }
    }
}

fn read_settings(path: &Path) -> anyhow::Result<Settings> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {path:?}"))?;
    serde_yaml::from_str::<Settings>(&content)
        .with_context(|| format!("Failed to parse settings file {path:?}"))
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );

    // Version 0 files predate the decode gate; 0 meant "no limit" there.
    if settings.version == 0 && settings.decode_concurrency == 0 {
        settings.decode_concurrency = default_decode_concurrency();
    }

    settings.version = CURRENT_VERSION;
}

pub fn save_settings_to_file(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {parent:?}"))?;
        }
    }

    fs::write(path, generate_settings_yaml(settings)?)
        .with_context(|| format!("Failed to save settings to {path:?}"))?;
    debug!("Saved settings to {path:?}");
    Ok(())
}

fn generate_settings_yaml(settings: &Settings) -> anyhow::Result<String> {
    let cache_dir = serde_yaml::to_string(&settings.cache_dir)
        .with_context(|| format!("Cannot store cache directory {:?}", settings.cache_dir))?;

    let mut content = String::new();

    content.push_str(&format!("version: {}\n", settings.version));
    content.push('\n');
    content.push_str("# Show rich previews; false shows file details only\n");
    content.push_str(&format!("preview_enabled: {}\n", settings.preview_enabled));
    content.push('\n');
    content.push_str("# Rendered pages and downscaled images are kept here\n");
    content.push_str(&format!("cache_dir: {}\n", cache_dir.trim_end()));
    content.push_str(&format!(
        "page_cache_enabled: {}\n",
        settings.page_cache_enabled
    ));
    content.push_str(&format!(
        "max_artifact_bytes: {}\n",
        settings.max_artifact_bytes
    ));
    content.push_str(&format!("max_cache_mb: {}\n", settings.max_cache_mb));
    content.push('\n');
    content.push_str("# Document pages decoded at once (all open documents share this)\n");
    content.push_str(&format!(
        "decode_concurrency: {}\n",
        settings.decode_concurrency
    ));
    content.push_str(&format!("debounce_ms: {}\n", settings.debounce_ms));
    content.push_str("# Worker threads, 0 = automatic\n");
    content.push_str(&format!("workers: {}\n", settings.workers));
    content.push('\n');
    content.push_str("# Longest edge in pixels for inline and full-screen previews\n");
    content.push_str(&format!("quick_max_edge: {}\n", settings.quick_max_edge));
    content.push_str(&format!("full_max_edge: {}\n", settings.full_max_edge));
    content.push_str(&format!("quick_text_bytes: {}\n", settings.quick_text_bytes));
    content.push_str(&format!("full_text_bytes: {}\n", settings.full_text_bytes));
    content.push_str(&format!("max_table_rows: {}\n", settings.max_table_rows));
    content.push_str(&format!(
        "max_listing_entries: {}\n",
        settings.max_listing_entries
    ));

    Ok(content)
}
