use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Parser;
use log::{info, warn};
use simplelog::{Config, LevelFilter, WriteLogger};

use lfpreview::panic_handler::initialize_panic_handler;
use lfpreview::preview::{
    DocumentPageSet, Fidelity, ListingEntry, PageSource, PageUpdate, PreviewDispatcher,
    PreviewEnv, PreviewResult,
};
use lfpreview::settings::load_settings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGES_TIMEOUT: Duration = Duration::from_secs(60);
const LISTING_LINES: usize = 20;

#[derive(Parser, Debug)]
#[command(name = "lfpreview")]
#[command(about = "Render file previews through the preview cache")]
#[command(version)]
struct Cli {
    /// Render at full-screen fidelity instead of the inline preview size
    #[arg(long)]
    full: bool,

    /// Number of document pages to load
    #[arg(long, default_value_t = 3)]
    pages: usize,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "lfpreview.log")]
    log_file: PathBuf,

    /// Files to preview; each one supersedes the previous, like moving the
    /// selection in a file browser
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    WriteLogger::init(
        LevelFilter::Debug,
        Config::default(),
        File::create(&cli.log_file)?,
    )?;
    initialize_panic_handler();

    info!("Starting lfpreview");

    let settings = load_settings(cli.config.as_deref());
    let env = Arc::new(PreviewEnv::from_settings(&settings)?);
    let mut dispatcher = PreviewDispatcher::new(Arc::clone(&env));

    let fidelity = if cli.full {
        Fidelity::Full
    } else {
        Fidelity::Quick
    };
    for path in &cli.paths {
        dispatcher.request(path, fidelity);
    }

    let Some(result) = dispatcher.wait(REQUEST_TIMEOUT) else {
        bail!("Timed out waiting for a preview");
    };
    print_summary(result);

    if let Some(pages) = result.as_pages().cloned() {
        load_pages(&pages, cli.pages);
    }

    dispatcher.clear();
    // Let pending cache writes and disposal finish before exiting.
    if !env.pool().wait_idle(Duration::from_secs(10)) {
        warn!("Exiting with background work still queued");
    }

    info!("Shutting down lfpreview");
    Ok(())
}

fn print_summary(result: &PreviewResult) {
    match result {
        PreviewResult::SingleImage(image) => {
            println!(
                "image {}: {}x{} shown at {}x{}{}",
                image.metadata.name,
                image.original_width,
                image.original_height,
                image.image.width,
                image.image.height,
                if image.from_cache { " (cached)" } else { "" }
            );
        }
        PreviewResult::DocumentPages(pages) => {
            println!("document {}: {} pages", pages.path().display(), pages.len());
        }
        PreviewResult::Video(video) => {
            println!(
                "video {}: {} container, {}",
                video.metadata.name, video.container, video.metadata.size
            );
        }
        PreviewResult::TextOrCode(text) => {
            println!(
                "text {} [{}]: {} of {} bytes{}",
                text.path.display(),
                text.language.unwrap_or("plain"),
                text.text.len(),
                text.total_bytes,
                if text.truncated { ", truncated" } else { "" }
            );
            for line in text.text.lines().take(10) {
                println!("  {line}");
            }
        }
        PreviewResult::Tabular(table) => {
            println!(
                "table {}: {} rows x {} columns{}",
                table.path.display(),
                table.rows.len(),
                table.column_count(),
                table.sheet.as_deref().map(|s| format!(" (sheet {s})")).unwrap_or_default()
            );
            for row in table.rows.iter().take(5) {
                println!("  {}", row.join(" | "));
            }
        }
        PreviewResult::Folder(folder) => {
            println!(
                "folder {}: {} entries{}",
                folder.path.display(),
                folder.total_entries,
                if folder.truncated { ", truncated" } else { "" }
            );
            print_listing(&folder.entries);
        }
        PreviewResult::Archive(archive) => {
            println!(
                "archive {}: {} files, {} uncompressed{}",
                archive.path.display(),
                archive.total_entries,
                humansize::format_size(archive.total_bytes, humansize::BINARY),
                if archive.truncated { ", truncated" } else { "" }
            );
            print_listing(&archive.entries);
        }
        PreviewResult::Metadata(meta) => {
            println!(
                "{} {}: {}, modified {}{}",
                if meta.is_dir { "folder" } else { "file" },
                meta.name,
                meta.size,
                meta.modified.as_deref().unwrap_or("unknown"),
                if meta.read_only { ", read-only" } else { "" }
            );
        }
        PreviewResult::Error(reason) => println!("error: {reason}"),
    }
}

fn print_listing(entries: &[ListingEntry]) {
    for entry in entries.iter().take(LISTING_LINES) {
        let kind = if entry.is_dir { "/" } else { "" };
        println!(
            "  {:<40} {:>10}  {}",
            format!("{}{kind}", entry.name),
            if entry.is_dir { "" } else { entry.size.as_str() },
            entry.modified.as_deref().unwrap_or("")
        );
    }
}

fn load_pages(pages: &DocumentPageSet, count: usize) {
    let wanted = count.min(pages.len());
    pages.sync_viewport(0..wanted);

    let deadline = Instant::now() + PAGES_TIMEOUT;
    let mut finished = 0;
    while finished < wanted && Instant::now() < deadline {
        for update in pages.wait_for_updates(Duration::from_millis(200)) {
            finished += 1;
            match update {
                PageUpdate::Loaded { index, source } => {
                    let size = pages.page(index).map(|p| p.size()).unwrap_or_default();
                    let origin = match source {
                        PageSource::Cache => "cache",
                        PageSource::Decoder => "decoder",
                    };
                    println!(
                        "  page {}: {}x{} from {origin}",
                        index + 1,
                        size.width,
                        size.height
                    );
                }
                PageUpdate::Failed { index, reason } => {
                    println!("  page {}: failed ({reason})", index + 1);
                }
            }
        }
    }

    if finished < wanted {
        warn!("Only {finished} of {wanted} pages finished loading");
    }
}
