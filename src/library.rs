//! Album library: link records and on-disk album enumeration
//!
//! Links pair an album folder with its sidecar metadata file. The link file
//! is read-only here; editing it belongs to the hosting application.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// One album folder and its sidecar metadata file.
#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub album_path: PathBuf,
    pub metadata_path: PathBuf,
}

impl Link {
    /// Both paths exist on disk.
    pub fn is_valid(&self) -> bool {
        self.album_path.exists() && self.metadata_path.exists()
    }
}

/// Item-name filter by file extension (lowercase, with dot).
#[derive(Debug, Clone)]
pub struct ItemFilter {
    extensions: &'static [&'static str],
}

impl ItemFilter {
    pub const IMAGES: &'static [&'static str] =
        &[".png", ".jpg", ".jpeg", ".webp", ".bmp", ".gif", ".heic", ".heif", ".avif"];
    pub const VIDEOS: &'static [&'static str] = &[".mp4", ".mkv", ".mov", ".webm", ".3gp"];
    pub const ALL: &'static [&'static str] = &[
        ".png", ".jpg", ".jpeg", ".webp", ".bmp", ".gif", ".heic", ".heif", ".avif", ".mp4",
        ".mkv", ".mov", ".webm", ".3gp",
    ];

    pub fn images() -> Self {
        Self { extensions: Self::IMAGES }
    }

    pub fn videos() -> Self {
        Self { extensions: Self::VIDEOS }
    }

    pub fn all() -> Self {
        Self { extensions: Self::ALL }
    }

    pub fn matches(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.extensions.iter().any(|ext| lower.ends_with(ext))
    }
}

/// Ordered link records plus per-album item listing.
#[derive(Debug, Clone, Default)]
pub struct AlbumLibrary {
    links: Vec<Link>,
}

impl AlbumLibrary {
    pub fn new(links: Vec<Link>) -> Self {
        Self { links }
    }

    /// Load links from a JSON file: `[{"album_path": ..., "metadata_path": ...}]`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read links file {}", path.display()))?;
        let links: Vec<Link> = serde_json::from_str(&text)
            .with_context(|| format!("parse links file {}", path.display()))?;
        Ok(Self { links })
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// List item names in an album folder, filtered and sorted by name.
    /// Subdirectories and non-matching files are skipped.
    pub fn list_items(&self, album_path: &Path, filter: &ItemFilter) -> Result<Vec<String>> {
        let mut items = Vec::new();
        let rd = std::fs::read_dir(album_path)
            .with_context(|| format!("list album {}", album_path.display()))?;
        for entry in rd.flatten() {
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if filter.matches(&name) {
                items.push(name);
            }
        }
        items.sort();
        Ok(items)
    }
}
