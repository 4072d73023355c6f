//! Background image assets for layouts with a background plane.

use super::Size;
use crate::pixels::{Image, pack};
use image::imageops::FilterType;
use std::path::{Path, PathBuf};
use tracing::warn;

const EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Candidate images for one mode and which of them is bound.
#[derive(Debug, Clone, Default)]
pub struct BackgroundSlots {
    files: Vec<PathBuf>,
    bound: Option<usize>,
}

impl BackgroundSlots {
    /// Image files directly inside `dir`, sorted by name. A missing directory
    /// yields no slots.
    pub fn scan(dir: &Path) -> Self {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Self::default();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();
        Self { files, bound: None }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn bind(&mut self, slot: usize) -> bool {
        if slot >= self.files.len() {
            return false;
        }
        self.bound = Some(slot);
        true
    }

    pub fn current(&self) -> Option<&Path> {
        self.bound.map(|i| self.files[i].as_path())
    }
}

/// Decode `path` and stretch it to the output. Failures are logged and the
/// layout runs without a background.
pub fn load_background(path: &Path, size: Size) -> Option<Image> {
    let decoded = match image::open(path) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Failed to load background {}: {}", path.display(), e);
            return None;
        }
    };
    let rgb = image::imageops::resize(&decoded.to_rgb8(), size.width, size.height, FilterType::Triangle);
    Some(Image {
        width: size.width,
        height: size.height,
        pixels: rgb.pixels().map(|p| pack(p.0)).collect(),
    })
}
