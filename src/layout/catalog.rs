//! The static layout table plus per-mode background bindings.

use super::background::BackgroundSlots;
use super::{Corner, LayoutFamily, LayoutMode, Rotation, SmallWindow};
use anyhow::Context;
use dualview_ipc::Rect;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("layout catalog is empty")]
    Empty,

    #[error("layout id {0} appears more than once")]
    DuplicateId(u8),

    #[error("layout {id} has an empty screen rect")]
    EmptyRect { id: u8 },

    #[error("layout {id} hides both screens")]
    NoScreens { id: u8 },
}

/// Immutable list of modes, indexed by id. Only the background binding of a
/// mode changes after construction.
#[derive(Debug, Clone)]
pub struct LayoutCatalog {
    modes: Vec<LayoutMode>,
    backgrounds: Vec<BackgroundSlots>,
}

impl LayoutCatalog {
    pub fn from_modes(mut modes: Vec<LayoutMode>) -> Result<Self, CatalogError> {
        if modes.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut seen = HashSet::new();
        for mode in &modes {
            if !seen.insert(mode.id) {
                return Err(CatalogError::DuplicateId(mode.id));
            }
            if mode.screens.iter().all(Option::is_none) {
                return Err(CatalogError::NoScreens { id: mode.id });
            }
            if mode.screens.iter().flatten().any(Rect::is_empty) {
                return Err(CatalogError::EmptyRect { id: mode.id });
            }
        }
        modes.sort_by_key(|m| m.id);

        let backgrounds = vec![BackgroundSlots::default(); modes.len()];
        Ok(Self { modes, backgrounds })
    }

    /// Load a replacement table from a JSON array of modes.
    pub fn from_json(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read layout table {}", path.display()))?;
        let modes: Vec<LayoutMode> = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse layout table {}", path.display()))?;
        let catalog = Self::from_modes(modes)?;
        info!("Loaded {} layouts from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// Every layout family at 640x480, each followed by its swapped variant.
    pub fn builtin() -> Self {
        let mut modes = Vec::new();
        let mut push = |name: &str, family, screens: [Option<Rect>; 2], rotation, mirror, background| {
            for swap in [false, true] {
                let id = modes.len() as u8;
                let name = if swap { format!("{}-swap", name) } else { name.to_string() };
                modes.push(LayoutMode {
                    id,
                    name,
                    family,
                    screens,
                    swap,
                    rotation,
                    mirror,
                    small_window: SmallWindow::new(Corner::BottomRight, 0, false),
                    background_slot_index: 0,
                    has_background_plane: background,
                });
            }
        };

        let full = Some(Rect::new(0, 0, 640, 480));
        push("small-window", LayoutFamily::SmallWindow, [full, Some(Rect::new(0, 0, 256, 192))], Rotation::R0, false, false);
        push("side-by-side", LayoutFamily::SideBySide, [Some(Rect::new(0, 120, 320, 240)), Some(Rect::new(320, 120, 320, 240))], Rotation::R0, false, true);
        push("stacked", LayoutFamily::Stacked, [Some(Rect::new(160, 0, 320, 240)), Some(Rect::new(160, 240, 320, 240))], Rotation::R0, false, true);
        push("big-small", LayoutFamily::BigSmall, [Some(Rect::new(0, 48, 512, 384)), Some(Rect::new(512, 336, 128, 96))], Rotation::R0, false, true);
        push("single", LayoutFamily::Single, [full, None], Rotation::R0, false, false);
        push("high-res", LayoutFamily::HighRes, [Some(Rect::new(64, 48, 512, 384)), None], Rotation::R0, false, true);
        push("rotated-cw", LayoutFamily::Rotated, [Some(Rect::new(80, 80, 240, 320)), Some(Rect::new(320, 80, 240, 320))], Rotation::R90, false, true);
        push("rotated-ccw", LayoutFamily::Rotated, [Some(Rect::new(320, 80, 240, 320)), Some(Rect::new(80, 80, 240, 320))], Rotation::R270, false, true);
        push("side-by-side-mirrored", LayoutFamily::SideBySide, [Some(Rect::new(0, 120, 320, 240)), Some(Rect::new(320, 120, 320, 240))], Rotation::R0, true, true);
        push("big-small-mirrored", LayoutFamily::BigSmall, [Some(Rect::new(0, 48, 512, 384)), Some(Rect::new(512, 336, 128, 96))], Rotation::R0, true, true);

        let backgrounds = vec![BackgroundSlots::default(); modes.len()];
        Self { modes, backgrounds }
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn modes(&self) -> &[LayoutMode] {
        &self.modes
    }

    fn index_of(&self, id: u8) -> Option<usize> {
        self.modes.binary_search_by_key(&id, |m| m.id).ok()
    }

    pub fn get(&self, id: u8) -> Option<&LayoutMode> {
        self.index_of(id).map(|i| &self.modes[i])
    }

    /// `id` if present, otherwise the first mode.
    pub fn resolve(&self, id: u8) -> &LayoutMode {
        self.get(id).unwrap_or(&self.modes[0])
    }

    /// Id of the mode after `id`, wrapping around. Unknown ids start over.
    pub fn next_id(&self, id: u8) -> u8 {
        let next = match self.index_of(id) {
            Some(i) => (i + 1) % self.modes.len(),
            None => 0,
        };
        self.modes[next].id
    }

    /// Scan `<root>/<mode id>/` for each mode. Returns the number of images found.
    pub fn scan_backgrounds(&mut self, root: &Path) -> usize {
        let mut found = 0;
        for (mode, slots) in self.modes.iter_mut().zip(self.backgrounds.iter_mut()) {
            *slots = BackgroundSlots::scan(&root.join(mode.id.to_string()));
            if !slots.bind(mode.background_slot_index) && !slots.files().is_empty() {
                mode.background_slot_index = 0;
                slots.bind(0);
            }
            found += slots.files().len();
        }
        debug!("Found {} background images under {}", found, root.display());
        found
    }

    /// Select background `slot` for mode `id`. False if either is unknown.
    pub fn bind_background(&mut self, id: u8, slot: usize) -> bool {
        let Some(i) = self.index_of(id) else {
            return false;
        };
        if !self.backgrounds[i].bind(slot) {
            return false;
        }
        self.modes[i].background_slot_index = slot;
        true
    }

    pub fn background_path(&self, id: u8) -> Option<&Path> {
        self.backgrounds[self.index_of(id)?].current()
    }

    pub fn backgrounds(&self, id: u8) -> &[PathBuf] {
        match self.index_of(id) {
            Some(i) => self.backgrounds[i].files(),
            None => &[],
        }
    }
}

impl Default for LayoutCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
