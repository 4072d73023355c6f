//! Layout modes: where the two LCDs land on the logical output.

pub mod background;
pub mod catalog;

pub use catalog::{CatalogError, LayoutCatalog};

use dualview_ipc::{Rect, SurfaceId};
use serde::{Deserialize, Serialize};

/// Width and height in logical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn rect(self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }
}

/// Logical output every built-in layout is authored against.
pub const OUTPUT_SIZE: Size = Size::new(640, 480);
/// Native size of one emulated LCD.
pub const LCD_SIZE: Size = Size::new(256, 192);

/// Clockwise rotation in quarter turns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    pub fn from_degrees(degrees: u16) -> Option<Self> {
        match degrees {
            0 => Some(Rotation::R0),
            90 => Some(Rotation::R90),
            180 => Some(Rotation::R180),
            270 => Some(Rotation::R270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u16 {
        self.quarter_turns() as u16 * 90
    }

    pub fn quarter_turns(self) -> usize {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 1,
            Rotation::R180 => 2,
            Rotation::R270 => 3,
        }
    }

    /// Portrait/landscape flips for 90 and 270.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::R90 | Rotation::R270)
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        Rotation::from_degrees(degrees)
            .ok_or_else(|| format!("rotation must be 0, 90, 180 or 270, got {}", degrees))
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> u16 {
        rotation.degrees()
    }
}

/// Corner the small window sticks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
}

impl Corner {
    /// Configuration encoding: 0 = TL, 1 = TR, 2 = BL, 3 = BR.
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Corner::TopLeft),
            1 => Some(Corner::TopRight),
            2 => Some(Corner::BottomLeft),
            3 => Some(Corner::BottomRight),
            _ => None,
        }
    }

    /// A `w`×`h` rect flush with this corner of `outer`.
    pub fn place(self, outer: Rect, w: u32, h: u32) -> Rect {
        let left = outer.x;
        let right = outer.right().saturating_sub(w);
        let top = outer.y;
        let bottom = outer.bottom().saturating_sub(h);
        match self {
            Corner::TopLeft => Rect::new(left, top, w, h),
            Corner::TopRight => Rect::new(right, top, w, h),
            Corner::BottomLeft => Rect::new(left, bottom, w, h),
            Corner::BottomRight => Rect::new(right, bottom, w, h),
        }
    }
}

/// Picture-in-picture sub-mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmallWindow {
    pub position: Corner,
    /// Weight of the full-screen image in tenths, 0..=9.
    pub alpha: u8,
    pub border: bool,
}

impl SmallWindow {
    pub const MAX_ALPHA: u8 = 9;

    pub fn new(position: Corner, alpha: u8, border: bool) -> Self {
        Self {
            position,
            alpha: alpha.min(Self::MAX_ALPHA),
            border,
        }
    }

    pub fn alpha_fraction(&self) -> f32 {
        self.alpha as f32 / 10.0
    }
}

impl Default for SmallWindow {
    fn default() -> Self {
        Self::new(Corner::BottomRight, 0, false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutFamily {
    SmallWindow,
    SideBySide,
    Stacked,
    BigSmall,
    Single,
    HighRes,
    Rotated,
}

/// One entry of the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutMode {
    pub id: u8,
    pub name: String,
    pub family: LayoutFamily,
    /// Destination of screen slot 0 and slot 1, `None` hides the slot. For
    /// small-window modes only the size of slot 1 matters; its corner comes
    /// from `small_window.position`.
    pub screens: [Option<Rect>; 2],
    /// Slot 0 shows the right LCD instead of the left.
    #[serde(default)]
    pub swap: bool,
    /// Rotation of the LCD content inside its rect.
    #[serde(default)]
    pub rotation: Rotation,
    /// Mirror left/right placement across the output.
    #[serde(default)]
    pub mirror: bool,
    #[serde(default)]
    pub small_window: SmallWindow,
    #[serde(default)]
    pub background_slot_index: usize,
    #[serde(default)]
    pub has_background_plane: bool,
}

impl LayoutMode {
    /// Screen slot the LCD `surface` occupies; `None` for non-LCD surfaces.
    pub fn slot_of(&self, surface: SurfaceId) -> Option<usize> {
        surface
            .lcd_index()
            .map(|lcd| if self.swap { 1 - lcd } else { lcd })
    }

    /// LCD shown in `slot`.
    pub fn surface_in_slot(&self, slot: usize) -> SurfaceId {
        let lcd = if self.swap { 1 - slot } else { slot };
        if lcd == 0 {
            SurfaceId::LeftLcd
        } else {
            SurfaceId::RightLcd
        }
    }

    pub fn uses_small_window(&self) -> bool {
        self.family == LayoutFamily::SmallWindow
    }

    pub fn is_small_window_slot(&self, slot: usize) -> bool {
        self.uses_small_window() && slot == 1
    }

    /// Destination of `slot` with the small window already in its corner.
    pub fn screen_rect(&self, slot: usize) -> Option<Rect> {
        let rect = (*self.screens.get(slot)?)?;
        if self.is_small_window_slot(slot) {
            let outer = self.screens[0]?;
            return Some(self.small_window.position.place(outer, rect.w, rect.h));
        }
        Some(rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pip(swap: bool) -> LayoutMode {
        LayoutMode {
            id: 0,
            name: "pip".into(),
            family: LayoutFamily::SmallWindow,
            screens: [Some(OUTPUT_SIZE.rect()), Some(Rect::new(0, 0, 256, 192))],
            swap,
            rotation: Rotation::R0,
            mirror: false,
            small_window: SmallWindow::new(Corner::TopRight, 3, true),
            background_slot_index: 0,
            has_background_plane: false,
        }
    }

    #[test]
    fn test_corner_placement() {
        let outer = Rect::new(0, 0, 640, 480);
        assert_eq!(Corner::TopLeft.place(outer, 256, 192), Rect::new(0, 0, 256, 192));
        assert_eq!(Corner::TopRight.place(outer, 256, 192), Rect::new(384, 0, 256, 192));
        assert_eq!(Corner::BottomLeft.place(outer, 256, 192), Rect::new(0, 288, 256, 192));
        assert_eq!(Corner::BottomRight.place(outer, 256, 192), Rect::new(384, 288, 256, 192));
    }

    #[test]
    fn test_small_window_rect_follows_position() {
        let mut mode = pip(false);
        assert_eq!(mode.screen_rect(1), Some(Rect::new(384, 0, 256, 192)));
        mode.small_window.position = Corner::BottomLeft;
        assert_eq!(mode.screen_rect(1), Some(Rect::new(0, 288, 256, 192)));
        assert_eq!(mode.screen_rect(0), Some(OUTPUT_SIZE.rect()));
    }

    #[test]
    fn test_swap_exchanges_slots() {
        let mode = pip(true);
        assert_eq!(mode.slot_of(SurfaceId::LeftLcd), Some(1));
        assert_eq!(mode.slot_of(SurfaceId::RightLcd), Some(0));
        assert_eq!(mode.surface_in_slot(0), SurfaceId::RightLcd);
        assert_eq!(mode.slot_of(SurfaceId::Background), None);
    }

    #[test]
    fn test_alpha_is_clamped_to_nine() {
        assert_eq!(SmallWindow::new(Corner::TopLeft, 12, false).alpha, 9);
        assert!((SmallWindow::new(Corner::TopLeft, 3, false).alpha_fraction() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_rotation_degrees() {
        assert_eq!(Rotation::try_from(270), Ok(Rotation::R270));
        assert!(Rotation::try_from(45).is_err());
        assert!(Rotation::R90.swaps_axes());
        assert_eq!(u16::from(Rotation::R180), 180);
    }
}
