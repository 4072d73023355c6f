//! Bit-exact layout of the shared frame region.
//!
//! Both processes map the same [`SharedFrame`]. The header is laid out as
//!
//! ```text
//! offset  size  field
//!      0     1  valid        (0 = empty, 1 = command pending)
//!      1     1  command      (CommandKind)
//!      2     1  surface_id   (SurfaceId)
//!      3     1  filter_mode  (FilterMode)
//!      4     4  pitch
//!      8     4  alpha
//!     12    16  src          (Rect)
//!     28    16  dst          (Rect)
//!     44     4  len
//!     48     -  payload      (MAX_PAYLOAD bytes)
//! ```
//!
//! All multi-byte fields are native endian; both sides run on the same host.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::mem;
use std::sync::atomic::AtomicU8;

/// Widest source surface the region can carry.
pub const MAX_SURFACE_WIDTH: usize = 1024;
/// Tallest source surface the region can carry.
pub const MAX_SURFACE_HEIGHT: usize = 768;
/// Largest pixel format on the wire (XRGB8888).
pub const MAX_BYTES_PER_PIXEL: usize = 4;
/// Payload capacity in bytes.
pub const MAX_PAYLOAD: usize = MAX_SURFACE_WIDTH * MAX_SURFACE_HEIGHT * MAX_BYTES_PER_PIXEL;
/// Byte offset of the payload inside [`SharedFrame`].
pub const HEADER_SIZE: usize = 48;

/// Rectangle in source-pixel or destination-pixel space.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// A rect with zero width or height never carries drawable content.
    pub const fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub const fn right(&self) -> u32 {
        self.x.saturating_add(self.w)
    }

    pub const fn bottom(&self) -> u32 {
        self.y.saturating_add(self.h)
    }

    pub const fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    /// True if the two rects share at least one pixel.
    pub const fn intersects(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// True if every pixel of `other` lies inside `self`.
    pub const fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x && other.y >= self.y && other.right() <= self.right() && other.bottom() <= self.bottom()
    }

    /// Same size, moved to `(x, y)`.
    pub const fn at(&self, x: u32, y: u32) -> Self {
        Self { x, y, w: self.w, h: self.h }
    }
}

/// Logical drawable targets the producer can update.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SurfaceId {
    LeftLcd = 0,
    RightLcd = 1,
    Background = 2,
    PenOverlay = 3,
    MenuOverlay = 4,
    ScratchBuffer = 5,
}

impl SurfaceId {
    pub const COUNT: usize = 6;

    pub const ALL: [SurfaceId; Self::COUNT] = [
        SurfaceId::LeftLcd,
        SurfaceId::RightLcd,
        SurfaceId::Background,
        SurfaceId::PenOverlay,
        SurfaceId::MenuOverlay,
        SurfaceId::ScratchBuffer,
    ];

    /// Index of the logical LCD (0 or 1), `None` for every other surface.
    pub const fn lcd_index(self) -> Option<usize> {
        match self {
            SurfaceId::LeftLcd => Some(0),
            SurfaceId::RightLcd => Some(1),
            _ => None,
        }
    }

    pub const fn is_overlay(self) -> bool {
        matches!(self, SurfaceId::PenOverlay | SurfaceId::MenuOverlay)
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for SurfaceId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        SurfaceId::ALL.get(value as usize).copied().ok_or(value)
    }
}

/// Texture sampling requested for a flush.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FilterMode {
    #[default]
    Nearest = 0,
    Linear = 1,
}

impl TryFrom<u8> for FilterMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FilterMode::Nearest),
            1 => Ok(FilterMode::Linear),
            other => Err(other),
        }
    }
}

/// Wire discriminant of a [`Command`]. Zero is never written.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Flush = 1,
    Flip = 2,
    Quit = 3,
}

impl TryFrom<u8> for CommandKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CommandKind::Flush),
            2 => Ok(CommandKind::Flip),
            3 => Ok(CommandKind::Quit),
            other => Err(other),
        }
    }
}

/// Pixel update for one surface. Borrows its payload: on the producer side
/// from the emulator's buffer, on the consumer side from the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flush<'a> {
    pub surface: SurfaceId,
    pub pixels: &'a [u8],
    pub src: Rect,
    pub dst: Rect,
    pub pitch: u32,
    pub filter: FilterMode,
    /// Opacity hint in tenths, 10 = opaque.
    pub alpha: u32,
}

impl Flush<'_> {
    /// Bytes per pixel implied by `pitch / src.w`, if it divides evenly.
    pub fn bytes_per_pixel(&self) -> Option<u32> {
        if self.src.w == 0 || self.pitch % self.src.w != 0 {
            return None;
        }
        Some(self.pitch / self.src.w)
    }
}

/// The one command that occupies the transport at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Flush(Flush<'a>),
    Flip,
    Quit,
}

impl Command<'_> {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Flush(_) => CommandKind::Flush,
            Command::Flip => CommandKind::Flip,
            Command::Quit => CommandKind::Quit,
        }
    }

    pub fn payload_len(&self) -> usize {
        match self {
            Command::Flush(flush) => flush.pixels.len(),
            _ => 0,
        }
    }
}

/// The shared region. Only `valid` is ever touched by both sides; every other
/// field is written by the producer while `valid == 0` and read by the
/// consumer while `valid == 1`.
#[repr(C)]
pub struct SharedFrame {
    pub valid: AtomicU8,
    pub command: u8,
    pub surface_id: u8,
    pub filter_mode: u8,
    pub pitch: u32,
    pub alpha: u32,
    pub src: Rect,
    pub dst: Rect,
    pub len: u32,
    pub payload: [u8; MAX_PAYLOAD],
}

impl SharedFrame {
    /// Size of the whole region in bytes
    pub const fn size() -> usize {
        mem::size_of::<Self>()
    }
}
