//! C entry points for the hook shim inside the emulator process.
//!
//! The shim calls `dualview_producer_open` once, then forwards the emulator's
//! screen updates and frame boundaries. A stalled compositor terminates the
//! process with [`STALL_EXIT_CODE`].

use crate::{PixelFormat, Producer, ProducerConfig, ProducerError};
use dualview_ipc::{FilterMode, Rect, SurfaceId};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

pub const DV_OK: i32 = 0;
pub const DV_ERR_ARGS: i32 = -1;
pub const DV_ERR_CLOSED: i32 = -2;
pub const DV_ERR_TRANSPORT: i32 = -3;

/// Process exit status after a compositor stall.
pub const STALL_EXIT_CODE: i32 = 3;

static PRODUCER: Mutex<Option<Producer>> = Mutex::new(None);

fn producer_slot() -> MutexGuard<'static, Option<Producer>> {
    PRODUCER.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn status(result: Result<(), ProducerError>) -> i32 {
    match result {
        Ok(()) => DV_OK,
        Err(e) if e.is_fatal() => {
            error!("{}; terminating", e);
            std::process::exit(STALL_EXIT_CODE)
        }
        Err(ProducerError::Closed) => DV_ERR_CLOSED,
        Err(e @ (ProducerError::UnknownDisplayMode(_)
            | ProducerError::EmptyRect { .. }
            | ProducerError::SourceOutOfBounds { .. })) => {
            warn!("Rejected update: {}", e);
            DV_ERR_ARGS
        }
        Err(e) => {
            error!("Transport failure: {}", e);
            DV_ERR_TRANSPORT
        }
    }
}

/// Create the shared region. Safe to call again after `dualview_producer_close`.
#[unsafe(no_mangle)]
pub extern "C" fn dualview_producer_open() -> i32 {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let config = ProducerConfig::load().unwrap_or_else(|e| {
        warn!("{:#}; using default transport settings", e);
        ProducerConfig::default()
    });

    let mut slot = producer_slot();
    if slot.is_some() {
        return DV_OK;
    }
    match Producer::open(&config) {
        Ok(producer) => {
            *slot = Some(producer);
            DV_OK
        }
        Err(e) => {
            error!("Failed to open producer: {}", e);
            DV_ERR_TRANSPORT
        }
    }
}

/// Forward one surface update.
///
/// # Safety
///
/// `pixels` must point to at least `pitch * (src.y + src.h)` readable bytes
/// (with `pitch` taken as `src.w * bpp` when zero); `src` and `dst` must point
/// to valid rects.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dualview_on_surface_update(
    surface_id: u8,
    pixels: *const u8,
    pitch: u32,
    src: *const Rect,
    dst: *const Rect,
    display_mode: u32,
    filter_flag: u8,
) -> i32 {
    if pixels.is_null() || src.is_null() || dst.is_null() {
        return DV_ERR_ARGS;
    }
    let Ok(surface) = SurfaceId::try_from(surface_id) else {
        return DV_ERR_ARGS;
    };
    let Some(format) = PixelFormat::from_display_mode(display_mode) else {
        return DV_ERR_ARGS;
    };

    // SAFETY: both checked non-null above; the caller passes valid `Rect`s.
    let (src, dst) = unsafe { (src.read_unaligned(), dst.read_unaligned()) };
    let stride = if pitch == 0 {
        src.w as usize * format.bytes_per_pixel() as usize
    } else {
        pitch as usize
    };
    // SAFETY: the caller guarantees `stride` bytes for every row up to
    // `src.bottom()`.
    let pixels = unsafe { std::slice::from_raw_parts(pixels, stride * src.bottom() as usize) };
    let filter = if filter_flag != 0 {
        FilterMode::Linear
    } else {
        FilterMode::Nearest
    };

    let mut slot = producer_slot();
    let Some(producer) = slot.as_mut() else {
        return DV_ERR_CLOSED;
    };
    status(producer.on_surface_update(surface, pixels, pitch, src, dst, display_mode, filter))
}

/// Present the frame assembled so far.
#[unsafe(no_mangle)]
pub extern "C" fn dualview_on_frame_boundary() -> i32 {
    let mut slot = producer_slot();
    let Some(producer) = slot.as_mut() else {
        return DV_ERR_CLOSED;
    };
    status(producer.on_frame_boundary())
}

/// Quit handshake, then release the region.
#[unsafe(no_mangle)]
pub extern "C" fn dualview_producer_close() -> i32 {
    let Some(mut producer) = producer_slot().take() else {
        return DV_ERR_CLOSED;
    };
    status(producer.shutdown())
}
