//! Dualview producer
//!
//! Runs inside the process hosting the emulator's video hook. Every surface
//! update becomes a `Flush` in the shared transport and every frame boundary a
//! `Flip`; each call blocks until the compositor has consumed the command.

pub mod ffi;

use anyhow::Context;
use dualview_ipc::config::config_path;
use dualview_ipc::{
    Command, FilterMode, Flush, Rect, SurfaceId, Transport, TransportConfig, TransportError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Pixel layout of the emulator's buffers, selected by `display_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb565,
    Xrgb8888,
}

impl PixelFormat {
    pub fn from_display_mode(mode: u32) -> Option<Self> {
        match mode {
            0 => Some(PixelFormat::Rgb565),
            1 => Some(PixelFormat::Xrgb8888),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Xrgb8888 => 4,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("compositor stalled: command not consumed within {0:?}")]
    Stalled(Duration),
    #[error("producer already shut down")]
    Closed,
    #[error("unknown display mode {0}")]
    UnknownDisplayMode(u32),
    #[error("empty rect in update: src {src:?}, dst {dst:?}")]
    EmptyRect { src: Rect, dst: Rect },
    #[error("source rect {src:?} with pitch {pitch} exceeds a {len} byte buffer")]
    SourceOutOfBounds { src: Rect, pitch: usize, len: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProducerError {
    /// A stalled compositor means no frame can ever reach the screen again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProducerError::Stalled(_))
    }
}

/// `[producer]` section: opacity hints, in tenths, for the overlay planes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    pub pen_alpha: u32,
    pub menu_alpha: u32,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            pen_alpha: 10,
            menu_alpha: 10,
        }
    }
}

/// The producer's view of the shared configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub transport: TransportConfig,
    pub producer: ProducerSettings,
}

impl ProducerConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse producer config")
    }

    /// Read `[transport]` and `[producer]` from the shared config file,
    /// defaults if it is absent.
    pub fn load() -> anyhow::Result<Self> {
        let Some(path) = config_path() else {
            return Ok(Self::default());
        };
        if !path.exists() {
            debug!("No config at {:?}, producer uses defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        Self::from_toml(&content).with_context(|| format!("Failed to load {:?}", path))
    }
}

pub struct Producer {
    transport: Option<Transport>,
    config: TransportConfig,
    staging: Vec<u8>,
    alpha: [u32; SurfaceId::COUNT],
    published: u64,
}

impl Producer {
    /// Create the shared region and take the producer end.
    pub fn open(config: &ProducerConfig) -> Result<Self, ProducerError> {
        let transport = Transport::create(&config.transport)?;
        info!("Producer ready on {}", config.transport.shm_name);
        let mut producer = Self::with_transport(transport, config.transport.clone());
        producer.apply_settings(&config.producer);
        Ok(producer)
    }

    pub fn apply_settings(&mut self, settings: &ProducerSettings) {
        self.set_surface_alpha(SurfaceId::PenOverlay, settings.pen_alpha);
        self.set_surface_alpha(SurfaceId::MenuOverlay, settings.menu_alpha);
    }

    pub fn with_transport(transport: Transport, config: TransportConfig) -> Self {
        Self {
            transport: Some(transport),
            config,
            staging: Vec::new(),
            alpha: [10; SurfaceId::COUNT],
            published: 0,
        }
    }

    /// Opacity hint (tenths) sent with every flush of `surface`.
    pub fn set_surface_alpha(&mut self, surface: SurfaceId, alpha: u32) {
        self.alpha[surface.index()] = alpha.min(10);
    }

    pub fn surface_alpha(&self, surface: SurfaceId) -> u32 {
        self.alpha[surface.index()]
    }

    /// Commands the compositor has accepted so far.
    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Forward one surface update. `pitch` is the stride of `pixels`; zero
    /// means tightly packed. Only the `src` sub-rectangle is sent.
    #[allow(clippy::too_many_arguments)]
    pub fn on_surface_update(
        &mut self,
        surface: SurfaceId,
        pixels: &[u8],
        pitch: u32,
        src: Rect,
        dst: Rect,
        display_mode: u32,
        filter: FilterMode,
    ) -> Result<(), ProducerError> {
        let format = PixelFormat::from_display_mode(display_mode)
            .ok_or(ProducerError::UnknownDisplayMode(display_mode))?;
        let transport = self.transport.as_mut().ok_or(ProducerError::Closed)?;
        if src.is_empty() || dst.is_empty() {
            return Err(ProducerError::EmptyRect { src, dst });
        }

        let bpp = format.bytes_per_pixel();
        let row = (bpp * src.w) as usize;
        let stride = if pitch == 0 { row } else { pitch as usize };
        let payload = pack_source(pixels, stride, src, bpp as usize, &mut self.staging)?;

        let command = Command::Flush(Flush {
            surface,
            pixels: payload,
            src,
            dst,
            pitch: bpp * src.w,
            filter,
            alpha: self.alpha[surface.index()],
        });
        send(transport, &self.config, &command)?;

        self.published += 1;
        trace!("Flushed {:?} {}x{}", surface, src.w, src.h);
        Ok(())
    }

    /// Ask the compositor to present the frame assembled so far.
    pub fn on_frame_boundary(&mut self) -> Result<(), ProducerError> {
        let transport = self.transport.as_mut().ok_or(ProducerError::Closed)?;
        send(transport, &self.config, &Command::Flip)?;
        self.published += 1;
        Ok(())
    }

    /// Send `Quit`, wait for the compositor to take it, then unmap and
    /// unlink the region. Every later call fails with [`ProducerError::Closed`].
    pub fn shutdown(&mut self) -> Result<(), ProducerError> {
        let mut transport = self.transport.take().ok_or(ProducerError::Closed)?;
        let result = send(&mut transport, &self.config, &Command::Quit);

        if let Err(e) = transport.unlink() {
            warn!("Failed to unlink shared region: {}", e);
        }
        drop(transport);

        match &result {
            Ok(()) => info!("Producer shut down after {} commands", self.published),
            Err(e) => warn!("Producer shut down without acknowledgement: {}", e),
        }
        result
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if self.transport.is_some() {
            if let Err(e) = self.shutdown() {
                warn!("Shutdown on drop failed: {}", e);
            }
        }
    }
}

/// Wait for the slot, publish, wait for consumption.
fn send(
    transport: &mut Transport,
    config: &TransportConfig,
    command: &Command<'_>,
) -> Result<(), ProducerError> {
    wait_idle(transport, config)?;
    transport.publish(command)?;
    wait_idle(transport, config)
}

/// Poll `valid` until it clears, at most `stall_retries` times.
fn wait_idle(transport: &Transport, config: &TransportConfig) -> Result<(), ProducerError> {
    let interval = config.poll_interval();
    for _ in 0..config.stall_retries {
        if !transport.is_busy() {
            return Ok(());
        }
        std::thread::sleep(interval);
    }
    if transport.is_busy() {
        Err(ProducerError::Stalled(config.stall_timeout()))
    } else {
        Ok(())
    }
}

/// Tightly pack the `src` sub-rectangle of a strided buffer. Borrows the
/// input directly when it is already tight.
fn pack_source<'a>(
    pixels: &'a [u8],
    stride: usize,
    src: Rect,
    bpp: usize,
    staging: &'a mut Vec<u8>,
) -> Result<&'a [u8], ProducerError> {
    let row = src.w as usize * bpp;
    if src.is_empty() {
        return Ok(&[]);
    }

    let x0 = src.x as usize * bpp;
    let first = src.y as usize * stride;
    let end = first + (src.h as usize - 1) * stride + x0 + row;
    if x0 + row > stride || end > pixels.len() {
        return Err(ProducerError::SourceOutOfBounds {
            src,
            pitch: stride,
            len: pixels.len(),
        });
    }

    if x0 == 0 && stride == row {
        return Ok(&pixels[first..first + row * src.h as usize]);
    }

    staging.clear();
    for r in 0..src.h as usize {
        let start = first + r * stride + x0;
        staging.extend_from_slice(&pixels[start..start + row]);
    }
    Ok(&staging[..])
}
