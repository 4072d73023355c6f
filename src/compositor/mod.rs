//! Consumer side of the transport: decode one command at a time, draw it on
//! the display backend and present on `Flip`.
//!
//! The compositor keeps the last image of every surface so that a frame can
//! be rebuilt from scratch whenever the backend does not preserve its back
//! buffer, the layout changed or a new background arrived.

use crate::backend::{BackendError, Capabilities, DisplayBackend};
use crate::blend::{BORDER_COLOR, blend_small_window, border_rects, occluded_uv};
use crate::config::Config;
use crate::layout::background::load_background;
use crate::layout::{LayoutCatalog, LayoutMode, Rotation, Size, SmallWindow};
use crate::pixels::Image;
use crate::transform::{Quad, QuadParams, quad_for};
use dualview_ipc::{Command, DecodeError, FilterMode, Flush, Rect, SurfaceId, Transport};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Everything the compositor needs from the configuration.
#[derive(Debug, Clone)]
pub struct CompositorSettings {
    pub output: Size,
    pub orientation: Rotation,
    pub clear_color: u32,
    pub mode: u8,
    pub small_window: SmallWindow,
}

impl CompositorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            output: Size::new(config.display.output_width, config.display.output_height),
            orientation: config.display.orientation,
            clear_color: config.display.clear_color,
            mode: config.layout.mode,
            small_window: config.layout.small_window.resolve(),
        }
    }
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            output: crate::layout::OUTPUT_SIZE,
            orientation: Rotation::R0,
            clear_color: 0,
            mode: 0,
            small_window: SmallWindow::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Processing,
    ShuttingDown,
}

/// What one [`Compositor::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing pending.
    Idle,
    Flushed(SurfaceId),
    /// A malformed command was consumed and ignored.
    Dropped,
    Flipped,
    Quit,
}

/// Why a command was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Malformed {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("empty source rect {0:?}")]
    EmptySource(Rect),

    #[error("empty destination rect {0:?}")]
    EmptyDestination(Rect),

    #[error("pitch {pitch} is not 2 or 4 bytes per pixel at width {width}")]
    BadPitch { pitch: u32, width: u32 },

    #[error("payload of {len} bytes is shorter than {needed}")]
    ShortPayload { len: usize, needed: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompositorStats {
    pub flushes: u64,
    pub flips: u64,
    pub dropped: u64,
    pub recompositions: u64,
}

/// Flips per second, measured from `CompositorStats::flips` over windows of
/// at least `interval`.
#[derive(Debug, Clone, Copy)]
struct FlipRate {
    interval: Duration,
    window_start: Instant,
    flips_at_start: u64,
    last: f64,
}

impl FlipRate {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: Instant::now(),
            flips_at_start: 0,
            last: 0.0,
        }
    }

    /// `Some(rate)` when a window closed.
    fn observe(&mut self, flips: u64, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }
        self.last = flips.saturating_sub(self.flips_at_start) as f64 / elapsed.as_secs_f64();
        self.window_start = now;
        self.flips_at_start = flips;
        Some(self.last)
    }
}

struct SurfaceState {
    image: Image,
    filter: FilterMode,
    /// Overlays only: opacity hint and where the producer placed them.
    opacity: f32,
    dst: Rect,
}

#[derive(Default)]
struct BackgroundPlane {
    image: Option<Image>,
    /// Newer than what the backend last drew.
    pending: bool,
    /// Asset the image was loaded from; `None` if the producer sent it.
    asset: Option<PathBuf>,
}

/// Overlay planes, bottom to top.
const OVERLAYS: [SurfaceId; 2] = [SurfaceId::PenOverlay, SurfaceId::MenuOverlay];

pub struct Compositor<B: DisplayBackend> {
    backend: B,
    catalog: LayoutCatalog,
    mode: LayoutMode,
    output: Size,
    orientation: Rotation,
    clear_color: u32,
    state: ConsumerState,
    surfaces: HashMap<SurfaceId, SurfaceState>,
    /// Surfaces whose texture could not be created; skipped for the session.
    disabled: HashSet<SurfaceId>,
    background: BackgroundPlane,
    needs_recompose: bool,
    flip_rate: FlipRate,
    stats: CompositorStats,
}

/// Bytes per pixel implied by the pitch, after checking the payload covers
/// the whole source rect.
fn validate(flush: &Flush<'_>) -> Result<u32, Malformed> {
    if flush.src.is_empty() {
        return Err(Malformed::EmptySource(flush.src));
    }
    if flush.dst.is_empty() {
        return Err(Malformed::EmptyDestination(flush.dst));
    }
    let bpp = flush
        .bytes_per_pixel()
        .filter(|bpp| matches!(*bpp, 2 | 4))
        .ok_or(Malformed::BadPitch {
            pitch: flush.pitch,
            width: flush.src.w,
        })?;
    let needed = flush.pitch as usize * flush.src.h as usize;
    if flush.pixels.len() < needed {
        return Err(Malformed::ShortPayload {
            len: flush.pixels.len(),
            needed,
        });
    }
    Ok(bpp)
}

impl<B: DisplayBackend> Compositor<B> {
    pub fn new(backend: B, catalog: LayoutCatalog, settings: CompositorSettings) -> Self {
        let mut mode = catalog.resolve(settings.mode).clone();
        if mode.id != settings.mode {
            warn!("Unknown layout {}, starting with {} ({})", settings.mode, mode.id, mode.name);
        }
        mode.small_window = settings.small_window;

        let mut compositor = Self {
            backend,
            catalog,
            mode,
            output: settings.output,
            orientation: settings.orientation,
            clear_color: settings.clear_color,
            state: ConsumerState::Idle,
            surfaces: HashMap::new(),
            disabled: HashSet::new(),
            background: BackgroundPlane::default(),
            needs_recompose: true,
            flip_rate: FlipRate::new(Duration::from_secs(1)),
            stats: CompositorStats::default(),
        };
        compositor.load_background_asset();
        compositor
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn stats(&self) -> CompositorStats {
        self.stats
    }

    /// Presented frames per second over the last full second, 0 until then.
    pub fn flip_rate(&self) -> f64 {
        self.flip_rate.last
    }

    pub fn mode(&self) -> &LayoutMode {
        &self.mode
    }

    pub fn catalog(&self) -> &LayoutCatalog {
        &self.catalog
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn is_disabled(&self, surface: SurfaceId) -> bool {
        self.disabled.contains(&surface)
    }

    /// Switch layouts at runtime. The next `Flip` rebuilds the frame. False
    /// if `id` is not in the catalog.
    pub fn set_layout(&mut self, id: u8, small_window: Option<SmallWindow>) -> bool {
        let Some(mode) = self.catalog.get(id) else {
            warn!("Ignoring switch to unknown layout {}", id);
            return false;
        };
        let small_window = small_window.unwrap_or(self.mode.small_window);
        self.mode = mode.clone();
        self.mode.small_window = small_window;
        info!("Layout {} ({})", self.mode.id, self.mode.name);

        self.needs_recompose = true;
        self.load_background_asset();
        self.refresh_lcd_textures();
        true
    }

    /// Cycle to the next layout in the catalog.
    pub fn next_layout(&mut self) -> bool {
        let id = self.catalog.next_id(self.mode.id);
        self.set_layout(id, None)
    }

    /// Pick another background image for the current layout.
    pub fn bind_background(&mut self, slot: usize) -> bool {
        if !self.catalog.bind_background(self.mode.id, slot) {
            return false;
        }
        self.mode.background_slot_index = slot;
        self.load_background_asset();
        true
    }

    /// Poll once; if a command is pending, apply it and hand the slot back.
    pub fn step(&mut self, transport: &mut Transport) -> Step {
        if self.state == ConsumerState::ShuttingDown {
            return Step::Quit;
        }

        let step = match transport.poll() {
            None => return Step::Idle,
            Some(polled) => {
                self.state = ConsumerState::Processing;
                self.dispatch(polled)
            }
        };
        transport.consume();

        if step == Step::Quit {
            self.shutdown();
        } else {
            self.state = ConsumerState::Idle;
        }
        step
    }

    /// Step until `Quit` or until `stop` is raised. Sleeps `idle` between
    /// empty polls.
    pub fn run(&mut self, transport: &mut Transport, stop: &AtomicBool, idle: Duration) -> CompositorStats {
        info!(
            "Compositing on the {} backend, layout {} ({})",
            self.backend.name(),
            self.mode.id,
            self.mode.name
        );
        while self.state != ConsumerState::ShuttingDown {
            if stop.load(Ordering::Relaxed) {
                info!("Stop requested");
                self.shutdown();
                break;
            }
            if self.step(transport) == Step::Idle {
                if idle.is_zero() {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(idle);
                }
            }
        }
        info!(
            "Compositor finished: {} flushes, {} flips, {} dropped",
            self.stats.flushes, self.stats.flips, self.stats.dropped
        );
        self.stats
    }

    /// Release backend resources. Later steps report `Quit`.
    pub fn shutdown(&mut self) {
        if self.state == ConsumerState::ShuttingDown {
            return;
        }
        self.state = ConsumerState::ShuttingDown;
        self.backend.release();
        self.surfaces.clear();
        self.background = BackgroundPlane::default();
        info!("Compositor shut down");
    }

    fn dispatch(&mut self, polled: Result<Command<'_>, DecodeError>) -> Step {
        match polled {
            Err(e) => self.drop_command(e.into()),
            Ok(Command::Flush(flush)) => match self.handle_flush(&flush) {
                Ok(()) => {
                    self.stats.flushes += 1;
                    Step::Flushed(flush.surface)
                }
                Err(reason) => self.drop_command(reason),
            },
            Ok(Command::Flip) => {
                self.handle_flip();
                Step::Flipped
            }
            Ok(Command::Quit) => {
                info!("Producer quit");
                Step::Quit
            }
        }
    }

    fn drop_command(&mut self, reason: Malformed) -> Step {
        warn!("Dropping malformed command: {}", reason);
        self.stats.dropped += 1;
        Step::Dropped
    }

    fn handle_flush(&mut self, flush: &Flush<'_>) -> Result<(), Malformed> {
        let bpp = validate(flush)?;
        let image = Image::from_payload(flush.pixels, flush.src.w, flush.src.h, bpp).ok_or(
            Malformed::ShortPayload {
                len: flush.pixels.len(),
                needed: (flush.src.area() * bpp as u64) as usize,
            },
        )?;

        match flush.surface {
            SurfaceId::LeftLcd | SurfaceId::RightLcd => self.update_lcd(flush.surface, image, flush.filter),
            SurfaceId::PenOverlay | SurfaceId::MenuOverlay => {
                let opacity = flush.alpha.min(10) as f32 / 10.0;
                self.update_overlay(flush.surface, image, flush.filter, opacity, flush.dst)
            }
            SurfaceId::Background => self.update_background(image, flush.filter),
            SurfaceId::ScratchBuffer => {
                debug!("Cached scratch buffer {}x{}", image.width, image.height);
                self.surfaces.insert(
                    SurfaceId::ScratchBuffer,
                    SurfaceState {
                        image,
                        filter: flush.filter,
                        opacity: 1.0,
                        dst: flush.dst,
                    },
                );
            }
        }
        Ok(())
    }

    fn handle_flip(&mut self) {
        let preserves = self.backend.capabilities().contains(Capabilities::PRESERVES_BACK_BUFFER);
        if self.needs_recompose || self.background.pending || !preserves {
            self.recompose();
        }
        if let Err(e) = self.backend.present() {
            warn!("Present failed: {}", e);
        }
        self.needs_recompose = false;
        self.stats.flips += 1;
        if let Some(rate) = self.flip_rate.observe(self.stats.flips, Instant::now()) {
            debug!("{:.1} fps", rate);
        }
    }

    /// Draw on flush, or leave it to the next `Flip`'s recomposition.
    fn draws_immediately(&self) -> bool {
        self.backend.capabilities().contains(Capabilities::PRESERVES_BACK_BUFFER)
            && !self.needs_recompose
            && !self.background.pending
    }

    fn update_lcd(&mut self, surface: SurfaceId, image: Image, filter: FilterMode) {
        let Some(slot) = self.mode.slot_of(surface) else {
            return;
        };
        let immediate = self.draws_immediately();
        let rect = self.mode.screen_rect(slot);
        let small = self.mode.is_small_window_slot(slot);

        if rect.is_some() && !small {
            self.upload(surface, &image, filter);
        }
        self.surfaces.insert(
            surface,
            SurfaceState {
                image,
                filter,
                opacity: 1.0,
                dst: Rect::default(),
            },
        );
        let Some(rect) = rect else {
            debug!("{:?} hidden in layout {}", surface, self.mode.name);
            return;
        };

        if small {
            self.prepare_small_window();
            if immediate {
                self.draw_small_window();
                self.restore_overlays(&[rect]);
            }
            return;
        }

        if immediate {
            self.draw_lcd(slot);
        }
        let mut damaged = vec![rect];
        // the base screen was drawn over the small window
        if self.mode.uses_small_window() && self.surfaces.contains_key(&self.mode.surface_in_slot(1)) {
            if !self.has_shader_blend() {
                self.prepare_small_window();
            }
            if immediate {
                self.draw_small_window();
                damaged.extend(self.mode.screen_rect(1));
            }
        }
        if immediate {
            self.restore_overlays(&damaged);
        }
    }

    /// An immediate draw over `damaged` covered the overlays there. Redraw
    /// them if they lie wholly inside it, else rebuild at the next `Flip`.
    fn restore_overlays(&mut self, damaged: &[Rect]) {
        let hit: Vec<SurfaceId> = OVERLAYS
            .into_iter()
            .filter(|o| {
                self.surfaces
                    .get(o)
                    .is_some_and(|s| damaged.iter().any(|r| r.intersects(&s.dst)))
            })
            .collect();
        let inside = hit.iter().all(|o| {
            self.surfaces
                .get(o)
                .is_some_and(|s| damaged.iter().any(|r| r.contains(&s.dst)))
        });
        if !inside {
            debug!("Overlay straddles a redrawn screen, recomposing at flip");
            self.needs_recompose = true;
            return;
        }
        for overlay in hit {
            self.draw_overlay(overlay);
        }
    }

    fn update_overlay(&mut self, surface: SurfaceId, image: Image, filter: FilterMode, opacity: f32, dst: Rect) {
        // Drawing over the previous copy only works if the new one hides it
        // completely and nothing above it is in the way.
        let previous = self.surfaces.get(&surface).map(|s| s.dst);
        let covered_above = OVERLAYS
            .into_iter()
            .skip_while(|o| *o != surface)
            .skip(1)
            .any(|o| self.surfaces.get(&o).is_some_and(|s| s.dst.intersects(&dst)));
        let in_place = previous.is_none_or(|p| opacity >= 1.0 && dst.contains(&p)) && !covered_above;
        if !in_place {
            self.needs_recompose = true;
        }
        let immediate = in_place && self.draws_immediately();
        let uploaded = self.upload(surface, &image, filter);
        self.surfaces.insert(
            surface,
            SurfaceState {
                image,
                filter,
                opacity,
                dst,
            },
        );
        if immediate && uploaded {
            self.draw_overlay(surface);
        }
    }

    fn update_background(&mut self, image: Image, filter: FilterMode) {
        if self.backend.capabilities().contains(Capabilities::BUFFER_LAYER) {
            self.upload(SurfaceId::Background, &image, filter);
            self.background = BackgroundPlane {
                image: Some(image),
                pending: false,
                asset: None,
            };
            return;
        }
        self.background = BackgroundPlane {
            image: Some(image),
            pending: true,
            asset: None,
        };
    }

    /// Load the bound background of the current mode if it is not the one
    /// already shown.
    fn load_background_asset(&mut self) {
        if !self.mode.has_background_plane {
            return;
        }
        let Some(path) = self.catalog.background_path(self.mode.id) else {
            return;
        };
        if self.background.asset.as_deref() == Some(path) {
            return;
        }
        let path = path.to_path_buf();
        if let Some(image) = load_background(&path, self.output) {
            info!("Background {}", path.display());
            self.background = BackgroundPlane {
                image: Some(image),
                pending: true,
                asset: Some(path),
            };
        }
    }

    /// After a layout change textures may hold blended pixels or belong to a
    /// screen that was hidden; upload the raw images again.
    fn refresh_lcd_textures(&mut self) {
        for slot in 0..2 {
            let surface = self.mode.surface_in_slot(slot);
            if self.mode.screen_rect(slot).is_none() || self.mode.is_small_window_slot(slot) {
                continue;
            }
            if let Some(state) = self.surfaces.get(&surface) {
                if self.disabled.contains(&surface) {
                    continue;
                }
                if let Err(e) = self.backend.upload_texture(surface, &state.image, state.filter) {
                    warn!("Disabling {:?} for this session: {}", surface, e);
                    self.disabled.insert(surface);
                }
            }
        }
        if self.mode.uses_small_window() {
            self.prepare_small_window();
        }
    }

    fn has_shader_blend(&self) -> bool {
        self.backend.capabilities().contains(Capabilities::SHADER_BLEND)
    }

    /// Upload, disabling the surface on allocation failure.
    fn upload(&mut self, surface: SurfaceId, image: &Image, filter: FilterMode) -> bool {
        if self.disabled.contains(&surface) {
            return false;
        }
        match self.backend.upload_texture(surface, image, filter) {
            Ok(()) => true,
            Err(e) => {
                self.disable(surface, e);
                false
            }
        }
    }

    fn disable(&mut self, surface: SurfaceId, e: BackendError) {
        warn!("Disabling {:?} for this session: {}", surface, e);
        self.disabled.insert(surface);
    }

    fn draw(&mut self, surface: SurfaceId, quad: &Quad, opacity: f32) {
        if self.disabled.contains(&surface) {
            return;
        }
        if let Err(e) = self.backend.draw_quad(surface, quad, opacity) {
            warn!("Failed to draw {:?}: {}", surface, e);
        }
    }

    /// Quad for an LCD: content rotation and mirroring from the layout.
    fn screen_quad(&self, rect: Rect) -> Quad {
        let params = QuadParams {
            output: self.output,
            orientation: self.orientation,
            content_rotation: self.mode.rotation,
            mirror: self.mode.mirror,
        };
        quad_for(rect, &params)
    }

    /// Quad in plain output space, for overlays, background and border.
    fn output_quad(&self, rect: Rect) -> Quad {
        quad_for(rect, &QuadParams::new(self.output, self.orientation))
    }

    fn draw_lcd(&mut self, slot: usize) {
        let surface = self.mode.surface_in_slot(slot);
        let Some(rect) = self.mode.screen_rect(slot) else {
            return;
        };
        if !self.surfaces.contains_key(&surface) {
            return;
        }
        let quad = self.screen_quad(rect);
        self.draw(surface, &quad, 1.0);
    }

    fn draw_overlay(&mut self, surface: SurfaceId) {
        let Some(state) = self.surfaces.get(&surface) else {
            return;
        };
        let (dst, opacity) = (state.dst, state.opacity);
        let quad = self.output_quad(dst);
        self.draw(surface, &quad, opacity);
    }

    /// Bring the small-window texture up to date: the raw overlay for the
    /// shader path, the CPU-blended result otherwise.
    fn prepare_small_window(&mut self) {
        let overlay = self.mode.surface_in_slot(1);
        let (Some(window), Some(base_dst)) = (self.mode.screen_rect(1), self.mode.screen_rect(0)) else {
            return;
        };
        if self.disabled.contains(&overlay) {
            return;
        }
        let Some(state) = self.surfaces.get(&overlay) else {
            return;
        };

        let result = if self.backend.capabilities().contains(Capabilities::SHADER_BLEND) {
            self.backend.upload_texture(overlay, &state.image, state.filter)
        } else {
            let base = self.surfaces.get(&self.mode.surface_in_slot(0)).map(|s| &s.image);
            let blended = blend_small_window(&state.image, base, base_dst, window, &self.mode.small_window);
            self.backend.upload_texture(overlay, &blended, state.filter)
        };
        if let Err(e) = result {
            self.disable(overlay, e);
        }
    }

    fn draw_small_window(&mut self) {
        let overlay = self.mode.surface_in_slot(1);
        let base = self.mode.surface_in_slot(0);
        let (Some(window), Some(base_dst)) = (self.mode.screen_rect(1), self.mode.screen_rect(0)) else {
            return;
        };
        if !self.surfaces.contains_key(&overlay) || self.disabled.contains(&overlay) {
            return;
        }
        let quad = self.output_quad(window);
        let small_window = self.mode.small_window;

        if !self.has_shader_blend() {
            // blend and border are baked into the texture
            self.draw(overlay, &quad, 1.0);
            return;
        }

        let base_ready = self.surfaces.contains_key(&base) && !self.disabled.contains(&base);
        let result = if base_ready {
            let uv = occluded_uv(window, base_dst);
            self.backend.draw_blended(overlay, base, &quad, uv, small_window.alpha)
        } else {
            // nothing underneath: blending against black is a scaled overlay
            self.backend.draw_quad(overlay, &quad, 1.0 - small_window.alpha_fraction())
        };
        if let Err(e) = result {
            warn!("Failed to draw small window: {}", e);
        }

        if small_window.border {
            for edge in border_rects(window) {
                let quad = self.output_quad(edge);
                if let Err(e) = self.backend.fill_quad(&quad, BORDER_COLOR) {
                    warn!("Failed to draw small window border: {}", e);
                }
            }
        }
    }

    fn draw_background(&mut self) {
        if !self.mode.has_background_plane {
            return;
        }
        if self.backend.capabilities().contains(Capabilities::BUFFER_LAYER) {
            return;
        }
        let Some(image) = &self.background.image else {
            return;
        };
        if self.background.pending {
            let result = self.backend.upload_texture(SurfaceId::Background, image, FilterMode::Linear);
            self.background.pending = false;
            if let Err(e) = result {
                self.disable(SurfaceId::Background, e);
            }
        }
        let quad = self.output_quad(self.output.rect());
        self.draw(SurfaceId::Background, &quad, 1.0);
    }

    /// Rebuild the whole frame from retained state.
    fn recompose(&mut self) {
        self.stats.recompositions += 1;
        self.backend.clear(self.clear_color);
        self.draw_background();
        // pending only matters for modes that draw it
        self.background.pending = false;

        for slot in 0..2 {
            if self.mode.is_small_window_slot(slot) {
                self.draw_small_window();
            } else {
                self.draw_lcd(slot);
            }
        }
        for overlay in OVERLAYS {
            self.draw_overlay(overlay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::layout::Corner;

    fn compositor(mode: u8, small_window: SmallWindow) -> Compositor<SoftwareBackend> {
        let settings = CompositorSettings {
            mode,
            small_window,
            ..CompositorSettings::default()
        };
        Compositor::new(SoftwareBackend::headless(640, 480), LayoutCatalog::builtin(), settings)
    }

    fn xrgb(color: u32, w: u32, h: u32) -> Vec<u8> {
        color.to_le_bytes().repeat((w * h) as usize)
    }

    fn flush<'a>(surface: SurfaceId, pixels: &'a [u8], w: u32, h: u32) -> Command<'a> {
        Command::Flush(Flush {
            surface,
            pixels,
            src: Rect::new(0, 0, w, h),
            dst: Rect::new(0, 0, 640, 480),
            pitch: w * 4,
            filter: FilterMode::Nearest,
            alpha: 10,
        })
    }

    fn send(compositor: &mut Compositor<SoftwareBackend>, producer: &mut Transport, consumer: &mut Transport, command: &Command<'_>) -> Step {
        producer.publish(command).unwrap();
        compositor.step(consumer)
    }

    #[test]
    fn test_side_by_side_places_both_screens() {
        let (mut producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(2, SmallWindow::default());
        let red = xrgb(0x00FF_0000, 4, 3);
        let blue = xrgb(0x0000_00FF, 4, 3);

        assert_eq!(send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &red, 4, 3)), Step::Flushed(SurfaceId::LeftLcd));
        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::RightLcd, &blue, 4, 3));
        assert_eq!(send(&mut comp, &mut producer, &mut consumer, &Command::Flip), Step::Flipped);

        let backend = comp.backend();
        assert_eq!(backend.pixel(10, 200), 0x00FF_0000);
        assert_eq!(backend.pixel(630, 200), 0x0000_00FF);
        // letterbox above the screens
        assert_eq!(backend.pixel(10, 10), 0);
        assert_eq!(comp.state(), ConsumerState::Idle);
    }

    #[test]
    fn test_swap_variant_exchanges_screens() {
        let (mut producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(3, SmallWindow::default());
        let red = xrgb(0x00FF_0000, 4, 3);
        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &red, 4, 3));
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
        assert_eq!(comp.backend().pixel(630, 200), 0x00FF_0000);
        assert_eq!(comp.backend().pixel(10, 200), 0);
    }

    #[test]
    fn test_small_window_blends_on_cpu() {
        let (mut producer, mut consumer) = Transport::loopback();
        let sw = SmallWindow::new(Corner::BottomRight, 3, false);
        let mut comp = compositor(0, sw);
        let bg = xrgb(0x00C8_6432, 8, 6);
        let ov = xrgb(0x000A_141E, 8, 6);

        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &bg, 8, 6));
        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::RightLcd, &ov, 8, 6));
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);

        let backend = comp.backend();
        assert_eq!(backend.pixel(500, 400), 0x0043_2C24);
        assert_eq!(backend.pixel(100, 100), 0x00C8_6432);
    }

    #[test]
    fn test_small_window_follows_new_base_frames() {
        let (mut producer, mut consumer) = Transport::loopback();
        let sw = SmallWindow::new(Corner::TopLeft, 5, true);
        let mut comp = compositor(0, sw);
        let ov = xrgb(0x0000_0000, 8, 6);
        let white = xrgb(0x00FF_FFFF, 8, 6);

        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::RightLcd, &ov, 8, 6));
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &white, 8, 6));
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);

        let backend = comp.backend();
        // white * 0.5 + black * 0.5, rounded up
        assert_eq!(backend.pixel(100, 100), 0x0080_8080);
        assert_eq!(backend.pixel(0, 0), BORDER_COLOR);
        assert_eq!(backend.pixel(400, 300), 0x00FF_FFFF);
    }

    #[test]
    fn test_overlay_uses_its_own_destination_and_alpha() {
        let (mut producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(8, SmallWindow::default());
        let black = xrgb(0, 4, 4);
        let white = xrgb(0x00FF_FFFF, 2, 2);
        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &black, 4, 4));

        let pen = Command::Flush(Flush {
            surface: SurfaceId::PenOverlay,
            pixels: &white,
            src: Rect::new(0, 0, 2, 2),
            dst: Rect::new(100, 100, 20, 20),
            pitch: 8,
            filter: FilterMode::Nearest,
            alpha: 5,
        });
        send(&mut comp, &mut producer, &mut consumer, &pen);
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);

        let backend = comp.backend();
        assert_eq!(backend.pixel(110, 110), 0x0080_8080);
        assert_eq!(backend.pixel(90, 90), 0);
    }

    fn pen(pixels: &[u8], dst: Rect, alpha: u32) -> Command<'_> {
        Command::Flush(Flush {
            surface: SurfaceId::PenOverlay,
            pixels,
            src: Rect::new(0, 0, 2, 2),
            dst,
            pitch: 8,
            filter: FilterMode::Nearest,
            alpha,
        })
    }

    #[test]
    fn test_overlay_survives_later_lcd_frames() {
        let (mut producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(8, SmallWindow::default());
        let black = xrgb(0, 4, 4);
        let gray = xrgb(0x0020_2020, 4, 4);
        let white = xrgb(0x00FF_FFFF, 2, 2);

        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &black, 4, 4));
        send(&mut comp, &mut producer, &mut consumer, &pen(&white, Rect::new(100, 100, 20, 20), 10));
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
        assert_eq!(comp.backend().pixel(110, 110), 0x00FF_FFFF);

        for _ in 0..3 {
            send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &gray, 4, 4));
            send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
            assert_eq!(comp.backend().pixel(110, 110), 0x00FF_FFFF);
            assert_eq!(comp.backend().pixel(90, 90), 0x0020_2020);
        }
        // the overlay sits inside the screen, so it is redrawn in place
        assert_eq!(comp.stats().recompositions, 1);
    }

    #[test]
    fn test_translucent_overlay_does_not_accumulate() {
        let (mut producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(8, SmallWindow::default());
        let black = xrgb(0, 4, 4);
        let white = xrgb(0x00FF_FFFF, 2, 2);
        let dst = Rect::new(100, 100, 20, 20);

        for _ in 0..3 {
            send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &black, 4, 4));
            send(&mut comp, &mut producer, &mut consumer, &pen(&white, dst, 5));
            send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
            assert_eq!(comp.backend().pixel(110, 110), 0x0080_8080);
        }
        for _ in 0..2 {
            send(&mut comp, &mut producer, &mut consumer, &pen(&white, dst, 5));
            send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
            assert_eq!(comp.backend().pixel(110, 110), 0x0080_8080);
        }
        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &black, 4, 4));
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
        assert_eq!(comp.backend().pixel(110, 110), 0x0080_8080);
    }

    #[test]
    fn test_moved_overlay_leaves_no_trail() {
        let (mut producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(8, SmallWindow::default());
        let black = xrgb(0, 4, 4);
        let white = xrgb(0x00FF_FFFF, 2, 2);

        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &black, 4, 4));
        send(&mut comp, &mut producer, &mut consumer, &pen(&white, Rect::new(100, 100, 20, 20), 10));
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
        send(&mut comp, &mut producer, &mut consumer, &pen(&white, Rect::new(300, 300, 20, 20), 10));
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);

        assert_eq!(comp.backend().pixel(110, 110), 0);
        assert_eq!(comp.backend().pixel(310, 310), 0x00FF_FFFF);
    }

    #[test]
    fn test_overlay_across_screen_edge_is_recomposed() {
        let (mut producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(2, SmallWindow::default());
        let red = xrgb(0x00FF_0000, 4, 3);
        let white = xrgb(0x00FF_FFFF, 2, 2);

        send(&mut comp, &mut producer, &mut consumer, &pen(&white, Rect::new(310, 110, 20, 20), 10));
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
        assert_eq!(comp.stats().recompositions, 1);

        for _ in 0..2 {
            send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &red, 4, 3));
            send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
            let backend = comp.backend();
            // inside the left screen and above it
            assert_eq!(backend.pixel(315, 125), 0x00FF_FFFF);
            assert_eq!(backend.pixel(315, 115), 0x00FF_FFFF);
            assert_eq!(backend.pixel(100, 200), 0x00FF_0000);
        }
        assert_eq!(comp.stats().recompositions, 3);
    }

    #[test]
    fn test_flip_rate_windows() {
        let start = Instant::now();
        let mut rate = FlipRate {
            interval: Duration::from_secs(1),
            window_start: start,
            flips_at_start: 0,
            last: 0.0,
        };
        assert_eq!(rate.observe(30, start + Duration::from_millis(500)), None);
        assert_eq!(rate.observe(60, start + Duration::from_secs(1)), Some(60.0));
        assert_eq!(rate.observe(90, start + Duration::from_secs(3)), Some(15.0));
        assert_eq!(rate.last, 15.0);
    }

    fn assert_quad(comp: &Compositor<SoftwareBackend>, slot: usize, corners: [f32; 4], texcoords: [[f32; 2]; 4]) {
        let rect = comp.mode().screen_rect(slot).unwrap();
        let quad = comp.screen_quad(rect);
        let [left, top, right, bottom] = corners;
        let expected = [[left, top], [right, top], [right, bottom], [left, bottom]];
        for (got, want) in quad.positions.iter().zip(expected) {
            assert!((got[0] - want[0]).abs() < 1e-5 && (got[1] - want[1]).abs() < 1e-5, "{:?} vs {:?}", got, want);
        }
        assert_eq!(quad.texcoords, texcoords);
    }

    #[test]
    fn test_screen_quads_per_layout_family() {
        let upright = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        let third = 2.0 / 3.0;

        let stacked = compositor(4, SmallWindow::default());
        assert_quad(&stacked, 0, [-0.5, 1.0, 0.5, 0.0], upright);
        assert_quad(&stacked, 1, [-0.5, 0.0, 0.5, -1.0], upright);

        let cw = compositor(12, SmallWindow::default());
        let cw_tex = [[0.0, 1.0], [0.0, 0.0], [1.0, 0.0], [1.0, 1.0]];
        assert_quad(&cw, 0, [-0.75, third, 0.0, -third], cw_tex);
        assert_quad(&cw, 1, [0.0, third, 0.75, -third], cw_tex);

        let ccw = compositor(14, SmallWindow::default());
        let ccw_tex = [[1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]];
        assert_quad(&ccw, 0, [0.0, third, 0.75, -third], ccw_tex);
        assert_quad(&ccw, 1, [-0.75, third, 0.0, -third], ccw_tex);

        let mirrored = compositor(16, SmallWindow::default());
        assert_quad(&mirrored, 0, [0.0, 0.5, 1.0, -0.5], upright);
        assert_quad(&mirrored, 1, [-1.0, 0.5, 0.0, -0.5], upright);
    }

    #[test]
    fn test_malformed_flush_is_consumed_and_dropped() {
        let (mut producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(2, SmallWindow::default());
        let pixels = xrgb(0x00FF_0000, 4, 3);
        let bad = Command::Flush(Flush {
            surface: SurfaceId::LeftLcd,
            pixels: &pixels,
            src: Rect::new(0, 0, 4, 3),
            dst: Rect::new(0, 0, 0, 480),
            pitch: 16,
            filter: FilterMode::Nearest,
            alpha: 10,
        });

        assert_eq!(send(&mut comp, &mut producer, &mut consumer, &bad), Step::Dropped);
        assert!(!producer.is_busy());
        assert_eq!(comp.stats().dropped, 1);

        let odd_pitch = Command::Flush(Flush {
            surface: SurfaceId::LeftLcd,
            pixels: &pixels,
            src: Rect::new(0, 0, 4, 3),
            dst: Rect::new(0, 0, 640, 480),
            pitch: 12,
            filter: FilterMode::Nearest,
            alpha: 10,
        });
        assert_eq!(send(&mut comp, &mut producer, &mut consumer, &odd_pitch), Step::Dropped);
        assert_eq!(comp.state(), ConsumerState::Idle);
    }

    #[test]
    fn test_rgb565_payload() {
        let (mut producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(8, SmallWindow::default());
        let pixels = 0xF800u16.to_le_bytes().repeat(4 * 3);
        let cmd = Command::Flush(Flush {
            surface: SurfaceId::LeftLcd,
            pixels: &pixels,
            src: Rect::new(0, 0, 4, 3),
            dst: Rect::new(0, 0, 640, 480),
            pitch: 8,
            filter: FilterMode::Nearest,
            alpha: 10,
        });
        send(&mut comp, &mut producer, &mut consumer, &cmd);
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
        assert_eq!(comp.backend().pixel(320, 240), 0x00FF_0000);
    }

    #[test]
    fn test_producer_background_is_drawn_at_flip() {
        let (mut producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(2, SmallWindow::default());
        let green = xrgb(0x0000_FF00, 4, 4);
        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::Background, &green, 4, 4));
        assert_eq!(comp.backend().pixel(10, 10), 0);

        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
        assert_eq!(comp.backend().pixel(10, 10), 0x0000_FF00);
        assert_eq!(comp.stats().recompositions, 1);
    }

    #[test]
    fn test_layout_switch_recomposes() {
        let (mut producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(2, SmallWindow::default());
        let red = xrgb(0x00FF_0000, 4, 3);
        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &red, 4, 3));
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
        assert_eq!(comp.backend().pixel(10, 10), 0);

        assert!(comp.set_layout(8, None));
        assert!(!comp.set_layout(200, None));
        send(&mut comp, &mut producer, &mut consumer, &Command::Flip);
        assert_eq!(comp.backend().pixel(10, 10), 0x00FF_0000);
        assert_eq!(comp.mode().id, 8);

        assert!(comp.next_layout());
        assert_eq!(comp.mode().id, 9);
    }

    #[test]
    fn test_quit_releases_and_stops() {
        let (mut producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(2, SmallWindow::default());
        let red = xrgb(0x00FF_0000, 4, 3);
        send(&mut comp, &mut producer, &mut consumer, &flush(SurfaceId::LeftLcd, &red, 4, 3));
        assert!(comp.backend().has_texture(SurfaceId::LeftLcd));

        assert_eq!(send(&mut comp, &mut producer, &mut consumer, &Command::Quit), Step::Quit);
        assert_eq!(comp.state(), ConsumerState::ShuttingDown);
        assert!(!comp.backend().has_texture(SurfaceId::LeftLcd));
        assert!(consumer.is_closed());
        assert_eq!(comp.step(&mut consumer), Step::Quit);
    }

    #[test]
    fn test_run_exits_on_stop_flag() {
        let (_producer, mut consumer) = Transport::loopback();
        let mut comp = compositor(2, SmallWindow::default());
        let stop = AtomicBool::new(true);
        comp.run(&mut consumer, &stop, Duration::ZERO);
        assert_eq!(comp.state(), ConsumerState::ShuttingDown);
    }
}
