//! Display backends: where textures live and how quads reach the screen.

pub mod opengl;
pub mod software;

pub use opengl::{GlBackend, GlSurface};
pub use software::{Headless, PresentTarget, SoftwareBackend};

use crate::pixels::Image;
use crate::transform::{Quad, UvRect};
use dualview_ipc::{FilterMode, SurfaceId};

bitflags::bitflags! {
    /// What a backend can do beyond drawing textured quads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// `draw_blended` blends two textures in a shader.
        const SHADER_BLEND = 1 << 0;
        /// The frame drawn before `present` is still there afterwards.
        const PRESERVES_BACK_BUFFER = 1 << 1;
        /// The background lives on its own hardware layer and is shown as
        /// soon as it is uploaded.
        const BUFFER_LAYER = 1 << 2;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to allocate a texture for {0:?}")]
    TextureAllocation(SurfaceId),

    #[error("no texture uploaded for {0:?}")]
    MissingTexture(SurfaceId),

    #[error("the {0} backend cannot blend in hardware")]
    Unsupported(&'static str),

    #[error("present failed: {0}")]
    Present(String),
}

pub trait DisplayBackend {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Replace the texture of `surface`. Reuses storage when the size matches.
    fn upload_texture(&mut self, surface: SurfaceId, image: &Image, filter: FilterMode) -> Result<(), BackendError>;

    /// Draw the texture of `surface` at `opacity` (0.0..=1.0) over what is there.
    fn draw_quad(&mut self, surface: SurfaceId, quad: &Quad, opacity: f32) -> Result<(), BackendError>;

    /// Draw `overlay` blended with the `base_uv` region of `base`, weighting
    /// the base by `alpha` tenths.
    fn draw_blended(
        &mut self,
        _overlay: SurfaceId,
        _base: SurfaceId,
        _quad: &Quad,
        _base_uv: UvRect,
        _alpha: u8,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(self.name()))
    }

    /// Solid fill, used for the small-window border.
    fn fill_quad(&mut self, quad: &Quad, color: u32) -> Result<(), BackendError>;

    fn clear(&mut self, color: u32);

    fn present(&mut self) -> Result<(), BackendError>;

    /// Drop every texture and program. The backend is unusable afterwards.
    fn release(&mut self);
}

impl<B: DisplayBackend + ?Sized> DisplayBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn upload_texture(&mut self, surface: SurfaceId, image: &Image, filter: FilterMode) -> Result<(), BackendError> {
        (**self).upload_texture(surface, image, filter)
    }

    fn draw_quad(&mut self, surface: SurfaceId, quad: &Quad, opacity: f32) -> Result<(), BackendError> {
        (**self).draw_quad(surface, quad, opacity)
    }

    fn draw_blended(
        &mut self,
        overlay: SurfaceId,
        base: SurfaceId,
        quad: &Quad,
        base_uv: UvRect,
        alpha: u8,
    ) -> Result<(), BackendError> {
        (**self).draw_blended(overlay, base, quad, base_uv, alpha)
    }

    fn fill_quad(&mut self, quad: &Quad, color: u32) -> Result<(), BackendError> {
        (**self).fill_quad(quad, color)
    }

    fn clear(&mut self, color: u32) {
        (**self).clear(color)
    }

    fn present(&mut self) -> Result<(), BackendError> {
        (**self).present()
    }

    fn release(&mut self) {
        (**self).release()
    }
}
