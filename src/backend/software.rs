//! CPU rasterizer. Keeps an XRGB back buffer the size of the output and
//! hands it to a [`PresentTarget`] on every present.

use super::{BackendError, Capabilities, DisplayBackend};
use crate::pixels::{Image, channels, pack};
use crate::transform::Quad;
use dualview_ipc::{FilterMode, SurfaceId};
use std::collections::HashMap;
use tracing::{debug, info};

/// Where finished frames go.
pub trait PresentTarget {
    fn name(&self) -> &'static str;

    fn present(&mut self, frame: &[u32], width: u32, height: u32) -> Result<(), BackendError>;

    fn release(&mut self) {}
}

/// Discards frames, counting them.
#[derive(Debug, Default)]
pub struct Headless {
    pub frames: u64,
}

impl PresentTarget for Headless {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn present(&mut self, _frame: &[u32], _width: u32, _height: u32) -> Result<(), BackendError> {
        self.frames += 1;
        Ok(())
    }
}

struct Texture {
    image: Image,
    filter: FilterMode,
}

/// Pixel-space bounding box of a quad, end-exclusive.
#[derive(Debug, Clone, Copy)]
struct Span {
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
}

pub struct SoftwareBackend {
    width: u32,
    height: u32,
    frame: Vec<u32>,
    textures: HashMap<SurfaceId, Texture>,
    target: Box<dyn PresentTarget>,
}

impl SoftwareBackend {
    pub fn new(width: u32, height: u32, target: Box<dyn PresentTarget>) -> Self {
        info!("Software backend {}x{} presenting to {}", width, height, target.name());
        Self {
            width,
            height,
            frame: vec![0; width as usize * height as usize],
            textures: HashMap::new(),
            target,
        }
    }

    pub fn headless(width: u32, height: u32) -> Self {
        Self::new(width, height, Box::new(Headless::default()))
    }

    /// The back buffer, row-major XRGB.
    pub fn frame(&self) -> &[u32] {
        &self.frame
    }

    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        self.frame[y as usize * self.width as usize + x as usize]
    }

    pub fn has_texture(&self, surface: SurfaceId) -> bool {
        self.textures.contains_key(&surface)
    }

    fn span(&self, quad: &Quad) -> Option<Span> {
        let (w, h) = (self.width as f32, self.height as f32);
        let points = quad.positions.map(|[x, y]| ((x + 1.0) * 0.5 * w, (1.0 - y) * 0.5 * h));
        let xs = points.map(|p| p.0);
        let ys = points.map(|p| p.1);
        let span = Span {
            x0: xs.iter().copied().fold(f32::INFINITY, f32::min),
            y0: ys.iter().copied().fold(f32::INFINITY, f32::min),
            x1: xs.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            y1: ys.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        };
        (span.x1 - span.x0 >= 0.5 && span.y1 - span.y0 >= 0.5).then_some(span)
    }

    /// Integer pixel range covered by `span`, clipped to the frame.
    fn pixels_of(&self, span: Span) -> (std::ops::Range<u32>, std::ops::Range<u32>) {
        let clip = |v: f32, max: u32| (v.round().max(0.0) as u32).min(max);
        (
            clip(span.x0, self.width)..clip(span.x1, self.width),
            clip(span.y0, self.height)..clip(span.y1, self.height),
        )
    }

    /// Texture coordinates at the four screen-space corners of `span`, as
    /// `[[top-left, top-right], [bottom-left, bottom-right]]`.
    fn corner_texcoords(&self, quad: &Quad, span: Span) -> [[[f32; 2]; 2]; 2] {
        let (w, h) = (self.width as f32, self.height as f32);
        let cx = (span.x0 + span.x1) * 0.5;
        let cy = (span.y0 + span.y1) * 0.5;
        let mut corners = [[[0.0; 2]; 2]; 2];
        for (pos, tc) in quad.positions.iter().zip(quad.texcoords.iter()) {
            let px = (pos[0] + 1.0) * 0.5 * w;
            let py = (1.0 - pos[1]) * 0.5 * h;
            corners[(py > cy) as usize][(px > cx) as usize] = *tc;
        }
        corners
    }
}

fn lerp(a: [f32; 2], b: [f32; 2], t: f32) -> [f32; 2] {
    [a[0] + (b[0] - a[0]) * t, a[1] + (b[1] - a[1]) * t]
}

fn sample(texture: &Texture, [u, v]: [f32; 2]) -> u32 {
    let image = &texture.image;
    let (tw, th) = (image.width as f32, image.height as f32);
    match texture.filter {
        FilterMode::Nearest => {
            let x = ((u * tw).floor().max(0.0) as u32).min(image.width - 1);
            let y = ((v * th).floor().max(0.0) as u32).min(image.height - 1);
            image.get(x, y)
        }
        FilterMode::Linear => {
            let fx = (u * tw - 0.5).max(0.0);
            let fy = (v * th - 0.5).max(0.0);
            let x0 = (fx.floor() as u32).min(image.width - 1);
            let y0 = (fy.floor() as u32).min(image.height - 1);
            let x1 = (x0 + 1).min(image.width - 1);
            let y1 = (y0 + 1).min(image.height - 1);
            let (tx, ty) = (fx - x0 as f32, fy - y0 as f32);

            let texels = [image.get(x0, y0), image.get(x1, y0), image.get(x0, y1), image.get(x1, y1)].map(channels);
            let mut out = [0u8; 3];
            for c in 0..3 {
                let top = texels[0][c] as f32 * (1.0 - tx) + texels[1][c] as f32 * tx;
                let bottom = texels[2][c] as f32 * (1.0 - tx) + texels[3][c] as f32 * tx;
                out[c] = (top * (1.0 - ty) + bottom * ty).round() as u8;
            }
            pack(out)
        }
    }
}

/// `src` over `dst` with `weight` in 0..=255.
fn mix(dst: u32, src: u32, weight: u32) -> u32 {
    if weight >= 255 {
        return src;
    }
    let d = channels(dst);
    let s = channels(src);
    let mut out = [0u8; 3];
    for c in 0..3 {
        out[c] = ((s[c] as u32 * weight + d[c] as u32 * (255 - weight) + 127) / 255) as u8;
    }
    pack(out)
}

impl DisplayBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PRESERVES_BACK_BUFFER
    }

    fn upload_texture(&mut self, surface: SurfaceId, image: &Image, filter: FilterMode) -> Result<(), BackendError> {
        if image.is_empty() {
            return Err(BackendError::TextureAllocation(surface));
        }
        if let Some(texture) = self
            .textures
            .get_mut(&surface)
            .filter(|t| t.image.width == image.width && t.image.height == image.height)
        {
            texture.image.pixels.copy_from_slice(&image.pixels);
            texture.filter = filter;
            return Ok(());
        }

        debug!("Allocating {}x{} texture for {:?}", image.width, image.height, surface);
        self.textures.insert(
            surface,
            Texture {
                image: image.clone(),
                filter,
            },
        );
        Ok(())
    }

    fn draw_quad(&mut self, surface: SurfaceId, quad: &Quad, opacity: f32) -> Result<(), BackendError> {
        if !self.textures.contains_key(&surface) {
            return Err(BackendError::MissingTexture(surface));
        }
        let Some(span) = self.span(quad) else {
            return Ok(());
        };
        let (xs, ys) = self.pixels_of(span);
        let tc = self.corner_texcoords(quad, span);
        let weight = (opacity.clamp(0.0, 1.0) * 255.0).round() as u32;
        let Some(texture) = self.textures.get(&surface) else {
            return Err(BackendError::MissingTexture(surface));
        };

        let stride = self.width as usize;
        for y in ys {
            let t = ((y as f32 + 0.5 - span.y0) / (span.y1 - span.y0)).clamp(0.0, 1.0);
            let left = lerp(tc[0][0], tc[1][0], t);
            let right = lerp(tc[0][1], tc[1][1], t);
            for x in xs.clone() {
                let s = ((x as f32 + 0.5 - span.x0) / (span.x1 - span.x0)).clamp(0.0, 1.0);
                let texel = sample(texture, lerp(left, right, s));
                let dst = &mut self.frame[y as usize * stride + x as usize];
                *dst = mix(*dst, texel, weight);
            }
        }
        Ok(())
    }

    fn fill_quad(&mut self, quad: &Quad, color: u32) -> Result<(), BackendError> {
        let Some(span) = self.span(quad) else {
            return Ok(());
        };
        let (xs, ys) = self.pixels_of(span);
        let stride = self.width as usize;
        for y in ys {
            let row = y as usize * stride;
            self.frame[row + xs.start as usize..row + xs.end as usize].fill(color);
        }
        Ok(())
    }

    fn clear(&mut self, color: u32) {
        self.frame.fill(color & 0x00FF_FFFF);
    }

    fn present(&mut self) -> Result<(), BackendError> {
        self.target.present(&self.frame, self.width, self.height)
    }

    fn release(&mut self) {
        self.textures.clear();
        self.target.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Rotation, Size};
    use crate::transform::{QuadParams, quad_for};
    use dualview_ipc::Rect;

    const OUT: Size = Size::new(8, 4);

    fn quad(rect: Rect) -> Quad {
        quad_for(rect, &QuadParams::new(OUT, Rotation::R0))
    }

    fn checker() -> Image {
        let mut image = Image::filled(2, 2, 0x0000_00FF);
        image.set(1, 0, 0x00FF_0000);
        image.set(0, 1, 0x0000_FF00);
        image
    }

    #[test]
    fn test_nearest_quad_lands_on_its_rect() {
        let mut backend = SoftwareBackend::headless(OUT.width, OUT.height);
        backend.upload_texture(SurfaceId::LeftLcd, &checker(), FilterMode::Nearest).unwrap();
        backend.draw_quad(SurfaceId::LeftLcd, &quad(Rect::new(4, 0, 4, 4)), 1.0).unwrap();

        assert_eq!(backend.pixel(0, 0), 0);
        assert_eq!(backend.pixel(4, 0), 0x0000_00FF);
        assert_eq!(backend.pixel(7, 0), 0x00FF_0000);
        assert_eq!(backend.pixel(4, 3), 0x0000_FF00);
        assert_eq!(backend.pixel(7, 3), 0x0000_00FF);
    }

    #[test]
    fn test_content_rotation_turns_the_image() {
        let mut backend = SoftwareBackend::headless(OUT.width, OUT.height);
        backend.upload_texture(SurfaceId::LeftLcd, &checker(), FilterMode::Nearest).unwrap();
        let mut params = QuadParams::new(OUT, Rotation::R0);
        params.content_rotation = Rotation::R90;
        backend.draw_quad(SurfaceId::LeftLcd, &quad_for(Rect::new(0, 0, 4, 4), &params), 1.0).unwrap();

        // bottom-left texel (green) ends up top-left after a clockwise turn
        assert_eq!(backend.pixel(0, 0), 0x0000_FF00);
        assert_eq!(backend.pixel(3, 0), 0x0000_00FF);
        assert_eq!(backend.pixel(3, 3), 0x00FF_0000);
    }

    #[test]
    fn test_opacity_mixes_with_back_buffer() {
        let mut backend = SoftwareBackend::headless(OUT.width, OUT.height);
        backend.clear(0x0000_0000);
        backend.upload_texture(SurfaceId::PenOverlay, &Image::filled(1, 1, 0x00FF_FFFF), FilterMode::Nearest).unwrap();
        backend.draw_quad(SurfaceId::PenOverlay, &quad(OUT.rect()), 0.5).unwrap();
        assert_eq!(backend.pixel(3, 2), 0x0080_8080);
    }

    #[test]
    fn test_fill_and_missing_texture() {
        let mut backend = SoftwareBackend::headless(OUT.width, OUT.height);
        backend.fill_quad(&quad(Rect::new(0, 0, 8, 1)), 0x0012_3456).unwrap();
        assert!(backend.frame()[..8].iter().all(|&p| p == 0x0012_3456));
        assert_eq!(backend.pixel(0, 1), 0);
        assert!(matches!(
            backend.draw_quad(SurfaceId::RightLcd, &quad(OUT.rect()), 1.0),
            Err(BackendError::MissingTexture(SurfaceId::RightLcd))
        ));
    }

    #[test]
    fn test_bilinear_of_uniform_texture_is_uniform() {
        let mut backend = SoftwareBackend::headless(OUT.width, OUT.height);
        backend.upload_texture(SurfaceId::Background, &Image::filled(3, 3, 0x0040_5060), FilterMode::Linear).unwrap();
        backend.draw_quad(SurfaceId::Background, &quad(OUT.rect()), 1.0).unwrap();
        assert!(backend.frame().iter().all(|&p| p == 0x0040_5060));
    }

    #[test]
    fn test_no_shader_blend() {
        let mut backend = SoftwareBackend::headless(OUT.width, OUT.height);
        assert!(!backend.capabilities().contains(Capabilities::SHADER_BLEND));
        let result = backend.draw_blended(
            SurfaceId::RightLcd,
            SurfaceId::LeftLcd,
            &quad(OUT.rect()),
            crate::transform::UvRect::FULL,
            3,
        );
        assert!(matches!(result, Err(BackendError::Unsupported("software"))));
    }
}
