//! Small-window alpha blend.
//!
//! `out = round(bg * a + ov * (1 - a))` with `a` in integer tenths, rounding
//! half up. The CPU path works on integers; the GPU path does the same sums
//! in the fragment shader on texels rescaled to 0..=255, and
//! [`shader_blend_channel`] mirrors that arithmetic so both can be compared.

use crate::layout::SmallWindow;
use crate::pixels::{Image, channels, pack};
use crate::transform::UvRect;
use dualview_ipc::Rect;

pub const BORDER_COLOR: u32 = 0x0000_0000;

/// One 8-bit channel; `alpha` is the background weight in tenths (0..=10).
pub fn blend_channel(bg: u8, ov: u8, alpha: u8) -> u8 {
    let a = alpha.min(10) as u32;
    ((bg as u32 * a + ov as u32 * (10 - a) + 5) / 10) as u8
}

pub fn blend_pixel(bg: u32, ov: u32, alpha: u8) -> u32 {
    let bg = channels(bg);
    let ov = channels(ov);
    pack([
        blend_channel(bg[0], ov[0], alpha),
        blend_channel(bg[1], ov[1], alpha),
        blend_channel(bg[2], ov[2], alpha),
    ])
}

/// What `BLEND_FRAGMENT_SHADER` computes for one channel, in f32.
pub fn shader_blend_channel(bg: u8, ov: u8, alpha: u8) -> u8 {
    let a = alpha.min(10) as f32;
    let b = (bg as f32 / 255.0 * 255.0 + 0.5).floor();
    let o = (ov as f32 / 255.0 * 255.0 + 0.5).floor();
    ((b * a + o * (10.0 - a) + 5.0) / 10.0).floor() as u8
}

/// Region of the base screen's texture lying under `window`, given that the
/// base screen is drawn at `base_dst`.
pub fn occluded_uv(window: Rect, base_dst: Rect) -> UvRect {
    let bw = base_dst.w.max(1) as f32;
    let bh = base_dst.h.max(1) as f32;
    UvRect {
        x: (window.x as f32 - base_dst.x as f32) / bw,
        y: (window.y as f32 - base_dst.y as f32) / bh,
        w: window.w as f32 / bw,
        h: window.h as f32 / bh,
    }
}

/// CPU small window: blend `overlay` over the part of `base` it covers and
/// burn in the border. A missing base blends against black.
pub fn blend_small_window(
    overlay: &Image,
    base: Option<&Image>,
    base_dst: Rect,
    window: Rect,
    small_window: &SmallWindow,
) -> Image {
    let uv = occluded_uv(window, base_dst);
    let mut out = overlay.clone();
    let (ow, oh) = (overlay.width, overlay.height);

    for y in 0..oh {
        let v = uv.y + (y as f32 + 0.5) / oh as f32 * uv.h;
        for x in 0..ow {
            let on_border = small_window.border && (x == 0 || y == 0 || x + 1 == ow || y + 1 == oh);
            if on_border {
                out.set(x, y, BORDER_COLOR);
                continue;
            }
            let bg = match base {
                Some(base) if !base.is_empty() => {
                    let u = uv.x + (x as f32 + 0.5) / ow as f32 * uv.w;
                    base.get(texel(u, base.width), texel(v, base.height))
                }
                _ => 0,
            };
            out.set(x, y, blend_pixel(bg, overlay.get(x, y), small_window.alpha));
        }
    }
    out
}

/// Nearest texel for normalized coordinate `t`, clamped to the edge.
fn texel(t: f32, size: u32) -> u32 {
    ((t * size as f32).floor().max(0.0) as u32).min(size - 1)
}

/// The four one-pixel edges of `rect`.
pub fn border_rects(rect: Rect) -> [Rect; 4] {
    let (x, y, w, h) = (rect.x, rect.y, rect.w, rect.h);
    [
        Rect::new(x, y, w, 1),
        Rect::new(x, y + h.saturating_sub(1), w, 1),
        Rect::new(x, y, 1, h),
        Rect::new(x + w.saturating_sub(1), y, 1, h),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Corner;

    const BG: u32 = 0x00C8_6432; // (200, 100, 50)
    const OV: u32 = 0x000A_141E; // (10, 20, 30)

    #[test]
    fn test_blend_exactness() {
        assert_eq!(channels(blend_pixel(BG, OV, 3)), [67, 44, 36]);
        let [r, g, b] = [(200, 10), (100, 20), (50, 30)].map(|(bg, ov)| shader_blend_channel(bg, ov, 3));
        assert_eq!([r, g, b], [67, 44, 36]);
    }

    #[test]
    fn test_shader_mirror_matches_cpu_everywhere() {
        for alpha in 0..=10u8 {
            for bg in 0..=255u8 {
                for ov in 0..=255u8 {
                    assert_eq!(
                        shader_blend_channel(bg, ov, alpha),
                        blend_channel(bg, ov, alpha),
                        "bg={} ov={} alpha={}",
                        bg,
                        ov,
                        alpha
                    );
                }
            }
        }
    }

    #[test]
    fn test_alpha_extremes() {
        assert_eq!(blend_pixel(BG, OV, 0), OV);
        assert_eq!(blend_pixel(BG, OV, 10), BG);
        // halves round up
        assert_eq!(blend_channel(0, 1, 5), 1);
    }

    #[test]
    fn test_occluded_uv_for_corner_window() {
        let uv = occluded_uv(Rect::new(384, 288, 256, 192), Rect::new(0, 0, 640, 480));
        assert!((uv.x - 0.6).abs() < 1e-6);
        assert!((uv.y - 0.6).abs() < 1e-6);
        assert!((uv.w - 0.4).abs() < 1e-6);
        assert!((uv.h - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_small_window_blends_uniform_inputs() {
        let overlay = Image::filled(16, 12, OV);
        let base = Image::filled(64, 48, BG);
        let sw = SmallWindow::new(Corner::BottomRight, 3, false);
        let out = blend_small_window(&overlay, Some(&base), Rect::new(0, 0, 640, 480), Rect::new(384, 288, 256, 192), &sw);
        assert!(out.pixels.iter().all(|&p| channels(p) == [67, 44, 36]));
    }

    #[test]
    fn test_small_window_samples_the_covered_region() {
        let mut base = Image::filled(2, 1, 0x00FF_0000);
        base.set(1, 0, BG);
        let overlay = Image::filled(4, 4, OV);
        let sw = SmallWindow::new(Corner::TopRight, 3, false);
        let out = blend_small_window(&overlay, Some(&base), Rect::new(0, 0, 640, 480), Rect::new(320, 0, 320, 480), &sw);
        assert!(out.pixels.iter().all(|&p| p == blend_pixel(BG, OV, 3)));
    }

    #[test]
    fn test_border_is_burned_in() {
        let overlay = Image::filled(4, 3, OV);
        let sw = SmallWindow::new(Corner::TopLeft, 0, true);
        let out = blend_small_window(&overlay, None, Rect::new(0, 0, 640, 480), Rect::new(0, 0, 4, 3), &sw);
        for y in 0..3 {
            for x in 0..4 {
                let edge = x == 0 || y == 0 || x == 3 || y == 2;
                assert_eq!(out.get(x, y), if edge { BORDER_COLOR } else { OV });
            }
        }
    }

    #[test]
    fn test_border_rects_hug_the_edges() {
        let [top, bottom, left, right] = border_rects(Rect::new(10, 20, 30, 40));
        assert_eq!(top, Rect::new(10, 20, 30, 1));
        assert_eq!(bottom, Rect::new(10, 59, 30, 1));
        assert_eq!(left, Rect::new(10, 20, 1, 40));
        assert_eq!(right, Rect::new(39, 20, 1, 40));
    }
}
