//! Logical output rects to normalized device coordinates.
//!
//! Vertices are always emitted in the order top-left, top-right,
//! bottom-right, bottom-left of the *logical* rect, so a triangle fan over
//! them covers the quad whatever the orientation.

use crate::layout::{Rotation, Size};
use dualview_ipc::Rect;

/// Texture coordinates of an unrotated quad, same vertex order.
const BASE_TEXCOORDS: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

/// A rect ready for drawing: NDC positions and texture coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad {
    pub positions: [[f32; 2]; 4],
    pub texcoords: [[f32; 2]; 4],
}

impl Quad {
    /// Interleaved `x, y, u, v` per vertex, as uploaded to a vertex buffer.
    pub fn vertices(&self) -> [f32; 16] {
        let mut out = [0.0; 16];
        for i in 0..4 {
            out[i * 4] = self.positions[i][0];
            out[i * 4 + 1] = self.positions[i][1];
            out[i * 4 + 2] = self.texcoords[i][0];
            out[i * 4 + 3] = self.texcoords[i][1];
        }
        out
    }
}

/// Normalized sub-rectangle of a texture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl UvRect {
    pub const FULL: UvRect = UvRect {
        x: 0.0,
        y: 0.0,
        w: 1.0,
        h: 1.0,
    };
}

/// Everything besides the rect that decides where a quad lands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadParams {
    pub output: Size,
    /// Physical display orientation.
    pub orientation: Rotation,
    /// Rotation of the content within its rect.
    pub content_rotation: Rotation,
    /// Reflect the rect's x position across the output.
    pub mirror: bool,
}

impl QuadParams {
    pub fn new(output: Size, orientation: Rotation) -> Self {
        Self {
            output,
            orientation,
            content_rotation: Rotation::R0,
            mirror: false,
        }
    }
}

pub fn quad_for(rect: Rect, params: &QuadParams) -> Quad {
    let ow = params.output.width.max(1) as f32;
    let oh = params.output.height.max(1) as f32;

    let x = if params.mirror {
        params.output.width as f32 - (rect.x + rect.w) as f32
    } else {
        rect.x as f32
    };
    let y = rect.y as f32;
    let (w, h) = (rect.w as f32, rect.h as f32);

    let left = x / ow * 2.0 - 1.0;
    let right = (x + w) / ow * 2.0 - 1.0;
    let top = 1.0 - y / oh * 2.0;
    let bottom = 1.0 - (y + h) / oh * 2.0;

    let positions = [[left, top], [right, top], [right, bottom], [left, bottom]]
        .map(|p| orient(p, params.orientation));

    let k = params.content_rotation.quarter_turns();
    let texcoords = std::array::from_fn(|i| BASE_TEXCOORDS[(i + 4 - k) % 4]);

    Quad {
        positions,
        texcoords,
    }
}

/// Rotate an NDC point clockwise about the origin.
fn orient([x, y]: [f32; 2], orientation: Rotation) -> [f32; 2] {
    match orientation {
        Rotation::R0 => [x, y],
        Rotation::R90 => [y, -x],
        Rotation::R180 => [-x, -y],
        Rotation::R270 => [-y, x],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUT: Size = Size::new(640, 480);

    fn assert_close(a: [[f32; 2]; 4], b: [[f32; 2]; 4]) {
        for (p, q) in a.iter().zip(b.iter()) {
            assert!((p[0] - q[0]).abs() < 1e-6 && (p[1] - q[1]).abs() < 1e-6, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn test_full_output_covers_ndc() {
        let quad = quad_for(OUT.rect(), &QuadParams::new(OUT, Rotation::R0));
        assert_close(quad.positions, [[-1.0, 1.0], [1.0, 1.0], [1.0, -1.0], [-1.0, -1.0]]);
        assert_eq!(quad.texcoords, BASE_TEXCOORDS);
    }

    #[test]
    fn test_positions_scale_with_output() {
        let params = QuadParams::new(OUT, Rotation::R0);
        let quad = quad_for(Rect::new(320, 120, 320, 240), &params);
        assert_close(quad.positions, [[0.0, 0.5], [1.0, 0.5], [1.0, -0.5], [0.0, -0.5]]);
    }

    #[test]
    fn test_upside_down_orientation_negates_positions() {
        let rect = Rect::new(0, 0, 320, 240);
        let upright = quad_for(rect, &QuadParams::new(OUT, Rotation::R0));
        let flipped = quad_for(rect, &QuadParams::new(OUT, Rotation::R180));
        assert_close(flipped.positions, upright.positions.map(|[x, y]| [-x, -y]));
        assert_eq!(flipped.texcoords, upright.texcoords);
    }

    #[test]
    fn test_quarter_turn_orientation() {
        let quad = quad_for(OUT.rect(), &QuadParams::new(OUT, Rotation::R90));
        assert_close(quad.positions, [[1.0, 1.0], [1.0, -1.0], [-1.0, -1.0], [-1.0, 1.0]]);
    }

    #[test]
    fn test_mirror_reflects_x_only() {
        let mut params = QuadParams::new(OUT, Rotation::R0);
        params.mirror = true;
        let quad = quad_for(Rect::new(0, 120, 320, 240), &params);
        assert_close(quad.positions, [[0.0, 0.5], [1.0, 0.5], [1.0, -0.5], [0.0, -0.5]]);
    }

    #[test]
    fn test_content_rotation_shifts_texcoords() {
        let mut params = QuadParams::new(OUT, Rotation::R0);
        params.content_rotation = Rotation::R90;
        let quad = quad_for(Rect::new(80, 80, 240, 320), &params);
        assert_eq!(quad.texcoords, [[0.0, 1.0], [0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]);
    }

    #[test]
    fn test_vertices_interleave() {
        let quad = quad_for(OUT.rect(), &QuadParams::new(OUT, Rotation::R0));
        let v = quad.vertices();
        assert_eq!(&v[..4], &[-1.0, 1.0, 0.0, 0.0]);
        assert_eq!(&v[12..], &[-1.0, -1.0, 0.0, 1.0]);
    }
}
