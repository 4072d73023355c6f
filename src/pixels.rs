//! CPU-side images. Everything the compositor keeps is XRGB8888 (`0x00RRGGBB`);
//! RGB565 payloads are widened once on arrival.

/// A tightly packed XRGB8888 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

impl Image {
    pub fn filled(width: u32, height: u32, color: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![color; width as usize * height as usize],
        }
    }

    /// Decode a tightly packed payload of `bpp` bytes per pixel (2 = RGB565,
    /// 4 = XRGB8888, both little endian). `None` if the payload is short or
    /// the format unknown.
    pub fn from_payload(bytes: &[u8], width: u32, height: u32, bpp: u32) -> Option<Self> {
        let count = width as usize * height as usize;
        let needed = count * bpp as usize;
        if bytes.len() < needed {
            return None;
        }
        let bytes = &bytes[..needed];

        let pixels = match bpp {
            2 => bytes
                .chunks_exact(2)
                .map(|c| rgb565_to_xrgb(u16::from_le_bytes([c[0], c[1]])))
                .collect(),
            4 => bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) & 0x00FF_FFFF)
                .collect(),
            _ => return None,
        };

        Some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn get(&self, x: u32, y: u32) -> u32 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, color: u32) {
        self.pixels[y as usize * self.width as usize + x as usize] = color;
    }

    /// Raw bytes in memory order (B, G, R, X on little-endian hosts).
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

pub fn rgb565_to_xrgb(p: u16) -> u32 {
    let r = ((p >> 11) & 0x1F) as u32;
    let g = ((p >> 5) & 0x3F) as u32;
    let b = (p & 0x1F) as u32;
    pack([
        ((r << 3) | (r >> 2)) as u8,
        ((g << 2) | (g >> 4)) as u8,
        ((b << 3) | (b >> 2)) as u8,
    ])
}

pub fn xrgb_to_rgb565(p: u32) -> u16 {
    let [r, g, b] = channels(p);
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

/// `[r, g, b]` of an XRGB pixel.
pub fn channels(p: u32) -> [u8; 3] {
    [(p >> 16) as u8, (p >> 8) as u8, p as u8]
}

pub fn pack([r, g, b]: [u8; 3]) -> u32 {
    (r as u32) << 16 | (g as u32) << 8 | b as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb565_extremes_expand_to_full_range() {
        assert_eq!(rgb565_to_xrgb(0xFFFF), 0x00FF_FFFF);
        assert_eq!(rgb565_to_xrgb(0xF800), 0x00FF_0000);
        assert_eq!(rgb565_to_xrgb(0x07E0), 0x0000_FF00);
        assert_eq!(rgb565_to_xrgb(0x001F), 0x0000_00FF);
        assert_eq!(rgb565_to_xrgb(0), 0);
    }

    #[test]
    fn test_xrgb_payload_drops_padding_byte() {
        let bytes = [0x30, 0x20, 0x10, 0xFF, 0x01, 0x02, 0x03, 0x00];
        let image = Image::from_payload(&bytes, 2, 1, 4).unwrap();
        assert_eq!(image.pixels, vec![0x0010_2030, 0x0003_0201]);
    }

    #[test]
    fn test_short_payload_is_rejected() {
        assert!(Image::from_payload(&[0; 7], 2, 2, 2).is_none());
        assert!(Image::from_payload(&[0; 12], 1, 1, 3).is_none());
    }

    #[test]
    fn test_565_roundtrip_of_representable_colors() {
        for p in [0x0000u16, 0x1234, 0xF81F, 0xFFFF, 0x07E0] {
            assert_eq!(xrgb_to_rgb565(rgb565_to_xrgb(p)), p);
        }
    }
}
