//! Emulated pixel formats and the in-place reinterpretations between them.
//!
//! Colour texels are packed `0xAARRGGBB` with 8 bits per channel. Formats with fewer bits per
//! channel store their values expanded to 8 bits, so a reinterpretation is a bit-level repack
//! followed by re-expansion.

/// Pixel format the emulated GPU renders into, as selected by the Z-compare control register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb8Z24,
    Rgba6Z24,
    Rgb565Z16,
    Z24,
    Y8,
    U8,
    V8,
    Yuv420,
}

impl PixelFormat {
    pub const ALL: [Self; 8] = [
        Self::Rgb8Z24,
        Self::Rgba6Z24,
        Self::Rgb565Z16,
        Self::Z24,
        Self::Y8,
        Self::U8,
        Self::V8,
        Self::Yuv420,
    ];

    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.get(usize::from(raw)).copied()
    }

    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Only RGBA6 stores a meaningful alpha channel.
    pub fn has_alpha(self) -> bool {
        self == Self::Rgba6Z24
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReinterpretKind {
    Rgb8ToRgba6,
    Rgb8ToRgb565,
    Rgba6ToRgb8,
    Rgba6ToRgb565,
    Rgb565ToRgb8,
    Rgb565ToRgba6,
}

/// What a pixel-format switch requires of the existing colour contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatChange {
    /// Same layout (or nothing to convert from).
    Unchanged,
    Reinterpret(ReinterpretKind),
    /// A switch the EFB cannot emulate (YUV and single-channel formats).
    Unhandled,
}

impl FormatChange {
    pub fn between(old: Option<PixelFormat>, new: PixelFormat) -> Self {
        use PixelFormat::*;
        use ReinterpretKind::*;

        let Some(old) = old else {
            return Self::Unchanged;
        };
        if old == new {
            return Self::Unchanged;
        }
        let kind = match (old, new) {
            // RGB8 and Z24 share a colour layout.
            (Rgb8Z24 | Z24, Rgb8Z24 | Z24) => return Self::Unchanged,
            (Rgb8Z24 | Z24, Rgba6Z24) => Rgb8ToRgba6,
            (Rgb8Z24 | Z24, Rgb565Z16) => Rgb8ToRgb565,
            (Rgba6Z24, Rgb8Z24 | Z24) => Rgba6ToRgb8,
            (Rgba6Z24, Rgb565Z16) => Rgba6ToRgb565,
            (Rgb565Z16, Rgb8Z24 | Z24) => Rgb565ToRgb8,
            (Rgb565Z16, Rgba6Z24) => Rgb565ToRgba6,
            _ => return Self::Unhandled,
        };
        Self::Reinterpret(kind)
    }
}

fn expand6(v: u32) -> u32 {
    (v << 2) | (v >> 4)
}

fn expand5(v: u32) -> u32 {
    (v << 3) | (v >> 2)
}

fn channels(texel: u32) -> [u32; 4] {
    [(texel >> 16) & 0xFF, (texel >> 8) & 0xFF, texel & 0xFF, texel >> 24]
}

fn pack(r: u32, g: u32, b: u32, a: u32) -> u32 {
    (a << 24) | (r << 16) | (g << 8) | b
}

fn to_rgb565(texel: u32) -> u32 {
    let [r, g, b, _] = channels(texel);
    pack(expand5(r >> 3), expand6(g >> 2), expand5(b >> 3), 0xFF)
}

impl ReinterpretKind {
    pub const ALL: [Self; 6] = [
        Self::Rgb8ToRgba6,
        Self::Rgb8ToRgb565,
        Self::Rgba6ToRgb8,
        Self::Rgba6ToRgb565,
        Self::Rgb565ToRgb8,
        Self::Rgb565ToRgba6,
    ];

    /// Converts one `0xAARRGGBB` texel.
    pub fn convert(self, texel: u32) -> u32 {
        match self {
            // The 24 colour bits are re-read as four 6-bit channels.
            Self::Rgb8ToRgba6 => {
                let bits = texel & 0x00FF_FFFF;
                pack(
                    expand6((bits >> 18) & 0x3F),
                    expand6((bits >> 12) & 0x3F),
                    expand6((bits >> 6) & 0x3F),
                    expand6(bits & 0x3F),
                )
            }
            // Four 6-bit channels are re-read as 24 colour bits.
            Self::Rgba6ToRgb8 => {
                let [r, g, b, a] = channels(texel).map(|c| c >> 2);
                (0xFF << 24) | (r << 18) | (g << 12) | (b << 6) | a
            }
            Self::Rgb8ToRgb565 | Self::Rgba6ToRgb565 => to_rgb565(texel),
            // 565 values are already representable in 8 bits per channel.
            Self::Rgb565ToRgb8 => texel | 0xFF00_0000,
            Self::Rgb565ToRgba6 => {
                let [r, g, b, _] = channels(texel);
                pack(expand6(r >> 2), expand6(g >> 2), expand6(b >> 2), 0xFF)
            }
        }
    }
}

impl PixelFormat {
    /// Drops the precision the format cannot store from a colour written into the EFB. Formats
    /// without an alpha channel store opaque colours.
    pub fn quantize_color(self, color: u32) -> u32 {
        let color = match self {
            Self::Rgba6Z24 => {
                let [r, g, b, a] = channels(color).map(|c| expand6(c >> 2));
                pack(r, g, b, a)
            }
            Self::Rgb565Z16 => to_rgb565(color),
            _ => color,
        };
        if self.has_alpha() {
            color
        } else {
            color | 0xFF00_0000
        }
    }

    /// 16-bit depth formats keep only the upper 16 bits of a 24-bit clear value.
    pub fn clear_depth(self, z: u32) -> u32 {
        let z = z & 0x00FF_FFFF;
        match self {
            Self::Rgb565Z16 => {
                let z16 = z >> 8;
                (z16 << 8) | (z16 >> 8)
            }
            _ => z,
        }
    }
}

/// Converts a 24-bit depth value to the `[0, 1]` float stored in the depth surface.
pub fn depth_from_z24(z: u32) -> f32 {
    (z & 0x00FF_FFFF) as f32 / 16_777_215.0
}
