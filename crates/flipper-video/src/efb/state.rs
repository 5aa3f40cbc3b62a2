use tracing::warn;

use crate::error::{SnapshotError, SnapshotResult};
use crate::snapshot::{SnapshotReader, SnapshotVersion, SnapshotWriter, StateSnapshot};

use super::device::{EfbDevice, SurfaceImage};
use super::format::PixelFormat;
use super::FramebufferManager;

const TAG_PREV_FORMAT: u16 = 1;
const TAG_SAVE_CONTENTS: u16 = 2;
const TAG_COLOR: u16 = 3;
const TAG_DEPTH: u16 = 4;

const NO_FORMAT: u8 = 0xFF;

fn encode_image(image: &SurfaceImage) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + image.texels.len() * 4);
    out.extend_from_slice(&image.width.to_le_bytes());
    out.extend_from_slice(&image.height.to_le_bytes());
    out.extend_from_slice(&image.layers.to_le_bytes());
    for texel in &image.texels {
        out.extend_from_slice(&texel.to_le_bytes());
    }
    out
}

fn decode_image(bytes: &[u8]) -> SnapshotResult<SurfaceImage> {
    let word = |i: usize| -> SnapshotResult<u32> {
        bytes
            .get(i * 4..i * 4 + 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or(SnapshotError::UnexpectedEof)
    };
    let (width, height, layers) = (word(0)?, word(1)?, word(2)?);
    let expected = SurfaceImage::texel_count(width, height, layers)
        .and_then(|count| count.checked_mul(4))
        .and_then(|len| len.checked_add(12));
    if expected != Some(bytes.len()) {
        return Err(SnapshotError::InvalidFieldEncoding("surface image"));
    }
    let texels = bytes[12..]
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(SurfaceImage {
        width,
        height,
        layers,
        texels,
    })
}

impl<D: EfbDevice> StateSnapshot for FramebufferManager<D> {
    const DEVICE_ID: [u8; 4] = *b"EFBM";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);
}

impl<D: EfbDevice> FramebufferManager<D> {
    /// Serializes the EFB. Multisampled contents are resolved first, so a reload is close to
    /// but not bit-exact with the saved frame.
    pub fn save_state(&mut self) -> Vec<u8> {
        self.flush_pokes();
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u8(
            TAG_PREV_FORMAT,
            self.prev_format.map_or(NO_FORMAT, PixelFormat::raw),
        );
        w.field_bool(TAG_SAVE_CONTENTS, self.settings.save_to_state);
        if self.settings.save_to_state {
            let rect = self.surfaces.rect();
            let hardware = self.caps.supports_partial_multisample_resolve;
            let color = self.surfaces.resolve_color(&mut self.device, rect, hardware);
            let color = self.device.read_surface(color);
            let depth = self.surfaces.resolve_depth(&mut self.device, rect);
            let depth = self.device.read_surface(depth);
            w.field_bytes(TAG_COLOR, encode_image(&color));
            w.field_bytes(TAG_DEPTH, encode_image(&depth));
        }
        w.finish()
    }

    /// Restores the EFB. Contents that do not fit the current surface set (different stereo
    /// mode, damaged image) are replaced by a full clear; a different scale is rescaled.
    pub fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        self.flush_pokes();
        self.prev_format = match r.u8(TAG_PREV_FORMAT)? {
            None | Some(NO_FORMAT) => None,
            Some(raw) => Some(
                PixelFormat::from_raw(raw)
                    .ok_or(SnapshotError::InvalidFieldEncoding("pixel format"))?,
            ),
        };
        if !r.bool(TAG_SAVE_CONTENTS)?.unwrap_or(false) {
            return Ok(());
        }

        self.invalidate_peek_cache(true);
        let decode = |tag| r.bytes(tag).ok_or(SnapshotError::UnexpectedEof).and_then(decode_image);
        let images = decode(TAG_COLOR).and_then(|color| Ok((color, decode(TAG_DEPTH)?)));
        match images {
            Ok((color, depth))
                if color.layers == self.surfaces.layers && depth.layers == self.surfaces.layers =>
            {
                let s = &mut self.surfaces;
                self.device.restore(&mut s.color, &mut s.depth, &color, &depth);
            }
            Ok((color, _)) => {
                warn!(
                    saved = color.layers,
                    current = self.surfaces.layers,
                    "EFB layer count differs from the save state, clearing instead"
                );
                self.clear_surfaces();
            }
            Err(err) => {
                warn!(%err, "failed to decode EFB contents, clearing instead");
                self.clear_surfaces();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::{ApiType, Capabilities};
    use crate::config::VideoConfig;
    use crate::efb::{EfbSettings, SoftwareEfbDevice};

    #[test]
    fn images_reject_trailing_or_missing_texels() {
        let image = SurfaceImage {
            width: 2,
            height: 1,
            layers: 1,
            texels: vec![1, 2],
        };
        let mut bytes = encode_image(&image);
        assert_eq!(decode_image(&bytes).unwrap(), image);
        bytes.push(0);
        assert!(decode_image(&bytes).is_err());
        assert_eq!(decode_image(&bytes[..8]), Err(SnapshotError::UnexpectedEof));

        let huge: Vec<u8> = [u32::MAX; 3].iter().flat_map(|w| w.to_le_bytes()).collect();
        assert_eq!(
            decode_image(&huge),
            Err(SnapshotError::InvalidFieldEncoding("surface image"))
        );
    }

    #[test]
    fn damaged_image_header_clears_instead_of_failing() {
        let caps = Capabilities::minimal(ApiType::Null);
        let mut efb = FramebufferManager::new(
            SoftwareEfbDevice::new(false),
            caps,
            EfbSettings::from(&VideoConfig::default()),
        )
        .unwrap();
        efb.poke_color(7, 7, 0xFF12_3456);

        let huge: Vec<u8> = [u32::MAX; 3].iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut w = SnapshotWriter::new(
            FramebufferManager::<SoftwareEfbDevice>::DEVICE_ID,
            FramebufferManager::<SoftwareEfbDevice>::DEVICE_VERSION,
        );
        w.field_u8(TAG_PREV_FORMAT, NO_FORMAT);
        w.field_bool(TAG_SAVE_CONTENTS, true);
        w.field_bytes(TAG_COLOR, huge.clone());
        w.field_bytes(TAG_DEPTH, huge);

        efb.load_state(&w.finish()).unwrap();
        assert_eq!(efb.peek_color(7, 7), 0);
    }
}
