//! Tiled CPU readback of the EFB.
//!
//! Each plane has one staging buffer covering the whole native EFB. Tiles are regions of that
//! buffer that are downloaded on first access and kept until something invalidates them. Tile
//! coordinates are in readback row order, which is flipped for lower-left-origin devices.

use crate::error::InitError;

use super::device::{EfbDevice, EfbPlane, EfbRect, SampleFilter, SurfaceDesc};
use super::{FramebufferManager, EFB_HEIGHT, EFB_WIDTH};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct TileLayout {
    tile_size: u32,
    tiles_wide: u32,
    tiles_high: u32,
}

impl TileLayout {
    pub(super) fn new(tile_size: u32) -> Self {
        if tile_size == 0 {
            return Self {
                tile_size,
                tiles_wide: 1,
                tiles_high: 1,
            };
        }
        Self {
            tile_size,
            tiles_wide: EFB_WIDTH.div_ceil(tile_size),
            tiles_high: EFB_HEIGHT.div_ceil(tile_size),
        }
    }

    pub(super) fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn is_tiled(&self) -> bool {
        self.tile_size != 0
    }

    fn tile_count(&self) -> usize {
        (self.tiles_wide * self.tiles_high) as usize
    }

    fn tile_index(&self, x: u32, y: u32) -> usize {
        if !self.is_tiled() {
            return 0;
        }
        ((y / self.tile_size) * self.tiles_wide + x / self.tile_size) as usize
    }

    fn tile_rect(&self, index: usize) -> EfbRect {
        if !self.is_tiled() {
            return EfbRect::with_size(EFB_WIDTH, EFB_HEIGHT);
        }
        let index = index as u32;
        let left = (index % self.tiles_wide) * self.tile_size;
        let top = (index / self.tiles_wide) * self.tile_size;
        EfbRect::new(left, top, left + self.tile_size, top + self.tile_size)
            .clamped(EFB_WIDTH, EFB_HEIGHT)
    }

    /// Size of the intermediate surface a single tile is downsampled into.
    fn tile_extent(&self) -> (u32, u32) {
        if self.is_tiled() {
            (self.tile_size.min(EFB_WIDTH), self.tile_size.min(EFB_HEIGHT))
        } else {
            (EFB_WIDTH, EFB_HEIGHT)
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Tile {
    present: bool,
    /// Bit 0 is the current frame; shifted left once per frame.
    frame_access_mask: u64,
}

pub(super) struct ReadbackCache<S, T> {
    tile_surface: S,
    staging: T,
    tiles: Vec<Tile>,
    /// Copies have been queued into `staging` without waiting for them.
    needs_flush: bool,
    /// Tiles were dropped since the last bulk refresh.
    needs_refresh: bool,
    has_active_tiles: bool,
    /// The EFB changed under present tiles; they are dropped on the next non-forced invalidate.
    out_of_date: bool,
}

impl<S, T> ReadbackCache<S, T> {
    pub(super) fn create<D>(device: &mut D, plane: EfbPlane, layout: TileLayout) -> Result<Self, InitError>
    where
        D: EfbDevice<Surface = S, Staging = T>,
    {
        let (format, surface) = match plane {
            EfbPlane::Color => (wgpu::TextureFormat::Rgba8Unorm, "color readback tile"),
            EfbPlane::Depth => (wgpu::TextureFormat::R32Float, "depth readback tile"),
        };
        let (width, height) = layout.tile_extent();
        let tile_desc = SurfaceDesc {
            width,
            height,
            layers: 1,
            samples: 1,
            format,
            render_target: true,
        };
        let tile_surface = device
            .create_surface(&tile_desc, surface)
            .map_err(|source| InitError::Surface { surface, source })?;
        let staging = device
            .create_staging(&SurfaceDesc {
                width: EFB_WIDTH,
                height: EFB_HEIGHT,
                render_target: false,
                ..tile_desc
            })
            .map_err(InitError::Staging)?;

        Ok(Self {
            tile_surface,
            staging,
            tiles: vec![Tile::default(); layout.tile_count()],
            needs_flush: false,
            needs_refresh: false,
            has_active_tiles: false,
            out_of_date: false,
        })
    }

    fn invalidate(&mut self, forced: bool) {
        if !(forced || self.out_of_date) {
            return;
        }
        if self.has_active_tiles {
            for tile in &mut self.tiles {
                tile.present = false;
            }
            self.needs_refresh = true;
        }
        self.has_active_tiles = false;
        self.needs_flush = false;
        self.out_of_date = false;
    }

    fn flag_out_of_date(&mut self) {
        if self.has_active_tiles {
            self.out_of_date = true;
        }
    }

    /// Tiles read recently that are no longer downloaded.
    fn stale_tiles(&self) -> Vec<usize> {
        self.tiles
            .iter()
            .enumerate()
            .filter(|(_, tile)| tile.frame_access_mask != 0 && !tile.present)
            .map(|(index, _)| index)
            .collect()
    }
}

impl<D: EfbDevice> FramebufferManager<D> {
    fn plane_cache(&mut self, plane: EfbPlane) -> (&mut D, &mut ReadbackCache<D::Surface, D::Staging>) {
        match plane {
            EfbPlane::Color => (&mut self.device, &mut self.color_cache),
            EfbPlane::Depth => (&mut self.device, &mut self.depth_cache),
        }
    }

    fn needs_intermediate_copy(&self, plane: EfbPlane) -> bool {
        if self.surfaces.scale != 1 {
            return true;
        }
        plane == EfbPlane::Depth
            && (!self.caps.supports_depth_readback
                || (self.layout.is_tiled() && !self.caps.supports_partial_depth_copies))
    }

    /// Downloads one tile into the staging buffer. With `deferred` the copy is only queued and
    /// the next read of the plane waits for it.
    fn populate_tile(&mut self, plane: EfbPlane, index: usize, deferred: bool) {
        self.flush_pokes();

        let native = self.layout.tile_rect(index);
        let rect = self
            .convert_efb_rect(native)
            .clamped(self.surfaces.width(), self.surfaces.height());
        let intermediate = self.needs_intermediate_copy(plane);
        let hardware = self.caps.supports_partial_multisample_resolve;

        let Self {
            device,
            surfaces,
            color_cache,
            depth_cache,
            ..
        } = self;
        let (src, cache, filter) = match plane {
            EfbPlane::Color => (
                surfaces.resolve_color(device, rect, hardware),
                color_cache,
                SampleFilter::Linear,
            ),
            EfbPlane::Depth => (
                surfaces.resolve_depth(device, rect),
                depth_cache,
                SampleFilter::Point,
            ),
        };

        if intermediate {
            let (w, h) = (native.width(), native.height());
            device.downsample(src, rect, &mut cache.tile_surface, w, h, filter);
            device.copy_to_staging(
                &cache.tile_surface,
                EfbRect::with_size(w, h),
                &mut cache.staging,
                native.left,
                native.top,
            );
        } else {
            device.copy_to_staging(src, rect, &mut cache.staging, native.left, native.top);
        }

        if deferred {
            cache.needs_flush = true;
        } else {
            device.flush_staging(&mut cache.staging);
            cache.needs_flush = false;
        }
        cache.has_active_tiles = true;
        cache.tiles[index].present = true;
    }

    /// Reads one texel at readback coordinates, downloading its tile if needed.
    pub(super) fn read_cached_texel(&mut self, plane: EfbPlane, x: u32, y: u32) -> u32 {
        let index = self.layout.tile_index(x, y);
        if !self.plane_cache(plane).1.tiles[index].present {
            self.populate_tile(plane, index, false);
        }
        let (device, cache) = self.plane_cache(plane);
        cache.tiles[index].frame_access_mask |= 1;
        if cache.needs_flush {
            device.flush_staging(&mut cache.staging);
            cache.needs_flush = false;
        }
        device.read_texel(&cache.staging, x, y)
    }

    /// Keeps a downloaded tile consistent with a poke that has not been drawn yet.
    pub(super) fn patch_cached_texel(&mut self, plane: EfbPlane, x: u32, y: u32, texel: u32) {
        let index = self.layout.tile_index(x, y);
        let (device, cache) = self.plane_cache(plane);
        if !cache.tiles[index].present {
            return;
        }
        // A queued copy predates the poke and would overwrite the patch.
        if cache.needs_flush {
            device.flush_staging(&mut cache.staging);
            cache.needs_flush = false;
        }
        device.write_texel(&mut cache.staging, x, y, texel);
    }

    /// Whether the tile holding native texel `(x, y)` is downloaded.
    pub fn is_efb_cache_tile_present(&self, plane: EfbPlane, x: u32, y: u32) -> bool {
        let y = self.readback_y(y);
        let index = self.layout.tile_index(x, y);
        let cache = match plane {
            EfbPlane::Color => &self.color_cache,
            EfbPlane::Depth => &self.depth_cache,
        };
        cache.tiles[index].present
    }

    pub fn efb_cache_tile_size(&self) -> u32 {
        self.layout.tile_size()
    }

    /// Drops downloaded tiles. Without `forced`, only planes flagged out of date are dropped.
    pub fn invalidate_peek_cache(&mut self, forced: bool) {
        self.color_cache.invalidate(forced);
        self.depth_cache.invalidate(forced);
    }

    /// Marks downloaded tiles as stale after the EFB changed. Unless invalidation is deferred
    /// to the end of the frame they are dropped immediately.
    pub fn flag_peek_cache_as_out_of_date(&mut self) {
        self.color_cache.flag_out_of_date();
        self.depth_cache.flag_out_of_date();
        if !self.settings.defer_invalidation {
            self.invalidate_peek_cache(false);
        }
    }

    /// Queues downloads of every tile read in the last 64 frames that is no longer present.
    pub fn refresh_peek_cache(&mut self) {
        if !self.color_cache.needs_refresh && !self.depth_cache.needs_refresh {
            return;
        }
        let mut populated = false;
        for plane in [EfbPlane::Color, EfbPlane::Depth] {
            let stale = self.plane_cache(plane).1.stale_tiles();
            for index in stale {
                self.populate_tile(plane, index, true);
                populated = true;
            }
        }
        self.color_cache.needs_refresh = false;
        self.depth_cache.needs_refresh = false;
        if populated {
            self.device.submit();
        }
    }

    /// Advances tile access history by one frame.
    pub fn end_of_frame(&mut self) {
        if self.settings.defer_invalidation {
            self.invalidate_peek_cache(false);
        }
        for cache in [&mut self.color_cache, &mut self.depth_cache] {
            for tile in &mut cache.tiles {
                tile.frame_access_mask <<= 1;
            }
        }
    }

    /// Changes the readback tile size, dropping every downloaded tile.
    pub fn set_efb_cache_tile_size(&mut self, tile_size: u32) -> Result<(), InitError> {
        if tile_size == self.layout.tile_size() {
            return Ok(());
        }
        self.invalidate_peek_cache(true);
        let layout = TileLayout::new(tile_size);
        let color_cache = ReadbackCache::create(&mut self.device, EfbPlane::Color, layout)?;
        let depth_cache = ReadbackCache::create(&mut self.device, EfbPlane::Depth, layout)?;
        self.layout = layout;
        self.color_cache = color_cache;
        self.depth_cache = depth_cache;
        self.settings.tile_size = tile_size;
        Ok(())
    }
}
