//! Embedded framebuffer emulation.
//!
//! The emulated GPU renders into a 640x528 on-chip buffer that the CPU can read and write texel
//! by texel. Here the buffer lives in host surfaces at `scale` times native resolution, optionally
//! multisampled and layered for stereo. CPU reads go through a tiled readback cache
//! ([`readback`]) and CPU writes are batched into point or quad draws ([`poke`]).
//!
//! Constructing a [`FramebufferManager`] is initialization; there is no uninitialized state to
//! misuse. All methods run on the GPU thread.

mod device;
mod format;
mod poke;
mod readback;
mod software;
mod state;


use tracing::{debug, error};

use crate::backend::FramebufferState;
use crate::caps::Capabilities;
use crate::config::VideoConfig;
use crate::error::InitError;

pub use device::{
    ClearMask, EfbDevice, EfbPlane, EfbRect, PokeTopology, ResolveOp, ResolvePath, SampleFilter,
    SurfaceDesc, SurfaceImage,
};
pub use format::{depth_from_z24, FormatChange, PixelFormat, ReinterpretKind};
pub use poke::PokeVertex;
pub use software::{DeviceCounters, SoftwareEfbDevice, SoftwareStaging, SoftwareSurface};

use readback::{ReadbackCache, TileLayout};

pub const EFB_WIDTH: u32 = 640;
pub const EFB_HEIGHT: u32 = 528;
/// Poke vertices buffered before a batch is drawn.
pub const MAX_POKE_VERTICES: usize = 32768;

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// The subset of [`VideoConfig`] the framebuffer manager reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EfbSettings {
    pub scale: u32,
    pub samples: u32,
    pub ssaa: bool,
    pub stereo: bool,
    /// Readback tile edge in native texels; 0 caches the whole EFB as one tile.
    pub tile_size: u32,
    /// Stale tiles stay readable until [`FramebufferManager::end_of_frame`], so a peek after a
    /// clear can still see the old contents.
    pub defer_invalidation: bool,
    pub emulate_format_changes: bool,
    pub save_to_state: bool,
}

impl From<&VideoConfig> for EfbSettings {
    fn from(config: &VideoConfig) -> Self {
        Self {
            scale: config.efb_scale,
            samples: config.msaa_samples,
            ssaa: config.ssaa,
            stereo: config.stereo,
            tile_size: config.efb_access_tile_size,
            defer_invalidation: config.efb_access_defer_invalidation,
            emulate_format_changes: config.emulate_efb_format_changes,
            save_to_state: config.save_efb_to_state,
        }
    }
}

/// A clear of the EFB as requested by the emulated GPU, in native coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClearRequest {
    pub rect: EfbRect,
    pub color: bool,
    pub alpha: bool,
    pub depth: bool,
    /// `0xAARRGGBB`.
    pub color_value: u32,
    /// 24-bit depth.
    pub z_value: u32,
}

struct SurfaceSet<S> {
    color: S,
    depth: S,
    /// Target of pixel-format reinterpretation; swapped with `color` afterwards.
    convert: S,
    color_resolve: Option<S>,
    depth_resolve: Option<S>,
    scale: u32,
    samples: u32,
    layers: u32,
}

impl<S> SurfaceSet<S> {
    fn create<D>(device: &mut D, scale: u32, samples: u32, layers: u32) -> Result<Self, InitError>
    where
        D: EfbDevice<Surface = S>,
    {
        let color_desc = SurfaceDesc {
            width: EFB_WIDTH * scale,
            height: EFB_HEIGHT * scale,
            layers,
            samples,
            format: COLOR_FORMAT,
            render_target: true,
        };
        let depth_desc = SurfaceDesc {
            format: DEPTH_FORMAT,
            ..color_desc
        };

        let mut make = |desc: &SurfaceDesc, surface: &'static str| {
            device
                .create_surface(desc, surface)
                .map_err(|source| InitError::Surface { surface, source })
        };
        let color = make(&color_desc, "color")?;
        let depth = make(&depth_desc, "depth")?;
        let convert = make(&color_desc, "convert")?;
        let (color_resolve, depth_resolve) = if samples > 1 {
            (
                Some(make(&color_desc.single_sampled(), "color resolve")?),
                Some(make(
                    &SurfaceDesc {
                        format: wgpu::TextureFormat::R32Float,
                        ..depth_desc.single_sampled()
                    },
                    "depth resolve",
                )?),
            )
        } else {
            (None, None)
        };

        device
            .prepare_utility_passes(&color_desc, &depth_desc)
            .map_err(InitError::UtilityPasses)?;

        Ok(Self {
            color,
            depth,
            convert,
            color_resolve,
            depth_resolve,
            scale,
            samples,
            layers,
        })
    }

    fn width(&self) -> u32 {
        EFB_WIDTH * self.scale
    }

    fn height(&self) -> u32 {
        EFB_HEIGHT * self.scale
    }

    fn rect(&self) -> EfbRect {
        EfbRect::with_size(self.width(), self.height())
    }

    /// Single-sampled colour covering `rect` (target coordinates).
    fn resolve_color<D>(&mut self, device: &mut D, rect: EfbRect, hardware: bool) -> &S
    where
        D: EfbDevice<Surface = S>,
    {
        let rect = rect.clamped(self.width(), self.height());
        match self.color_resolve.as_mut() {
            Some(resolved) => {
                let path = if hardware {
                    ResolvePath::Hardware
                } else {
                    ResolvePath::Shader
                };
                device.resolve(&self.color, resolved, rect, ResolveOp::Average, path);
                &*resolved
            }
            None => &self.color,
        }
    }

    /// Single-sampled depth covering `rect`. Multisampled depth keeps the nearest sample.
    fn resolve_depth<D>(&mut self, device: &mut D, rect: EfbRect) -> &S
    where
        D: EfbDevice<Surface = S>,
    {
        let rect = rect.clamped(self.width(), self.height());
        match self.depth_resolve.as_mut() {
            Some(resolved) => {
                device.resolve(&self.depth, resolved, rect, ResolveOp::Min, ResolvePath::Shader);
                &*resolved
            }
            None => &self.depth,
        }
    }
}

pub struct FramebufferManager<D: EfbDevice> {
    device: D,
    caps: Capabilities,
    settings: EfbSettings,
    surfaces: SurfaceSet<D::Surface>,
    layout: TileLayout,
    color_cache: ReadbackCache<D::Surface, D::Staging>,
    depth_cache: ReadbackCache<D::Surface, D::Staging>,
    color_pokes: Vec<PokeVertex>,
    depth_pokes: Vec<PokeVertex>,
    prev_format: Option<PixelFormat>,
}

impl<D: EfbDevice> FramebufferManager<D> {
    /// Creates the surface set, readback caches and utility passes, then clears the EFB.
    ///
    /// Failure here is fatal for the video session.
    pub fn new(
        mut device: D,
        caps: Capabilities,
        settings: EfbSettings,
    ) -> Result<Self, InitError> {
        let scale = Self::clamp_scale(&caps, settings.scale);
        let samples = Self::clamp_samples(&caps, settings.samples);
        let layers = if settings.stereo { 2 } else { 1 };

        let surfaces = SurfaceSet::create(&mut device, scale, samples, layers)?;
        let layout = TileLayout::new(settings.tile_size);
        let color_cache = ReadbackCache::create(&mut device, EfbPlane::Color, layout)?;
        let depth_cache = ReadbackCache::create(&mut device, EfbPlane::Depth, layout)?;

        debug!(scale, samples, layers, tile_size = settings.tile_size, "created EFB");

        let mut manager = Self {
            device,
            caps,
            settings,
            surfaces,
            layout,
            color_cache,
            depth_cache,
            color_pokes: Vec::new(),
            depth_pokes: Vec::new(),
            prev_format: None,
        };
        manager.clear_surfaces();
        Ok(manager)
    }

    fn clamp_scale(caps: &Capabilities, scale: u32) -> u32 {
        let max = (caps.max_texture_size / EFB_WIDTH).max(1);
        scale.clamp(1, max)
    }

    fn clamp_samples(caps: &Capabilities, samples: u32) -> u32 {
        samples.clamp(1, caps.max_samples.max(1))
    }

    fn clear_surfaces(&mut self) {
        let mask = ClearMask {
            color: true,
            alpha: true,
            depth: true,
        };
        let rect = self.surfaces.rect();
        let s = &mut self.surfaces;
        self.device.clear(&mut s.color, &mut s.depth, rect, mask, 0, 0.0);
    }

    /// Rebuilds the surface set for a new scale or sample count. The old set stays live until
    /// the new one has been fully created, so a failure leaves the manager usable.
    pub fn recreate(&mut self, scale: u32, samples: u32) -> Result<(), InitError> {
        let scale = Self::clamp_scale(&self.caps, scale);
        let samples = Self::clamp_samples(&self.caps, samples);
        if scale == self.surfaces.scale && samples == self.surfaces.samples {
            return Ok(());
        }

        self.flush_pokes();
        let surfaces = SurfaceSet::create(&mut self.device, scale, samples, self.surfaces.layers)?;
        self.surfaces = surfaces;
        self.settings.scale = scale;
        self.settings.samples = samples;
        self.invalidate_peek_cache(true);
        self.clear_surfaces();
        debug!(scale, samples, "recreated EFB");
        Ok(())
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn settings(&self) -> &EfbSettings {
        &self.settings
    }

    pub fn efb_scale(&self) -> u32 {
        self.surfaces.scale
    }

    pub fn efb_samples(&self) -> u32 {
        self.surfaces.samples
    }

    pub fn efb_layers(&self) -> u32 {
        self.surfaces.layers
    }

    pub fn is_multisampled(&self) -> bool {
        self.surfaces.samples > 1
    }

    pub fn target_width(&self) -> u32 {
        self.surfaces.width()
    }

    pub fn target_height(&self) -> u32 {
        self.surfaces.height()
    }

    pub fn prev_pixel_format(&self) -> Option<PixelFormat> {
        self.prev_format
    }

    pub fn color_surface(&self) -> &D::Surface {
        &self.surfaces.color
    }

    pub fn depth_surface(&self) -> &D::Surface {
        &self.surfaces.depth
    }

    /// Render-target shape pipelines drawing into the EFB must be created against.
    pub fn framebuffer_state(&self) -> FramebufferState {
        FramebufferState {
            color_format: COLOR_FORMAT,
            depth_format: DEPTH_FORMAT,
            samples: self.surfaces.samples,
            per_sample_shading: self.surfaces.samples > 1 && self.settings.ssaa,
        }
    }

    /// Maps a native EFB rectangle to target coordinates.
    pub fn convert_efb_rect(&self, rect: EfbRect) -> EfbRect {
        rect.scaled(self.surfaces.scale)
    }

    /// Single-sampled colour for `rect` in target coordinates. Without multisampling this is
    /// the live surface.
    pub fn resolve_color(&mut self, rect: EfbRect) -> &D::Surface {
        self.flush_pokes();
        let hardware = self.caps.supports_partial_multisample_resolve;
        self.surfaces.resolve_color(&mut self.device, rect, hardware)
    }

    /// Single-sampled depth for `rect` in target coordinates.
    pub fn resolve_depth(&mut self, rect: EfbRect) -> &D::Surface {
        self.flush_pokes();
        self.surfaces.resolve_depth(&mut self.device, rect)
    }

    /// Re-encodes the colour contents for a pixel-format switch. Depth is left untouched.
    /// Returns `false` if the device could not run the conversion.
    pub fn reinterpret_pixel_data(&mut self, kind: ReinterpretKind) -> bool {
        self.flush_pokes();
        let s = &mut self.surfaces;
        if let Err(err) = self.device.convert(&s.color, &mut s.convert, kind) {
            error!(?kind, %err, "EFB reinterpretation failed");
            return false;
        }
        std::mem::swap(&mut s.color, &mut s.convert);
        self.invalidate_peek_cache(true);
        true
    }

    /// Records the emulated pixel format and reinterprets the colour contents if the switch
    /// changes their layout.
    pub fn on_pixel_format_change(&mut self, format: PixelFormat) {
        let old = self.prev_format.replace(format);
        if !self.settings.emulate_format_changes {
            return;
        }
        match FormatChange::between(old, format) {
            FormatChange::Unchanged => {}
            FormatChange::Reinterpret(kind) => {
                self.reinterpret_pixel_data(kind);
            }
            FormatChange::Unhandled => {
                error!(?old, new = ?format, "unhandled EFB pixel format change");
            }
        }
    }

    /// Clears part of the EFB while rendering in `format`.
    pub fn clear(&mut self, request: &ClearRequest, format: PixelFormat) {
        let mut mask = ClearMask {
            color: request.color,
            alpha: request.alpha,
            depth: request.depth,
        };
        let mut color_value = request.color_value;
        if !format.has_alpha() {
            mask.alpha = true;
        }
        if !(mask.color || mask.alpha || mask.depth) {
            return;
        }
        color_value = format.quantize_color(color_value);
        let depth_value = depth_from_z24(format.clear_depth(request.z_value));

        self.flush_pokes();
        self.flag_peek_cache_as_out_of_date();

        let mut rect = self.convert_efb_rect(request.rect);
        if self.caps.uses_lower_left_origin {
            rect = rect.flipped(self.surfaces.height());
        }
        let rect = rect.clamped(self.surfaces.width(), self.surfaces.height());
        let s = &mut self.surfaces;
        self.device
            .clear(&mut s.color, &mut s.depth, rect, mask, color_value, depth_value);
    }

    /// Draws any batched pokes.
    pub fn flush_pokes(&mut self) {
        let topology = poke::topology(self.caps.supports_large_points);
        let s = &mut self.surfaces;
        for (plane, batch) in [
            (EfbPlane::Color, &mut self.color_pokes),
            (EfbPlane::Depth, &mut self.depth_pokes),
        ] {
            if batch.is_empty() {
                continue;
            }
            self.device.draw_pokes(
                &mut s.color,
                &mut s.depth,
                plane,
                topology,
                bytemuck::cast_slice(batch.as_slice()),
            );
            batch.clear();
        }
    }

    pub fn pending_poke_vertices(&self) -> usize {
        self.color_pokes.len() + self.depth_pokes.len()
    }

    /// Writes one colour texel, reduced to what the current pixel format stores.
    pub fn poke_color(&mut self, x: u32, y: u32, color: u32) {
        let color = self.prev_format.map_or(color, |format| format.quantize_color(color));
        self.poke(EfbPlane::Color, x, y, 0.0, color, color);
    }

    pub fn poke_depth(&mut self, x: u32, y: u32, depth: f32) {
        self.poke(EfbPlane::Depth, x, y, depth, 0, depth.to_bits());
    }

    fn poke(&mut self, plane: EfbPlane, x: u32, y: u32, z: f32, color: u32, texel: u32) {
        assert!(
            x < EFB_WIDTH && y < EFB_HEIGHT,
            "EFB poke at ({x}, {y}) is out of bounds"
        );
        let pending = match plane {
            EfbPlane::Color => self.color_pokes.len(),
            EfbPlane::Depth => self.depth_pokes.len(),
        };
        if pending + poke::VERTICES_PER_POKE > MAX_POKE_VERTICES {
            self.flush_pokes();
        }
        let batch = match plane {
            EfbPlane::Color => &mut self.color_pokes,
            EfbPlane::Depth => &mut self.depth_pokes,
        };
        poke::push_poke(
            batch,
            x,
            y,
            z,
            color,
            self.surfaces.scale,
            self.caps.supports_large_points,
        );

        let y = self.readback_y(y);
        self.patch_cached_texel(plane, x, y, texel);
    }

    pub fn peek_color(&mut self, x: u32, y: u32) -> u32 {
        self.peek(EfbPlane::Color, x, y)
    }

    pub fn peek_depth(&mut self, x: u32, y: u32) -> f32 {
        f32::from_bits(self.peek(EfbPlane::Depth, x, y))
    }

    fn peek(&mut self, plane: EfbPlane, x: u32, y: u32) -> u32 {
        assert!(
            x < EFB_WIDTH && y < EFB_HEIGHT,
            "EFB peek at ({x}, {y}) is out of bounds"
        );
        let y = self.readback_y(y);
        self.read_cached_texel(plane, x, y)
    }

    /// Readback memory is stored in the surface's own row order.
    fn readback_y(&self, y: u32) -> u32 {
        if self.caps.uses_lower_left_origin {
            EFB_HEIGHT - 1 - y
        } else {
            y
        }
    }

    /// Submits work recorded since the last submit.
    pub fn submit(&mut self) {
        self.flush_pokes();
        self.device.submit();
    }
}
