//! The GPU operations the framebuffer manager needs, expressed over owned surface handles.

use crate::error::DeviceError;

use super::format::ReinterpretKind;

/// Half-open rectangle in texels: `left..right` by `top..bottom`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EfbRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl EfbRect {
    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn with_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn scaled(&self, scale: u32) -> Self {
        Self::new(
            self.left * scale,
            self.top * scale,
            self.right * scale,
            self.bottom * scale,
        )
    }

    pub fn clamped(&self, width: u32, height: u32) -> Self {
        Self::new(
            self.left.min(width),
            self.top.min(height),
            self.right.min(width),
            self.bottom.min(height),
        )
    }

    /// Mirrors the rectangle vertically inside a surface of `height` rows.
    pub fn flipped(&self, height: u32) -> Self {
        Self::new(
            self.left,
            height.saturating_sub(self.bottom),
            self.right,
            height.saturating_sub(self.top),
        )
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        (self.left..self.right).contains(&x) && (self.top..self.bottom).contains(&y)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub samples: u32,
    pub format: wgpu::TextureFormat,
    pub render_target: bool,
}

impl SurfaceDesc {
    pub fn rect(&self) -> EfbRect {
        EfbRect::with_size(self.width, self.height)
    }

    pub fn single_sampled(self) -> Self {
        Self { samples: 1, ..self }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClearMask {
    pub color: bool,
    pub alpha: bool,
    pub depth: bool,
}

/// How samples of one texel combine when resolving a multisampled surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveOp {
    /// Per-channel average.
    Average,
    /// Nearest depth wins.
    Min,
}

/// Whether a resolve uses the API's partial resolve or a full-screen pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvePath {
    Hardware,
    Shader,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFilter {
    Point,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PokeTopology {
    /// One vertex per poke; the point size covers one scaled EFB texel.
    Points,
    /// Two triangles per poke.
    Triangles,
}

/// One of the two EFB planes. Each has its own poke batch and readback cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EfbPlane {
    Color,
    Depth,
}

/// Single-sampled surface contents moved in and out of save states.
#[derive(Clone, Debug, PartialEq)]
pub struct SurfaceImage {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    /// Row-major, layer after layer.
    pub texels: Vec<u32>,
}

impl SurfaceImage {
    /// `None` when the dimensions cannot be addressed in memory.
    pub fn texel_count(width: u32, height: u32, layers: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(layers as usize)
    }
}

/// Everything the framebuffer manager asks of the graphics API.
///
/// Colour texels are `0xAARRGGBB`; depth and depth-readback texels are `f32` bit patterns.
/// All calls come from the GPU thread.
pub trait EfbDevice {
    type Surface;
    /// CPU-visible buffer that receives tile copies.
    type Staging;

    fn create_surface(&mut self, desc: &SurfaceDesc, label: &'static str)
        -> Result<Self::Surface, DeviceError>;

    fn create_staging(&mut self, desc: &SurfaceDesc) -> Result<Self::Staging, DeviceError>;

    /// Builds the clear, poke, conversion, resolve and copy passes for the given target shape.
    fn prepare_utility_passes(&mut self, color: &SurfaceDesc, depth: &SurfaceDesc)
        -> Result<(), DeviceError>;

    fn clear(
        &mut self,
        color: &mut Self::Surface,
        depth: &mut Self::Surface,
        rect: EfbRect,
        mask: ClearMask,
        color_value: u32,
        depth_value: f32,
    );

    fn resolve(
        &mut self,
        src: &Self::Surface,
        dst: &mut Self::Surface,
        rect: EfbRect,
        op: ResolveOp,
        path: ResolvePath,
    );

    /// Draws `src` through a format conversion into `dst`, covering the whole surface.
    fn convert(
        &mut self,
        src: &Self::Surface,
        dst: &mut Self::Surface,
        kind: ReinterpretKind,
    ) -> Result<(), DeviceError>;

    /// Scales `src_rect` of `src` down into the top-left `dst_width` x `dst_height` of `dst`.
    fn downsample(
        &mut self,
        src: &Self::Surface,
        src_rect: EfbRect,
        dst: &mut Self::Surface,
        dst_width: u32,
        dst_height: u32,
        filter: SampleFilter,
    );

    /// Queues a copy of `src_rect` (layer 0) into the staging buffer at `(dst_x, dst_y)`.
    fn copy_to_staging(
        &mut self,
        src: &Self::Surface,
        src_rect: EfbRect,
        staging: &mut Self::Staging,
        dst_x: u32,
        dst_y: u32,
    );

    /// Waits for queued copies into `staging` and makes them CPU-visible.
    fn flush_staging(&mut self, staging: &mut Self::Staging);

    fn read_texel(&self, staging: &Self::Staging, x: u32, y: u32) -> u32;

    fn write_texel(&mut self, staging: &mut Self::Staging, x: u32, y: u32, value: u32);

    /// `vertices` is a packed array of [`super::PokeVertex`].
    fn draw_pokes(
        &mut self,
        color: &mut Self::Surface,
        depth: &mut Self::Surface,
        plane: EfbPlane,
        topology: PokeTopology,
        vertices: &[u8],
    );

    /// Reads back a single-sampled surface.
    fn read_surface(&mut self, surface: &Self::Surface) -> SurfaceImage;

    /// Draws saved images over the live surfaces, rescaling colour if the sizes differ.
    fn restore(
        &mut self,
        color: &mut Self::Surface,
        depth: &mut Self::Surface,
        color_image: &SurfaceImage,
        depth_image: &SurfaceImage,
    );

    /// Submits recorded work without waiting for it.
    fn submit(&mut self);
}
