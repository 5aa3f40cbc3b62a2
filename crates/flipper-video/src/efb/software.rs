//! CPU implementation of [`EfbDevice`] used by tests and headless hosts.

use std::mem::size_of;

use crate::error::DeviceError;

use super::device::{
    ClearMask, EfbDevice, EfbPlane, EfbRect, PokeTopology, ResolveOp, ResolvePath, SampleFilter,
    SurfaceDesc, SurfaceImage,
};
use super::format::ReinterpretKind;
use super::poke::PokeVertex;

#[derive(Clone, Debug)]
pub struct SoftwareSurface {
    desc: SurfaceDesc,
    label: &'static str,
    texels: Vec<u32>,
}

impl SoftwareSurface {
    pub fn desc(&self) -> &SurfaceDesc {
        &self.desc
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    fn index(&self, x: u32, y: u32, layer: u32, sample: u32) -> usize {
        let d = &self.desc;
        (((layer as usize * d.height as usize + y as usize) * d.width as usize + x as usize)
            * d.samples as usize)
            + sample as usize
    }

    pub fn texel(&self, x: u32, y: u32, layer: u32, sample: u32) -> u32 {
        self.texels[self.index(x, y, layer, sample)]
    }

    /// Writes every sample of `(x, y)` in every layer.
    fn fill(&mut self, x: u32, y: u32, value: u32) {
        for layer in 0..self.desc.layers {
            for sample in 0..self.desc.samples {
                let i = self.index(x, y, layer, sample);
                self.texels[i] = value;
            }
        }
    }
}

#[derive(Clone, Debug)]
struct PendingCopy {
    dst_x: u32,
    dst_y: u32,
    width: u32,
    texels: Vec<u32>,
}

/// Staging buffer whose queued copies only become readable on flush, like a GPU readback.
#[derive(Clone, Debug)]
pub struct SoftwareStaging {
    width: u32,
    height: u32,
    visible: Vec<u32>,
    pending: Vec<PendingCopy>,
}

impl SoftwareStaging {
    pub fn has_pending_copies(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub surfaces_created: u64,
    pub clears: u64,
    pub hardware_resolves: u64,
    pub shader_resolves: u64,
    pub conversions: u64,
    pub downsamples: u64,
    pub staging_copies: u64,
    pub staging_flushes: u64,
    pub poke_draws: u64,
    pub poke_vertices: u64,
    pub submits: u64,
}

#[derive(Debug, Default)]
pub struct SoftwareEfbDevice {
    lower_left_origin: bool,
    fail_label: Option<&'static str>,
    counters: DeviceCounters,
}

impl SoftwareEfbDevice {
    pub fn new(lower_left_origin: bool) -> Self {
        Self {
            lower_left_origin,
            ..Self::default()
        }
    }

    /// Makes creation of the surface with this label fail as if the device ran out of memory.
    pub fn fail_surface(mut self, label: &'static str) -> Self {
        self.fail_label = Some(label);
        self
    }

    pub fn counters(&self) -> DeviceCounters {
        self.counters
    }

    /// Texel-space span covered by `lo..hi` of clip space on an axis of `extent` texels.
    fn span(lo: f32, hi: f32, extent: u32) -> (u32, u32) {
        let to_texel = |c: f32| (((c + 1.0) * 0.5 * extent as f32).round().max(0.0) as u32).min(extent);
        (to_texel(lo), to_texel(hi))
    }

    /// Rows covered by clip-space `lo..hi` on the vertical axis.
    fn row_span(&self, lo: f32, hi: f32, extent: u32) -> (u32, u32) {
        if self.lower_left_origin {
            Self::span(lo, hi, extent)
        } else {
            Self::span(-hi, -lo, extent)
        }
    }
}

fn average(values: impl Iterator<Item = u32>) -> u32 {
    let mut sums = [0u64; 4];
    let mut n = 0u64;
    for v in values {
        for (c, sum) in sums.iter_mut().enumerate() {
            *sum += u64::from((v >> (c * 8)) & 0xFF);
        }
        n += 1;
    }
    if n == 0 {
        return 0;
    }
    sums.iter()
        .enumerate()
        .fold(0, |acc, (c, sum)| acc | (((sum / n) as u32) << (c * 8)))
}

fn min_depth(values: impl Iterator<Item = u32>) -> u32 {
    values
        .map(f32::from_bits)
        .fold(f32::INFINITY, f32::min)
        .to_bits()
}

impl EfbDevice for SoftwareEfbDevice {
    type Surface = SoftwareSurface;
    type Staging = SoftwareStaging;

    fn create_surface(
        &mut self,
        desc: &SurfaceDesc,
        label: &'static str,
    ) -> Result<SoftwareSurface, DeviceError> {
        if self.fail_label == Some(label) {
            return Err(DeviceError::OutOfMemory {
                width: desc.width,
                height: desc.height,
                layers: desc.layers,
            });
        }
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 || desc.samples == 0 {
            return Err(DeviceError::Unsupported(format!("{label}: empty surface {desc:?}")));
        }
        let len = SurfaceImage::texel_count(desc.width, desc.height, desc.layers)
            .and_then(|count| count.checked_mul(desc.samples as usize))
            .ok_or(DeviceError::OutOfMemory {
                width: desc.width,
                height: desc.height,
                layers: desc.layers,
            })?;
        self.counters.surfaces_created += 1;
        Ok(SoftwareSurface {
            desc: *desc,
            label,
            texels: vec![0; len],
        })
    }

    fn create_staging(&mut self, desc: &SurfaceDesc) -> Result<SoftwareStaging, DeviceError> {
        if self.fail_label == Some("readback staging") {
            return Err(DeviceError::OutOfMemory {
                width: desc.width,
                height: desc.height,
                layers: 1,
            });
        }
        Ok(SoftwareStaging {
            width: desc.width,
            height: desc.height,
            visible: vec![0; desc.width as usize * desc.height as usize],
            pending: Vec::new(),
        })
    }

    fn prepare_utility_passes(
        &mut self,
        color: &SurfaceDesc,
        depth: &SurfaceDesc,
    ) -> Result<(), DeviceError> {
        if color.samples != depth.samples || color.layers != depth.layers {
            return Err(DeviceError::Unsupported(
                "colour and depth targets differ in shape".to_string(),
            ));
        }
        Ok(())
    }

    fn clear(
        &mut self,
        color: &mut SoftwareSurface,
        depth: &mut SoftwareSurface,
        rect: EfbRect,
        mask: ClearMask,
        color_value: u32,
        depth_value: f32,
    ) {
        self.counters.clears += 1;
        let mut keep = 0u32;
        if !mask.color {
            keep |= 0x00FF_FFFF;
        }
        if !mask.alpha {
            keep |= 0xFF00_0000;
        }
        let rect = rect.clamped(color.desc.width, color.desc.height);
        for y in rect.top..rect.bottom {
            for x in rect.left..rect.right {
                for layer in 0..color.desc.layers {
                    for sample in 0..color.desc.samples {
                        if mask.color || mask.alpha {
                            let i = color.index(x, y, layer, sample);
                            color.texels[i] = (color.texels[i] & keep) | (color_value & !keep);
                        }
                        if mask.depth {
                            let i = depth.index(x, y, layer, sample);
                            depth.texels[i] = depth_value.to_bits();
                        }
                    }
                }
            }
        }
    }

    fn resolve(
        &mut self,
        src: &SoftwareSurface,
        dst: &mut SoftwareSurface,
        rect: EfbRect,
        op: ResolveOp,
        path: ResolvePath,
    ) {
        match path {
            ResolvePath::Hardware => self.counters.hardware_resolves += 1,
            ResolvePath::Shader => self.counters.shader_resolves += 1,
        }
        let rect = rect
            .clamped(src.desc.width, src.desc.height)
            .clamped(dst.desc.width, dst.desc.height);
        let layers = src.desc.layers.min(dst.desc.layers);
        for layer in 0..layers {
            for y in rect.top..rect.bottom {
                for x in rect.left..rect.right {
                    let samples = (0..src.desc.samples).map(|s| src.texel(x, y, layer, s));
                    let value = match op {
                        ResolveOp::Average => average(samples),
                        ResolveOp::Min => min_depth(samples),
                    };
                    let i = dst.index(x, y, layer, 0);
                    dst.texels[i] = value;
                }
            }
        }
    }

    fn convert(
        &mut self,
        src: &SoftwareSurface,
        dst: &mut SoftwareSurface,
        kind: ReinterpretKind,
    ) -> Result<(), DeviceError> {
        if src.texels.len() != dst.texels.len() {
            return Err(DeviceError::Unsupported(format!(
                "conversion between {} and {} surfaces of different shape",
                src.label, dst.label
            )));
        }
        self.counters.conversions += 1;
        for (out, texel) in dst.texels.iter_mut().zip(&src.texels) {
            *out = kind.convert(*texel);
        }
        Ok(())
    }

    fn downsample(
        &mut self,
        src: &SoftwareSurface,
        src_rect: EfbRect,
        dst: &mut SoftwareSurface,
        dst_width: u32,
        dst_height: u32,
        filter: SampleFilter,
    ) {
        self.counters.downsamples += 1;
        let (sw, sh) = (src_rect.width(), src_rect.height());
        if sw == 0 || sh == 0 {
            return;
        }
        let dst_width = dst_width.min(dst.desc.width);
        let dst_height = dst_height.min(dst.desc.height);
        for y in 0..dst_height {
            let y0 = src_rect.top + y * sh / dst_height;
            let y1 = (src_rect.top + (y + 1) * sh / dst_height).max(y0 + 1);
            for x in 0..dst_width {
                let x0 = src_rect.left + x * sw / dst_width;
                let x1 = (src_rect.left + (x + 1) * sw / dst_width).max(x0 + 1);
                let value = match filter {
                    SampleFilter::Point => src.texel((x0 + x1 - 1) / 2, (y0 + y1 - 1) / 2, 0, 0),
                    SampleFilter::Linear => average(
                        (y0..y1).flat_map(|sy| (x0..x1).map(move |sx| src.texel(sx, sy, 0, 0))),
                    ),
                };
                let i = dst.index(x, y, 0, 0);
                dst.texels[i] = value;
            }
        }
    }

    fn copy_to_staging(
        &mut self,
        src: &SoftwareSurface,
        src_rect: EfbRect,
        staging: &mut SoftwareStaging,
        dst_x: u32,
        dst_y: u32,
    ) {
        self.counters.staging_copies += 1;
        let rect = src_rect.clamped(src.desc.width, src.desc.height);
        let texels = (rect.top..rect.bottom)
            .flat_map(|y| (rect.left..rect.right).map(move |x| src.texel(x, y, 0, 0)))
            .collect();
        staging.pending.push(PendingCopy {
            dst_x,
            dst_y,
            width: rect.width(),
            texels,
        });
    }

    fn flush_staging(&mut self, staging: &mut SoftwareStaging) {
        self.counters.staging_flushes += 1;
        for copy in staging.pending.drain(..) {
            if copy.width == 0 {
                continue;
            }
            for (row, chunk) in copy.texels.chunks(copy.width as usize).enumerate() {
                let y = copy.dst_y + row as u32;
                if y >= staging.height {
                    break;
                }
                for (col, texel) in chunk.iter().enumerate() {
                    let x = copy.dst_x + col as u32;
                    if x < staging.width {
                        staging.visible[(y * staging.width + x) as usize] = *texel;
                    }
                }
            }
        }
    }

    fn read_texel(&self, staging: &SoftwareStaging, x: u32, y: u32) -> u32 {
        staging.visible[(y * staging.width + x) as usize]
    }

    fn write_texel(&mut self, staging: &mut SoftwareStaging, x: u32, y: u32, value: u32) {
        staging.visible[(y * staging.width + x) as usize] = value;
    }

    fn draw_pokes(
        &mut self,
        color: &mut SoftwareSurface,
        depth: &mut SoftwareSurface,
        plane: EfbPlane,
        topology: PokeTopology,
        vertices: &[u8],
    ) {
        let vertices: Vec<PokeVertex> = vertices
            .chunks_exact(size_of::<PokeVertex>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        self.counters.poke_draws += 1;
        self.counters.poke_vertices += vertices.len() as u64;

        let (w, h) = (color.desc.width, color.desc.height);
        let target = match plane {
            EfbPlane::Color => color,
            EfbPlane::Depth => depth,
        };
        let mut draw = |xs: (u32, u32), ys: (u32, u32), v: &PokeVertex| {
            let value = match plane {
                EfbPlane::Color => v.color,
                EfbPlane::Depth => v.position[2].to_bits(),
            };
            for y in ys.0..ys.1 {
                for x in xs.0..xs.1 {
                    target.fill(x, y, value);
                }
            }
        };

        match topology {
            PokeTopology::Points => {
                for v in &vertices {
                    let [cx, cy, _, size] = v.position;
                    let half_w = size / w as f32;
                    let half_h = size / h as f32;
                    let xs = Self::span(cx - half_w, cx + half_w, w);
                    let ys = self.row_span(cy - half_h, cy + half_h, h);
                    draw(xs, ys, v);
                }
            }
            PokeTopology::Triangles => {
                for quad in vertices.chunks_exact(6) {
                    let (mut min_x, mut max_x) = (f32::MAX, f32::MIN);
                    let (mut min_y, mut max_y) = (f32::MAX, f32::MIN);
                    for v in quad {
                        min_x = min_x.min(v.position[0]);
                        max_x = max_x.max(v.position[0]);
                        min_y = min_y.min(v.position[1]);
                        max_y = max_y.max(v.position[1]);
                    }
                    let xs = Self::span(min_x, max_x, w);
                    let ys = self.row_span(min_y, max_y, h);
                    draw(xs, ys, &quad[0]);
                }
            }
        }
    }

    fn read_surface(&mut self, surface: &SoftwareSurface) -> SurfaceImage {
        let d = surface.desc;
        let count = SurfaceImage::texel_count(d.width, d.height, d.layers).unwrap_or_default();
        let mut texels = Vec::with_capacity(count);
        for layer in 0..d.layers {
            for y in 0..d.height {
                for x in 0..d.width {
                    texels.push(surface.texel(x, y, layer, 0));
                }
            }
        }
        SurfaceImage {
            width: d.width,
            height: d.height,
            layers: d.layers,
            texels,
        }
    }

    fn restore(
        &mut self,
        color: &mut SoftwareSurface,
        depth: &mut SoftwareSurface,
        color_image: &SurfaceImage,
        depth_image: &SurfaceImage,
    ) {
        for (surface, image) in [(color, color_image), (depth, depth_image)] {
            let d = surface.desc;
            if image.width == 0 || image.height == 0 {
                continue;
            }
            for layer in 0..d.layers.min(image.layers) {
                for y in 0..d.height {
                    let sy = y * image.height / d.height;
                    for x in 0..d.width {
                        let sx = x * image.width / d.width;
                        let texel = image.texels[((layer * image.height + sy) * image.width + sx) as usize];
                        for sample in 0..d.samples {
                            let i = surface.index(x, y, layer, sample);
                            surface.texels[i] = texel;
                        }
                    }
                }
            }
        }
    }

    fn submit(&mut self) {
        self.counters.submits += 1;
    }
}
