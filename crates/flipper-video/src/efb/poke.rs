use bytemuck::{Pod, Zeroable};

use super::device::PokeTopology;
use super::{EFB_HEIGHT, EFB_WIDTH};

/// Vertex layout of the poke pass. `position.w` carries the point size when pokes are drawn
/// as large points.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PokeVertex {
    pub position: [f32; 4],
    pub color: u32,
}

/// Vertices one poke can add to a batch.
pub(crate) const VERTICES_PER_POKE: usize = 6;

pub(crate) fn topology(large_points: bool) -> PokeTopology {
    if large_points {
        PokeTopology::Points
    } else {
        PokeTopology::Triangles
    }
}

/// Appends the clip-space geometry covering native EFB texel `(x, y)`.
pub(crate) fn push_poke(
    batch: &mut Vec<PokeVertex>,
    x: u32,
    y: u32,
    z: f32,
    color: u32,
    scale: u32,
    large_points: bool,
) {
    let texel_w = 2.0 / EFB_WIDTH as f32;
    let texel_h = 2.0 / EFB_HEIGHT as f32;

    if large_points {
        let cx = (x as f32 + 0.5) * texel_w - 1.0;
        let cy = 1.0 - (y as f32 + 0.5) * texel_h;
        batch.push(PokeVertex {
            position: [cx, cy, z, scale as f32],
            color,
        });
        return;
    }

    let x0 = x as f32 * texel_w - 1.0;
    let y0 = 1.0 - y as f32 * texel_h;
    let x1 = x0 + texel_w;
    let y1 = y0 - texel_h;
    let v = |px: f32, py: f32| PokeVertex {
        position: [px, py, z, 1.0],
        color,
    };
    batch.extend_from_slice(&[
        v(x0, y0),
        v(x1, y0),
        v(x0, y1),
        v(x1, y0),
        v(x0, y1),
        v(x1, y1),
    ]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<PokeVertex>(), 20);
    }

    #[test]
    fn large_points_emit_one_vertex_sized_by_scale() {
        let mut batch = Vec::new();
        push_poke(&mut batch, 0, 0, 0.5, 0xFF00_00FF, 3, true);
        assert_eq!(batch.len(), 1);
        let [x, y, z, size] = batch[0].position;
        assert!((x - (-1.0 + 1.0 / EFB_WIDTH as f32)).abs() < 1e-6);
        assert!((y - (1.0 - 1.0 / EFB_HEIGHT as f32)).abs() < 1e-6);
        assert_eq!(z, 0.5);
        assert_eq!(size, 3.0);
    }

    #[test]
    fn quads_cover_exactly_one_texel() {
        let mut batch = Vec::new();
        push_poke(&mut batch, EFB_WIDTH - 1, EFB_HEIGHT - 1, 0.0, 7, 1, false);
        assert_eq!(batch.len(), VERTICES_PER_POKE);
        let max_x = batch.iter().map(|v| v.position[0]).fold(f32::MIN, f32::max);
        let min_y = batch.iter().map(|v| v.position[1]).fold(f32::MAX, f32::min);
        assert!((max_x - 1.0).abs() < 1e-5);
        assert!((min_y + 1.0).abs() < 1e-5);
        assert!(batch.iter().all(|v| v.color == 7));
    }
}
