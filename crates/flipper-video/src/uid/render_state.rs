//! Fixed-function state carried by a program identity.

use super::codec::{wire_enum, FixedCodec, UidDecodeError, UidReader, UidWriter};

wire_enum! {
    pub enum PrimitiveType {
        Points = 0,
        Lines = 1,
        Triangles = 2,
        TriangleStrip = 3,
    }
}

impl PrimitiveType {
    pub fn is_triangles(self) -> bool {
        matches!(self, Self::Triangles | Self::TriangleStrip)
    }
}

wire_enum! {
    pub enum CullMode {
        None = 0,
        Back = 1,
        Front = 2,
        All = 3,
    }
}

wire_enum! {
    pub enum CompareMode {
        Never = 0,
        Less = 1,
        Equal = 2,
        LEqual = 3,
        Greater = 4,
        NEqual = 5,
        GEqual = 6,
        Always = 7,
    }
}

wire_enum! {
    pub enum BlendFactor {
        Zero = 0,
        One = 1,
        SrcColor = 2,
        InvSrcColor = 3,
        DstColor = 4,
        InvDstColor = 5,
        SrcAlpha = 6,
        InvSrcAlpha = 7,
        DstAlpha = 8,
        InvDstAlpha = 9,
    }
}

impl BlendFactor {
    /// Source-alpha factors read the second colour output when dual-source blending is on.
    pub fn is_dual_source(self) -> bool {
        matches!(self, Self::SrcAlpha | Self::InvSrcAlpha)
    }
}

wire_enum! {
    pub enum LogicOp {
        Clear = 0,
        And = 1,
        AndReverse = 2,
        Copy = 3,
        AndInverted = 4,
        NoOp = 5,
        Xor = 6,
        Or = 7,
        Nor = 8,
        Equiv = 9,
        Invert = 10,
        OrReverse = 11,
        CopyInverted = 12,
        OrInverted = 13,
        Nand = 14,
        Set = 15,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RasterizationState {
    pub primitive: PrimitiveType,
    pub cull_mode: CullMode,
}

impl RasterizationState {
    pub fn cull_back(primitive: PrimitiveType) -> Self {
        Self {
            primitive,
            cull_mode: CullMode::Back,
        }
    }

    pub fn no_cull(primitive: PrimitiveType) -> Self {
        Self {
            primitive,
            cull_mode: CullMode::None,
        }
    }
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self::no_cull(PrimitiveType::Triangles)
    }
}

impl FixedCodec for RasterizationState {
    const SERIALIZED_LEN: usize = 2;

    fn encode(&self, w: &mut UidWriter) {
        w.enumeration(self.primitive);
        w.enumeration(self.cull_mode);
    }

    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError> {
        Ok(Self {
            primitive: r.enumeration("primitive")?,
            cull_mode: r.enumeration("cull_mode")?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub test_enable: bool,
    pub update_enable: bool,
    pub func: CompareMode,
}

impl DepthState {
    pub fn no_depth_testing() -> Self {
        Self {
            test_enable: false,
            update_enable: false,
            func: CompareMode::Always,
        }
    }

    pub fn always_write() -> Self {
        Self {
            test_enable: true,
            update_enable: true,
            func: CompareMode::Always,
        }
    }
}

impl Default for DepthState {
    fn default() -> Self {
        Self::no_depth_testing()
    }
}

impl FixedCodec for DepthState {
    const SERIALIZED_LEN: usize = 3;

    fn encode(&self, w: &mut UidWriter) {
        w.bool(self.test_enable);
        w.bool(self.update_enable);
        w.enumeration(self.func);
    }

    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError> {
        Ok(Self {
            test_enable: r.bool("depth.test_enable")?,
            update_enable: r.bool("depth.update_enable")?,
            func: r.enumeration("depth.func")?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlendingState {
    pub blend_enable: bool,
    pub logic_op_enable: bool,
    pub color_update: bool,
    pub alpha_update: bool,
    pub use_dual_src: bool,
    pub subtract: bool,
    pub subtract_alpha: bool,
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub src_factor_alpha: BlendFactor,
    pub dst_factor_alpha: BlendFactor,
    pub logic_mode: LogicOp,
}

struct LogicOpApproximation {
    blend_enable: bool,
    subtract: bool,
    src_factor: BlendFactor,
    dst_factor: BlendFactor,
}

const fn approx(
    blend_enable: bool,
    subtract: bool,
    src_factor: BlendFactor,
    dst_factor: BlendFactor,
) -> LogicOpApproximation {
    LogicOpApproximation {
        blend_enable,
        subtract,
        src_factor,
        dst_factor,
    }
}

// Indexed by `LogicOp`. Entries with blending off rely on the pixel stage writing 0 or 1.
#[rustfmt::skip]
const LOGIC_OP_APPROXIMATIONS: [LogicOpApproximation; 16] = {
    use BlendFactor::*;
    [
        approx(false, false, One,         Zero),        // Clear
        approx(true,  false, DstColor,    Zero),        // And
        approx(true,  true,  One,         InvSrcColor), // AndReverse
        approx(false, false, One,         Zero),        // Copy
        approx(true,  true,  DstColor,    One),         // AndInverted
        approx(true,  false, Zero,        One),         // NoOp
        approx(true,  false, InvDstColor, InvSrcColor), // Xor
        approx(true,  false, InvDstColor, One),         // Or
        approx(true,  false, InvSrcColor, InvDstColor), // Nor
        approx(true,  false, InvSrcColor, Zero),        // Equiv
        approx(false, false, InvDstColor, InvDstColor), // Invert
        approx(true,  false, One,         InvDstAlpha), // OrReverse
        approx(false, false, InvSrcColor, InvSrcColor), // CopyInverted
        approx(true,  false, InvDstColor, One),         // OrInverted
        approx(true,  false, InvDstColor, InvSrcColor), // Nand
        approx(false, false, One,         Zero),        // Set
    ]
};

impl BlendingState {
    pub fn no_blending() -> Self {
        Self {
            blend_enable: false,
            logic_op_enable: false,
            color_update: true,
            alpha_update: true,
            use_dual_src: false,
            subtract: false,
            subtract_alpha: false,
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            src_factor_alpha: BlendFactor::One,
            dst_factor_alpha: BlendFactor::Zero,
            logic_mode: LogicOp::Copy,
        }
    }

    /// Every field cleared except the colour/alpha write masks.
    pub fn write_mask_only(color_update: bool, alpha_update: bool) -> Self {
        Self {
            blend_enable: false,
            logic_op_enable: false,
            color_update,
            alpha_update,
            use_dual_src: false,
            subtract: false,
            subtract_alpha: false,
            src_factor: BlendFactor::Zero,
            dst_factor: BlendFactor::Zero,
            src_factor_alpha: BlendFactor::Zero,
            dst_factor_alpha: BlendFactor::Zero,
            logic_mode: LogicOp::Clear,
        }
    }

    pub fn requires_dual_src(&self) -> bool {
        let reads_second_output = self.src_factor.is_dual_source()
            || self.src_factor_alpha.is_dual_source()
            || self.dst_factor.is_dual_source()
            || self.dst_factor_alpha.is_dual_source();
        reads_second_output && self.blend_enable && self.use_dual_src
    }

    pub fn logic_op_approximation_is_exact(&self) -> bool {
        matches!(
            self.logic_mode,
            LogicOp::Clear
                | LogicOp::Set
                | LogicOp::NoOp
                | LogicOp::Invert
                | LogicOp::CopyInverted
                | LogicOp::Copy
        )
    }

    /// Modes whose approximation only works if the pixel stage forces its output.
    pub fn logic_op_approximation_wants_shader_help(&self) -> bool {
        matches!(
            self.logic_mode,
            LogicOp::Clear | LogicOp::Set | LogicOp::NoOp | LogicOp::Invert | LogicOp::CopyInverted
        )
    }

    pub fn approximate_logic_op_with_blending(&mut self) {
        let approximation = &LOGIC_OP_APPROXIMATIONS[self.logic_mode as usize];
        self.logic_op_enable = false;
        self.use_dual_src = false;
        if approximation.blend_enable {
            self.blend_enable = true;
            self.subtract = approximation.subtract;
            self.src_factor = approximation.src_factor;
            self.dst_factor = approximation.dst_factor;
        }
    }
}

impl Default for BlendingState {
    fn default() -> Self {
        Self::no_blending()
    }
}

impl FixedCodec for BlendingState {
    const SERIALIZED_LEN: usize = 12;

    fn encode(&self, w: &mut UidWriter) {
        w.bool(self.blend_enable);
        w.bool(self.logic_op_enable);
        w.bool(self.color_update);
        w.bool(self.alpha_update);
        w.bool(self.use_dual_src);
        w.bool(self.subtract);
        w.bool(self.subtract_alpha);
        w.enumeration(self.src_factor);
        w.enumeration(self.dst_factor);
        w.enumeration(self.src_factor_alpha);
        w.enumeration(self.dst_factor_alpha);
        w.enumeration(self.logic_mode);
    }

    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError> {
        Ok(Self {
            blend_enable: r.bool("blend.blend_enable")?,
            logic_op_enable: r.bool("blend.logic_op_enable")?,
            color_update: r.bool("blend.color_update")?,
            alpha_update: r.bool("blend.alpha_update")?,
            use_dual_src: r.bool("blend.use_dual_src")?,
            subtract: r.bool("blend.subtract")?,
            subtract_alpha: r.bool("blend.subtract_alpha")?,
            src_factor: r.enumeration("blend.src_factor")?,
            dst_factor: r.enumeration("blend.dst_factor")?,
            src_factor_alpha: r.enumeration("blend.src_factor_alpha")?,
            dst_factor_alpha: r.enumeration("blend.dst_factor_alpha")?,
            logic_mode: r.enumeration("blend.logic_mode")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approximation_table_follows_logic_op_order() {
        assert_eq!(LOGIC_OP_APPROXIMATIONS.len(), LogicOp::ALL.len());
        for (index, op) in LogicOp::ALL.iter().enumerate() {
            assert_eq!(*op as usize, index);
        }
    }

    #[test]
    fn approximating_xor_enables_blending_and_drops_logic_op() {
        let mut state = BlendingState {
            logic_op_enable: true,
            logic_mode: LogicOp::Xor,
            use_dual_src: true,
            ..BlendingState::no_blending()
        };
        assert!(!state.logic_op_approximation_is_exact());
        state.approximate_logic_op_with_blending();
        assert!(!state.logic_op_enable);
        assert!(!state.use_dual_src);
        assert!(state.blend_enable);
        assert_eq!(state.src_factor, BlendFactor::InvDstColor);
        assert_eq!(state.dst_factor, BlendFactor::InvSrcColor);
    }

    #[test]
    fn dual_source_requires_blending_and_an_alpha_factor() {
        let mut state = BlendingState {
            blend_enable: true,
            use_dual_src: true,
            src_factor: BlendFactor::SrcAlpha,
            dst_factor: BlendFactor::InvSrcAlpha,
            ..BlendingState::no_blending()
        };
        assert!(state.requires_dual_src());
        state.blend_enable = false;
        assert!(!state.requires_dual_src());
    }
}
