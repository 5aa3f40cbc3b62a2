use super::codec::{wire_enum, FixedCodec, UidDecodeError, UidReader, UidWriter};

wire_enum! {
    pub enum ComponentFormat {
        UByte = 0,
        Byte = 1,
        UShort = 2,
        Short = 3,
        Float = 4,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttributeFormat {
    pub format: ComponentFormat,
    pub components: u8,
    pub offset: u16,
    pub enable: bool,
    pub integer: bool,
}

impl AttributeFormat {
    pub const DISABLED: Self = Self {
        format: ComponentFormat::UByte,
        components: 0,
        offset: 0,
        enable: false,
        integer: false,
    };

    pub fn float(components: u8, offset: u16) -> Self {
        Self {
            format: ComponentFormat::Float,
            components,
            offset,
            enable: true,
            integer: false,
        }
    }
}

impl Default for AttributeFormat {
    fn default() -> Self {
        Self::DISABLED
    }
}

impl FixedCodec for AttributeFormat {
    const SERIALIZED_LEN: usize = 6;

    fn encode(&self, w: &mut UidWriter) {
        w.enumeration(self.format);
        w.u8(self.components);
        w.u16(self.offset);
        w.bool(self.enable);
        w.bool(self.integer);
    }

    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError> {
        Ok(Self {
            format: r.enumeration("attribute.format")?,
            components: r.u8()?,
            offset: r.u16()?,
            enable: r.bool("attribute.enable")?,
            integer: r.bool("attribute.integer")?,
        })
    }
}

/// Host-side description of one vertex buffer layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u32,
    pub position: AttributeFormat,
    pub normals: [AttributeFormat; 3],
    pub colors: [AttributeFormat; 2],
    pub texcoords: [AttributeFormat; 8],
    pub posmtx: AttributeFormat,
}

impl VertexLayout {
    /// A layout with only a float4 position, used for über pipelines whose loader is
    /// expanded at bind time.
    pub fn position_only() -> Self {
        Self {
            stride: 16,
            position: AttributeFormat::float(4, 0),
            ..Self::default()
        }
    }

    fn attributes(&self) -> impl Iterator<Item = &AttributeFormat> {
        std::iter::once(&self.position)
            .chain(self.normals.iter())
            .chain(self.colors.iter())
            .chain(self.texcoords.iter())
            .chain(std::iter::once(&self.posmtx))
    }
}

impl FixedCodec for VertexLayout {
    const SERIALIZED_LEN: usize = 4 + 15 * AttributeFormat::SERIALIZED_LEN;

    fn encode(&self, w: &mut UidWriter) {
        w.u32(self.stride);
        for attribute in self.attributes() {
            attribute.encode(w);
        }
    }

    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError> {
        let stride = r.u32()?;
        let position = AttributeFormat::decode(r)?;
        let mut normals = [AttributeFormat::DISABLED; 3];
        for normal in &mut normals {
            *normal = AttributeFormat::decode(r)?;
        }
        let mut colors = [AttributeFormat::DISABLED; 2];
        for color in &mut colors {
            *color = AttributeFormat::decode(r)?;
        }
        let mut texcoords = [AttributeFormat::DISABLED; 8];
        for texcoord in &mut texcoords {
            *texcoord = AttributeFormat::decode(r)?;
        }
        let posmtx = AttributeFormat::decode(r)?;
        Ok(Self {
            stride,
            position,
            normals,
            colors,
            texcoords,
            posmtx,
        })
    }
}
