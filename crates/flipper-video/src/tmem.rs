//! Presence heuristic for the emulated GPU's texture memory.
//!
//! TMEM is not emulated byte for byte. Each texture unit tracks the even and odd TMEM regions
//! its registers configure, and whether the texture last bound to it is still resident. Texture
//! caching uses [`Tmem::is_cached`] to skip reloading textures that real hardware would not
//! have reloaded either.

use bitflags::bitflags;

use crate::error::{SnapshotError, SnapshotResult};
use crate::snapshot::{SnapshotReader, SnapshotVersion, SnapshotWriter, StateSnapshot};

pub const TEXTURE_UNITS: usize = 8;

bitflags! {
    /// Texture units sampled by one draw.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TextureUnits: u8 {
        const UNIT0 = 1 << 0;
        const UNIT1 = 1 << 1;
        const UNIT2 = 1 << 2;
        const UNIT3 = 1 << 3;
        const UNIT4 = 1 << 4;
        const UNIT5 = 1 << 5;
        const UNIT6 = 1 << 6;
        const UNIT7 = 1 << 7;
    }
}

impl TextureUnits {
    pub fn unit(index: usize) -> Self {
        assert!(index < TEXTURE_UNITS, "texture unit {index} out of range");
        Self::from_bits_retain(1 << index)
    }

    pub fn indices(self) -> impl Iterator<Item = usize> {
        (0..TEXTURE_UNITS).filter(move |&i| self.bits() & (1 << i) != 0)
    }
}

/// Per-unit registers that configure TMEM regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TmemRegister {
    /// Even region base and cache size (plus the image type, which is ignored here).
    SetImage1,
    /// Odd region base and cache size.
    SetImage2,
}

impl TmemRegister {
    /// Maps a register address to the unit and register it configures. Units 0-3 and 4-7 live
    /// in separate register banks.
    pub fn decode(address: u8) -> Option<(usize, Self)> {
        match address {
            0x8C..=0x8F => Some((usize::from(address - 0x8C), Self::SetImage1)),
            0x90..=0x93 => Some((usize::from(address - 0x90), Self::SetImage2)),
            0xAC..=0xAF => Some((usize::from(address - 0xAC) + 4, Self::SetImage1)),
            0xB0..=0xB3 => Some((usize::from(address - 0xB0) + 4, Self::SetImage2)),
            _ => None,
        }
    }

    pub fn address(self, unit: usize) -> u8 {
        assert!(unit < TEXTURE_UNITS, "texture unit {unit} out of range");
        let (low, high) = match self {
            Self::SetImage1 => (0x8C, 0xAC),
            Self::SetImage2 => (0x90, 0xB0),
        };
        if unit < 4 {
            low + unit as u8
        } else {
            high + (unit - 4) as u8
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnitState {
    /// Registers changed or TMEM was invalidated since the last bind.
    #[default]
    Invalid,
    /// Bound, but the texture does not stay resident.
    Valid,
    /// Bound and resident.
    Cached,
}

impl UnitState {
    fn raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Option<Self> {
        [Self::Invalid, Self::Valid, Self::Cached]
            .get(usize::from(raw))
            .copied()
    }
}

/// One TMEM region. `width` and `height` are the register's size codes, not byte counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Region {
    pub width: u32,
    pub height: u32,
    pub base: u32,
    /// Bytes in use, computed at bind time. Zero when the region is unused.
    pub size: u32,
}

impl Region {
    fn from_register(value: u32) -> Self {
        Self {
            width: (value >> 15) & 0x7,
            height: (value >> 18) & 0x7,
            base: (value & 0x7FFF) << 5,
            size: 0,
        }
    }

    /// Capacity of a region configured with these size codes.
    ///
    /// Only the three equal-code sizes are documented. Everything else follows a guessed
    /// formula that has not been checked against hardware.
    pub fn capacity(&self) -> u32 {
        if self.width == self.height {
            match self.width {
                3 => return 32 * 1024,
                4 => return 128 * 1024,
                5 => return 512 * 1024,
                _ => {}
            }
        }
        512 * (1 << self.width) * (1 << self.height)
    }

    fn overlaps(&self, other: &Region) -> bool {
        if self.size == 0 || other.size == 0 {
            return false;
        }
        self.base < other.base + other.size && other.base < self.base + self.size
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct TextureUnit {
    even: Region,
    odd: Region,
    state: UnitState,
}

impl TextureUnit {
    fn overlaps(&self, other: &TextureUnit) -> bool {
        if self.state == UnitState::Invalid || other.state == UnitState::Invalid {
            return false;
        }
        [&self.even, &self.odd]
            .into_iter()
            .any(|a| a.overlaps(&other.even) || a.overlaps(&other.odd))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tmem {
    units: [TextureUnit; TEXTURE_UNITS],
}

impl Tmem {
    pub fn new() -> Self {
        Self::default()
    }

    fn unit_mut(&mut self, unit: usize) -> &mut TextureUnit {
        assert!(unit < TEXTURE_UNITS, "texture unit {unit} out of range");
        &mut self.units[unit]
    }

    fn unit(&self, unit: usize) -> &TextureUnit {
        assert!(unit < TEXTURE_UNITS, "texture unit {unit} out of range");
        &self.units[unit]
    }

    /// Applies a write to one of `unit`'s region registers. Any change invalidates the unit.
    pub fn configuration_changed(&mut self, unit: usize, register: TmemRegister, value: u32) {
        let unit = self.unit_mut(unit);
        unit.state = UnitState::Invalid;
        match register {
            TmemRegister::SetImage1 => unit.even = Region::from_register(value),
            TmemRegister::SetImage2 => unit.odd = Region::from_register(value),
        }
    }

    /// Feeds a raw register write. Returns whether the register belongs to TMEM.
    pub fn write_register(&mut self, address: u8, value: u32) -> bool {
        match TmemRegister::decode(address) {
            Some((unit, register)) => {
                self.configuration_changed(unit, register, value);
                true
            }
            None => false,
        }
    }

    pub fn invalidate_all(&mut self) {
        for unit in &mut self.units {
            unit.state = UnitState::Invalid;
        }
    }

    /// Handles the invalidate command. Its parameter nominally selects an address range;
    /// nothing depends on partial invalidation, so everything is dropped.
    pub fn invalidate(&mut self, _param: u32) {
        self.invalidate_all();
    }

    /// Records a texture bind. `width` and `height` are in 32-byte texture tiles.
    ///
    /// Every texture uses the even region; mipmapped and 32-bit textures also use the odd one.
    pub fn bind(&mut self, unit: usize, width: u32, height: u32, mipmapped: bool, is_32_bit: bool) {
        let unit = self.unit_mut(unit);
        let footprint = u64::from(width) * u64::from(height) * 32;

        unit.even.size = unit.even.capacity();
        let mut fits = footprint <= u64::from(unit.even.size);
        if mipmapped || is_32_bit {
            unit.odd.size = unit.odd.capacity();
            fits = fits && footprint <= u64::from(unit.odd.size);
        } else {
            unit.odd.size = 0;
        }

        // Games expect a mipmapped texture to occupy twice the base level.
        if mipmapped {
            unit.even.size *= 2;
            if is_32_bit {
                unit.odd.size *= 2;
            }
        }

        unit.state = if fits {
            UnitState::Cached
        } else {
            UnitState::Valid
        };
    }

    /// Drops residency of any used unit whose regions collide, with itself or with another used
    /// unit. Runs once per draw, after every unit has been bound.
    pub fn finalize_binds(&mut self, used: TextureUnits) {
        for i in used.indices() {
            if self.units[i].even.overlaps(&self.units[i].odd) {
                self.units[i].state = UnitState::Valid;
            }
            for j in used.indices().filter(|&j| j != i) {
                if self.units[i].overlaps(&self.units[j]) {
                    self.units[i].state = UnitState::Valid;
                }
            }
        }
    }

    pub fn is_cached(&self, unit: usize) -> bool {
        self.unit(unit).state == UnitState::Cached
    }

    pub fn is_valid(&self, unit: usize) -> bool {
        self.unit(unit).state != UnitState::Invalid
    }

    pub fn state(&self, unit: usize) -> UnitState {
        self.unit(unit).state
    }

    pub fn regions(&self, unit: usize) -> (Region, Region) {
        let unit = self.unit(unit);
        (unit.even, unit.odd)
    }
}

impl StateSnapshot for Tmem {
    const DEVICE_ID: [u8; 4] = *b"TMEM";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);
}

const TAG_UNITS: u16 = 1;
const UNIT_LEN: usize = 8 * 4 + 1;

impl Tmem {
    pub fn save_state(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(UNIT_LEN * TEXTURE_UNITS);
        for unit in &self.units {
            for region in [unit.even, unit.odd] {
                for v in [region.width, region.height, region.base, region.size] {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
            }
            bytes.push(unit.state.raw());
        }
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_UNITS, bytes);
        w.finish()
    }

    pub fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;
        let raw = r.bytes(TAG_UNITS).ok_or(SnapshotError::UnexpectedEof)?;
        if raw.len() != UNIT_LEN * TEXTURE_UNITS {
            return Err(SnapshotError::InvalidFieldEncoding("tmem units"));
        }

        let mut units = [TextureUnit::default(); TEXTURE_UNITS];
        for (unit, chunk) in units.iter_mut().zip(raw.chunks_exact(UNIT_LEN)) {
            let word = |i: usize| {
                u32::from_le_bytes([chunk[i * 4], chunk[i * 4 + 1], chunk[i * 4 + 2], chunk[i * 4 + 3]])
            };
            let region = |i: usize| Region {
                width: word(i),
                height: word(i + 1),
                base: word(i + 2),
                size: word(i + 3),
            };
            unit.even = region(0);
            unit.odd = region(4);
            unit.state = UnitState::from_raw(chunk[UNIT_LEN - 1])
                .ok_or(SnapshotError::InvalidFieldEncoding("tmem unit state"))?;
        }
        self.units = units;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn image_register(base: u32, width: u32, height: u32) -> u32 {
        (base >> 5) | (width << 15) | (height << 18)
    }

    /// Unit with a 32 KiB even region at `even` and a 32 KiB odd region at `odd`.
    fn configure(tmem: &mut Tmem, unit: usize, even: u32, odd: u32) {
        tmem.configuration_changed(unit, TmemRegister::SetImage1, image_register(even, 3, 3));
        tmem.configuration_changed(unit, TmemRegister::SetImage2, image_register(odd, 3, 3));
    }

    #[test]
    fn register_addresses_cover_both_banks() {
        assert_eq!(TmemRegister::decode(0x8C), Some((0, TmemRegister::SetImage1)));
        assert_eq!(TmemRegister::decode(0x93), Some((3, TmemRegister::SetImage2)));
        assert_eq!(TmemRegister::decode(0xAD), Some((5, TmemRegister::SetImage1)));
        assert_eq!(TmemRegister::decode(0xB3), Some((7, TmemRegister::SetImage2)));
        assert_eq!(TmemRegister::decode(0x94), None);
        for unit in 0..TEXTURE_UNITS {
            for register in [TmemRegister::SetImage1, TmemRegister::SetImage2] {
                assert_eq!(TmemRegister::decode(register.address(unit)), Some((unit, register)));
            }
        }
    }

    #[test]
    fn register_fields_decode() {
        let mut tmem = Tmem::new();
        assert!(tmem.write_register(0x8D, image_register(0x8000, 4, 5)));
        let (even, _) = tmem.regions(1);
        assert_eq!((even.base, even.width, even.height), (0x8000, 4, 5));
        assert!(!tmem.write_register(0x20, u32::MAX));
    }

    #[test]
    fn documented_sizes_and_the_fallback() {
        let region = |width, height| Region {
            width,
            height,
            ..Region::default()
        };
        assert_eq!(region(3, 3).capacity(), 32 * 1024);
        assert_eq!(region(4, 4).capacity(), 128 * 1024);
        assert_eq!(region(5, 5).capacity(), 512 * 1024);
        assert_eq!(region(3, 4).capacity(), 512 * 8 * 16);
        assert_eq!(region(0, 0).capacity(), 512);
    }

    #[test]
    fn small_texture_is_cached_large_one_only_valid() {
        let mut tmem = Tmem::new();
        configure(&mut tmem, 0, 0, 0x8_0000);
        assert!(!tmem.is_valid(0));

        tmem.bind(0, 32, 32, false, false);
        assert!(tmem.is_cached(0));
        assert_eq!(tmem.regions(0).1.size, 0);

        tmem.bind(0, 64, 32, false, false);
        assert_eq!(tmem.state(0), UnitState::Valid);
    }

    #[test]
    fn mipmaps_double_the_even_region() {
        let mut tmem = Tmem::new();
        configure(&mut tmem, 0, 0, 0x8_0000);
        tmem.bind(0, 32, 32, true, false);
        let (even, odd) = tmem.regions(0);
        assert_eq!(even.size, 64 * 1024);
        assert_eq!(odd.size, 32 * 1024);

        tmem.bind(0, 32, 32, true, true);
        assert_eq!(tmem.regions(0).1.size, 64 * 1024);
    }

    #[test]
    fn overlapping_units_are_downgraded() {
        let mut tmem = Tmem::new();
        configure(&mut tmem, 0, 0, 0x8_0000);
        configure(&mut tmem, 1, 0x4000, 0x9_0000);
        tmem.bind(0, 16, 16, false, false);
        tmem.bind(1, 16, 16, false, false);
        assert!(tmem.is_cached(0) && tmem.is_cached(1));

        tmem.finalize_binds(TextureUnits::UNIT0 | TextureUnits::UNIT1);
        assert!(!tmem.is_cached(0));
        assert!(!tmem.is_cached(1));
        assert!(tmem.is_valid(0) && tmem.is_valid(1));
    }

    #[test]
    fn unused_units_do_not_collide() {
        let mut tmem = Tmem::new();
        configure(&mut tmem, 0, 0, 0x8_0000);
        configure(&mut tmem, 1, 0, 0x8_0000);
        tmem.bind(0, 16, 16, false, false);
        tmem.bind(1, 16, 16, false, false);
        tmem.finalize_binds(TextureUnits::UNIT0);
        assert!(tmem.is_cached(0));
    }

    #[test]
    fn a_unit_overlapping_itself_is_downgraded() {
        let mut tmem = Tmem::new();
        configure(&mut tmem, 2, 0x1000, 0x2000);
        tmem.bind(2, 16, 16, false, true);
        assert!(tmem.is_cached(2));
        tmem.finalize_binds(TextureUnits::unit(2));
        assert_eq!(tmem.state(2), UnitState::Valid);
    }

    #[test]
    fn invalidate_drops_every_unit() {
        let mut tmem = Tmem::new();
        for unit in 0..TEXTURE_UNITS {
            configure(&mut tmem, unit, unit as u32 * 0x1_0000, 0x8_0000 + unit as u32 * 0x1_0000);
            tmem.bind(unit, 1, 1, false, false);
        }
        tmem.invalidate(0x1234);
        assert!((0..TEXTURE_UNITS).all(|unit| !tmem.is_valid(unit)));
    }

    #[test]
    fn state_round_trips() {
        let mut tmem = Tmem::new();
        configure(&mut tmem, 3, 0x2000, 0x9_0000);
        tmem.bind(3, 8, 8, true, true);
        let bytes = tmem.save_state();

        let mut restored = Tmem::new();
        restored.load_state(&bytes).unwrap();
        assert_eq!(restored, tmem);

        let mut truncated = bytes.clone();
        truncated.truncate(bytes.len() - 1);
        assert!(restored.load_state(&truncated).is_err());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn unit_index_is_checked() {
        Tmem::new().bind(8, 1, 1, false, false);
    }

    proptest! {
        #[test]
        fn register_write_always_invalidates(unit in 0usize..TEXTURE_UNITS, odd in any::<bool>(), value in any::<u32>()) {
            let mut tmem = Tmem::new();
            configure(&mut tmem, unit, 0, 0x8_0000);
            tmem.bind(unit, 1, 1, false, false);
            prop_assert!(tmem.is_valid(unit));

            let register = if odd { TmemRegister::SetImage2 } else { TmemRegister::SetImage1 };
            tmem.configuration_changed(unit, register, value);
            prop_assert!(!tmem.is_valid(unit));
        }

        #[test]
        fn finalize_never_upgrades(binds in proptest::collection::vec((0u32..0x8000, 0u32..0x8000, 1u32..64, 1u32..64, any::<bool>(), any::<bool>()), TEXTURE_UNITS), used in any::<u8>()) {
            let mut tmem = Tmem::new();
            for (unit, (even, odd, w, h, mip, wide)) in binds.into_iter().enumerate() {
                configure(&mut tmem, unit, even << 5, odd << 5);
                tmem.bind(unit, w, h, mip, wide);
            }
            let before: Vec<_> = (0..TEXTURE_UNITS).map(|u| tmem.state(u)).collect();
            tmem.finalize_binds(TextureUnits::from_bits_retain(used));
            for unit in 0..TEXTURE_UNITS {
                if before[unit] != UnitState::Cached {
                    prop_assert_eq!(tmem.state(unit), before[unit]);
                }
                prop_assert!(tmem.is_valid(unit));
            }
        }
    }
}
