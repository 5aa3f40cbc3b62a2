use flipper_video::tmem::{TextureUnits, Tmem, TmemRegister, TEXTURE_UNITS};

/// SETIMAGE1/2 value for a 32 KiB region at `base`.
fn region(base: u32) -> u32 {
    (base >> 5) | (3 << 15) | (3 << 18)
}

fn configure(tmem: &mut Tmem, unit: usize, even: u32, odd: u32) {
    assert!(tmem.write_register(TmemRegister::SetImage1.address(unit), region(even)));
    assert!(tmem.write_register(TmemRegister::SetImage2.address(unit), region(odd)));
}

#[test]
fn disjoint_units_stay_cached_across_draws() {
    let mut tmem = Tmem::new();
    for unit in 0..TEXTURE_UNITS {
        let base = unit as u32 * 0x8000;
        configure(&mut tmem, unit, base, 0x8_0000 + base);
    }

    for _draw in 0..3 {
        for unit in 0..TEXTURE_UNITS {
            tmem.bind(unit, 32, 32, false, true);
        }
        tmem.finalize_binds(TextureUnits::all());
        assert!((0..TEXTURE_UNITS).all(|unit| tmem.is_cached(unit)));
    }
}

#[test]
fn overlapping_units_lose_residency_until_reconfigured() {
    let mut tmem = Tmem::new();
    configure(&mut tmem, 4, 0, 0x8_0000);
    configure(&mut tmem, 5, 0x7000, 0x8_8000);
    tmem.bind(4, 4, 4, false, false);
    tmem.bind(5, 4, 4, false, false);
    tmem.finalize_binds(TextureUnits::UNIT4 | TextureUnits::UNIT5);
    assert!(!tmem.is_cached(4) && !tmem.is_cached(5));

    configure(&mut tmem, 5, 0x8000, 0x8_8000);
    assert!(!tmem.is_valid(5));
    tmem.bind(4, 4, 4, false, false);
    tmem.bind(5, 4, 4, false, false);
    tmem.finalize_binds(TextureUnits::UNIT4 | TextureUnits::UNIT5);
    assert!(tmem.is_cached(4) && tmem.is_cached(5));
}

#[test]
fn unrelated_register_writes_are_ignored() {
    let mut tmem = Tmem::new();
    configure(&mut tmem, 0, 0, 0x8_0000);
    tmem.bind(0, 1, 1, false, false);
    assert!(!tmem.write_register(0x94, u32::MAX));
    assert!(tmem.is_cached(0));
}
