//! sRGB transfer functions for the boundary between encoded files and the
//! linear working space modules run in.

use std::sync::LazyLock;

/// Inverse sRGB EOTF (IEC 61966-2-1): linear light [0,1] -> perceptual sRGB [0,1].
pub fn linear_to_srgb(x: f32) -> f32 {
    if x <= 0.0031308 {
        12.92 * x
    } else {
        1.055 * x.powf(1.0 / 2.4) - 0.055
    }
}

/// sRGB EOTF (IEC 61966-2-1): perceptual sRGB [0,1] -> linear light [0,1].
pub fn srgb_to_linear(x: f32) -> f32 {
    if x <= 0.04045 {
        x / 12.92
    } else {
        ((x + 0.055) / 1.055).powf(2.4)
    }
}

const SRGB_LUT_SIZE: usize = 4096;

static SRGB_LUT: LazyLock<[u8; SRGB_LUT_SIZE]> = LazyLock::new(|| {
    let mut lut = [0u8; SRGB_LUT_SIZE];
    for (i, entry) in lut.iter_mut().enumerate() {
        let v = i as f32 / (SRGB_LUT_SIZE - 1) as f32;
        *entry = (linear_to_srgb(v) * 255.0 + 0.5) as u8;
    }
    lut
});

static SRGB_DECODE: LazyLock<[f32; 256]> = LazyLock::new(|| {
    let mut lut = [0.0f32; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        *entry = srgb_to_linear(i as f32 / 255.0);
    }
    lut
});

/// Linear value to an 8-bit sRGB code, clamping out-of-range input.
pub fn linear_to_srgb_u8(v: f32) -> u8 {
    let v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
    let idx = (v * (SRGB_LUT_SIZE - 1) as f32) as usize;
    SRGB_LUT[idx]
}

/// 8-bit sRGB code to linear light.
pub fn srgb_u8_to_linear(v: u8) -> f32 {
    SRGB_DECODE[v as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_functions_invert_each_other() {
        for x in (0..=64).map(|i| i as f32 / 64.0) {
            let back = srgb_to_linear(linear_to_srgb(x));
            assert!((back - x).abs() < 1e-5, "{x} came back as {back}");
        }
        assert_eq!(linear_to_srgb(0.0), 0.0);
        assert!((srgb_to_linear(1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn encode_is_linear_near_black() {
        let x = 0.002;
        assert!((linear_to_srgb(x) - 12.92 * x).abs() < 1e-7);
        assert!((srgb_to_linear(0.02) - 0.02 / 12.92).abs() < 1e-7);
    }

    #[test]
    fn u8_black_white_and_clamp() {
        assert_eq!(linear_to_srgb_u8(0.0), 0);
        assert_eq!(linear_to_srgb_u8(1.0), 255);
        assert_eq!(linear_to_srgb_u8(-0.5), 0);
        assert_eq!(linear_to_srgb_u8(2.0), 255);
        assert_eq!(linear_to_srgb_u8(f32::NAN), 0);
    }

    #[test]
    fn u8_mid_gray() {
        // Linear 0.214 should map to roughly sRGB 128 (mid-gray)
        assert!((linear_to_srgb_u8(0.2140) as i32 - 128).unsigned_abs() <= 2);
    }

    #[test]
    fn u8_decode_roundtrip() {
        for code in [0u8, 1, 64, 128, 200, 255] {
            let back = linear_to_srgb_u8(srgb_u8_to_linear(code));
            assert!((back as i32 - code as i32).abs() <= 1, "{code} -> {back}");
        }
    }
}
