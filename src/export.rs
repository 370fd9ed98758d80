//! Image files in and out of the linear working space.

use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage, RgbaImage};
use stratum_core::ImageBuf;
use stratum_core::color::{linear_to_srgb_u8, srgb_u8_to_linear};
use tracing::{debug, info};

/// Decode an 8-bit image file into linear-light f32.
///
/// The alpha channel is kept as a 4th (mask) channel only when `keep_alpha`
/// is set and the file has one; it is stored as-is, not linearized.
pub fn load_linear(path: &Path, keep_alpha: bool) -> Result<ImageBuf> {
    info!(?path, "loading image file");
    let img =
        image::open(path).with_context(|| format!("failed to open image: {}", path.display()))?;
    let (width, height) = (img.width(), img.height());
    debug!(width, height, color = ?img.color(), "image decode");

    let (channels, data): (u32, Vec<f32>) = if keep_alpha && img.color().has_alpha() {
        let data = img
            .into_rgba8()
            .pixels()
            .flat_map(|p| {
                let [r, g, b, a] = p.0;
                [
                    srgb_u8_to_linear(r),
                    srgb_u8_to_linear(g),
                    srgb_u8_to_linear(b),
                    a as f32 / 255.0,
                ]
            })
            .collect();
        (4, data)
    } else {
        let data = img
            .into_rgb8()
            .pixels()
            .flat_map(|p| p.0.map(srgb_u8_to_linear))
            .collect();
        (3, data)
    };

    ImageBuf::from_data(width, height, channels, data)
}

/// Encode a linear buffer as 8-bit sRGB. The format follows the extension.
pub fn save_srgb(buf: &ImageBuf, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }

    let img = match buf.channels {
        4 => {
            let bytes = buf
                .data
                .chunks_exact(4)
                .flat_map(|p| {
                    [
                        linear_to_srgb_u8(p[0]),
                        linear_to_srgb_u8(p[1]),
                        linear_to_srgb_u8(p[2]),
                        (p[3].clamp(0.0, 1.0) * 255.0 + 0.5) as u8,
                    ]
                })
                .collect();
            RgbaImage::from_raw(buf.width, buf.height, bytes).map(DynamicImage::ImageRgba8)
        }
        _ => {
            let bytes = buf.data.iter().map(|&v| linear_to_srgb_u8(v)).collect();
            RgbImage::from_raw(buf.width, buf.height, bytes).map(DynamicImage::ImageRgb8)
        }
    }
    .context("pixel buffer does not match image dimensions")?;

    img.save(path)
        .with_context(|| format!("failed to write image: {}", path.display()))?;
    info!(?path, width = buf.width, height = buf.height, "wrote image");
    Ok(())
}
