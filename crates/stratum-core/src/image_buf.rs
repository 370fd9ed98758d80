use crate::region::Roi;

/// Linear f32 image buffer with interleaved channels.
///
/// Three channels hold RGB; a fourth, when present, is the alpha/mask
/// channel. Values are scene-referred and may exceed 1.0.
///
/// Modules never compute the fourth channel. A transforming pass copies it
/// from the input only in mask-display mode and otherwise leaves the
/// output's own value (0 in a fresh buffer). A pass that degenerates to an
/// identity copies whole pixels, so the fourth channel survives it in
/// either mode.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageBuf {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    /// Flat pixel data, `channels` floats per pixel, row-major.
    pub data: Vec<f32>,
}

impl ImageBuf {
    pub fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![0.0; width as usize * height as usize * channels as usize],
        }
    }

    pub fn from_data(
        width: u32,
        height: u32,
        channels: u32,
        data: Vec<f32>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            channels == 3 || channels == 4,
            "unsupported channel count {channels}, expected 3 or 4"
        );
        let expected = width as usize * height as usize * channels as usize;
        anyhow::ensure!(
            data.len() == expected,
            "expected {expected} floats for {width}x{height}x{channels}, got {}",
            data.len()
        );
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// A buffer where every pixel holds `pixel`.
    pub fn filled(width: u32, height: u32, pixel: &[f32]) -> Self {
        let count = width as usize * height as usize;
        Self {
            width,
            height,
            channels: pixel.len() as u32,
            data: pixel.repeat(count),
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn roi(&self) -> Roi {
        Roi::full(self.width, self.height)
    }

    pub fn has_alpha(&self) -> bool {
        self.channels == 4
    }

    pub fn pixel(&self, x: u32, y: u32) -> &[f32] {
        let ch = self.channels as usize;
        let idx = (y as usize * self.width as usize + x as usize) * ch;
        &self.data[idx..idx + ch]
    }

    /// Copy `roi` (in this buffer's coordinates) into a new region-sized buffer.
    pub fn extract(&self, roi: &Roi) -> anyhow::Result<ImageBuf> {
        anyhow::ensure!(
            self.roi().contains(roi),
            "region {roi:?} outside {}x{} buffer",
            self.width,
            self.height
        );
        let ch = self.channels as usize;
        let row_len = roi.width as usize * ch;
        let mut data = Vec::with_capacity(roi.height as usize * row_len);
        for row in roi.y..roi.bottom() {
            let start = (row as usize * self.width as usize + roi.x as usize) * ch;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }
        ImageBuf::from_data(roi.width, roi.height, self.channels, data)
    }

    /// Write `tile` into this buffer with its top-left corner at `(roi.x, roi.y)`.
    pub fn paste(&mut self, roi: &Roi, tile: &ImageBuf) -> anyhow::Result<()> {
        anyhow::ensure!(
            tile.width == roi.width && tile.height == roi.height && tile.channels == self.channels,
            "tile {}x{}x{} does not match region {roi:?}",
            tile.width,
            tile.height,
            tile.channels
        );
        anyhow::ensure!(
            self.roi().contains(roi),
            "region {roi:?} outside {}x{} buffer",
            self.width,
            self.height
        );
        let ch = self.channels as usize;
        let row_len = roi.width as usize * ch;
        for (i, row) in (roi.y..roi.bottom()).enumerate() {
            let dst = (row as usize * self.width as usize + roi.x as usize) * ch;
            let src = i * row_len;
            self.data[dst..dst + row_len].copy_from_slice(&tile.data[src..src + row_len]);
        }
        Ok(())
    }

    /// Exact copy of `src` into this same-sized buffer.
    pub fn copy_from(&mut self, src: &ImageBuf) {
        debug_assert_eq!(self.data.len(), src.data.len());
        self.data.copy_from_slice(&src.data);
    }

    /// Copy the 4th channel of `src` verbatim. No-op for three-channel buffers.
    pub fn copy_alpha_from(&mut self, src: &ImageBuf) {
        if self.channels != 4 || src.channels != 4 {
            return;
        }
        debug_assert_eq!(self.data.len(), src.data.len());
        for (out, inp) in self.data.chunks_exact_mut(4).zip(src.data.chunks_exact(4)) {
            out[3] = inp[3];
        }
    }

    /// Convert to RGBA f32 (for upload as Rgba32Float). Three-channel buffers get alpha = 1.0.
    pub fn to_rgba_f32(&self) -> Vec<f32> {
        if self.channels == 4 {
            return self.data.clone();
        }
        let mut rgba = Vec::with_capacity(self.pixel_count() * 4);
        for pixel in self.data.chunks_exact(3) {
            rgba.extend_from_slice(pixel);
            rgba.push(1.0);
        }
        rgba
    }

    /// Build a buffer with `channels` channels from RGBA f32 data.
    pub fn from_rgba_f32(
        width: u32,
        height: u32,
        channels: u32,
        rgba: &[f32],
    ) -> anyhow::Result<Self> {
        if channels == 4 {
            return Self::from_data(width, height, 4, rgba.to_vec());
        }
        let data = rgba
            .chunks_exact(4)
            .flat_map(|p| [p[0], p[1], p[2]])
            .collect();
        Self::from_data(width, height, channels, data)
    }
}
