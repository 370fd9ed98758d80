use anyhow::Result;
use stratum_core::{ImageBuf, Roi};

const BYTES_PER_PIXEL: u32 = 4 * 4;

/// A GPU texture holding RGBA f32 image data.
pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl GpuTexture {
    /// Upload an ImageBuf to a GPU texture (Rgba32Float format).
    pub fn from_image_buf(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        buf: &ImageBuf,
        label: &str,
    ) -> Self {
        let texture = Self::create_storage(device, buf.width, buf.height, label);

        let rgba = buf.to_rgba_f32();
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&rgba),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(buf.width * BYTES_PER_PIXEL),
                rows_per_image: Some(buf.height),
            },
            texture.extent(),
        );

        texture
    }

    /// Create a texture usable as kernel input, kernel output, and copy source or target.
    pub fn create_storage(device: &wgpu::Device, width: u32, height: u32, label: &str) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            texture,
            view,
            width,
            height,
        }
    }

    pub fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }

    /// Record a copy of `region` into the same place in `dst`.
    pub fn copy_region_to(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        dst: &GpuTexture,
        region: Roi,
    ) {
        let origin = wgpu::Origin3d {
            x: region.x,
            y: region.y,
            z: 0,
        };
        encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &dst.texture,
                mip_level: 0,
                origin,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: region.width,
                height: region.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Read texture data back to CPU as an ImageBuf with `channels` channels (blocking).
    pub fn download(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        channels: u32,
    ) -> Result<ImageBuf> {
        let bytes_per_row_unpadded = self.width * BYTES_PER_PIXEL;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let bytes_per_row_padded = bytes_per_row_unpadded.div_ceil(align) * align;

        let buffer_size = (bytes_per_row_padded * self.height) as u64;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texture_download_staging"),
            size: buffer_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("texture_download"),
        });

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row_padded),
                    rows_per_image: Some(self.height),
                },
            },
            self.extent(),
        );

        queue.submit(std::iter::once(encoder.finish()));

        let (sender, receiver) = std::sync::mpsc::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
        device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| anyhow::anyhow!("GPU poll error: {e}"))?;
        receiver
            .recv()
            .map_err(|_| anyhow::anyhow!("buffer map cancelled"))??;

        let mapped = staging.slice(..).get_mapped_range();
        let mut rgba = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for row in 0..self.height {
            let row_offset = (row * bytes_per_row_padded) as usize;
            let row_bytes = &mapped[row_offset..row_offset + bytes_per_row_unpadded as usize];
            rgba.extend_from_slice(bytemuck::cast_slice::<u8, f32>(row_bytes));
        }

        drop(mapped);
        staging.unmap();

        ImageBuf::from_rgba_f32(self.width, self.height, channels, &rgba)
    }
}
