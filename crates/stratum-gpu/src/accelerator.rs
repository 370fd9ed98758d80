use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use stratum_core::accel::EventObserver;
use stratum_core::{
    Accelerator, AcceleratorError, AcceleratorEvent, ArgSlot, DeviceImage, ImageBuf, KernelId,
    KernelSource, Roi,
};
use tracing::{debug, warn};

use crate::context::GpuContext;
use crate::shader::ShaderManager;
use crate::texture::GpuTexture;

const WORKGROUP_SIZE: u32 = 16;

#[derive(Default)]
struct Resources {
    shaders: ShaderManager,
    args: HashMap<u64, wgpu::Buffer>,
    images: HashMap<u64, GpuTexture>,
}

/// [`Accelerator`] backed by a wgpu compute device.
///
/// Every kernel shares one bind group layout: input storage texture at
/// binding 0, output storage texture at binding 1, argument uniform at
/// binding 2. Queued work is submitted immediately and awaited in `finish`.
pub struct WgpuAccelerator {
    ctx: GpuContext,
    layout: wgpu::BindGroupLayout,
    resources: Mutex<Resources>,
    next_id: AtomicU64,
    observer: Option<EventObserver>,
}

impl WgpuAccelerator {
    pub fn new(ctx: GpuContext) -> Self {
        let layout = create_image_params_layout(&ctx.device);
        Self {
            ctx,
            layout,
            resources: Mutex::new(Resources::default()),
            next_id: AtomicU64::new(1),
            observer: None,
        }
    }

    /// Open the default high-performance adapter.
    pub fn with_default_adapter() -> anyhow::Result<Self> {
        GpuContext::new_blocking().map(Self::new)
    }

    /// Report every device operation to `observer`.
    pub fn with_observer(mut self, observer: EventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: AcceleratorEvent) {
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }

    fn resources(&self) -> Result<MutexGuard<'_, Resources>, AcceleratorError> {
        self.resources
            .lock()
            .map_err(|_| AcceleratorError::Unavailable("device state lock poisoned".into()))
    }

    /// Run `f` inside validation and out-of-memory error scopes.
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        let device = &self.ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(device.pop_error_scope());
        let oom = pollster::block_on(device.pop_error_scope());
        (value, validation.or(oom))
    }

    /// Largest image edge this accelerator can hold.
    pub fn max_image_dimension(&self) -> u32 {
        self.ctx.max_texture_dimension()
    }

    fn check_extent(&self, width: u32, height: u32) -> Result<(), AcceleratorError> {
        if width == 0 || height == 0 {
            return Err(AcceleratorError::Transfer(format!(
                "cannot place an empty {width}x{height} image on the device"
            )));
        }
        let limit = self.max_image_dimension();
        if width > limit || height > limit {
            return Err(AcceleratorError::Transfer(format!(
                "{width}x{height} image exceeds the device limit of {limit} pixels per edge"
            )));
        }
        Ok(())
    }

    fn image_texture(
        &self,
        width: u32,
        height: u32,
        label: &str,
    ) -> Result<GpuTexture, AcceleratorError> {
        self.check_extent(width, height)?;
        let (texture, error) =
            self.scoped(|| GpuTexture::create_storage(&self.ctx.device, width, height, label));
        match error {
            None => Ok(texture),
            Some(e) => Err(device_error(e, format!("{width}x{height} image"))),
        }
    }
}

fn device_error(error: wgpu::Error, what: String) -> AcceleratorError {
    match error {
        wgpu::Error::OutOfMemory { .. } => AcceleratorError::OutOfMemory { what },
        other => AcceleratorError::Transfer(format!("{what}: {other}")),
    }
}

fn create_image_params_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("image_params_bgl"),
        entries: &[
            // Input texture
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::StorageTexture {
                    access: wgpu::StorageTextureAccess::ReadOnly,
                    format: wgpu::TextureFormat::Rgba32Float,
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
                count: None,
            },
            // Output texture
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::StorageTexture {
                    access: wgpu::StorageTextureAccess::WriteOnly,
                    format: wgpu::TextureFormat::Rgba32Float,
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
                count: None,
            },
            // Params uniform
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        ],
    })
}

impl Accelerator for WgpuAccelerator {
    fn name(&self) -> &str {
        &self.ctx.adapter_name
    }

    fn create_kernel(&self, source: &KernelSource) -> Result<KernelId, AcceleratorError> {
        let id = self.id();
        let mut res = self.resources()?;
        let (created, error) = self.scoped(|| {
            res.shaders
                .load_shader(&self.ctx.device, id, source.name, source.wgsl);
            res.shaders
                .get_or_create_pipeline(&self.ctx.device, id, &self.layout)
                .map(|_| ())
        });
        let failure = match (created, error) {
            (Ok(()), None) => None,
            (Err(e), _) => Some(format!("{e:#}")),
            (_, Some(e)) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            res.shaders.remove(id);
            return Err(AcceleratorError::Kernel {
                kernel: source.name.to_string(),
                reason,
            });
        }
        debug!(kernel = source.name, id, "compute kernel ready");
        Ok(KernelId(id))
    }

    fn free_kernel(&self, kernel: KernelId) {
        if let Ok(mut res) = self.resources() {
            res.shaders.remove(kernel.0);
        }
    }

    fn alloc_args(&self, bytes: usize) -> Result<ArgSlot, AcceleratorError> {
        let size = (bytes.max(16) as u64).div_ceil(16) * 16;
        let (buffer, error) = self.scoped(|| {
            self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("kernel_args"),
                size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        if let Some(e) = error {
            return Err(device_error(e, format!("{size}-byte argument buffer")));
        }
        let id = self.id();
        self.resources()?.args.insert(id, buffer);
        Ok(ArgSlot(id))
    }

    fn free_args(&self, slot: ArgSlot) {
        if let Ok(mut res) = self.resources() {
            res.args.remove(&slot.0);
        }
    }

    fn upload(&self, buf: &ImageBuf) -> Result<DeviceImage, AcceleratorError> {
        self.check_extent(buf.width, buf.height)?;
        let (texture, error) = self.scoped(|| {
            GpuTexture::from_image_buf(&self.ctx.device, &self.ctx.queue, buf, "upload")
        });
        if let Some(e) = error {
            let what = format!("upload of {}x{} image", buf.width, buf.height);
            return Err(device_error(e, what));
        }

        let id = self.id();
        self.resources()?.images.insert(id, texture);
        self.emit(AcceleratorEvent::Upload {
            width: buf.width,
            height: buf.height,
        });
        Ok(DeviceImage {
            id,
            width: buf.width,
            height: buf.height,
        })
    }

    fn alloc_image(&self, width: u32, height: u32) -> Result<DeviceImage, AcceleratorError> {
        let texture = self.image_texture(width, height, "stage_output")?;
        let id = self.id();
        self.resources()?.images.insert(id, texture);
        Ok(DeviceImage { id, width, height })
    }

    fn free_image(&self, image: DeviceImage) {
        if let Ok(mut res) = self.resources() {
            res.images.remove(&image.id);
        }
    }

    fn enqueue_copy(
        &self,
        src: DeviceImage,
        dst: DeviceImage,
        region: Roi,
    ) -> Result<(), AcceleratorError> {
        let res = self.resources()?;
        let from = res
            .images
            .get(&src.id)
            .ok_or(AcceleratorError::UnknownHandle(src.id))?;
        let to = res
            .images
            .get(&dst.id)
            .ok_or(AcceleratorError::UnknownHandle(dst.id))?;

        let ((), error) = self.scoped(|| {
            let mut encoder = self
                .ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("region_copy"),
                });
            from.copy_region_to(&mut encoder, to, region);
            self.ctx.queue.submit(std::iter::once(encoder.finish()));
        });
        drop(res);
        if let Some(e) = error {
            return Err(AcceleratorError::Transfer(e.to_string()));
        }

        self.emit(AcceleratorEvent::Copy {
            width: region.width,
            height: region.height,
        });
        Ok(())
    }

    fn enqueue_kernel_2d(
        &self,
        kernel: KernelId,
        slot: ArgSlot,
        args: &[u8],
        input: DeviceImage,
        output: DeviceImage,
        size: (u32, u32),
    ) -> Result<(), AcceleratorError> {
        let mut res = self.resources()?;
        let name = res
            .shaders
            .name(kernel.0)
            .ok_or(AcceleratorError::UnknownHandle(kernel.0))?
            .to_string();
        let kernel_error = |reason: String| AcceleratorError::Kernel {
            kernel: name.clone(),
            reason,
        };

        let args_buf = res
            .args
            .get(&slot.0)
            .ok_or(AcceleratorError::UnknownHandle(slot.0))?
            .clone();
        if args.len() as u64 > args_buf.size() {
            return Err(kernel_error(format!(
                "{} argument bytes exceed the {}-byte slot",
                args.len(),
                args_buf.size()
            )));
        }
        let (input_view, output_view) = {
            let from = res
                .images
                .get(&input.id)
                .ok_or(AcceleratorError::UnknownHandle(input.id))?;
            let to = res
                .images
                .get(&output.id)
                .ok_or(AcceleratorError::UnknownHandle(output.id))?;
            (from.view.clone(), to.view.clone())
        };
        let pipeline = res
            .shaders
            .get_or_create_pipeline(&self.ctx.device, kernel.0, &self.layout)
            .map_err(|e| kernel_error(format!("{e:#}")))?
            .clone();
        drop(res);

        let ((), error) = self.scoped(|| {
            self.ctx.queue.write_buffer(&args_buf, 0, args);

            let bind_group = self
                .ctx
                .device
                .create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&format!("{name}_bg")),
                    layout: &self.layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&input_view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(&output_view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: args_buf.as_entire_binding(),
                        },
                    ],
                });

            let mut encoder = self
                .ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some(&format!("{name}_encoder")),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(&format!("{name}_pass")),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(
                    size.0.div_ceil(WORKGROUP_SIZE),
                    size.1.div_ceil(WORKGROUP_SIZE),
                    1,
                );
            }
            self.ctx.queue.submit(std::iter::once(encoder.finish()));
        });
        if let Some(e) = error {
            return Err(kernel_error(e.to_string()));
        }

        self.emit(AcceleratorEvent::Dispatch {
            kernel: name,
            width: size.0,
            height: size.1,
        });
        Ok(())
    }

    fn finish(&self) -> Result<(), AcceleratorError> {
        let result = self
            .ctx
            .device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|e| {
                warn!(error = %e, "waiting for queued GPU work failed");
                AcceleratorError::Unavailable(format!("GPU poll error: {e}"))
            });
        self.emit(AcceleratorEvent::Finish);
        result
    }

    fn download(&self, image: DeviceImage, channels: u32) -> Result<ImageBuf, AcceleratorError> {
        let res = self.resources()?;
        let texture = res
            .images
            .get(&image.id)
            .ok_or(AcceleratorError::UnknownHandle(image.id))?;
        let buf = texture
            .download(&self.ctx.device, &self.ctx.queue, channels)
            .map_err(|e| AcceleratorError::Transfer(format!("{e:#}")))?;
        drop(res);
        self.emit(AcceleratorEvent::Download {
            width: image.width,
            height: image.height,
        });
        Ok(buf)
    }
}
