//! Device abstraction for the accelerator execution path.
//!
//! A session owns one `Arc<dyn Accelerator>` and passes it into every
//! accelerated call. Work is asynchronous: `enqueue_*` returns once the
//! work is queued, and device images only hold valid results after
//! [`Accelerator::finish`] returns `Ok`.

use std::fmt;
use std::sync::Arc;

use crate::error::AcceleratorError;
use crate::image_buf::ImageBuf;
use crate::region::Roi;

/// WGSL source of a compute kernel with a `main` entry point.
///
/// Kernels bind the input image at binding 0 (read-only `rgba32float`
/// storage texture), the output at binding 1 (write-only), and a uniform
/// argument block at binding 2.
#[derive(Clone, Copy, Debug)]
pub struct KernelSource {
    pub name: &'static str,
    pub wgsl: &'static str,
}

/// Handle to a compiled kernel, valid for the session that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelId(pub u64);

/// Handle to a per-pipeline kernel argument buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArgSlot(pub u64);

/// Handle to an RGBA f32 image resident on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceImage {
    pub id: u64,
    pub width: u32,
    pub height: u32,
}

impl DeviceImage {
    pub fn roi(&self) -> Roi {
        Roi::full(self.width, self.height)
    }
}

/// Instrumentation record of one device operation.
#[derive(Clone, Debug, PartialEq)]
pub enum AcceleratorEvent {
    Upload { width: u32, height: u32 },
    Copy { width: u32, height: u32 },
    Dispatch { kernel: String, width: u32, height: u32 },
    Finish,
    Download { width: u32, height: u32 },
}

impl AcceleratorEvent {
    pub fn is_dispatch(&self) -> bool {
        matches!(self, Self::Dispatch { .. })
    }

    pub fn is_copy(&self) -> bool {
        matches!(self, Self::Copy { .. })
    }
}

/// Callback invoked for every [`AcceleratorEvent`].
pub type EventObserver = Arc<dyn Fn(&AcceleratorEvent) + Send + Sync>;

pub trait Accelerator: Send + Sync {
    /// Human-readable device name for logs.
    fn name(&self) -> &str;

    /// Compile a kernel. Called once per session per kernel.
    fn create_kernel(&self, source: &KernelSource) -> Result<KernelId, AcceleratorError>;

    fn free_kernel(&self, kernel: KernelId);

    /// Reserve an argument buffer of `bytes` bytes for one pipeline.
    fn alloc_args(&self, bytes: usize) -> Result<ArgSlot, AcceleratorError>;

    fn free_args(&self, slot: ArgSlot);

    /// Copy a host buffer to a new device image. Three-channel buffers get alpha = 1.
    fn upload(&self, buf: &ImageBuf) -> Result<DeviceImage, AcceleratorError>;

    /// Allocate an uninitialized device image.
    fn alloc_image(&self, width: u32, height: u32) -> Result<DeviceImage, AcceleratorError>;

    fn free_image(&self, image: DeviceImage);

    /// Queue a copy of `region` from `src` to the same place in `dst`.
    fn enqueue_copy(
        &self,
        src: DeviceImage,
        dst: DeviceImage,
        region: Roi,
    ) -> Result<(), AcceleratorError>;

    /// Write `args` into `slot` and queue `kernel` over a `width`x`height` grid.
    fn enqueue_kernel_2d(
        &self,
        kernel: KernelId,
        slot: ArgSlot,
        args: &[u8],
        input: DeviceImage,
        output: DeviceImage,
        size: (u32, u32),
    ) -> Result<(), AcceleratorError>;

    /// Block until all queued work completed. Errors raised by queued work surface here.
    fn finish(&self) -> Result<(), AcceleratorError>;

    /// Read a device image back as a host buffer with `channels` channels.
    fn download(&self, image: DeviceImage, channels: u32) -> Result<ImageBuf, AcceleratorError>;
}

impl fmt::Debug for dyn Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accelerator")
            .field("name", &self.name())
            .finish()
    }
}

/// Frees a device image when dropped, so every exit path of an accelerated
/// stage (including errors and cancellation) returns its memory.
pub struct ScopedImage<'a> {
    accel: &'a dyn Accelerator,
    image: DeviceImage,
}

impl<'a> ScopedImage<'a> {
    pub fn new(accel: &'a dyn Accelerator, image: DeviceImage) -> Self {
        Self { accel, image }
    }

    pub fn get(&self) -> DeviceImage {
        self.image
    }
}

impl Drop for ScopedImage<'_> {
    fn drop(&mut self) {
        self.accel.free_image(self.image);
    }
}
