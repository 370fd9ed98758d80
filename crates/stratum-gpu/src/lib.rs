//! wgpu backend for the stratum accelerator interface.

mod accelerator;
pub mod context;
mod shader;
mod texture;

pub use accelerator::WgpuAccelerator;
pub use context::GpuContext;
