pub mod accel;
pub mod color;
pub mod config;
pub mod error;
pub mod image_buf;
pub mod params;
pub mod pipeline;
pub mod region;

pub use accel::{Accelerator, AcceleratorEvent, ArgSlot, DeviceImage, KernelId, KernelSource};
pub use config::{AcceleratorMode, PipelineConfig};
pub use error::{AcceleratorError, ModuleError, Result};
pub use image_buf::ImageBuf;
pub use params::{HistoryItem, ParamField, ParamsBlob, ParamsSchema};
pub use pipeline::instance::{BackendSupport, StageInstance, StageState};
pub use pipeline::module::{
    ColorSpace, Iop, ModuleDescriptor, ModuleFlags, ModuleGroup, ProcessingModule,
};
pub use pipeline::registry::ModuleRegistry;
pub use pipeline::session::Session;
pub use pipeline::{Backend, CancelToken, Pipeline, PipelineReport, StageReport};
pub use region::Roi;
