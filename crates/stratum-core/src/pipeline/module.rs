use std::any::Any;
use std::fmt::Debug;

use crate::accel::{Accelerator, ArgSlot, DeviceImage, KernelId, KernelSource};
use crate::error::{ModuleError, Result};
use crate::image_buf::ImageBuf;
use crate::params::{self, ParamField, ParamsBlob, ParamsSchema};
use crate::region::Roi;

/// Working space a module expects its buffers in. Conversion is the caller's job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorSpace {
    Raw,
    Rgb,
    Lab,
}

/// Where a module is listed by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleGroup {
    Basic,
    Tone,
    Color,
    Correct,
    Effect,
    Grading,
    Technical,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModuleFlags {
    /// Parameters may be copied into styles.
    pub include_in_styles: bool,
    /// The scheduler may blend module output with its input through a mask.
    pub supports_blending: bool,
    /// Output is independent of region boundaries, so the module may be tiled.
    pub allow_tiling: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleDescription {
    pub purpose: &'static str,
    pub nature: &'static str,
    pub input: &'static str,
    pub processing: &'static str,
    pub output: &'static str,
}

/// Static metadata the scheduler reads before running a module.
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleDescriptor {
    /// Stable identifier used in stored histories.
    pub op: &'static str,
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub description: ModuleDescription,
    pub flags: ModuleFlags,
    pub groups: &'static [ModuleGroup],
    pub colorspace: ColorSpace,
}

/// Per-invocation settings for the general path.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessContext {
    pub mask_display: bool,
}

/// Per-invocation settings for the accelerator path. The device handle is
/// owned by the session; kernels live for the session, the argument slot
/// for the pipeline.
#[derive(Clone, Copy)]
pub struct AccelContext<'a> {
    pub accel: &'a dyn Accelerator,
    pub kernels: &'a [KernelId],
    pub args: ArgSlot,
    pub mask_display: bool,
}

/// A processing module with typed parameters and working data.
///
/// Implement this; the pipeline sees every `Iop` through the erased
/// [`ProcessingModule`] interface.
pub trait Iop: Send + Sync + 'static {
    /// Current-version parameter record.
    type Params: ParamsSchema;
    /// Per-pipeline state derived from `Params`.
    type Data: Default + Debug + Send + Sync + 'static;

    fn descriptor(&self) -> &ModuleDescriptor;

    /// Upgrade `old` to `new_version`. Only explicitly declared pairs succeed.
    fn legacy_params(&self, old: &ParamsBlob, new_version: u32) -> Result<ParamsBlob> {
        Err(ModuleError::UnsupportedMigration {
            op: self.descriptor().op.to_string(),
            from: old.version,
            to: new_version,
        })
    }

    /// Project clamped parameters into working data.
    fn commit_params(&self, params: &Self::Params, data: &mut Self::Data);

    fn process(
        &self,
        data: &Self::Data,
        ctx: &ProcessContext,
        input: &ImageBuf,
        output: &mut ImageBuf,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()>;

    /// Kernels created once per session for the accelerator path.
    fn kernels(&self) -> &'static [KernelSource] {
        &[]
    }

    /// Bytes of the per-pipeline kernel argument block.
    fn kernel_args_size(&self) -> usize {
        0
    }

    /// Queue this module's work on the device. The caller synchronizes.
    fn process_accelerated(
        &self,
        _data: &Self::Data,
        _ctx: &AccelContext<'_>,
        _input: DeviceImage,
        _output: DeviceImage,
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<()> {
        Err(ModuleError::NoAcceleratorPath(
            self.descriptor().op.to_string(),
        ))
    }
}

pub type WorkingData = Box<dyn Any + Send + Sync>;

/// Object-safe module interface used by the registry and stage instances.
pub trait ProcessingModule: Send + Sync {
    fn descriptor(&self) -> &ModuleDescriptor;

    fn name(&self) -> &str {
        self.descriptor().op
    }

    fn params_version(&self) -> u32;
    fn param_fields(&self) -> &'static [ParamField];
    fn default_params(&self) -> Result<ParamsBlob>;
    fn legacy_params(&self, old: &ParamsBlob, new_version: u32) -> Result<ParamsBlob>;

    /// Upgrade a stored blob to the current version, directly or step by step.
    fn migrate(&self, blob: &ParamsBlob) -> Result<ParamsBlob> {
        params::migrate_to_current(self.name(), blob, self.params_version(), |old, to| {
            self.legacy_params(old, to)
        })
    }

    fn kernels(&self) -> &'static [KernelSource];
    fn kernel_args_size(&self) -> usize;

    fn init_data(&self) -> WorkingData;
    fn commit(&self, params: &ParamsBlob, data: &mut WorkingData) -> Result<()>;

    fn process(
        &self,
        data: &WorkingData,
        ctx: &ProcessContext,
        input: &ImageBuf,
        output: &mut ImageBuf,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()>;

    fn process_accelerated(
        &self,
        data: &WorkingData,
        ctx: &AccelContext<'_>,
        input: DeviceImage,
        output: DeviceImage,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()>;
}

fn wrong_data(op: &str) -> ModuleError {
    ModuleError::Other(anyhow::anyhow!("working data of `{op}` has the wrong type"))
}

impl<M: Iop> ProcessingModule for M {
    fn descriptor(&self) -> &ModuleDescriptor {
        Iop::descriptor(self)
    }

    fn params_version(&self) -> u32 {
        M::Params::VERSION
    }

    fn param_fields(&self) -> &'static [ParamField] {
        M::Params::fields()
    }

    fn default_params(&self) -> Result<ParamsBlob> {
        ParamsBlob::encode(&M::Params::default())
    }

    fn legacy_params(&self, old: &ParamsBlob, new_version: u32) -> Result<ParamsBlob> {
        Iop::legacy_params(self, old, new_version)
    }

    fn kernels(&self) -> &'static [KernelSource] {
        Iop::kernels(self)
    }

    fn kernel_args_size(&self) -> usize {
        Iop::kernel_args_size(self)
    }

    fn init_data(&self) -> WorkingData {
        Box::new(M::Data::default())
    }

    fn commit(&self, params: &ParamsBlob, data: &mut WorkingData) -> Result<()> {
        let op = Iop::descriptor(self).op;
        let params: M::Params = params.decode(op)?;
        let data = data.downcast_mut::<M::Data>().ok_or_else(|| wrong_data(op))?;
        self.commit_params(&params.clamped(), data);
        Ok(())
    }

    fn process(
        &self,
        data: &WorkingData,
        ctx: &ProcessContext,
        input: &ImageBuf,
        output: &mut ImageBuf,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()> {
        let op = Iop::descriptor(self).op;
        let data = data.downcast_ref::<M::Data>().ok_or_else(|| wrong_data(op))?;
        Iop::process(self, data, ctx, input, output, roi_in, roi_out)
    }

    fn process_accelerated(
        &self,
        data: &WorkingData,
        ctx: &AccelContext<'_>,
        input: DeviceImage,
        output: DeviceImage,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()> {
        let op = Iop::descriptor(self).op;
        let data = data.downcast_ref::<M::Data>().ok_or_else(|| wrong_data(op))?;
        Iop::process_accelerated(self, data, ctx, input, output, roi_in, roi_out)
    }
}

/// Check the buffers of a per-pixel module: input and output match their
/// regions, and both regions have the same size.
///
/// A mismatch is a caller defect; debug builds abort on it.
pub fn check_pointwise(
    op: &str,
    input: &ImageBuf,
    output: &ImageBuf,
    roi_in: &Roi,
    roi_out: &Roi,
) -> Result<()> {
    let fits = |buf: &ImageBuf, roi: &Roi| buf.width == roi.width && buf.height == roi.height;
    let ok = fits(input, roi_in)
        && fits(output, roi_out)
        && roi_in.width == roi_out.width
        && roi_in.height == roi_out.height
        && input.channels == output.channels
        && input.channels >= 3;
    debug_assert!(ok, "{op}: buffers do not match regions {roi_in:?} -> {roi_out:?}");
    if ok {
        Ok(())
    } else {
        Err(ModuleError::InvalidRegion {
            roi: *roi_out,
            width: output.width,
            height: output.height,
        })
    }
}

/// Device-side counterpart of [`check_pointwise`].
pub fn check_pointwise_device(
    op: &str,
    input: DeviceImage,
    output: DeviceImage,
    roi_in: &Roi,
    roi_out: &Roi,
) -> Result<()> {
    let ok = input.width == roi_in.width
        && input.height == roi_in.height
        && output.width == roi_out.width
        && output.height == roi_out.height
        && roi_in.width == roi_out.width
        && roi_in.height == roi_out.height;
    debug_assert!(ok, "{op}: device images do not match regions {roi_in:?} -> {roi_out:?}");
    if ok {
        Ok(())
    } else {
        Err(ModuleError::InvalidRegion {
            roi: *roi_out,
            width: output.width,
            height: output.height,
        })
    }
}
