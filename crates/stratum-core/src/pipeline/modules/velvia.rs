use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::accel::{DeviceImage, KernelSource};
use crate::error::{ModuleError, Result};
use crate::image_buf::ImageBuf;
use crate::params::{ParamField, ParamsBlob, ParamsSchema};
use crate::pipeline::module::{
    AccelContext, ColorSpace, Iop, ModuleDescription, ModuleDescriptor, ModuleFlags, ModuleGroup,
    ProcessContext, check_pointwise, check_pointwise_device,
};
use crate::region::Roi;

const OP: &str = "velvia";

static DESCRIPTOR: ModuleDescriptor = ModuleDescriptor {
    op: OP,
    name: "velvia",
    aliases: &["saturation"],
    description: ModuleDescription {
        purpose: "resaturate giving more weight to blacks, whites and low-saturation pixels",
        nature: "creative",
        input: "linear, RGB, scene-referred",
        processing: "linear, RGB",
        output: "linear, RGB, scene-referred",
    },
    flags: ModuleFlags {
        include_in_styles: true,
        supports_blending: true,
        allow_tiling: true,
    },
    groups: &[ModuleGroup::Color, ModuleGroup::Grading],
    colorspace: ColorSpace::Rgb,
};

static KERNELS: [KernelSource; 1] = [KernelSource {
    name: "velvia",
    wgsl: include_str!("../../../shaders/velvia.wgsl"),
}];

static FIELDS: [ParamField; 2] = [
    ParamField::new("strength", 0.0, 100.0, 25.0).describe("the strength of saturation boost"),
    ParamField::new("bias", 0.0, 1.0, 1.0).describe("how much to spare highlights and shadows"),
];

static FIELDS_V1: [ParamField; 4] = [
    ParamField::new("saturation", 0.0, 100.0, 25.0),
    ParamField::new("vibrance", 0.0, 100.0, 100.0),
    ParamField::new("luminance", 0.0, 1.0, 1.0),
    ParamField::new("clarity", 0.0, 100.0, 0.0),
];

/// Current (version 2) parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VelviaParams {
    /// Saturation boost in percent.
    pub strength: f32,
    /// Mid-tones bias. Lower values give shadows and highlights more weight.
    pub bias: f32,
}

impl Default for VelviaParams {
    fn default() -> Self {
        Self {
            strength: FIELDS[0].default,
            bias: FIELDS[1].default,
        }
    }
}

impl ParamsSchema for VelviaParams {
    const VERSION: u32 = 2;

    fn fields() -> &'static [ParamField] {
        &FIELDS
    }

    fn clamped(&self) -> Self {
        Self {
            strength: FIELDS[0].clamp(self.strength),
            bias: FIELDS[1].clamp(self.bias),
        }
    }
}

/// Version 1 parameters, kept so old edits still load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VelviaParamsV1 {
    pub saturation: f32,
    pub vibrance: f32,
    pub luminance: f32,
    pub clarity: f32,
}

impl Default for VelviaParamsV1 {
    fn default() -> Self {
        Self {
            saturation: FIELDS_V1[0].default,
            vibrance: FIELDS_V1[1].default,
            luminance: FIELDS_V1[2].default,
            clarity: FIELDS_V1[3].default,
        }
    }
}

impl ParamsSchema for VelviaParamsV1 {
    const VERSION: u32 = 1;

    fn fields() -> &'static [ParamField] {
        &FIELDS_V1
    }

    fn clamped(&self) -> Self {
        Self {
            saturation: FIELDS_V1[0].clamp(self.saturation),
            vibrance: FIELDS_V1[1].clamp(self.vibrance),
            luminance: FIELDS_V1[2].clamp(self.luminance),
            clarity: FIELDS_V1[3].clamp(self.clarity),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VelviaData {
    /// Strength as a fraction (percent / 100).
    pub strength: f32,
    pub bias: f32,
}

/// Uniform block of the velvia kernel. Layout matches `shaders/velvia.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct VelviaArgs {
    pub width: u32,
    pub height: u32,
    pub strength: f32,
    pub bias: f32,
    pub copy_alpha: u32,
    pub pad: [u32; 3],
}

pub struct Velvia;

/// Saturation estimate from the channel extremes. The branch is picked on
/// the midpoint luminance, and both denominators carry an epsilon.
pub fn saturation_estimate(pmax: f32, pmin: f32) -> f32 {
    let plum = (pmax + pmin) / 2.0;
    if plum <= 0.5 {
        (pmax - pmin) / (1e-5 + pmax + pmin)
    } else {
        (pmax - pmin) / (1e-5 + (2.0 - pmax - pmin).max(0.0))
    }
}

/// How strongly a pixel is affected, in [0, 1].
pub fn pixel_weight(psat: f32, plum: f32, bias: f32) -> f32 {
    let spare = 1.0 - bias;
    let weight = ((1.0 - 1.5 * psat) + (1.0 + (plum - 0.5).abs() * 2.0) * spare) / (1.0 + spare);
    weight.clamp(0.0, 1.0)
}

/// Apply velvia to one RGB triple. `strength` is a fraction.
pub fn velvia_pixel(rgb: [f32; 3], strength: f32, bias: f32) -> [f32; 3] {
    let [r, g, b] = rgb;
    let pmax = r.max(g.max(b));
    let pmin = r.min(g.min(b));
    let plum = (pmax + pmin) / 2.0;
    let psat = saturation_estimate(pmax, pmin);
    let saturation = strength * pixel_weight(psat, plum, bias);

    [
        (r + saturation * (r - 0.5 * (g + b))).clamp(0.0, 1.0),
        (g + saturation * (g - 0.5 * (b + r))).clamp(0.0, 1.0),
        (b + saturation * (b - 0.5 * (r + g))).clamp(0.0, 1.0),
    ]
}

impl Iop for Velvia {
    type Params = VelviaParams;
    type Data = VelviaData;

    fn descriptor(&self) -> &ModuleDescriptor {
        &DESCRIPTOR
    }

    fn legacy_params(&self, old: &ParamsBlob, new_version: u32) -> Result<ParamsBlob> {
        match (old.version, new_version) {
            (1, 2) => {
                let v1: VelviaParamsV1 = old.decode(OP)?;
                ParamsBlob::encode(&VelviaParams {
                    strength: v1.saturation * v1.vibrance / 100.0,
                    bias: v1.luminance,
                })
            }
            (from, to) => Err(ModuleError::UnsupportedMigration {
                op: OP.to_string(),
                from,
                to,
            }),
        }
    }

    fn commit_params(&self, params: &VelviaParams, data: &mut VelviaData) {
        data.strength = params.strength / 100.0;
        data.bias = params.bias;
    }

    fn process(
        &self,
        data: &VelviaData,
        ctx: &ProcessContext,
        input: &ImageBuf,
        output: &mut ImageBuf,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()> {
        check_pointwise(OP, input, output, roi_in, roi_out)?;

        if data.strength <= 0.0 {
            output.copy_from(input);
            return Ok(());
        }

        let ch = input.channels as usize;
        let (strength, bias) = (data.strength, data.bias);
        output
            .data
            .par_chunks_exact_mut(ch)
            .zip(input.data.par_chunks_exact(ch))
            .for_each(|(out, inp)| {
                let rgb = velvia_pixel([inp[0], inp[1], inp[2]], strength, bias);
                out[..3].copy_from_slice(&rgb);
            });

        if ctx.mask_display {
            output.copy_alpha_from(input);
        }
        Ok(())
    }

    fn kernels(&self) -> &'static [KernelSource] {
        &KERNELS
    }

    fn kernel_args_size(&self) -> usize {
        std::mem::size_of::<VelviaArgs>()
    }

    fn process_accelerated(
        &self,
        data: &VelviaData,
        ctx: &AccelContext<'_>,
        input: DeviceImage,
        output: DeviceImage,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()> {
        check_pointwise_device(OP, input, output, roi_in, roi_out)?;

        if data.strength <= 0.0 {
            trace!(op = OP, "zero strength, device copy");
            return ctx
                .accel
                .enqueue_copy(input, output, output.roi())
                .map_err(ModuleError::Dispatch);
        }

        let kernel = *ctx
            .kernels
            .first()
            .ok_or_else(|| ModuleError::NoAcceleratorPath(OP.to_string()))?;
        let args = VelviaArgs {
            width: roi_out.width,
            height: roi_out.height,
            strength: data.strength,
            bias: data.bias,
            copy_alpha: u32::from(ctx.mask_display),
            pad: [0; 3],
        };
        ctx.accel
            .enqueue_kernel_2d(
                kernel,
                ctx.args,
                bytemuck::bytes_of(&args),
                input,
                output,
                (roi_out.width, roi_out.height),
            )
            .map_err(ModuleError::Dispatch)
    }
}
