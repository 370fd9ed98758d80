use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::accel::{DeviceImage, KernelSource};
use crate::error::{ModuleError, Result};
use crate::image_buf::ImageBuf;
use crate::params::{ParamField, ParamsBlob, ParamsSchema};
use crate::pipeline::module::{
    AccelContext, ColorSpace, Iop, ModuleDescription, ModuleDescriptor, ModuleFlags, ModuleGroup,
    ProcessContext, check_pointwise, check_pointwise_device,
};
use crate::region::Roi;

const OP: &str = "saturation";

static DESCRIPTOR: ModuleDescriptor = ModuleDescriptor {
    op: OP,
    name: "saturation",
    aliases: &["colorfulness"],
    description: ModuleDescription {
        purpose: "scale color distance from luminance uniformly",
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
    groups: &[ModuleGroup::Color],
    colorspace: ColorSpace::Rgb,
};

static KERNELS: [KernelSource; 1] = [KernelSource {
    name: "saturation",
    wgsl: include_str!("../../../shaders/saturation.wgsl"),
}];

static FIELDS: [ParamField; 2] = [
    ParamField::new("saturation", -100.0, 100.0, 0.0),
    ParamField::new("highlight_protection", 0.0, 1.0, 0.0)
        .describe("reduce the effect on bright pixels"),
];

static FIELDS_V2: [ParamField; 1] = [ParamField::new("saturation", -100.0, 100.0, 0.0)];

static FIELDS_V1: [ParamField; 1] = [ParamField::new("factor", 0.0, 2.0, 1.0)];

/// Current (version 3) parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SaturationParams {
    /// Percent; -100 is grayscale, +100 doubles distance from luminance.
    pub saturation: f32,
    pub highlight_protection: f32,
}

impl ParamsSchema for SaturationParams {
    const VERSION: u32 = 3;

    fn fields() -> &'static [ParamField] {
        &FIELDS
    }

    fn clamped(&self) -> Self {
        Self {
            saturation: FIELDS[0].clamp(self.saturation),
            highlight_protection: FIELDS[1].clamp(self.highlight_protection),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SaturationParamsV2 {
    pub saturation: f32,
}

impl ParamsSchema for SaturationParamsV2 {
    const VERSION: u32 = 2;

    fn fields() -> &'static [ParamField] {
        &FIELDS_V2
    }

    fn clamped(&self) -> Self {
        Self {
            saturation: FIELDS_V2[0].clamp(self.saturation),
        }
    }
}

/// Version 1 stored the blend factor directly (1.0 = unchanged).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaturationParamsV1 {
    pub factor: f32,
}

impl Default for SaturationParamsV1 {
    fn default() -> Self {
        Self {
            factor: FIELDS_V1[0].default,
        }
    }
}

impl ParamsSchema for SaturationParamsV1 {
    const VERSION: u32 = 1;

    fn fields() -> &'static [ParamField] {
        &FIELDS_V1
    }

    fn clamped(&self) -> Self {
        Self {
            factor: FIELDS_V1[0].clamp(self.factor),
        }
    }
}

fn factor_to_percent(factor: f32) -> f32 {
    (factor - 1.0) * 100.0
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SaturationData {
    /// Saturation as a fraction (percent / 100).
    pub strength: f32,
    pub highlight_protection: f32,
}

/// Uniform block of the saturation kernel. Layout matches `shaders/saturation.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SaturationArgs {
    pub width: u32,
    pub height: u32,
    pub strength: f32,
    pub highlight_protection: f32,
    pub copy_alpha: u32,
    pub pad: [u32; 3],
}

pub struct Saturation;

pub fn saturation_pixel(rgb: [f32; 3], strength: f32, highlight_protection: f32) -> [f32; 3] {
    let [r, g, b] = rgb;
    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    let blend = 1.0 + strength * (1.0 - highlight_protection * y.clamp(0.0, 1.0));
    [
        (y + blend * (r - y)).max(0.0),
        (y + blend * (g - y)).max(0.0),
        (y + blend * (b - y)).max(0.0),
    ]
}

impl Iop for Saturation {
    type Params = SaturationParams;
    type Data = SaturationData;

    fn descriptor(&self) -> &ModuleDescriptor {
        &DESCRIPTOR
    }

    fn legacy_params(&self, old: &ParamsBlob, new_version: u32) -> Result<ParamsBlob> {
        match (old.version, new_version) {
            (1, 2) => {
                let v1: SaturationParamsV1 = old.decode(OP)?;
                ParamsBlob::encode(&SaturationParamsV2 {
                    saturation: factor_to_percent(v1.factor),
                })
            }
            (2, 3) => {
                let v2: SaturationParamsV2 = old.decode(OP)?;
                ParamsBlob::encode(&SaturationParams {
                    saturation: v2.saturation,
                    highlight_protection: 0.0,
                })
            }
            (1, 3) => {
                let v1: SaturationParamsV1 = old.decode(OP)?;
                ParamsBlob::encode(&SaturationParams {
                    saturation: factor_to_percent(v1.factor),
                    highlight_protection: 0.0,
                })
            }
            (from, to) => Err(ModuleError::UnsupportedMigration {
                op: OP.to_string(),
                from,
                to,
            }),
        }
    }

    fn commit_params(&self, params: &SaturationParams, data: &mut SaturationData) {
        data.strength = params.saturation / 100.0;
        data.highlight_protection = params.highlight_protection;
    }

    fn process(
        &self,
        data: &SaturationData,
        ctx: &ProcessContext,
        input: &ImageBuf,
        output: &mut ImageBuf,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()> {
        check_pointwise(OP, input, output, roi_in, roi_out)?;

        if data.strength == 0.0 {
            output.copy_from(input);
            return Ok(());
        }

        let ch = input.channels as usize;
        let (strength, protection) = (data.strength, data.highlight_protection);
        output
            .data
            .par_chunks_exact_mut(ch)
            .zip(input.data.par_chunks_exact(ch))
            .for_each(|(out, inp)| {
                let rgb = saturation_pixel([inp[0], inp[1], inp[2]], strength, protection);
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
        std::mem::size_of::<SaturationArgs>()
    }

    fn process_accelerated(
        &self,
        data: &SaturationData,
        ctx: &AccelContext<'_>,
        input: DeviceImage,
        output: DeviceImage,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()> {
        check_pointwise_device(OP, input, output, roi_in, roi_out)?;

        if data.strength == 0.0 {
            return ctx
                .accel
                .enqueue_copy(input, output, output.roi())
                .map_err(ModuleError::Dispatch);
        }

        let kernel = *ctx
            .kernels
            .first()
            .ok_or_else(|| ModuleError::NoAcceleratorPath(OP.to_string()))?;
        let args = SaturationArgs {
            width: roi_out.width,
            height: roi_out.height,
            strength: data.strength,
            highlight_protection: data.highlight_protection,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::module::ProcessingModule;

    fn run(input: &ImageBuf, saturation: f32, highlight_protection: f32) -> ImageBuf {
        let params = SaturationParams {
            saturation,
            highlight_protection,
        };
        let mut data = SaturationData::default();
        Saturation.commit_params(&params.clamped(), &mut data);
        let mut output = ImageBuf::new(input.width, input.height, input.channels);
        let roi = input.roi();
        Iop::process(
            &Saturation,
            &data,
            &ProcessContext::default(),
            input,
            &mut output,
            &roi,
            &roi,
        )
        .unwrap();
        output
    }

    fn rgb(r: f32, g: f32, b: f32) -> ImageBuf {
        ImageBuf::from_data(1, 1, 3, vec![r, g, b]).unwrap()
    }

    #[test]
    fn identity_noop() {
        let buf = ImageBuf::filled(2, 2, &[0.5, 0.4, 0.3, 1.0]);
        assert_eq!(run(&buf, 0.0, 0.7), buf);
    }

    #[test]
    fn positive_increases_saturation() {
        let result = run(&rgb(0.8, 0.3, 0.1), 50.0, 0.0);
        let spread_before = 0.8 - 0.1;
        let spread_after = result.data[0] - result.data[2];
        assert!(spread_after > spread_before);
    }

    #[test]
    fn negative_decreases_saturation() {
        let result = run(&rgb(0.8, 0.3, 0.1), -50.0, 0.0);
        let spread_after = result.data[0] - result.data[2];
        assert!(spread_after < 0.8 - 0.1);
    }

    #[test]
    fn minus_100_produces_grayscale() {
        let result = run(&rgb(0.8, 0.3, 0.1), -100.0, 0.0);
        let y = 0.2126 * 0.8 + 0.7152 * 0.3 + 0.0722 * 0.1;
        for &v in &result.data {
            assert!(
                (v - y).abs() < 1e-6,
                "at -100 saturation all channels should equal Y={y}, got {v}"
            );
        }
    }

    #[test]
    fn gray_pixel_stays_gray() {
        for sat in [-100.0, -50.0, 50.0, 100.0] {
            let result = run(&rgb(0.5, 0.5, 0.5), sat, 0.0);
            for &v in &result.data {
                assert!(
                    (v - 0.5).abs() < 1e-6,
                    "gray pixel should stay gray at saturation={sat}, got {v}"
                );
            }
        }
    }

    #[test]
    fn hdr_input_handled() {
        let result = run(&rgb(2.0, 1.5, 0.5), 50.0, 0.5);
        assert!(
            result.data.iter().all(|v| v.is_finite() && *v >= 0.0),
            "HDR input should produce finite non-negative output: {:?}",
            result.data
        );
    }

    #[test]
    fn positive_100_doubles_deviation() {
        let y = 0.2126 * 0.8 + 0.7152 * 0.3 + 0.0722 * 0.1;
        let result = run(&rgb(0.8, 0.3, 0.1), 100.0, 0.0);
        let expected_r = y + 2.0 * (0.8 - y);
        assert!(
            (result.data[0] - expected_r).abs() < 1e-5,
            "saturation +100 should double deviation: got {} expected {}",
            result.data[0],
            expected_r
        );
    }

    #[test]
    fn highlight_protection_eases_bright_pixels() {
        let bright = rgb(0.95, 0.8, 0.7);
        let free = run(&bright, 80.0, 0.0);
        let protected = run(&bright, 80.0, 1.0);
        assert!(protected.data[0] - protected.data[2] < free.data[0] - free.data[2]);
    }

    #[test]
    fn v1_factor_maps_to_percent() {
        for (factor, percent) in [(0.0, -100.0), (1.0, 0.0), (2.0, 100.0), (1.5, 50.0)] {
            let blob = ParamsBlob::encode(&SaturationParamsV1 { factor }).unwrap();
            let p: SaturationParams = ProcessingModule::migrate(&Saturation, &blob)
                .unwrap()
                .decode(OP)
                .unwrap();
            assert_eq!(p.saturation, percent);
            assert_eq!(p.highlight_protection, 0.0);
        }
    }

    #[test]
    fn v2_gains_protection_default() {
        let blob = ParamsBlob::encode(&SaturationParamsV2 { saturation: -30.0 }).unwrap();
        let p: SaturationParams = Iop::legacy_params(&Saturation, &blob, 3)
            .unwrap()
            .decode(OP)
            .unwrap();
        assert_eq!(p, SaturationParams { saturation: -30.0, highlight_protection: 0.0 });
    }

    #[test]
    fn no_downgrade_pairs() {
        let blob = ParamsBlob::encode(&SaturationParams::default()).unwrap();
        assert!(Iop::legacy_params(&Saturation, &blob, 2).is_err());
        assert!(Iop::legacy_params(&Saturation, &blob, 1).is_err());
    }
}
