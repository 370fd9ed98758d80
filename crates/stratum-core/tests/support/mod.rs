//! Host-memory accelerator used to drive the accelerator path in tests.
//!
//! Work is queued by `enqueue_*` and only executed by `finish`, like a real
//! device queue. Kernels are re-implemented in f64 from their WGSL source so
//! the two executors are compared against an independent implementation.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use stratum_core::pipeline::modules::saturation::SaturationArgs;
use stratum_core::pipeline::modules::velvia::VelviaArgs;
use stratum_core::{
    Accelerator, AcceleratorError, AcceleratorEvent, ArgSlot, CancelToken, DeviceImage, ImageBuf,
    KernelId, KernelSource, Roi,
};

struct HostImage {
    width: u32,
    height: u32,
    rgba: Vec<f32>,
}

enum Queued {
    Copy {
        src: u64,
        dst: u64,
        region: Roi,
    },
    Kernel {
        name: String,
        args: Vec<u8>,
        input: u64,
        output: u64,
        size: (u32, u32),
    },
}

#[derive(Default)]
struct State {
    kernels: HashMap<u64, String>,
    args: HashMap<u64, usize>,
    images: HashMap<u64, HostImage>,
    queue: Vec<Queued>,
}

#[derive(Default)]
pub struct HostAccelerator {
    state: Mutex<State>,
    events: Mutex<Vec<AcceleratorEvent>>,
    next_id: AtomicU64,
    /// Queued kernels fail at `finish` and scribble over their output.
    pub fail_dispatch: AtomicBool,
    /// `alloc_args` and `alloc_image` report out-of-memory.
    pub fail_alloc: AtomicBool,
    pub fail_kernel_create: AtomicBool,
    /// Cancelled as soon as a kernel is queued.
    pub cancel_on_dispatch: Mutex<Option<CancelToken>>,
}

impl HostAccelerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AcceleratorEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn dispatch_count(&self) -> usize {
        self.events().iter().filter(|e| e.is_dispatch()).count()
    }

    pub fn copy_count(&self) -> usize {
        self.events().iter().filter(|e| e.is_copy()).count()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }

    pub fn live_kernels(&self) -> usize {
        self.state.lock().unwrap().kernels.len()
    }

    pub fn live_args(&self) -> usize {
        self.state.lock().unwrap().args.len()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record(&self, event: AcceleratorEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn oom(&self, what: &str) -> Result<(), AcceleratorError> {
        if self.fail_alloc.load(Ordering::Relaxed) {
            Err(AcceleratorError::OutOfMemory { what: what.into() })
        } else {
            Ok(())
        }
    }
}

impl Accelerator for HostAccelerator {
    fn name(&self) -> &str {
        "host"
    }

    fn create_kernel(&self, source: &KernelSource) -> Result<KernelId, AcceleratorError> {
        if self.fail_kernel_create.load(Ordering::Relaxed) {
            return Err(AcceleratorError::Kernel {
                kernel: source.name.into(),
                reason: "compilation failed".into(),
            });
        }
        let id = self.id();
        self.state
            .lock()
            .unwrap()
            .kernels
            .insert(id, source.name.to_string());
        Ok(KernelId(id))
    }

    fn free_kernel(&self, kernel: KernelId) {
        self.state.lock().unwrap().kernels.remove(&kernel.0);
    }

    fn alloc_args(&self, bytes: usize) -> Result<ArgSlot, AcceleratorError> {
        self.oom("kernel arguments")?;
        let id = self.id();
        self.state.lock().unwrap().args.insert(id, bytes);
        Ok(ArgSlot(id))
    }

    fn free_args(&self, slot: ArgSlot) {
        self.state.lock().unwrap().args.remove(&slot.0);
    }

    fn upload(&self, buf: &ImageBuf) -> Result<DeviceImage, AcceleratorError> {
        self.oom("image")?;
        let id = self.id();
        self.state.lock().unwrap().images.insert(
            id,
            HostImage {
                width: buf.width,
                height: buf.height,
                rgba: buf.to_rgba_f32(),
            },
        );
        self.record(AcceleratorEvent::Upload {
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
        self.oom("image")?;
        let id = self.id();
        self.state.lock().unwrap().images.insert(
            id,
            HostImage {
                width,
                height,
                rgba: vec![0.0; width as usize * height as usize * 4],
            },
        );
        Ok(DeviceImage { id, width, height })
    }

    fn free_image(&self, image: DeviceImage) {
        self.state.lock().unwrap().images.remove(&image.id);
    }

    fn enqueue_copy(
        &self,
        src: DeviceImage,
        dst: DeviceImage,
        region: Roi,
    ) -> Result<(), AcceleratorError> {
        self.state.lock().unwrap().queue.push(Queued::Copy {
            src: src.id,
            dst: dst.id,
            region,
        });
        self.record(AcceleratorEvent::Copy {
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
        let name = {
            let mut state = self.state.lock().unwrap();
            let name = state
                .kernels
                .get(&kernel.0)
                .cloned()
                .ok_or(AcceleratorError::UnknownHandle(kernel.0))?;
            let capacity = *state
                .args
                .get(&slot.0)
                .ok_or(AcceleratorError::UnknownHandle(slot.0))?;
            assert!(args.len() <= capacity, "argument block overflows its slot");
            state.queue.push(Queued::Kernel {
                name: name.clone(),
                args: args.to_vec(),
                input: input.id,
                output: output.id,
                size,
            });
            name
        };
        self.record(AcceleratorEvent::Dispatch {
            kernel: name,
            width: size.0,
            height: size.1,
        });
        if let Some(token) = self.cancel_on_dispatch.lock().unwrap().as_ref() {
            token.cancel();
        }
        Ok(())
    }

    fn finish(&self) -> Result<(), AcceleratorError> {
        let mut state = self.state.lock().unwrap();
        let queue = std::mem::take(&mut state.queue);
        let mut result = Ok(());
        for op in queue {
            match op {
                Queued::Copy { src, dst, region } => {
                    let src = state
                        .images
                        .get(&src)
                        .map(|img| (img.width, img.rgba.clone()))
                        .ok_or(AcceleratorError::UnknownHandle(src))?;
                    let out = state
                        .images
                        .get_mut(&dst)
                        .ok_or(AcceleratorError::UnknownHandle(dst))?;
                    copy_region(&src.1, src.0, &mut out.rgba, out.width, region);
                }
                Queued::Kernel {
                    name,
                    args,
                    input,
                    output,
                    size,
                } => {
                    let src = state
                        .images
                        .get(&input)
                        .map(|img| img.rgba.clone())
                        .ok_or(AcceleratorError::UnknownHandle(input))?;
                    let out = state
                        .images
                        .get_mut(&output)
                        .ok_or(AcceleratorError::UnknownHandle(output))?;
                    if self.fail_dispatch.load(Ordering::Relaxed) {
                        out.rgba.fill(f32::NAN);
                        result = Err(AcceleratorError::Kernel {
                            kernel: name,
                            reason: "device lost".into(),
                        });
                        continue;
                    }
                    run_kernel(&name, &args, &src, &mut out.rgba, out.width, size);
                }
            }
        }
        drop(state);
        self.record(AcceleratorEvent::Finish);
        result
    }

    fn download(&self, image: DeviceImage, channels: u32) -> Result<ImageBuf, AcceleratorError> {
        let state = self.state.lock().unwrap();
        let img = state
            .images
            .get(&image.id)
            .ok_or(AcceleratorError::UnknownHandle(image.id))?;
        let buf = ImageBuf::from_rgba_f32(img.width, img.height, channels, &img.rgba)
            .map_err(|e| AcceleratorError::Transfer(e.to_string()))?;
        drop(state);
        self.record(AcceleratorEvent::Download {
            width: image.width,
            height: image.height,
        });
        Ok(buf)
    }
}

fn copy_region(src: &[f32], src_width: u32, dst: &mut [f32], dst_width: u32, region: Roi) {
    for y in region.y..region.bottom() {
        for x in region.x..region.right() {
            let s = (y as usize * src_width as usize + x as usize) * 4;
            let d = (y as usize * dst_width as usize + x as usize) * 4;
            dst[d..d + 4].copy_from_slice(&src[s..s + 4]);
        }
    }
}

fn run_kernel(name: &str, args: &[u8], src: &[f32], dst: &mut [f32], width: u32, size: (u32, u32)) {
    type PixelFn = Box<dyn Fn([f64; 3]) -> [f64; 3]>;
    let (pixel, copy_alpha): (PixelFn, bool) = match name {
        "velvia" => {
            let a: VelviaArgs = bytemuck::pod_read_unaligned(args);
            let (strength, bias) = (a.strength as f64, a.bias as f64);
            (Box::new(move |p| velvia_f64(p, strength, bias)), a.copy_alpha != 0)
        }
        "saturation" => {
            let a: SaturationArgs = bytemuck::pod_read_unaligned(args);
            let (strength, protection) = (a.strength as f64, a.highlight_protection as f64);
            (
                Box::new(move |p| saturation_f64(p, strength, protection)),
                a.copy_alpha != 0,
            )
        }
        other => panic!("host accelerator has no kernel `{other}`"),
    };

    for y in 0..size.1 {
        for x in 0..size.0 {
            let i = (y as usize * width as usize + x as usize) * 4;
            let rgb = [src[i] as f64, src[i + 1] as f64, src[i + 2] as f64];
            let out = pixel(rgb);
            dst[i] = out[0] as f32;
            dst[i + 1] = out[1] as f32;
            dst[i + 2] = out[2] as f32;
            dst[i + 3] = if copy_alpha { src[i + 3] } else { 0.0 };
        }
    }
}

pub fn velvia_f64(p: [f64; 3], strength: f64, bias: f64) -> [f64; 3] {
    let pmax = p[0].max(p[1]).max(p[2]);
    let pmin = p[0].min(p[1]).min(p[2]);
    let plum = (pmax + pmin) / 2.0;
    let psat = if plum <= 0.5 {
        (pmax - pmin) / (1e-5 + pmax + pmin)
    } else {
        (pmax - pmin) / (1e-5 + (2.0 - pmax - pmin).max(0.0))
    };
    let spare = 1.0 - bias;
    let pweight = (((1.0 - 1.5 * psat) + (1.0 + (plum - 0.5).abs() * 2.0) * spare)
        / (1.0 + spare))
        .clamp(0.0, 1.0);
    let s = strength * pweight;
    [
        (p[0] + s * (p[0] - 0.5 * (p[1] + p[2]))).clamp(0.0, 1.0),
        (p[1] + s * (p[1] - 0.5 * (p[2] + p[0]))).clamp(0.0, 1.0),
        (p[2] + s * (p[2] - 0.5 * (p[0] + p[1]))).clamp(0.0, 1.0),
    ]
}

pub fn saturation_f64(p: [f64; 3], strength: f64, protection: f64) -> [f64; 3] {
    let y = 0.2126 * p[0] + 0.7152 * p[1] + 0.0722 * p[2];
    let blend = 1.0 + strength * (1.0 - protection * y.clamp(0.0, 1.0));
    p.map(|c| (y + blend * (c - y)).max(0.0))
}

/// Swatches every backend comparison covers.
pub fn swatches() -> Vec<[f32; 4]> {
    vec![
        [0.0, 0.0, 0.0, 1.0],
        [1.0, 1.0, 1.0, 1.0],
        [0.18, 0.18, 0.18, 1.0],
        [0.5, 0.5, 0.5, 1.0],
        [1.0, 0.0, 0.0, 1.0],
        [0.0, 1.0, 0.0, 1.0],
        [0.0, 0.0, 1.0, 1.0],
        [0.8, 0.2, 0.2, 0.6],
        [0.25, 0.6, 0.9, 0.3],
        [0.95, 0.9, 0.05, 0.0],
    ]
}

/// One row holding every swatch.
pub fn swatch_image() -> ImageBuf {
    let pixels = swatches();
    let data = pixels.iter().flatten().copied().collect();
    ImageBuf::from_data(pixels.len() as u32, 1, 4, data).unwrap()
}

/// A smooth test card with varied saturation and luminance.
pub fn test_card(width: u32, height: u32) -> ImageBuf {
    let mut data = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        for x in 0..width {
            let u = x as f32 / width.max(2).saturating_sub(1) as f32;
            let v = y as f32 / height.max(2).saturating_sub(1) as f32;
            data.extend_from_slice(&[u, v, (1.0 - u) * 0.7 + 0.1, 0.5]);
        }
    }
    ImageBuf::from_data(width, height, 4, data).unwrap()
}

pub fn max_abs_diff(a: &ImageBuf, b: &ImageBuf) -> f32 {
    assert_eq!((a.width, a.height, a.channels), (b.width, b.height, b.channels));
    a.data
        .iter()
        .zip(&b.data)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, |worst, d| if d.is_nan() || d > worst { d } else { worst })
}
