pub mod instance;
pub mod module;
pub mod modules;
pub mod registry;
pub mod session;

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::accel::ScopedImage;
use crate::config::PipelineConfig;
use crate::error::{ModuleError, Result};
use crate::image_buf::ImageBuf;
use crate::params::{HistoryItem, ParamsBlob};
use crate::region::Roi;
use instance::{BackendSupport, PipeContext, StageInstance};
use module::ProcessContext;
use session::Session;

/// Executor that produced a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    General,
    Accelerated,
}

/// Shared cancellation flag. Checked before every stage and every tile.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageReport {
    pub op: String,
    /// `Accelerated` only when every region of the stage ran on the accelerator.
    pub backend: Backend,
    pub regions: usize,
    /// Regions re-run on the general path after an accelerator failure.
    pub fallbacks: usize,
    pub duration: Duration,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn fallbacks(&self) -> usize {
        self.stages.iter().map(|s| s.fallbacks).sum()
    }

    pub fn duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }
}

/// An ordered stack of stage instances evaluated on one image.
///
/// ```text
/// history -> resolve params -> allocate -> commit -> [stage 1] -> [stage 2] -> ... -> output
/// ```
///
/// Stages run in order; each one sees the previous stage's output. Every
/// region of a stage goes to exactly one executor, and an accelerator
/// failure re-runs that region on the general path.
pub struct Pipeline<'s> {
    session: &'s Session,
    stages: Vec<StageInstance>,
    config: PipelineConfig,
    pool: Option<rayon::ThreadPool>,
}

impl<'s> Pipeline<'s> {
    /// Build stages for the enabled items of `history`. Unknown modules are skipped.
    pub fn new(
        session: &'s Session,
        history: &[HistoryItem],
        config: PipelineConfig,
    ) -> Result<Self> {
        let pool = config
            .threads
            .map(|n| {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .context("building worker pool")
            })
            .transpose()?;

        let mut stages = Vec::with_capacity(history.len());
        for item in history {
            if !item.enabled {
                debug!(module = %item.op, "skipping disabled history item");
                continue;
            }
            let Some(module) = session.registry().get(&item.op) else {
                warn!(module = %item.op, "unknown module in history, skipping");
                continue;
            };
            let params = session.resolve_params(item)?;

            let pipe = if config.accelerator_enabled() {
                session.pipe_context(&item.op)
            } else {
                PipeContext::general()
            };
            let mut stage = StageInstance::new(Arc::clone(module));
            stage.allocate(&pipe)?;
            stage.commit(&params)?;
            stages.push(stage);
        }

        info!(
            stages = stages.len(),
            accelerator = session.accelerator().is_some() && config.accelerator_enabled(),
            "pipeline ready"
        );
        Ok(Self {
            session,
            stages,
            config,
            pool,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn stages(&self) -> &[StageInstance] {
        &self.stages
    }

    /// Replace the parameters of the first stage running `op`.
    pub fn recommit(&mut self, op: &str, params: &ParamsBlob) -> Result<()> {
        let stage = self
            .stages
            .iter_mut()
            .find(|s| s.op() == op)
            .ok_or_else(|| ModuleError::UnknownModule(op.to_string()))?;
        let current = stage.module().migrate(params)?;
        stage.commit(&current)
    }

    pub fn process(
        &mut self,
        input: &ImageBuf,
        cancel: &CancelToken,
    ) -> Result<(ImageBuf, PipelineReport)> {
        match &self.pool {
            Some(pool) => pool.install(|| self.run(input, cancel)),
            None => self.run(input, cancel),
        }
    }

    fn run(&self, input: &ImageBuf, cancel: &CancelToken) -> Result<(ImageBuf, PipelineReport)> {
        let mut current = Cow::Borrowed(input);
        let mut report = PipelineReport::default();
        for stage in &self.stages {
            if cancel.is_cancelled() {
                info!(module = stage.op(), "pipeline cancelled");
                return Err(ModuleError::Cancelled);
            }
            let (output, stage_report) = self.run_stage(stage, &current, cancel)?;
            debug!(
                module = stage.op(),
                backend = ?stage_report.backend,
                regions = stage_report.regions,
                fallbacks = stage_report.fallbacks,
                elapsed_ms = stage_report.duration.as_secs_f64() * 1000.0,
                "stage done"
            );
            current = Cow::Owned(output);
            report.stages.push(stage_report);
        }
        Ok((current.into_owned(), report))
    }

    fn regions(&self, stage: &StageInstance, full: Roi) -> Vec<Roi> {
        match self.config.tile_size {
            Some(tile) if stage.module().descriptor().flags.allow_tiling => full.tiles(tile),
            _ => vec![full],
        }
    }

    fn use_accelerator(&self, stage: &StageInstance, roi: &Roi) -> bool {
        self.config.accelerator_enabled()
            && stage.backend_support() == BackendSupport::Accelerated
            && !roi.is_empty()
    }

    fn run_stage(
        &self,
        stage: &StageInstance,
        input: &ImageBuf,
        cancel: &CancelToken,
    ) -> Result<(ImageBuf, StageReport)> {
        let started = Instant::now();
        let full = input.roi();
        let regions = self.regions(stage, full);
        let single = regions.len() == 1 && regions[0] == full;

        let mut output = ImageBuf::new(input.width, input.height, input.channels);
        let mut accelerated = 0;
        let mut fallbacks = 0;

        for roi in &regions {
            if cancel.is_cancelled() {
                return Err(ModuleError::Cancelled);
            }
            let region_in = if single {
                Cow::Borrowed(input)
            } else {
                Cow::Owned(input.extract(roi)?)
            };

            let mut done = None;
            if self.use_accelerator(stage, roi) {
                match self.run_accelerated(stage, &region_in, roi, cancel) {
                    Ok(buf) => {
                        accelerated += 1;
                        done = Some(buf);
                    }
                    Err(e) if e.is_recoverable_on_cpu() => {
                        warn!(
                            module = stage.op(),
                            ?roi,
                            error = %e,
                            "accelerator failed, re-running region on the general path"
                        );
                        fallbacks += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            let region_out = match done {
                Some(buf) => buf,
                None => {
                    let mut buf = ImageBuf::new(roi.width, roi.height, input.channels);
                    let ctx = ProcessContext {
                        mask_display: self.config.mask_display,
                    };
                    stage.process(&ctx, &region_in, &mut buf, roi, roi)?;
                    buf
                }
            };

            if single {
                output = region_out;
            } else {
                output.paste(roi, &region_out)?;
            }
        }

        let backend = if !regions.is_empty() && accelerated == regions.len() {
            Backend::Accelerated
        } else {
            Backend::General
        };
        Ok((
            output,
            StageReport {
                op: stage.op().to_string(),
                backend,
                regions: regions.len(),
                fallbacks,
                duration: started.elapsed(),
            },
        ))
    }

    /// Upload, dispatch, synchronize, download. Device images are freed on every path.
    fn run_accelerated(
        &self,
        stage: &StageInstance,
        input: &ImageBuf,
        roi: &Roi,
        cancel: &CancelToken,
    ) -> Result<ImageBuf> {
        let accel = stage
            .accelerator()
            .ok_or_else(|| ModuleError::NoAcceleratorPath(stage.op().to_string()))?;

        let src = ScopedImage::new(accel, accel.upload(input).map_err(ModuleError::Allocation)?);
        let dst = ScopedImage::new(
            accel,
            accel
                .alloc_image(roi.width, roi.height)
                .map_err(ModuleError::Allocation)?,
        );

        stage.process_accelerated(self.config.mask_display, src.get(), dst.get(), roi, roi)?;

        if cancel.is_cancelled() {
            // drain queued work before the images are freed
            if let Err(e) = accel.finish() {
                debug!(module = stage.op(), error = %e, "abandoned accelerator work failed");
            }
            return Err(ModuleError::Cancelled);
        }

        accel.finish().map_err(ModuleError::Dispatch)?;
        accel
            .download(dst.get(), input.channels)
            .map_err(ModuleError::Dispatch)
    }
}
