use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::accel::{Accelerator, ArgSlot, DeviceImage, KernelId};
use crate::error::{ModuleError, Result};
use crate::image_buf::ImageBuf;
use crate::params::ParamsBlob;
use crate::pipeline::module::{AccelContext, ProcessContext, ProcessingModule, WorkingData};
use crate::region::Roi;

/// Lifecycle of a stage instance.
///
/// ```text
/// Uninitialized --allocate--> Bound --commit--> Committed --commit--> Committed
///        \                      \                  \
///         `------------------------ release ---------`--> Released
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Uninitialized,
    Bound,
    Committed,
    Released,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Bound => "bound",
            Self::Committed => "committed",
            Self::Released => "released",
        }
    }
}

/// Which executors a stage can use after allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendSupport {
    Accelerated,
    GeneralOnly,
}

/// What a pipeline offers a stage at allocation time.
#[derive(Clone, Copy, Default)]
pub struct PipeContext<'a> {
    /// Present only when the accelerator path is allowed for this pipeline.
    pub accel: Option<&'a Arc<dyn Accelerator>>,
    /// Session kernels of the module; empty means no accelerator path.
    pub kernels: &'a [KernelId],
}

impl PipeContext<'_> {
    /// A context that never offers the accelerator.
    pub fn general() -> Self {
        Self::default()
    }
}

struct DeviceBinding {
    accel: Arc<dyn Accelerator>,
    kernels: Vec<KernelId>,
    args: ArgSlot,
}

/// Runtime state of one module inside one pipeline.
pub struct StageInstance {
    module: Arc<dyn ProcessingModule>,
    state: StageState,
    data: Option<WorkingData>,
    device: Option<DeviceBinding>,
}

impl StageInstance {
    pub fn new(module: Arc<dyn ProcessingModule>) -> Self {
        Self {
            module,
            state: StageState::Uninitialized,
            data: None,
            device: None,
        }
    }

    pub fn module(&self) -> &Arc<dyn ProcessingModule> {
        &self.module
    }

    pub fn op(&self) -> &str {
        self.module.name()
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn backend_support(&self) -> BackendSupport {
        if self.device.is_some() {
            BackendSupport::Accelerated
        } else {
            BackendSupport::GeneralOnly
        }
    }

    pub fn accelerator(&self) -> Option<&dyn Accelerator> {
        self.device.as_ref().map(|d| d.accel.as_ref())
    }

    fn invalid_state(&self, required: &'static str) -> ModuleError {
        ModuleError::InvalidState {
            op: self.op().to_string(),
            state: self.state.as_str(),
            required,
        }
    }

    /// Reserve per-pipeline resources and create default working data.
    ///
    /// Failing to reserve the accelerator argument slot downgrades the stage
    /// to the general path instead of failing. Repeating the call on a bound
    /// or committed stage keeps the existing binding and data.
    pub fn allocate(&mut self, pipe: &PipeContext<'_>) -> Result<BackendSupport> {
        match self.state {
            StageState::Uninitialized => {}
            StageState::Bound | StageState::Committed => {
                debug!(module = self.op(), "stage already allocated");
                return Ok(self.backend_support());
            }
            StageState::Released => return Err(self.invalid_state("uninitialized")),
        }

        self.data = Some(self.module.init_data());

        if let Some(accel) = pipe.accel.filter(|_| !pipe.kernels.is_empty()) {
            match accel.alloc_args(self.module.kernel_args_size()) {
                Ok(args) => {
                    self.device = Some(DeviceBinding {
                        accel: Arc::clone(accel),
                        kernels: pipe.kernels.to_vec(),
                        args,
                    });
                }
                Err(e) => {
                    warn!(
                        module = self.op(),
                        error = %e,
                        "accelerator arguments unavailable, stage limited to the general path"
                    );
                }
            }
        }

        self.state = StageState::Bound;
        let support = self.backend_support();
        debug!(module = self.op(), ?support, "stage allocated");
        Ok(support)
    }

    /// Project current-version parameters into working data. May be called repeatedly.
    pub fn commit(&mut self, params: &ParamsBlob) -> Result<()> {
        if !matches!(self.state, StageState::Bound | StageState::Committed) {
            return Err(self.invalid_state("bound"));
        }
        let Some(data) = self.data.as_mut() else {
            return Err(self.invalid_state("bound"));
        };
        self.module.commit(params, data)?;
        self.state = StageState::Committed;
        Ok(())
    }

    fn committed_data(&self) -> Result<&WorkingData> {
        match (&self.state, &self.data) {
            (StageState::Committed, Some(data)) => Ok(data),
            _ => Err(self.invalid_state("committed")),
        }
    }

    pub fn process(
        &self,
        ctx: &ProcessContext,
        input: &ImageBuf,
        output: &mut ImageBuf,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()> {
        let data = self.committed_data()?;
        self.module.process(data, ctx, input, output, roi_in, roi_out)
    }

    /// Queue the accelerated transform. Results are valid after `finish`.
    pub fn process_accelerated(
        &self,
        mask_display: bool,
        input: DeviceImage,
        output: DeviceImage,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()> {
        let data = self.committed_data()?;
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| ModuleError::NoAcceleratorPath(self.op().to_string()))?;
        let ctx = AccelContext {
            accel: device.accel.as_ref(),
            kernels: &device.kernels,
            args: device.args,
            mask_display,
        };
        self.module
            .process_accelerated(data, &ctx, input, output, roi_in, roi_out)
    }

    /// Free per-pipeline resources. Safe from any state and idempotent.
    pub fn release(&mut self) {
        if let Some(device) = self.device.take() {
            device.accel.free_args(device.args);
        }
        self.data = None;
        if self.state != StageState::Released {
            debug!(module = self.op(), from = self.state.as_str(), "stage released");
            self.state = StageState::Released;
        }
    }
}

impl Drop for StageInstance {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for StageInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageInstance")
            .field("op", &self.op())
            .field("state", &self.state)
            .field("support", &self.backend_support())
            .finish()
    }
}
