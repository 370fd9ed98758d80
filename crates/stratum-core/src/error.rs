use thiserror::Error;

use crate::region::Roi;

/// Failures reported by an accelerator device.
///
/// Every variant is recoverable from the pipeline's point of view: the
/// affected region is re-run on the general path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcceleratorError {
    #[error("accelerator unavailable: {0}")]
    Unavailable(String),

    #[error("out of device memory allocating {what}")]
    OutOfMemory { what: String },

    #[error("kernel `{kernel}` failed: {reason}")]
    Kernel { kernel: String, reason: String },

    #[error("device transfer failed: {0}")]
    Transfer(String),

    #[error("unknown device handle {0}")]
    UnknownHandle(u64),
}

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("no migration for `{op}` params from version {from} to version {to}")]
    UnsupportedMigration { op: String, from: u32, to: u32 },

    #[error("malformed `{op}` params (version {version}): {reason}")]
    MalformedParams {
        op: String,
        version: u32,
        reason: String,
    },

    #[error("accelerator resource allocation failed: {0}")]
    Allocation(#[source] AcceleratorError),

    #[error("accelerator dispatch failed: {0}")]
    Dispatch(#[source] AcceleratorError),

    #[error("module `{0}` has no accelerator path")]
    NoAcceleratorPath(String),

    #[error("region {roi:?} does not fit a {width}x{height} buffer")]
    InvalidRegion { roi: Roi, width: u32, height: u32 },

    #[error("stage `{op}` is {state} but the call requires {required}")]
    InvalidState {
        op: String,
        state: &'static str,
        required: &'static str,
    },

    #[error("unknown module `{0}`")]
    UnknownModule(String),

    #[error("pipeline evaluation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ModuleError {
    /// True for failures the pipeline answers by re-running on the general path.
    pub fn is_recoverable_on_cpu(&self) -> bool {
        matches!(
            self,
            Self::Allocation(_) | Self::Dispatch(_) | Self::NoAcceleratorPath(_)
        )
    }

    /// True for failures answered by substituting default parameters.
    pub fn is_params_failure(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedMigration { .. } | Self::MalformedParams { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ModuleError>;
