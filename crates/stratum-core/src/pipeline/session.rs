use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::accel::{Accelerator, KernelId, KernelSource};
use crate::error::{ModuleError, Result};
use crate::params::{HistoryItem, ParamsBlob};
use crate::pipeline::instance::PipeContext;
use crate::pipeline::registry::ModuleRegistry;

/// An editing session: the module registry plus the accelerator handle and
/// the kernels compiled on it.
///
/// Kernels are created once per module when the session starts and freed
/// when it is dropped. Pipelines borrow the session, so no pipeline outlives
/// the kernels it dispatches.
pub struct Session {
    registry: ModuleRegistry,
    accel: Option<Arc<dyn Accelerator>>,
    kernels: HashMap<String, Vec<KernelId>>,
}

impl Session {
    pub fn new(registry: ModuleRegistry, accel: Option<Arc<dyn Accelerator>>) -> Self {
        let mut kernels = HashMap::new();
        if let Some(accel) = &accel {
            info!(device = accel.name(), "accelerator attached to session");
            for module in registry.iter() {
                if let Some(ids) = init_global(accel.as_ref(), module.name(), module.kernels()) {
                    kernels.insert(module.name().to_string(), ids);
                }
            }
        }
        Self {
            registry,
            accel,
            kernels,
        }
    }

    /// A session with the built-in modules and no accelerator.
    pub fn general_only() -> Self {
        Self::new(ModuleRegistry::with_builtin_modules(), None)
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn accelerator(&self) -> Option<&Arc<dyn Accelerator>> {
        self.accel.as_ref()
    }

    /// Session kernels of `op`. Empty when the module runs on the general path only.
    pub fn kernels(&self, op: &str) -> &[KernelId] {
        self.kernels.get(op).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn pipe_context(&self, op: &str) -> PipeContext<'_> {
        let kernels = self.kernels(op);
        PipeContext {
            accel: self.accel.as_ref().filter(|_| !kernels.is_empty()),
            kernels,
        }
    }

    /// Current-version parameters for a history item.
    ///
    /// Blobs that cannot be migrated or decoded are replaced by the module's
    /// defaults; only an unknown `op` is an error.
    pub fn resolve_params(&self, item: &HistoryItem) -> Result<ParamsBlob> {
        let module = self
            .registry
            .get(&item.op)
            .ok_or_else(|| ModuleError::UnknownModule(item.op.clone()))?;

        let checked = module.migrate(&item.params).and_then(|blob| {
            let mut scratch = module.init_data();
            module.commit(&blob, &mut scratch)?;
            Ok(blob)
        });

        match checked {
            Ok(blob) => Ok(blob),
            Err(e) if e.is_params_failure() => {
                warn!(
                    module = %item.op,
                    version = item.params.version,
                    error = %e,
                    "stored params unusable, substituting defaults"
                );
                module.default_params()
            }
            Err(e) => Err(e),
        }
    }
}

fn init_global(
    accel: &dyn Accelerator,
    op: &str,
    sources: &[KernelSource],
) -> Option<Vec<KernelId>> {
    if sources.is_empty() {
        return None;
    }
    let mut ids = Vec::with_capacity(sources.len());
    for source in sources {
        match accel.create_kernel(source) {
            Ok(id) => ids.push(id),
            Err(e) => {
                warn!(
                    module = op,
                    kernel = source.name,
                    error = %e,
                    "kernel creation failed, module limited to the general path"
                );
                for id in ids {
                    accel.free_kernel(id);
                }
                return None;
            }
        }
    }
    debug!(module = op, count = ids.len(), "kernels created");
    Some(ids)
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(accel) = &self.accel else {
            return;
        };
        for (op, ids) in self.kernels.drain() {
            for id in ids {
                accel.free_kernel(id);
            }
            debug!(module = %op, "kernels freed");
        }
    }
}
